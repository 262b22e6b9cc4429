//! # Access Validators
//!
//! Per-request decisions on whether a credential role or a remote secret may
//! be used from a namespace.
//!
//! The two validators deliberately default in opposite directions:
//!
//! - [`role::RoleValidator`] defaults **open**: namespaces that never opted
//!   into role restriction keep working unchanged;
//! - [`secret_tags::SecretTagValidator`] defaults **closed**: cross-account
//!   secret scoping only applies to namespaces that explicitly declare a
//!   type, and secrets that explicitly opt into it.

pub mod role;
pub mod secret_tags;

pub use role::RoleValidator;
pub use secret_tags::SecretTagValidator;
