//! SyncedSecret Controller Library
//!
//! Core functionality for the SyncedSecret controller: the Secrets Manager
//! polling cache, the materialization engine, the access validators and the
//! reconciliation orchestrator. Tests are included in the module files.

pub mod constants;
pub mod controller;
pub mod crd;
pub mod error;
pub mod iam;
pub mod materialize;
pub mod namespace;
pub mod observability;
pub mod poller;
pub mod provider;
pub mod server;
pub mod validation;

pub use crd::{SyncedSecret, SyncedSecretSpec, SyncedSecretStatus};
pub use error::SyncError;
