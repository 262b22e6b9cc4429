//! # Constants
//!
//! Shared constants used throughout the controller.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration or environment variables where applicable.

/// Default HTTP server port for metrics and health probes
pub const DEFAULT_METRICS_PORT: u16 = 8080;

/// Default Secrets Manager poll interval (seconds)
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 300;

/// Default capacity of the bounded (secret id, credential role) value cache.
/// The capacity only bounds memory; staleness is enforced by the catalog
/// version comparison, not by eviction.
pub const DEFAULT_VALUE_CACHE_CAPACITY: usize = 10_000;

/// Default requeue interval after a successful reconciliation (seconds)
pub const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 120;

/// Default requeue interval for reconciliation errors (seconds)
pub const DEFAULT_RECONCILIATION_ERROR_REQUEUE_SECS: u64 = 60;

/// Maximum startup jitter before the first poll (seconds).
/// Spreads ListSecrets load when several controllers start at once.
pub const MAX_STARTUP_JITTER_SECS: u64 = 60;

/// Page size for Secrets Manager ListSecrets calls
pub const LIST_SECRETS_PAGE_SIZE: i32 = 100;

/// Stage label Secrets Manager attaches to the current version of a secret
pub const CURRENT_STAGE_LABEL: &str = "AWSCURRENT";

/// Namespace annotation holding the JSON array of IAM roles allowed to be
/// assumed from that namespace (kube2iam convention)
pub const ALLOWED_ROLES_ANNOTATION: &str = "iam.amazonaws.com/allowed-roles";

/// Namespace label declaring the namespace type used for secret scoping
pub const NAMESPACE_TYPE_LABEL: &str = "secret-sync.microscaler.io/namespace-type";

/// Prefix of the remote-secret tag that opts a secret into a namespace type.
/// A secret tagged `{prefix}/{type}` with value "1" is readable from
/// namespaces labeled with that type.
pub const NAMESPACE_TYPE_TAG_PREFIX: &str = "secret-sync.microscaler.io/namespace-type";

/// Tag value that marks a namespace-type tag as enabled
pub const NAMESPACE_TYPE_TAG_ENABLED: &str = "1";

/// Role name used by the AWSAccountID convention:
/// `arn:aws:iam::{account}:role/{DEFAULT_SYNC_ROLE_NAME}`
pub const DEFAULT_SYNC_ROLE_NAME: &str = "secret-syncer";

/// Session name used for STS assume-role calls
pub const STS_SESSION_NAME: &str = "synced-secret-controller";
