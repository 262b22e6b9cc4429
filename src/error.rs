//! # Error Types
//!
//! Typed error taxonomy for the sync pipeline.
//!
//! Nothing here is process-fatal: catalog-wide poll failures are reported on
//! the poller's error channel and keep the previous catalog; every other
//! variant aborts only the reconciliation of the resource that triggered it,
//! to be retried on the next timer or watch event.

use thiserror::Error;

/// Errors produced by the poller, the access validators and the
/// materialization engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// No version of the remote secret carries the AWSCURRENT stage label.
    #[error("secret {secret_id} has no version with stage AWSCURRENT")]
    NoCurrentVersion { secret_id: String },

    /// A role reference could not be normalized to a valid IAM role ARN.
    #[error("invalid IAM role reference {role:?}: {reason}")]
    InvalidRoleReference { role: String, reason: String },

    /// A fetched secret value did not have the shape the spec requires
    /// (not JSON, not an object, or missing the referenced key).
    #[error("malformed value for secret {secret_id}: {reason}")]
    MalformedSecretValue { secret_id: String, reason: String },

    /// Template compilation or rendering failed for a templated field.
    #[error("template for field {field} failed: {source}")]
    TemplateError {
        field: String,
        #[source]
        source: anyhow::Error,
    },

    /// An access validator denied the request.
    #[error("access denied: {reason}")]
    AccessDenied { reason: String },

    /// A live call to Secrets Manager failed. Never cached, never retried
    /// here; the injected client owns the retry policy.
    #[error("remote fetch failed for secret {secret_id}: {source}")]
    RemoteFetchFailed {
        secret_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// The namespace a resource lives in is unknown to the metadata cache.
    #[error("namespace {namespace} not found")]
    NamespaceNotFound { namespace: String },

    /// Kubernetes API error surfaced while reading or writing objects.
    #[error(transparent)]
    Kube(#[from] kube::Error),
}

impl SyncError {
    pub fn malformed(secret_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedSecretValue {
            secret_id: secret_id.into(),
            reason: reason.into(),
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self::AccessDenied {
            reason: reason.into(),
        }
    }
}
