//! Namespace-type scoping of remote secrets via their tags.

use crate::constants::{NAMESPACE_TYPE_LABEL, NAMESPACE_TYPE_TAG_ENABLED, NAMESPACE_TYPE_TAG_PREFIX};
use crate::error::SyncError;
use crate::namespace::NamespaceGetter;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Validates that a remote secret opted into the requesting namespace's type.
///
/// Fail-closed: a namespace without a declared type reads nothing through
/// this path, and a secret without the matching tag is invisible to the
/// namespace. This is the opposite default from role whitelisting on purpose:
/// cross-account access must be explicit on both sides.
pub struct SecretTagValidator {
    namespaces: Arc<dyn NamespaceGetter>,
}

impl std::fmt::Debug for SecretTagValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretTagValidator").finish_non_exhaustive()
    }
}

impl SecretTagValidator {
    pub fn new(namespaces: Arc<dyn NamespaceGetter>) -> Self {
        Self { namespaces }
    }

    /// Returns whether a secret with `tags` may be read from `namespace`
    pub fn has_namespace_type(
        &self,
        tags: &BTreeMap<String, String>,
        namespace: &str,
    ) -> Result<bool, SyncError> {
        let ns = self
            .namespaces
            .get(namespace)
            .ok_or_else(|| SyncError::NamespaceNotFound {
                namespace: namespace.to_string(),
            })?;

        let Some(ns_type) = ns.labels.get(NAMESPACE_TYPE_LABEL) else {
            return Ok(false);
        };

        let wanted = format!("{NAMESPACE_TYPE_TAG_PREFIX}/{ns_type}");
        Ok(tags
            .get(&wanted)
            .is_some_and(|v| v == NAMESPACE_TYPE_TAG_ENABLED))
    }
}
