//! Role allow-list validation against namespace annotations.

use crate::error::SyncError;
use crate::iam::ArnResolver;
use crate::namespace::NamespaceGetter;
use std::sync::Arc;

/// Validates that a credential role is allowed in a namespace.
///
/// The allow-list lives in a namespace annotation (kube2iam convention) as a
/// JSON array of role references. Comparison happens on normalized ARNs, so
/// a bare role name and its fully-qualified spelling match.
pub struct RoleValidator {
    arns: Arc<ArnResolver>,
    namespaces: Arc<dyn NamespaceGetter>,
    annotation: String,
}

impl std::fmt::Debug for RoleValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoleValidator")
            .field("annotation", &self.annotation)
            .finish_non_exhaustive()
    }
}

impl RoleValidator {
    pub fn new(
        arns: Arc<ArnResolver>,
        namespaces: Arc<dyn NamespaceGetter>,
        annotation: impl Into<String>,
    ) -> Self {
        Self {
            arns,
            namespaces,
            annotation: annotation.into(),
        }
    }

    /// Returns whether `role` may be assumed from `namespace`.
    ///
    /// No annotation on the namespace allows every role, including the empty
    /// one. With the annotation present an empty role is rejected outright:
    /// a restricted namespace must name its role explicitly.
    pub async fn is_whitelisted(&self, role: &str, namespace: &str) -> Result<bool, SyncError> {
        let ns = self
            .namespaces
            .get(namespace)
            .ok_or_else(|| SyncError::NamespaceNotFound {
                namespace: namespace.to_string(),
            })?;

        let Some(annotation) = ns.annotations.get(&self.annotation) else {
            return Ok(true);
        };

        if role.is_empty() {
            return Ok(false);
        }

        self.is_role_allowed(role, annotation, namespace).await
    }

    async fn is_role_allowed(
        &self,
        role: &str,
        annotation: &str,
        namespace: &str,
    ) -> Result<bool, SyncError> {
        let role_arn = self.arns.resolve(role).await?;

        // A restricted namespace with an unparseable allow-list fails closed.
        let allowed_roles: Vec<String> = serde_json::from_str(annotation).map_err(|e| {
            SyncError::denied(format!(
                "allowed-roles annotation on namespace {namespace} is not a JSON array: {e}"
            ))
        })?;

        for allowed in &allowed_roles {
            let allowed_arn = self.arns.resolve(allowed).await?;
            if role_arn == allowed_arn {
                return Ok(true);
            }
        }

        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::ALLOWED_ROLES_ANNOTATION;
    use crate::namespace::NamespaceMeta;
    use std::collections::{BTreeMap, HashMap};

    struct StaticNamespaces(HashMap<String, NamespaceMeta>);

    impl NamespaceGetter for StaticNamespaces {
        fn get(&self, name: &str) -> Option<NamespaceMeta> {
            self.0.get(name).cloned()
        }
    }

    fn validator(namespaces: HashMap<String, NamespaceMeta>) -> RoleValidator {
        RoleValidator::new(
            Arc::new(ArnResolver::with_base("arn:aws:iam::123456789012:role/")),
            Arc::new(StaticNamespaces(namespaces)),
            ALLOWED_ROLES_ANNOTATION,
        )
    }

    fn restricted(allowed: &str) -> NamespaceMeta {
        NamespaceMeta {
            labels: BTreeMap::new(),
            annotations: BTreeMap::from([(
                ALLOWED_ROLES_ANNOTATION.to_string(),
                allowed.to_string(),
            )]),
        }
    }

    #[tokio::test]
    async fn unrestricted_namespace_allows_everything() {
        let v = validator(HashMap::from([(
            "open".to_string(),
            NamespaceMeta::default(),
        )]));
        assert!(v.is_whitelisted("any-role", "open").await.expect("ok"));
        assert!(v.is_whitelisted("", "open").await.expect("ok"));
    }

    #[tokio::test]
    async fn restricted_namespace_rejects_empty_role() {
        let v = validator(HashMap::from([(
            "locked".to_string(),
            restricted(r#"["reader"]"#),
        )]));
        assert!(!v.is_whitelisted("", "locked").await.expect("ok"));
    }

    #[tokio::test]
    async fn comparison_is_by_normalized_identity() {
        // Allow-list names the full ARN; the candidate uses the bare name.
        let v = validator(HashMap::from([(
            "locked".to_string(),
            restricted(r#"["arn:aws:iam::123456789012:role/reader"]"#),
        )]));
        assert!(v.is_whitelisted("reader", "locked").await.expect("ok"));
        assert!(!v.is_whitelisted("writer", "locked").await.expect("ok"));
    }

    #[tokio::test]
    async fn invalid_role_reference_propagates() {
        let v = validator(HashMap::from([(
            "locked".to_string(),
            restricted(r#"["reader"]"#),
        )]));
        let err = v
            .is_whitelisted("arn:aws:iam::123456789012:nope", "locked")
            .await
            .expect_err("must fail");
        assert!(matches!(err, SyncError::InvalidRoleReference { .. }));
    }

    #[tokio::test]
    async fn unknown_namespace_is_an_error() {
        let v = validator(HashMap::new());
        let err = v
            .is_whitelisted("reader", "ghost")
            .await
            .expect_err("must fail");
        assert!(matches!(err, SyncError::NamespaceNotFound { .. }));
    }
}
