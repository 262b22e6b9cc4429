//! # IAM Role References
//!
//! Normalizes role references to fully-qualified IAM role ARNs.
//!
//! A reference is either a full ARN (validated and used as-is) or a bare role
//! name, which is qualified against the base ARN of the account the
//! controller runs in. The base ARN is discovered once from the EC2 instance
//! metadata service and can be overridden for clusters without IMDS access.
//!
//! Resolved ARNs are memoized in an explicit cache owned by the resolver, so
//! role comparison and per-role client construction never repeat the
//! normalization work.

use crate::error::SyncError;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

const FULL_ARN_PREFIX: &str = "arn:";

/// See <http://docs.aws.amazon.com/IAM/latest/UserGuide/reference_identifiers.html#identifiers-arns>
static ARN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^arn:(\w|-)*:iam::\d+:role/?(\w+|-|/|\.)*$")
        .expect("ARN regex is a constant and must compile")
});

/// Validates that a candidate is a well-formed IAM role ARN
pub fn is_valid_arn(arn: &str) -> bool {
    ARN_RE.is_match(arn)
}

/// Role-reference resolver with an explicit memoization cache
pub struct ArnResolver {
    cache: Mutex<HashMap<String, String>>,
    base_arn: tokio::sync::OnceCell<String>,
    base_override: Option<String>,
}

impl std::fmt::Debug for ArnResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArnResolver")
            .field("base_override", &self.base_override)
            .finish_non_exhaustive()
    }
}

impl ArnResolver {
    /// Resolver that discovers the base ARN from EC2 instance metadata on
    /// first use
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            base_arn: tokio::sync::OnceCell::new(),
            base_override: None,
        }
    }

    /// Resolver with a fixed base ARN, e.g. `arn:aws:iam::123456789012:role/`
    pub fn with_base(base: impl Into<String>) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            base_arn: tokio::sync::OnceCell::new(),
            base_override: Some(base.into()),
        }
    }

    /// Normalizes a role reference to a fully-qualified role ARN
    pub async fn resolve(&self, role: &str) -> Result<String, SyncError> {
        if let Some(arn) = self.cache.lock().expect("arn cache poisoned").get(role) {
            return Ok(arn.clone());
        }

        let arn = self.normalize(role).await?;
        self.cache
            .lock()
            .expect("arn cache poisoned")
            .insert(role.to_string(), arn.clone());
        Ok(arn)
    }

    async fn normalize(&self, role: &str) -> Result<String, SyncError> {
        if is_valid_arn(role) {
            return Ok(role.to_string());
        }

        // Something that claims to be an ARN but fails validation is a user
        // error, not a bare role name to qualify.
        if role.to_lowercase().starts_with(FULL_ARN_PREFIX) {
            return Err(SyncError::InvalidRoleReference {
                role: role.to_string(),
                reason: "not a valid IAM role ARN".to_string(),
            });
        }

        let base = self.base_arn(role).await?;
        let arn = format!("{base}{role}");
        if !is_valid_arn(&arn) {
            return Err(SyncError::InvalidRoleReference {
                role: role.to_string(),
                reason: format!("qualified ARN {arn} is not valid"),
            });
        }
        Ok(arn)
    }

    async fn base_arn(&self, role: &str) -> Result<String, SyncError> {
        if let Some(base) = &self.base_override {
            return Ok(base.clone());
        }
        self.base_arn
            .get_or_try_init(|| discover_base_arn(role))
            .await
            .cloned()
    }
}

impl Default for ArnResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Derives the account base ARN (`arn:aws:iam::{account}:role/`) from the
/// instance profile reported by the EC2 metadata service
async fn discover_base_arn(role: &str) -> Result<String, SyncError> {
    let invalid = |reason: String| SyncError::InvalidRoleReference {
        role: role.to_string(),
        reason,
    };

    let imds = aws_config::imds::Client::builder().build();
    let info = imds
        .get("/latest/meta-data/iam/info")
        .await
        .map_err(|e| invalid(format!("EC2 metadata unavailable: {e}")))?;

    let body: serde_json::Value = serde_json::from_str(info.as_ref())
        .map_err(|e| invalid(format!("unparseable IAM info from EC2 metadata: {e}")))?;
    let profile_arn = body
        .get("InstanceProfileArn")
        .and_then(|v| v.as_str())
        .ok_or_else(|| invalid("EC2 metadata IAM info has no InstanceProfileArn".to_string()))?;

    let arn = profile_arn.replacen("instance-profile", "role", 1);
    let (head, _) = arn
        .split_once('/')
        .ok_or_else(|| invalid(format!("cannot derive base ARN from {profile_arn}")))?;

    Ok(format!("{head}/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_role_arns() {
        assert!(is_valid_arn("arn:aws:iam::123456789012:role/secret-syncer"));
        assert!(is_valid_arn("arn:aws:iam::123456789012:role/team/nested.role"));
        assert!(!is_valid_arn("arn:aws:iam::123456789012:user/alice"));
        assert!(!is_valid_arn("arn:aws:iam::not-an-account:role/x"));
        assert!(!is_valid_arn("secret-syncer"));
    }

    #[tokio::test]
    async fn full_arn_passes_through() {
        let resolver = ArnResolver::with_base("arn:aws:iam::123456789012:role/");
        let arn = resolver
            .resolve("arn:aws:iam::999999999999:role/other")
            .await
            .expect("full ARN resolves");
        assert_eq!(arn, "arn:aws:iam::999999999999:role/other");
    }

    #[tokio::test]
    async fn bare_name_is_qualified_with_base() {
        let resolver = ArnResolver::with_base("arn:aws:iam::123456789012:role/");
        let arn = resolver.resolve("secret-syncer").await.expect("resolves");
        assert_eq!(arn, "arn:aws:iam::123456789012:role/secret-syncer");

        // Second resolve hits the cache and must agree.
        let again = resolver.resolve("secret-syncer").await.expect("resolves");
        assert_eq!(arn, again);
    }

    #[tokio::test]
    async fn malformed_arn_is_rejected() {
        let resolver = ArnResolver::with_base("arn:aws:iam::123456789012:role/");
        let err = resolver
            .resolve("arn:aws:iam::123456789012:nope")
            .await
            .expect_err("must reject");
        assert!(matches!(err, SyncError::InvalidRoleReference { .. }));
    }
}
