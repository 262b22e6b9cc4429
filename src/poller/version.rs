//! # Version Resolver
//!
//! Picks the version id that carries the AWSCURRENT stage label.

use crate::constants::CURRENT_STAGE_LABEL;
use crate::error::SyncError;
use std::collections::HashMap;

/// Returns the version id whose stage list contains AWSCURRENT.
///
/// Secrets Manager moves the label atomically on rotation, so at most one
/// version is expected to carry it; if the store ever reports several, the
/// iteration order decides which one wins. Zero carriers is an error.
pub fn current_version_id(
    secret_id: &str,
    versions_to_stages: &HashMap<String, Vec<String>>,
) -> Result<String, SyncError> {
    for (version_id, stages) in versions_to_stages {
        if stages.iter().any(|stage| stage == CURRENT_STAGE_LABEL) {
            return Ok(version_id.clone());
        }
    }
    Err(SyncError::NoCurrentVersion {
        secret_id: secret_id.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stages(pairs: &[(&str, &[&str])]) -> HashMap<String, Vec<String>> {
        pairs
            .iter()
            .map(|(id, labels)| {
                (
                    (*id).to_string(),
                    labels.iter().map(|l| (*l).to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn picks_the_version_carrying_awscurrent() {
        let map = stages(&[
            ("v-old", &["AWSPREVIOUS"]),
            ("v-new", &["AWSCURRENT", "AWSPENDING"]),
        ]);
        assert_eq!(
            current_version_id("db/creds", &map).expect("resolves"),
            "v-new"
        );
    }

    #[test]
    fn fails_when_no_version_is_current() {
        let map = stages(&[("v-old", &["AWSPREVIOUS"]), ("v-stale", &[])]);
        let err = current_version_id("db/creds", &map).expect_err("must fail");
        assert!(matches!(err, SyncError::NoCurrentVersion { .. }));
    }

    #[test]
    fn fails_on_empty_stage_map() {
        let err = current_version_id("db/creds", &HashMap::new()).expect_err("must fail");
        assert!(matches!(err, SyncError::NoCurrentVersion { .. }));
    }
}
