//! # Custom Resource Definitions
//!
//! CRD types for the SyncedSecret controller.
//!
//! A `SyncedSecret` declares how a native Kubernetes Secret is materialized
//! from AWS Secrets Manager: which credential role to assume, and how each
//! field of the generated Secret is sourced (literal, whole-secret copy,
//! single-key extraction, or a template).
//!
//! The generated Secret is always co-located and co-named with the
//! SyncedSecret; any name or namespace inside `secretMetadata` is ignored.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// SyncedSecret custom resource
///
/// # Example
///
/// ```yaml
/// apiVersion: secret-sync.microscaler.io/v1
/// kind: SyncedSecret
/// metadata:
///   name: demo-service
///   namespace: demo
/// spec:
///   IAMRole: demo-reader
///   dataFrom:
///     secretRef:
///       name: demo/credentials
///   data:
///     - name: endpoint
///       value: https://db.internal:5432
///     - name: password
///       valueFrom:
///         secretKeyRef:
///           name: demo/credentials
///           key: password
/// ```
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "secret-sync.microscaler.io",
    version = "v1",
    kind = "SyncedSecret",
    namespaced,
    status = "SyncedSecretStatus",
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".status.currentVersionID"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SyncedSecretSpec {
    /// Annotations and labels stamped onto the generated Secret
    #[serde(default)]
    pub secret_metadata: Option<SecretMetadata>,

    /// IAM role (name or full ARN) assumed for every fetch in one pass
    #[serde(default, rename = "IAMRole")]
    pub iam_role: Option<String>,

    /// AWS account id; resolves to `arn:aws:iam::{account}:role/{sync-role}`.
    /// Takes priority over IAMRole when both are set.
    #[serde(default, rename = "AWSAccountID")]
    pub aws_account_id: Option<String>,

    /// Named fields of the generated Secret, resolved in declaration order
    #[serde(default)]
    pub data: Option<Vec<SecretField>>,

    /// Whole-secret copy source, applied before `data`
    #[serde(default)]
    pub data_from: Option<DataFrom>,
}

/// Metadata forwarded to the generated Secret
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretMetadata {
    #[serde(default)]
    pub annotations: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub labels: Option<BTreeMap<String, String>>,
}

/// Whole-secret copy: every key of the referenced JSON object becomes a field
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataFrom {
    pub secret_ref: SecretRef,
}

/// Reference to a remote secret by id
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    pub name: String,
}

/// Reference to a single key inside a remote JSON secret
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
}

/// One named field of the generated Secret.
///
/// The source is a tagged variant: exactly one of `value` or `valueFrom`
/// applies, which keeps illegal combinations unrepresentable.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretField {
    pub name: String,
    #[serde(flatten)]
    pub source: FieldSource,
}

/// Where a field's bytes come from
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase", untagged)]
pub enum FieldSource {
    /// Verbatim literal
    Value { value: String },
    /// Derived from a remote secret
    From { value_from: ValueFrom },
}

/// Derivation of a field value from the remote store
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase", untagged)]
pub enum ValueFrom {
    /// Entire fetched string, unparsed
    SecretRef { secret_ref: SecretRef },
    /// One key extracted from the fetched JSON object
    SecretKeyRef { secret_key_ref: SecretKeyRef },
    /// Handlebars template rendered against the secret accessors
    Template { template: String },
}

/// Observed state of a SyncedSecret
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct SyncedSecretStatus {
    /// Remote version id the generated Secret was last materialized from
    #[serde(default, rename = "currentVersionID")]
    pub current_version_id: String,

    /// Hash of the generated data, used to diagnose drift of the Secret
    #[serde(
        default,
        rename = "generatedSecretHash",
        skip_serializing_if = "Option::is_none"
    )]
    pub generated_secret_hash: Option<String>,
}

impl SyncedSecretSpec {
    /// Credential role used for every fetch within one materialization pass.
    ///
    /// The AWSAccountID convention takes priority over an explicit IAMRole;
    /// with neither set the empty role selects the default client.
    pub fn credential_role(&self, sync_role_name: &str) -> String {
        if let Some(account) = &self.aws_account_id {
            format!("arn:aws:iam::{account}:role/{sync_role_name}")
        } else {
            self.iam_role.clone().unwrap_or_default()
        }
    }

    /// Whether the resource opted into cross-account secret scoping
    pub fn has_account_scoping(&self) -> bool {
        self.aws_account_id.is_some()
    }

    /// Distinct remote secret ids referenced directly by the spec, in
    /// declaration order. Secrets fetched from inside templates are resolved
    /// at render time and cannot be enumerated here.
    pub fn declared_secret_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = Vec::new();
        if let Some(data_from) = &self.data_from {
            ids.push(data_from.secret_ref.name.as_str());
        }
        if let Some(fields) = &self.data {
            for field in fields {
                if let FieldSource::From { value_from } = &field.source {
                    match value_from {
                        ValueFrom::SecretRef { secret_ref } => ids.push(secret_ref.name.as_str()),
                        ValueFrom::SecretKeyRef { secret_key_ref } => {
                            ids.push(secret_key_ref.name.as_str());
                        }
                        ValueFrom::Template { .. } => {}
                    }
                }
            }
        }
        let mut seen = std::collections::HashSet::new();
        ids.retain(|id| seen.insert(*id));
        ids
    }

    /// The reference whose remote version is reported in status: the
    /// whole-secret source if present, otherwise the first declared reference.
    pub fn primary_secret_id(&self) -> Option<&str> {
        self.declared_secret_ids().first().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_from_json(value: serde_json::Value) -> SyncedSecretSpec {
        serde_json::from_value(value).expect("spec should deserialize")
    }

    #[test]
    fn field_source_variants_deserialize() {
        let spec = spec_from_json(serde_json::json!({
            "data": [
                {"name": "literal", "value": "v"},
                {"name": "whole", "valueFrom": {"secretRef": {"name": "db/creds"}}},
                {"name": "one", "valueFrom": {"secretKeyRef": {"name": "db/creds", "key": "password"}}},
                {"name": "tpl", "valueFrom": {"template": "{{getSecretValue \"db/creds\"}}"}},
            ]
        }));

        let fields = spec.data.expect("data fields");
        assert!(matches!(fields[0].source, FieldSource::Value { .. }));
        assert!(matches!(
            fields[1].source,
            FieldSource::From {
                value_from: ValueFrom::SecretRef { .. }
            }
        ));
        assert!(matches!(
            fields[2].source,
            FieldSource::From {
                value_from: ValueFrom::SecretKeyRef { .. }
            }
        ));
        assert!(matches!(
            fields[3].source,
            FieldSource::From {
                value_from: ValueFrom::Template { .. }
            }
        ));
    }

    #[test]
    fn account_id_convention_takes_priority() {
        let spec = spec_from_json(serde_json::json!({
            "AWSAccountID": "123456789012",
            "IAMRole": "explicit-role",
        }));
        assert_eq!(
            spec.credential_role("secret-syncer"),
            "arn:aws:iam::123456789012:role/secret-syncer"
        );

        // Same outcome with the keys declared in the opposite order.
        let spec = spec_from_json(serde_json::json!({
            "IAMRole": "explicit-role",
            "AWSAccountID": "123456789012",
        }));
        assert_eq!(
            spec.credential_role("secret-syncer"),
            "arn:aws:iam::123456789012:role/secret-syncer"
        );
    }

    #[test]
    fn explicit_role_used_without_account_id() {
        let spec = spec_from_json(serde_json::json!({"IAMRole": "explicit-role"}));
        assert_eq!(spec.credential_role("secret-syncer"), "explicit-role");

        let empty = spec_from_json(serde_json::json!({}));
        assert_eq!(empty.credential_role("secret-syncer"), "");
    }

    #[test]
    fn declared_secret_ids_dedup_in_order() {
        let spec = spec_from_json(serde_json::json!({
            "dataFrom": {"secretRef": {"name": "app/all"}},
            "data": [
                {"name": "a", "valueFrom": {"secretKeyRef": {"name": "db/creds", "key": "user"}}},
                {"name": "b", "valueFrom": {"secretRef": {"name": "app/all"}}},
                {"name": "c", "valueFrom": {"secretKeyRef": {"name": "db/creds", "key": "password"}}},
            ]
        }));

        assert_eq!(spec.declared_secret_ids(), vec!["app/all", "db/creds"]);
        assert_eq!(spec.primary_secret_id(), Some("app/all"));
    }
}
