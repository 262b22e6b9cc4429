//! # AWS Secrets Manager Client
//!
//! `SecretsManagerApi` implementation on top of the official AWS SDK.
//!
//! Retry and timeout policy live in the SDK config loaded by the factory,
//! not here; a failed call is surfaced to the caller as-is.

use super::{DescribedSecret, FetchedValue, RemoteSecretEntry, SecretsManagerApi};
use crate::constants::LIST_SECRETS_PAGE_SIZE;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_sdk_secretsmanager::Client as SecretsManagerClient;
use std::collections::BTreeMap;
use tracing::debug;

/// AWS Secrets Manager backed implementation
pub struct AwsSecretsManager {
    client: SecretsManagerClient,
}

impl std::fmt::Debug for AwsSecretsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsSecretsManager").finish_non_exhaustive()
    }
}

impl AwsSecretsManager {
    pub fn new(client: SecretsManagerClient) -> Self {
        Self { client }
    }
}

fn tags_to_map(tags: Option<Vec<aws_sdk_secretsmanager::types::Tag>>) -> BTreeMap<String, String> {
    tags.unwrap_or_default()
        .into_iter()
        .filter_map(|t| match (t.key, t.value) {
            (Some(k), Some(v)) => Some((k, v)),
            _ => None,
        })
        .collect()
}

fn to_chrono(dt: &aws_sdk_secretsmanager::primitives::DateTime) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}

#[async_trait]
impl SecretsManagerApi for AwsSecretsManager {
    async fn list_secrets(&self) -> Result<Vec<RemoteSecretEntry>> {
        let mut entries = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let page = self
                .client
                .list_secrets()
                .max_results(LIST_SECRETS_PAGE_SIZE)
                .set_next_token(next_token.take())
                .send()
                .await
                .context("failed listing secrets")?;

            for entry in page.secret_list.unwrap_or_default() {
                let Some(name) = entry.name else {
                    continue;
                };
                entries.push(RemoteSecretEntry {
                    name,
                    deleted: entry.deleted_date.is_some(),
                    tags: tags_to_map(entry.tags),
                    versions_to_stages: entry.secret_versions_to_stages.unwrap_or_default(),
                    last_changed: entry.last_changed_date.as_ref().and_then(to_chrono),
                });
            }

            next_token = page.next_token;
            if next_token.is_none() {
                break;
            }
        }

        debug!("listed {} secrets from Secrets Manager", entries.len());
        Ok(entries)
    }

    async fn get_secret_value(&self, secret_id: &str, stage: &str) -> Result<FetchedValue> {
        let out = self
            .client
            .get_secret_value()
            .secret_id(secret_id)
            .version_stage(stage)
            .send()
            .await
            .with_context(|| format!("can't find {stage} version for secret {secret_id}"))?;

        let secret_string = out
            .secret_string
            .or_else(|| {
                out.secret_binary
                    .map(|blob| String::from_utf8_lossy(blob.as_ref()).into_owned())
            })
            .ok_or_else(|| anyhow!("secret {secret_id} has no string or binary value"))?;
        let version_id = out
            .version_id
            .ok_or_else(|| anyhow!("secret {secret_id} value carries no version id"))?;

        Ok(FetchedValue {
            secret_string,
            version_id,
        })
    }

    async fn describe_secret(&self, secret_id: &str) -> Result<DescribedSecret> {
        let out = self
            .client
            .describe_secret()
            .secret_id(secret_id)
            .send()
            .await
            .with_context(|| format!("failed describing secret {secret_id}"))?;

        Ok(DescribedSecret {
            arn: out.arn,
            tags: tags_to_map(out.tags),
        })
    }
}
