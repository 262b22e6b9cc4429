//! # Provider Modules
//!
//! Seam between the sync core and AWS Secrets Manager.
//!
//! The poller and the reconciler only see the `SecretsManagerApi` trait and
//! the `ClientProvider` factory trait, which keeps the core testable with
//! in-memory fakes. The production factory memoizes one client per
//! normalized role ARN so assume-role setup cost is paid once per role.

use crate::constants::STS_SESSION_NAME;
use crate::error::SyncError;
use crate::iam::ArnResolver;
use anyhow::Result;
use async_trait::async_trait;
use aws_config::sts::AssumeRoleProvider;
use aws_config::SdkConfig;
use aws_sdk_secretsmanager::Client as SecretsManagerClient;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::debug;

pub mod aws;

pub use aws::AwsSecretsManager;

/// One entry of the remote store's listing
#[derive(Debug, Clone, Default)]
pub struct RemoteSecretEntry {
    pub name: String,
    /// Marked for deletion upstream; such entries never reach the catalog
    pub deleted: bool,
    pub tags: BTreeMap<String, String>,
    /// Opaque version id to the stage labels attached to it
    pub versions_to_stages: HashMap<String, Vec<String>>,
    pub last_changed: Option<DateTime<Utc>>,
}

/// A secret value fetched at a specific stage
#[derive(Debug, Clone)]
pub struct FetchedValue {
    pub secret_string: String,
    pub version_id: String,
}

/// Metadata from a describe call, used when a referenced secret is not in
/// the polled catalog (e.g. cross-account references)
#[derive(Debug, Clone, Default)]
pub struct DescribedSecret {
    pub arn: Option<String>,
    pub tags: BTreeMap<String, String>,
}

/// Remote secret store operations the core depends on
#[async_trait]
pub trait SecretsManagerApi: Send + Sync {
    /// Lists all secrets, driving pagination internally
    async fn list_secrets(&self) -> Result<Vec<RemoteSecretEntry>>;

    /// Fetches the value of a secret at the given stage label
    async fn get_secret_value(&self, secret_id: &str, stage: &str) -> Result<FetchedValue>;

    /// Fetches metadata (tags, ARN) of one secret
    async fn describe_secret(&self, secret_id: &str) -> Result<DescribedSecret>;
}

/// Hands out store clients scoped to a credential role
#[async_trait]
pub trait ClientProvider: Send + Sync {
    /// A client for the given role; the empty role selects the default
    /// credential chain
    async fn client_for_role(&self, role: &str) -> Result<Arc<dyn SecretsManagerApi>, SyncError>;
}

/// Production client factory.
///
/// Owns the memoization cache explicitly instead of hiding it in global
/// state: one assumed-role client per normalized role ARN, plus a default
/// client for requests without a role.
pub struct ClientFactory {
    base_config: SdkConfig,
    arns: Arc<ArnResolver>,
    default_client: Arc<dyn SecretsManagerApi>,
    assumed: Mutex<HashMap<String, Arc<dyn SecretsManagerApi>>>,
}

impl std::fmt::Debug for ClientFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientFactory").finish_non_exhaustive()
    }
}

impl ClientFactory {
    /// Loads the default AWS config (region, credentials, retry policy from
    /// the environment) and wraps it for per-role client construction
    pub async fn new(arns: Arc<ArnResolver>) -> Self {
        let base_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .load()
            .await;
        let default_client: Arc<dyn SecretsManagerApi> = Arc::new(AwsSecretsManager::new(
            SecretsManagerClient::new(&base_config),
        ));
        Self {
            base_config,
            arns,
            default_client,
            assumed: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ClientProvider for ClientFactory {
    async fn client_for_role(&self, role: &str) -> Result<Arc<dyn SecretsManagerApi>, SyncError> {
        if role.is_empty() {
            return Ok(Arc::clone(&self.default_client));
        }

        let arn = self.arns.resolve(role).await?;

        if let Some(client) = self
            .assumed
            .lock()
            .expect("client cache poisoned")
            .get(&arn)
        {
            return Ok(Arc::clone(client));
        }

        debug!("building assumed-role Secrets Manager client for {arn}");
        let credentials = AssumeRoleProvider::builder(&arn)
            .session_name(STS_SESSION_NAME)
            .configure(&self.base_config)
            .build()
            .await;
        let conf = aws_sdk_secretsmanager::config::Builder::from(&self.base_config)
            .credentials_provider(credentials)
            .build();
        let client: Arc<dyn SecretsManagerApi> =
            Arc::new(AwsSecretsManager::new(SecretsManagerClient::from_conf(conf)));

        self.assumed
            .lock()
            .expect("client cache poisoned")
            .insert(arn, Arc::clone(&client));
        Ok(client)
    }
}
