//! # Controller
//!
//! Reconciliation orchestrator for SyncedSecret resources.
//!
//! Per resource event: resolve the credential role, run the access
//! validators (tag scoping before any fetch when the resource uses the
//! account-id convention, role whitelisting otherwise), materialize the data
//! map, create or update the native Secret, and report status. Every exit
//! path records the outcome in the shared sync-state map, which feeds the
//! success/failure gauges.
//!
//! Validation and materialization failures abort only the current resource's
//! pass; the next timer or watch event is the retry mechanism.

use crate::crd::{SyncedSecret, SyncedSecretStatus};
use crate::error::SyncError;
use crate::materialize::{self, SecretFetcher};
use crate::observability::metrics;
use crate::poller::{Catalog, Poller};
use crate::provider::ClientProvider;
use crate::validation::{RoleValidator, SecretTagValidator};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::core::ObjectMeta;
use kube::{Client, ResourceExt};
use kube_runtime::controller::Action;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error("reconciliation failed: {0}")]
    ReconciliationFailed(#[from] SyncError),
}

/// Tunables shared by all reconciliations
#[derive(Debug, Clone)]
pub struct Settings {
    /// Role name used by the AWSAccountID convention
    pub sync_role_name: String,
    /// Requeue interval after a successful pass
    pub reconcile_interval: Duration,
    /// Requeue interval after a failed pass
    pub error_requeue: Duration,
}

/// Per-resource outcome map; one pass over it yields the success/failure
/// counts reported as gauges. Reset-on-write per resource, never persisted.
#[derive(Debug, Default)]
pub struct SyncState {
    inner: Mutex<HashMap<String, bool>>,
}

impl SyncState {
    /// Overwrites the resource's outcome and returns (success, failure)
    /// counts across all resources seen so far
    pub fn record(&self, resource: &str, ok: bool) -> (i64, i64) {
        let mut state = self.inner.lock().expect("sync state poisoned");
        state.insert(resource.to_string(), ok);
        let success = state.values().filter(|ok| **ok).count() as i64;
        let failures = state.len() as i64 - success;
        (success, failures)
    }
}

/// Shared context handed to every reconciliation
pub struct Context {
    pub client: Client,
    pub poller: Arc<Poller>,
    pub clients: Arc<dyn ClientProvider>,
    pub role_validator: RoleValidator,
    pub tag_validator: SecretTagValidator,
    pub settings: Settings,
    sync_state: SyncState,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Context {
    pub fn new(
        client: Client,
        poller: Arc<Poller>,
        clients: Arc<dyn ClientProvider>,
        role_validator: RoleValidator,
        tag_validator: SecretTagValidator,
        settings: Settings,
    ) -> Self {
        Self {
            client,
            poller,
            clients,
            role_validator,
            tag_validator,
            settings,
            sync_state: SyncState::default(),
        }
    }

    /// Overwrites the resource's outcome and refreshes the derived gauges
    fn record_outcome(&self, resource: &str, ok: bool) {
        let (success, failures) = self.sync_state.record(resource, ok);
        metrics::set_sync_state(success, failures);
    }
}

/// Main reconciliation entry point, wired into the controller runtime
pub async fn reconcile(
    cs: Arc<SyncedSecret>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcilerError> {
    let start = Instant::now();
    metrics::increment_reconciliations();

    let name = cs.name_any();
    let namespace = cs.namespace().unwrap_or_else(|| "default".to_string());

    // Refetch the live object: the resource may have been deleted between
    // the trigger and now, which is a no-op rather than an error.
    let api: Api<SyncedSecret> = Api::namespaced(ctx.client.clone(), &namespace);
    let Some(cs) = api.get_opt(&name).await.map_err(SyncError::from)? else {
        info!("SyncedSecret {namespace}/{name} is gone, nothing to do");
        return Ok(Action::await_change());
    };

    match reconcile_inner(&cs, &ctx, &name, &namespace).await {
        Ok(()) => {
            ctx.record_outcome(&name, true);
            metrics::observe_reconciliation_duration(start.elapsed().as_secs_f64());
            debug!(
                "reconciled SyncedSecret {namespace}/{name} in {:.2}s",
                start.elapsed().as_secs_f64()
            );
            Ok(Action::requeue(ctx.settings.reconcile_interval))
        }
        Err(e) => {
            ctx.record_outcome(&name, false);
            error!("failed reconciling SyncedSecret {namespace}/{name}: {e}");
            Err(ReconcilerError::ReconciliationFailed(e))
        }
    }
}

/// Error policy for the controller runtime: count and retry on a fixed delay
pub fn error_policy(cs: Arc<SyncedSecret>, error: &ReconcilerError, ctx: Arc<Context>) -> Action {
    error!(
        "reconciliation error for {}: {error}",
        cs.name_any()
    );
    metrics::increment_reconciliation_errors();
    Action::requeue(ctx.settings.error_requeue)
}

async fn reconcile_inner(
    cs: &SyncedSecret,
    ctx: &Context,
    name: &str,
    namespace: &str,
) -> Result<(), SyncError> {
    let role = cs.spec.credential_role(&ctx.settings.sync_role_name);
    let catalog = ctx.poller.catalog();

    // Validate before any value fetch, so unauthorized requests cannot probe
    // for a secret's existence or content through side channels.
    if cs.spec.has_account_scoping() {
        authorize_secret_refs(cs, ctx, &catalog, namespace, &role).await?;
    } else {
        let allowed = ctx.role_validator.is_whitelisted(&role, namespace).await?;
        if !allowed {
            return Err(SyncError::denied(format!(
                "role {role:?} not allowed in namespace {namespace}"
            )));
        }
    }

    let data = materialize::render_data(
        &cs.spec,
        &role,
        Arc::clone(&catalog),
        Arc::clone(&ctx.poller) as Arc<dyn SecretFetcher>,
    )
    .await?;
    metrics::set_generated_bytes(name, data.values().map(Vec::len).sum::<usize>() as i64);

    let desired = build_secret(cs, data);
    apply_secret(ctx, namespace, name, &desired).await?;
    update_status(ctx, cs, &catalog, &desired, name, namespace).await?;
    Ok(())
}

/// Tag-scoping check for every remote secret the spec references directly.
/// Catalog metadata answers for listed secrets; uncataloged references
/// (e.g. cross-account ids) fall back to a live describe call.
async fn authorize_secret_refs(
    cs: &SyncedSecret,
    ctx: &Context,
    catalog: &Arc<Catalog>,
    namespace: &str,
    role: &str,
) -> Result<(), SyncError> {
    for secret_id in cs.spec.declared_secret_ids() {
        let tags = match catalog.get(secret_id) {
            Some(meta) => meta.tags.clone(),
            None => {
                let client = ctx.clients.client_for_role(role).await?;
                client
                    .describe_secret(secret_id)
                    .await
                    .map_err(|e| SyncError::RemoteFetchFailed {
                        secret_id: secret_id.to_string(),
                        source: e,
                    })?
                    .tags
            }
        };

        if !ctx.tag_validator.has_namespace_type(&tags, namespace)? {
            return Err(SyncError::denied(format!(
                "secret {secret_id} is not tagged for the type of namespace {namespace}"
            )));
        }
    }
    Ok(())
}

/// Builds the native Secret from a resolved data map.
///
/// Name and namespace always come from the SyncedSecret itself; only labels
/// and annotations are taken from `secretMetadata`.
pub fn build_secret(cs: &SyncedSecret, data: BTreeMap<String, Vec<u8>>) -> Secret {
    let annotations = cs
        .spec
        .secret_metadata
        .as_ref()
        .and_then(|m| m.annotations.clone())
        .filter(|m| !m.is_empty());
    let labels = cs
        .spec
        .secret_metadata
        .as_ref()
        .and_then(|m| m.labels.clone())
        .filter(|m| !m.is_empty());

    Secret {
        metadata: ObjectMeta {
            name: Some(cs.name_any()),
            namespace: cs.namespace(),
            annotations,
            labels,
            ..ObjectMeta::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(
            data.into_iter()
                .map(|(key, value)| (key, ByteString(value)))
                .collect(),
        ),
        ..Secret::default()
    }
}

/// Whether two Secrets materialize the same content.
/// Only data and annotations participate; a labels-only difference does not
/// trigger a rewrite.
pub fn secrets_equal(a: &Secret, b: &Secret) -> bool {
    a.data == b.data && a.metadata.annotations == b.metadata.annotations
}

async fn apply_secret(
    ctx: &Context,
    namespace: &str,
    name: &str,
    desired: &Secret,
) -> Result<(), SyncError> {
    let api: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);

    match api.get_opt(name).await? {
        None => {
            api.create(&PostParams::default(), desired).await?;
            info!("created secret {namespace}/{name}");
        }
        Some(existing) => {
            if secrets_equal(&existing, desired) {
                debug!("secret {namespace}/{name} unchanged, skipping update");
                return Ok(());
            }
            let mut updated = desired.clone();
            updated.metadata.resource_version = existing.metadata.resource_version.clone();
            api.replace(name, &PostParams::default(), &updated).await?;
            info!("updated secret {namespace}/{name}");
        }
    }
    Ok(())
}

async fn update_status(
    ctx: &Context,
    cs: &SyncedSecret,
    catalog: &Arc<Catalog>,
    desired: &Secret,
    name: &str,
    namespace: &str,
) -> Result<(), SyncError> {
    let current_version_id = cs
        .spec
        .primary_secret_id()
        .and_then(|id| catalog.get(id))
        .map(|meta| meta.current_version_id.clone())
        .unwrap_or_default();

    let status = SyncedSecretStatus {
        current_version_id,
        generated_secret_hash: Some(hash_secret_data(desired)),
    };

    let api: Api<SyncedSecret> = Api::namespaced(ctx.client.clone(), namespace);
    api.patch_status(
        name,
        &PatchParams::default(),
        &Patch::Merge(serde_json::json!({ "status": status })),
    )
    .await?;
    Ok(())
}

/// Stable hash of the generated data, reported in status for drift diagnosis
pub fn hash_secret_data(secret: &Secret) -> String {
    let mut hasher = Sha256::new();
    if let Some(data) = &secret.data {
        for (key, ByteString(value)) in data {
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value);
            hasher.update(b"\n");
        }
    }
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}
