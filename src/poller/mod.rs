//! # Polling Cache
//!
//! Keeps an eventually-consistent view of Secrets Manager without a live
//! round-trip per reconciliation.
//!
//! Two pieces of shared state:
//!
//! - the **catalog**: metadata (tags, current version id, last change) for
//!   every listed secret, rebuilt wholesale on each poll cycle and swapped
//!   atomically behind an `Arc`, so readers see either the old or the new
//!   snapshot, never a half-updated one;
//! - the **value cache**: a capacity-bounded LRU of fetched values keyed by
//!   (secret id, credential role). A cached value is only served while its
//!   version id still matches the catalog's current version for that secret,
//!   which makes the cache self-invalidating without timers.
//!
//! Lifecycle: construction performs one synchronous catalog fetch (callers
//! never reconcile against an empty catalog), then a background task refreshes
//! on a fixed interval until `stop()` is awaited; the stop acknowledgment only
//! arrives after the in-flight tick completes.

use crate::constants::CURRENT_STAGE_LABEL;
use crate::error::SyncError;
use crate::observability::metrics;
use crate::provider::ClientProvider;
use anyhow::Context;
use chrono::{DateTime, Utc};
use lru::LruCache;
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub mod version;

pub use version::current_version_id;

/// Metadata of one polled secret
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSecretMeta {
    pub tags: BTreeMap<String, String>,
    pub current_version_id: String,
    pub last_changed: Option<DateTime<Utc>>,
}

/// Snapshot of all polled secrets, keyed by secret id
pub type Catalog = HashMap<String, RemoteSecretMeta>;

/// Restricts a catalog to the entries carrying the given tag key
pub fn filter_by_tag_key(catalog: &Catalog, tag_key: &str) -> Catalog {
    catalog
        .iter()
        .filter(|(_, meta)| meta.tags.contains_key(tag_key))
        .map(|(name, meta)| (name.clone(), meta.clone()))
        .collect()
}

#[derive(Debug, Clone)]
struct CachedValue {
    secret_value: String,
    version_id: String,
}

/// Polling cache over the remote secret store
pub struct Poller {
    clients: Arc<dyn ClientProvider>,
    catalog: RwLock<Arc<Catalog>>,
    values: Mutex<LruCache<(String, String), CachedValue>>,
    quit: watch::Sender<bool>,
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller").finish_non_exhaustive()
    }
}

impl Poller {
    /// Fetches the catalog once, then spawns the refresh loop.
    ///
    /// Poll failures after startup are transient by default: they keep the
    /// previous catalog and are reported through `error_tx`, never to a
    /// caller. Only the initial fetch is allowed to fail construction.
    pub async fn start(
        clients: Arc<dyn ClientProvider>,
        interval: Duration,
        cache_capacity: usize,
        error_tx: mpsc::UnboundedSender<anyhow::Error>,
    ) -> anyhow::Result<Arc<Self>> {
        let capacity =
            NonZeroUsize::new(cache_capacity.max(1)).expect("capacity clamped to at least 1");
        let (quit, quit_rx) = watch::channel(false);

        let poller = Arc::new(Self {
            clients,
            catalog: RwLock::new(Arc::new(Catalog::new())),
            values: Mutex::new(LruCache::new(capacity)),
            quit,
            handle: tokio::sync::Mutex::new(None),
        });

        poller
            .refresh()
            .await
            .context("initial catalog fetch failed")?;

        let task = tokio::spawn(Self::run(Arc::clone(&poller), interval, quit_rx, error_tx));
        *poller.handle.lock().await = Some(task);

        info!(
            "poller started: {} secrets in catalog, refresh every {}s",
            poller.catalog().len(),
            interval.as_secs()
        );
        Ok(poller)
    }

    /// Signals the refresh loop to drain and waits for it to finish.
    /// Idempotent; later calls return immediately.
    pub async fn stop(&self) {
        let _ = self.quit.send(true);
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }

    /// Current catalog snapshot
    pub fn catalog(&self) -> Arc<Catalog> {
        Arc::clone(&self.catalog.read().expect("catalog lock poisoned"))
    }

    /// Fetches the catalog once and swaps it in on success.
    ///
    /// A listing failure aborts the whole fetch and leaves the previous
    /// catalog untouched; a secret without a resolvable current version is
    /// skipped so one malformed secret cannot hide all others.
    pub async fn refresh(&self) -> anyhow::Result<()> {
        let client = self
            .clients
            .client_for_role("")
            .await
            .context("failed building catalog client")?;
        let entries = client.list_secrets().await?;

        let mut catalog = Catalog::with_capacity(entries.len());
        for entry in entries {
            if entry.deleted {
                continue;
            }
            let Ok(version_id) = current_version_id(&entry.name, &entry.versions_to_stages) else {
                debug!("skipping secret {} with no current version", entry.name);
                continue;
            };
            catalog.insert(
                entry.name,
                RemoteSecretMeta {
                    tags: entry.tags,
                    current_version_id: version_id,
                    last_changed: entry.last_changed,
                },
            );
        }

        metrics::set_catalog_size(catalog.len() as i64);
        *self.catalog.write().expect("catalog lock poisoned") = Arc::new(catalog);
        Ok(())
    }

    /// Returns (value, version id) for a secret under a credential role.
    ///
    /// Serves the cached value only while its version matches the catalog's
    /// current version; otherwise fetches live at the AWSCURRENT stage
    /// through the role-scoped client and re-caches. Fetch failures are
    /// returned, never cached.
    pub async fn get_secret(
        &self,
        secret_id: &str,
        role: &str,
    ) -> Result<(String, String), SyncError> {
        if let Some((value, version_id)) = self.cached_value(secret_id, role) {
            metrics::increment_value_cache_hits();
            return Ok((value, version_id));
        }
        metrics::increment_value_cache_misses();

        let client = self.clients.client_for_role(role).await?;
        let fetched = client
            .get_secret_value(secret_id, CURRENT_STAGE_LABEL)
            .await
            .map_err(|e| SyncError::RemoteFetchFailed {
                secret_id: secret_id.to_string(),
                source: e,
            })?;

        self.values
            .lock()
            .expect("value cache poisoned")
            .put(
                (secret_id.to_string(), role.to_string()),
                CachedValue {
                    secret_value: fetched.secret_string.clone(),
                    version_id: fetched.version_id.clone(),
                },
            );

        Ok((fetched.secret_string, fetched.version_id))
    }

    fn cached_value(&self, secret_id: &str, role: &str) -> Option<(String, String)> {
        let current = {
            let catalog = self.catalog();
            catalog.get(secret_id)?.current_version_id.clone()
        };

        let mut values = self.values.lock().expect("value cache poisoned");
        let hit = values.get(&(secret_id.to_string(), role.to_string()))?;
        // Physically present but logically stale entries are left for
        // eviction; the version mismatch alone disqualifies them.
        (hit.version_id == current).then(|| (hit.secret_value.clone(), hit.version_id.clone()))
    }

    async fn run(
        poller: Arc<Self>,
        interval: Duration,
        mut quit_rx: watch::Receiver<bool>,
        error_tx: mpsc::UnboundedSender<anyhow::Error>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The catalog was already fetched synchronously at construction.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match poller.refresh().await {
                        Ok(()) => metrics::increment_poll_cycles(),
                        Err(e) => {
                            metrics::increment_poll_errors();
                            let _ = error_tx.send(e.context("failed polling secrets"));
                        }
                    }
                }
                _ = quit_rx.changed() => {
                    debug!("poller draining");
                    break;
                }
            }
        }
        // error_tx drops here, closing the reporting channel.
    }
}
