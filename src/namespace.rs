//! # Namespace Metadata
//!
//! Lookup-by-name access to namespace labels and annotations.
//!
//! The access validators only need `get(name)`; production backs it with a
//! watch-populated reflector store so reconciliations never hit the API
//! server for namespace metadata.

use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use std::collections::BTreeMap;
use tracing::warn;

/// Labels and annotations of one namespace
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceMeta {
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl From<&Namespace> for NamespaceMeta {
    fn from(ns: &Namespace) -> Self {
        Self {
            labels: ns.metadata.labels.clone().unwrap_or_default(),
            annotations: ns.metadata.annotations.clone().unwrap_or_default(),
        }
    }
}

/// Lookup capability consumed by the access validators
pub trait NamespaceGetter: Send + Sync {
    /// Returns the namespace metadata, or None if the namespace is unknown
    fn get(&self, name: &str) -> Option<NamespaceMeta>;
}

/// Reflector-backed namespace cache
pub struct NamespaceCache {
    store: Store<Namespace>,
}

impl std::fmt::Debug for NamespaceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceCache").finish_non_exhaustive()
    }
}

impl NamespaceCache {
    /// Starts the namespace watch and waits for the initial list to land,
    /// so validators never run against an empty store.
    pub async fn start(client: Client) -> anyhow::Result<Self> {
        let api: Api<Namespace> = Api::all(client);
        let (store, writer) = reflector::store();

        let stream = reflector::reflector(writer, watcher(api, watcher::Config::default()));
        tokio::spawn(async move {
            stream
                .applied_objects()
                .for_each(|res| async {
                    if let Err(e) = res {
                        warn!("namespace watch error: {e}");
                    }
                })
                .await;
        });

        store.wait_until_ready().await?;
        Ok(Self { store })
    }
}

impl NamespaceGetter for NamespaceCache {
    fn get(&self, name: &str) -> Option<NamespaceMeta> {
        self.store
            .get(&ObjectRef::new(name))
            .map(|ns| NamespaceMeta::from(ns.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta;

    #[test]
    fn meta_conversion_defaults_to_empty_maps() {
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some("demo".to_string()),
                ..ObjectMeta::default()
            },
            ..Namespace::default()
        };
        let meta = NamespaceMeta::from(&ns);
        assert!(meta.labels.is_empty());
        assert!(meta.annotations.is_empty());
    }

    #[test]
    fn meta_conversion_copies_labels_and_annotations() {
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some("demo".to_string()),
                labels: Some(BTreeMap::from([(
                    "secret-sync.microscaler.io/namespace-type".to_string(),
                    "integration".to_string(),
                )])),
                annotations: Some(BTreeMap::from([(
                    "iam.amazonaws.com/allowed-roles".to_string(),
                    "[\"reader\"]".to_string(),
                )])),
                ..ObjectMeta::default()
            },
            ..Namespace::default()
        };
        let meta = NamespaceMeta::from(&ns);
        assert_eq!(
            meta.labels.get("secret-sync.microscaler.io/namespace-type"),
            Some(&"integration".to_string())
        );
        assert_eq!(
            meta.annotations.get("iam.amazonaws.com/allowed-roles"),
            Some(&"[\"reader\"]".to_string())
        );
    }
}
