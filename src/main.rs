//! # SyncedSecret Controller
//!
//! A Kubernetes controller that materializes `SyncedSecret` resources from
//! AWS Secrets Manager into native Secrets.
//!
//! ## Overview
//!
//! 1. **Polling cache** - A background task keeps a versioned catalog of
//!    remote secret metadata and a bounded cache of fetched values, so
//!    reconciliations rarely pay a live round-trip
//! 2. **Access control** - Namespace annotations whitelist the IAM roles a
//!    namespace may assume; remote-secret tags scope cross-account secrets
//!    to namespace types
//! 3. **Materialization** - Literal fields, whole-secret copies, single-key
//!    extractions and handlebars templates resolve into the data map of the
//!    generated Secret
//! 4. **Reconciliation** - The generated Secret is created or updated only
//!    when its content actually changed, and the observed remote version is
//!    reported in status
//!
//! ## Features
//!
//! - **Multi-namespace**: watches `SyncedSecret` resources across all namespaces
//! - **Per-role credentials**: one assumed-role client per referenced IAM role
//! - **Prometheus metrics**: sync state, poll cycles and cache effectiveness
//! - **Health probes**: HTTP endpoints for liveness and readiness checks

use anyhow::{Context as _, Result};
use clap::Parser;
use futures::StreamExt;
use kube::{api::Api, Client};
use kube_runtime::{watcher, Controller};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

use synced_secret_controller::constants;
use synced_secret_controller::controller::{self, Context, Settings};
use synced_secret_controller::iam::ArnResolver;
use synced_secret_controller::namespace::{NamespaceCache, NamespaceGetter};
use synced_secret_controller::observability::metrics;
use synced_secret_controller::poller::Poller;
use synced_secret_controller::provider::{ClientFactory, ClientProvider};
use synced_secret_controller::server::{start_server, ServerState};
use synced_secret_controller::validation::{RoleValidator, SecretTagValidator};
use synced_secret_controller::SyncedSecret;

#[derive(Parser, Debug)]
#[command(
    name = "synced-secret-controller",
    version,
    about = "Syncs AWS Secrets Manager secrets into Kubernetes Secrets"
)]
struct Args {
    /// Port for metrics and health probes
    #[arg(long, env = "METRICS_PORT", default_value_t = constants::DEFAULT_METRICS_PORT)]
    metrics_port: u16,

    /// Secrets Manager poll interval in seconds
    #[arg(long, env = "POLL_INTERVAL_SEC", default_value_t = constants::DEFAULT_POLL_INTERVAL_SECS)]
    poll_interval_secs: u64,

    /// Capacity of the bounded secret value cache
    #[arg(long, default_value_t = constants::DEFAULT_VALUE_CACHE_CAPACITY)]
    value_cache_capacity: usize,

    /// Role name substituted into the AWSAccountID convention
    #[arg(long, default_value = constants::DEFAULT_SYNC_ROLE_NAME)]
    sync_role_name: String,

    /// Namespace annotation carrying the JSON role allow-list
    #[arg(long, default_value = constants::ALLOWED_ROLES_ANNOTATION)]
    allowed_roles_annotation: String,

    /// Requeue interval after a successful reconciliation, in seconds
    #[arg(long, default_value_t = constants::DEFAULT_RECONCILE_INTERVAL_SECS)]
    reconcile_interval_secs: u64,

    /// Base role ARN (e.g. "arn:aws:iam::123456789012:role/") used to qualify
    /// bare role names when EC2 instance metadata is unavailable
    #[arg(long, env = "BASE_ROLE_ARN")]
    base_role_arn: Option<String>,

    /// Skip the randomized startup delay before the first poll
    #[arg(long, default_value_t = false)]
    no_startup_jitter: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "synced_secret_controller=info".into()),
        )
        .init();

    let args = Args::parse();

    info!(
        "Starting SyncedSecret Controller (build {})",
        env!("BUILD_GIT_HASH")
    );

    metrics::register_metrics()?;

    let server_state = Arc::new(ServerState {
        is_ready: Arc::new(std::sync::atomic::AtomicBool::new(false)),
    });

    let server_state_clone = Arc::clone(&server_state);
    let server_port = args.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = start_server(server_port, server_state_clone).await {
            error!("HTTP server error: {}", e);
        }
    });

    let client = Client::try_default().await?;

    // Namespace metadata cache; validators read labels and annotations from
    // it without touching the API server.
    let namespaces: Arc<dyn NamespaceGetter> = Arc::new(
        NamespaceCache::start(client.clone())
            .await
            .context("failed starting namespace watcher")?,
    );

    let arns = Arc::new(match args.base_role_arn.clone() {
        Some(base) => ArnResolver::with_base(base),
        None => ArnResolver::new(),
    });
    let factory = Arc::new(ClientFactory::new(Arc::clone(&arns)).await);

    // Spread the first ListSecrets across replicas starting simultaneously.
    if !args.no_startup_jitter {
        let delay = rand::thread_rng().gen_range(0..constants::MAX_STARTUP_JITTER_SECS);
        info!("startup jitter: sleeping {delay}s before first poll");
        tokio::time::sleep(Duration::from_secs(delay)).await;
    }

    // Poll failures are transient: they keep the previous catalog and are
    // only logged here, never surfaced to a reconciliation.
    let (error_tx, mut error_rx) = mpsc::unbounded_channel::<anyhow::Error>();
    tokio::spawn(async move {
        while let Some(e) = error_rx.recv().await {
            error!("polling error: {e:#}");
        }
    });

    let poller = Poller::start(
        Arc::clone(&factory) as Arc<dyn ClientProvider>,
        Duration::from_secs(args.poll_interval_secs),
        args.value_cache_capacity,
        error_tx,
    )
    .await
    .context("failed starting Secrets Manager poller")?;

    let role_validator = RoleValidator::new(
        Arc::clone(&arns),
        Arc::clone(&namespaces),
        args.allowed_roles_annotation.clone(),
    );
    let tag_validator = SecretTagValidator::new(Arc::clone(&namespaces));

    let context = Arc::new(Context::new(
        client.clone(),
        Arc::clone(&poller),
        Arc::clone(&factory) as Arc<dyn ClientProvider>,
        role_validator,
        tag_validator,
        Settings {
            sync_role_name: args.sync_role_name.clone(),
            reconcile_interval: Duration::from_secs(args.reconcile_interval_secs),
            error_requeue: Duration::from_secs(
                constants::DEFAULT_RECONCILIATION_ERROR_REQUEUE_SECS,
            ),
        },
    ));

    server_state
        .is_ready
        .store(true, std::sync::atomic::Ordering::Relaxed);

    // Watch SyncedSecret resources across all namespaces.
    let synced: Api<SyncedSecret> = Api::all(client);
    Controller::new(synced, watcher::Config::default())
        .shutdown_on_signal()
        .run(controller::reconcile, controller::error_policy, context)
        .for_each(|_| std::future::ready(()))
        .await;

    info!("Controller stopped, draining poller");
    poller.stop().await;

    Ok(())
}
