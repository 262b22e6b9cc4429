//! # Metrics
//!
//! Prometheus metrics for monitoring the controller.
//!
//! ## Metrics Exposed
//!
//! - `synced_secret_reconciliations_total` - Total number of reconciliations
//! - `synced_secret_reconciliation_errors_total` - Total number of reconciliation errors
//! - `synced_secret_reconciliation_duration_seconds` - Duration of reconciliation operations
//! - `synced_secret_sync_success` - Resources whose last reconciliation succeeded
//! - `synced_secret_sync_failures` - Resources whose last reconciliation failed
//! - `synced_secret_poll_cycles_total` - Successful Secrets Manager poll cycles
//! - `synced_secret_poll_errors_total` - Failed Secrets Manager poll cycles
//! - `synced_secret_catalog_size` - Secrets currently in the polled catalog
//! - `synced_secret_value_cache_hits_total` / `_misses_total` - Value cache effectiveness
//! - `synced_secret_generated_bytes` - Total bytes of materialized secret data

use anyhow::Result;
use prometheus::{Histogram, IntCounter, IntGauge, IntGaugeVec, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "synced_secret_reconciliations_total",
        "Total number of reconciliations",
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "synced_secret_reconciliation_errors_total",
        "Total number of reconciliation errors",
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "synced_secret_reconciliation_duration_seconds",
            "Duration of reconciliation in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static SYNC_SUCCESS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "synced_secret_sync_success",
        "Number of SyncedSecrets whose last reconciliation succeeded",
    )
    .expect("Failed to create SYNC_SUCCESS metric - this should never happen")
});

static SYNC_FAILURES: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "synced_secret_sync_failures",
        "Number of SyncedSecrets whose last reconciliation failed",
    )
    .expect("Failed to create SYNC_FAILURES metric - this should never happen")
});

static POLL_CYCLES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "synced_secret_poll_cycles_total",
        "Successful Secrets Manager poll cycles",
    )
    .expect("Failed to create POLL_CYCLES_TOTAL metric - this should never happen")
});

static POLL_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "synced_secret_poll_errors_total",
        "Failed Secrets Manager poll cycles",
    )
    .expect("Failed to create POLL_ERRORS_TOTAL metric - this should never happen")
});

static CATALOG_SIZE: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "synced_secret_catalog_size",
        "Secrets currently in the polled catalog",
    )
    .expect("Failed to create CATALOG_SIZE metric - this should never happen")
});

static VALUE_CACHE_HITS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "synced_secret_value_cache_hits_total",
        "Secret value reads served from the cache",
    )
    .expect("Failed to create VALUE_CACHE_HITS_TOTAL metric - this should never happen")
});

static VALUE_CACHE_MISSES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "synced_secret_value_cache_misses_total",
        "Secret value reads that required a live fetch",
    )
    .expect("Failed to create VALUE_CACHE_MISSES_TOTAL metric - this should never happen")
});

static GENERATED_BYTES: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    IntGaugeVec::new(
        prometheus::Opts::new(
            "synced_secret_generated_bytes",
            "Bytes of secret data last materialized, per resource",
        ),
        &["resource"],
    )
    .expect("Failed to create GENERATED_BYTES metric - this should never happen")
});

/// Register all metrics with the registry served on /metrics
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(SYNC_SUCCESS.clone()))?;
    REGISTRY.register(Box::new(SYNC_FAILURES.clone()))?;
    REGISTRY.register(Box::new(POLL_CYCLES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(POLL_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CATALOG_SIZE.clone()))?;
    REGISTRY.register(Box::new(VALUE_CACHE_HITS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(VALUE_CACHE_MISSES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(GENERATED_BYTES.clone()))?;

    Ok(())
}

pub fn increment_reconciliations() {
    RECONCILIATIONS_TOTAL.inc();
}

pub fn increment_reconciliation_errors() {
    RECONCILIATION_ERRORS_TOTAL.inc();
}

pub fn observe_reconciliation_duration(duration: f64) {
    RECONCILIATION_DURATION.observe(duration);
}

/// Set both sync-state gauges from one pass over the state map
pub fn set_sync_state(success: i64, failures: i64) {
    SYNC_SUCCESS.set(success);
    SYNC_FAILURES.set(failures);
}

pub fn increment_poll_cycles() {
    POLL_CYCLES_TOTAL.inc();
}

pub fn increment_poll_errors() {
    POLL_ERRORS_TOTAL.inc();
}

pub fn set_catalog_size(count: i64) {
    CATALOG_SIZE.set(count);
}

pub fn increment_value_cache_hits() {
    VALUE_CACHE_HITS_TOTAL.inc();
}

pub fn increment_value_cache_misses() {
    VALUE_CACHE_MISSES_TOTAL.inc();
}

pub fn set_generated_bytes(resource: &str, count: i64) {
    GENERATED_BYTES.with_label_values(&[resource]).set(count);
}
