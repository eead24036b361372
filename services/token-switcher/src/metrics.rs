//! Prometheus metrics exposition
//!
//! The engine crates emit these counters through the `metrics` facade:
//!
//! - `credential_switches_total` (counter): label `trigger`
//! - `failover_attempts_total` (counter): label `outcome`
//! - `quota_checks_total` (counter): label `state`
//! - `credentials_imported_total` (counter)
//! - `credentials_deleted_total` (counter)
//!
//! This module installs the recorder that renders them on `/metrics`.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

const COUNTERS: &[(&str, &str)] = &[
    ("credential_switches_total", "Active credential switches by trigger"),
    ("failover_attempts_total", "Log-triggered failover attempts by outcome"),
    ("quota_checks_total", "Quota queries by resulting state"),
    ("credentials_imported_total", "Credentials added through import"),
    ("credentials_deleted_total", "Credentials removed from the pool"),
];

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");
    describe();
    handle
}

fn describe() {
    for (name, help) in COUNTERS {
        metrics::describe_counter!(*name, *help);
    }
}
