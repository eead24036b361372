//! Token Switcher
//!
//! Single-binary service that keeps exactly one credential from a pool active
//! for a CLI client:
//! 1. Loads and reconciles the pool and active credential files
//! 2. Probes the active credential's quota on a fixed interval
//! 3. Tails the client's logs and fails over when it reports an empty balance
//! 4. Serves an admin API for import, delete, manual switches and loop control

mod admin;
mod config;
mod error;
mod metrics;
mod quota_impl;

use std::sync::Arc;
use std::time::Duration;

use account_auth::CredentialFiles;
use account_pool::{CredentialStore, LogFailoverWatcher, PoolEvent, QuotaProbe, SwitchCoordinator};
use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::{AdminState, build_admin_router};
use crate::config::Config;
use crate::quota_impl::UsageQuotaProvider;

/// Upper bound on draining admin connections after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting token-switcher");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        pool_path = %config.files.pool_path.display(),
        active_path = %config.files.active_path.display(),
        admin_addr = %config.admin.listen_addr,
        log_paths = config.watcher.log_paths.len(),
        "configuration loaded"
    );

    let files = CredentialFiles::new(
        config.files.pool_path.clone(),
        config.files.active_path.clone(),
    );
    let store = CredentialStore::load(files)
        .await
        .context("failed to load credential files")?;
    let coordinator = Arc::new(SwitchCoordinator::new(
        Arc::new(store),
        config.lock_timeout(),
    ));

    let event_logger = spawn_event_logger(coordinator.subscribe());

    let quota_provider = Arc::new(UsageQuotaProvider::new(
        reqwest::Client::new(),
        config.probe.usage_url.clone(),
        config.probe.refresh_url.clone(),
        config.probe.client_id.clone(),
    ));
    let probe = Arc::new(QuotaProbe::new(
        coordinator.clone(),
        quota_provider,
        config.probe_settings(),
    ));
    let watcher = Arc::new(LogFailoverWatcher::new(
        coordinator.clone(),
        config.watcher_settings(),
    ));

    if config.probe.enabled {
        probe.start();
    }
    if config.watcher.enabled {
        watcher.start();
    }

    let admin_state = AdminState::new(
        coordinator.clone(),
        probe.clone(),
        watcher.clone(),
        prometheus_handle,
    );
    let app = build_admin_router(admin_state.clone(), config.admin.max_connections);

    let listener = TcpListener::bind(config.admin.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.admin.listen_addr))?;
    info!(addr = %config.admin.listen_addr, "admin API listening");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    // Stop the loops first so no failover starts while the process winds down.
    // An in-flight probe query or failover completes and persists its result.
    watcher.stop().await;
    probe.stop().await;

    // Open /events streams would otherwise hold the drain until the timeout
    admin_state.close_event_streams();
    let _ = shutdown_tx.send(());
    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("admin API drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    event_logger.abort();
    info!("shutdown complete");
    Ok(())
}

/// Log every engine event so the JSON log is a complete audit trail.
fn spawn_event_logger(mut rx: broadcast::Receiver<PoolEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event logger lagging, events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(event: &PoolEvent) {
    match event {
        PoolEvent::FailoverFailed { failure } => {
            error!(kind = event.kind(), ?failure, "failover failed");
        }
        _ => {
            let detail = serde_json::to_string(event).unwrap_or_default();
            info!(kind = event.kind(), detail = %detail, "engine event");
        }
    }
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
