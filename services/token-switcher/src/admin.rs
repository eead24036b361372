//! Admin API for the credential pool
//!
//! The only surface operators use to drive the engine. Binds to localhost by
//! default; token values are never returned by any endpoint.
//!
//! Endpoints:
//! - GET    /health                     : active id, pool size, loop status
//! - GET    /credentials                : benched pool, insertion order
//! - GET    /credentials/active         : the active credential
//! - GET    /credentials/{id}           : one credential (pool or active)
//! - POST   /credentials/import         : text body, `refresh----access----timestamp` per line
//! - DELETE /credentials                : `{"ids": [...]}`
//! - POST   /credentials/{id}/activate  : manual switch
//! - POST   /failover                   : auto-failover on demand
//! - POST   /probe/{start,stop,sweep}   : quota probe control
//! - POST   /watcher/{start,stop}       : log watcher control
//! - GET    /events                     : engine events as server-sent events
//! - GET    /metrics                    : Prometheus exposition

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use account_auth::{Credential, QuotaState};
use account_pool::{LogFailoverWatcher, QuotaProbe, SwitchCoordinator, SwitchOutcome};
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures_util::Stream;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::ApiError;

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    coordinator: Arc<SwitchCoordinator>,
    probe: Arc<QuotaProbe>,
    watcher: Arc<LogFailoverWatcher>,
    prometheus: PrometheusHandle,
    started_at: Instant,
    /// Flipped at shutdown so open `/events` streams end
    closing: Arc<watch::Sender<bool>>,
}

impl AdminState {
    pub fn new(
        coordinator: Arc<SwitchCoordinator>,
        probe: Arc<QuotaProbe>,
        watcher: Arc<LogFailoverWatcher>,
        prometheus: PrometheusHandle,
    ) -> Self {
        Self {
            coordinator,
            probe,
            watcher,
            prometheus,
            started_at: Instant::now(),
            closing: Arc::new(watch::channel(false).0),
        }
    }

    /// End every open event stream so a graceful shutdown can finish draining.
    pub fn close_event_streams(&self) {
        self.closing.send_replace(true);
    }
}

/// Build the admin router.
///
/// The concurrency limit bounds simultaneous requests, including open
/// `/events` streams.
pub fn build_admin_router(state: AdminState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/credentials", get(list_credentials).delete(delete_credentials))
        .route("/credentials/active", get(active_credential))
        .route("/credentials/import", post(import_credentials))
        .route("/credentials/{id}", get(get_credential))
        .route("/credentials/{id}/activate", post(activate_credential))
        .route("/failover", post(failover))
        .route("/probe/start", post(probe_start))
        .route("/probe/stop", post(probe_stop))
        .route("/probe/sweep", post(probe_sweep))
        .route("/watcher/start", post(watcher_start))
        .route("/watcher/stop", post(watcher_stop))
        .route("/events", get(events))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// Public view of a credential, without token values.
#[derive(Serialize)]
struct CredentialView {
    id: String,
    quota_state: QuotaState,
    #[serde(skip_serializing_if = "Option::is_none")]
    imported_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_checked_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    used_ratio: Option<f64>,
    active: bool,
}

impl CredentialView {
    fn new(credential: Credential, active: bool) -> Self {
        Self {
            id: credential.id,
            quota_state: credential.quota_state,
            imported_at: credential.imported_at,
            last_checked_at: credential.last_checked_at,
            used_ratio: credential.used_ratio,
            active,
        }
    }
}

fn json(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn switch_body(outcome: &SwitchOutcome) -> serde_json::Value {
    serde_json::json!({ "from": outcome.from, "to": outcome.to })
}

/// GET /health: liveness plus a summary of the engine state.
async fn health(State(state): State<AdminState>) -> Response {
    let snapshot = state.coordinator.store().snapshot().await;
    json(
        StatusCode::OK,
        serde_json::json!({
            "status": if snapshot.active.is_some() { "healthy" } else { "no_active_credential" },
            "active": snapshot.active.as_ref().map(|c| c.id.as_str()),
            "pool_size": snapshot.pool.len(),
            "pool_usable": snapshot
                .pool
                .iter()
                .filter(|c| c.quota_state != QuotaState::Exhausted)
                .count(),
            "probe_running": state.probe.is_running(),
            "watcher_running": state.watcher.is_running(),
            "uptime_seconds": state.started_at.elapsed().as_secs(),
        }),
    )
}

/// GET /credentials: benched pool in insertion order.
async fn list_credentials(State(state): State<AdminState>) -> Response {
    let pool: Vec<CredentialView> = state
        .coordinator
        .store()
        .list()
        .await
        .into_iter()
        .map(|c| CredentialView::new(c, false))
        .collect();
    json(StatusCode::OK, serde_json::json!({ "credentials": pool }))
}

/// GET /credentials/active
async fn active_credential(State(state): State<AdminState>) -> Response {
    match state.coordinator.store().active().await {
        Some(active) => json(
            StatusCode::OK,
            serde_json::json!(CredentialView::new(active, true)),
        ),
        None => json(
            StatusCode::NOT_FOUND,
            serde_json::json!({ "error": "no active credential", "kind": "not_found" }),
        ),
    }
}

/// GET /credentials/{id}
async fn get_credential(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let store = state.coordinator.store();
    let credential = store.get(&id).await?;
    let active = store.active().await.is_some_and(|a| a.id == id);
    Ok(json(
        StatusCode::OK,
        serde_json::json!(CredentialView::new(credential, active)),
    ))
}

/// POST /credentials/import: one record per line; bad lines are reported, not fatal.
async fn import_credentials(
    State(state): State<AdminState>,
    body: String,
) -> Result<Response, ApiError> {
    let outcome = state.coordinator.import(body.lines()).await?;
    let rejected: Vec<serde_json::Value> = outcome
        .rejected
        .iter()
        .map(|(line, e)| serde_json::json!({ "line": line, "error": e.to_string() }))
        .collect();
    Ok(json(
        StatusCode::OK,
        serde_json::json!({
            "imported": outcome.imported,
            "skipped": outcome.skipped,
            "ids": outcome.ids,
            "rejected": rejected,
        }),
    ))
}

#[derive(Deserialize)]
struct DeleteRequest {
    ids: Vec<String>,
}

/// DELETE /credentials: partial failures are listed, the rest still goes.
async fn delete_credentials(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<DeleteRequest>,
) -> Result<Response, ApiError> {
    let outcome = state.coordinator.delete(body.ids.as_slice()).await?;
    let rejected: Vec<serde_json::Value> = outcome
        .rejected
        .iter()
        .map(|(id, e)| serde_json::json!({ "id": id, "kind": e.kind(), "error": e.to_string() }))
        .collect();
    Ok(json(
        StatusCode::OK,
        serde_json::json!({ "removed": outcome.removed, "rejected": rejected }),
    ))
}

/// POST /credentials/{id}/activate
async fn activate_credential(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let outcome = state.coordinator.switch_to(&id).await?;
    Ok(json(StatusCode::OK, switch_body(&outcome)))
}

/// POST /failover: same path the log watcher takes on an exhaustion notice.
async fn failover(State(state): State<AdminState>) -> Result<Response, ApiError> {
    let outcome = state.coordinator.auto_failover().await?;
    Ok(json(StatusCode::OK, switch_body(&outcome)))
}

async fn probe_start(State(state): State<AdminState>) -> Response {
    let started = state.probe.start();
    json(
        StatusCode::OK,
        serde_json::json!({ "started": started, "running": state.probe.is_running() }),
    )
}

async fn probe_stop(State(state): State<AdminState>) -> Response {
    let stopped = state.probe.stop().await;
    json(
        StatusCode::OK,
        serde_json::json!({ "stopped": stopped, "running": state.probe.is_running() }),
    )
}

/// POST /probe/sweep: check every benched credential once.
async fn probe_sweep(State(state): State<AdminState>) -> Response {
    let results: Vec<serde_json::Value> = state
        .probe
        .check_pool()
        .await
        .into_iter()
        .map(|(id, result)| match result {
            Ok(quota_state) => serde_json::json!({ "id": id, "quota_state": quota_state }),
            Err(e) => serde_json::json!({ "id": id, "error": e.to_string(), "kind": e.kind() }),
        })
        .collect();
    json(StatusCode::OK, serde_json::json!({ "results": results }))
}

async fn watcher_start(State(state): State<AdminState>) -> Response {
    let started = state.watcher.start();
    json(
        StatusCode::OK,
        serde_json::json!({ "started": started, "running": state.watcher.is_running() }),
    )
}

async fn watcher_stop(State(state): State<AdminState>) -> Response {
    let stopped = state.watcher.stop().await;
    json(
        StatusCode::OK,
        serde_json::json!({ "stopped": stopped, "running": state.watcher.is_running() }),
    )
}

/// GET /events: one SSE message per engine event, named after its `kind`.
async fn events(
    State(state): State<AdminState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.coordinator.subscribe();
    let closing = state.closing.subscribe();
    info!("event stream subscriber connected");

    let stream = futures_util::stream::unfold((rx, closing), |(mut rx, mut closing)| async move {
        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Ok(event) => match Event::default().event(event.kind()).json_data(&event) {
                        Ok(sse) => return Some((Ok(sse), (rx, closing))),
                        Err(e) => warn!(error = %e, "failed to encode event"),
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event stream subscriber lagging, events dropped");
                    }
                    Err(RecvError::Closed) => return None,
                },
                _ = async { let _ = closing.wait_for(|closed| *closed).await; } => {
                    debug!("closing event stream for shutdown");
                    return None;
                }
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// GET /metrics: Prometheus text exposition format.
async fn metrics_handler(State(state): State<AdminState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use account_auth::{ActiveRecord, CredentialFiles};
    use account_pool::{CredentialStore, ProbeSettings, WatcherSettings};
    use axum::body::Body;
    use axum::http::Request;
    use common::Secret;
    use futures_util::StreamExt;
    use provider::{QuotaProvider, QuotaReport, QuotaRequest, QuotaVerdict};
    use std::future::Future;
    use std::pin::Pin;
    use std::time::Duration;
    use tower::ServiceExt;

    struct AlwaysHealthy;

    impl QuotaProvider for AlwaysHealthy {
        fn id(&self) -> &str {
            "always-healthy"
        }

        fn query<'a>(
            &'a self,
            _request: QuotaRequest<'a>,
        ) -> Pin<Box<dyn Future<Output = provider::Result<QuotaReport>> + Send + 'a>> {
            Box::pin(async { Ok(QuotaReport::verdict(QuotaVerdict::Healthy)) })
        }
    }

    fn credential(id: &str, state: QuotaState) -> Credential {
        Credential {
            id: id.to_string(),
            refresh_token: Secret::new(format!("rt_{id}")),
            access_token: Secret::new(format!("at_{id}")),
            imported_at: None,
            quota_state: state,
            last_checked_at: None,
            used_ratio: None,
        }
    }

    /// Pool `[p1 healthy, p2 exhausted]`, active `x`.
    async fn test_state(dir: &tempfile::TempDir) -> AdminState {
        let files = CredentialFiles::new(dir.path().join("tokens.json"), dir.path().join("auth.json"));
        files
            .save_pool(&[
                credential("p1", QuotaState::Healthy),
                credential("p2", QuotaState::Exhausted),
            ])
            .await
            .unwrap();
        files
            .save_active(&ActiveRecord::from_credential(
                &credential("x", QuotaState::Healthy),
                Default::default(),
            ))
            .await
            .unwrap();

        let store = Arc::new(CredentialStore::load(files).await.unwrap());
        let coordinator = Arc::new(SwitchCoordinator::new(store, Duration::from_secs(5)));
        let probe = Arc::new(QuotaProbe::new(
            coordinator.clone(),
            Arc::new(AlwaysHealthy),
            ProbeSettings::default(),
        ));
        let watcher = Arc::new(LogFailoverWatcher::new(
            coordinator.clone(),
            WatcherSettings {
                paths: vec![dir.path().join("client.log")],
                ..WatcherSettings::default()
            },
        ));
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        AdminState::new(coordinator, probe, watcher, recorder.handle())
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Body) -> (StatusCode, serde_json::Value) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(body)
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn health_reports_active_and_pool() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_admin_router(test_state(&dir).await, 16);

        let (status, json) = send(&app, "GET", "/health", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["active"], "x");
        assert_eq!(json["pool_size"], 2);
        assert_eq!(json["pool_usable"], 1);
        assert_eq!(json["probe_running"], false);
    }

    #[tokio::test]
    async fn list_never_exposes_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_admin_router(test_state(&dir).await, 16);

        let (status, json) = send(&app, "GET", "/credentials", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        let credentials = json["credentials"].as_array().unwrap();
        assert_eq!(credentials.len(), 2);
        assert_eq!(credentials[0]["id"], "p1");
        assert_eq!(credentials[1]["quota_state"], "exhausted");
        let raw = json.to_string();
        assert!(!raw.contains("rt_p1") && !raw.contains("at_p1"), "got: {raw}");
    }

    #[tokio::test]
    async fn get_active_and_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_admin_router(test_state(&dir).await, 16);

        let (status, json) = send(&app, "GET", "/credentials/active", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["id"], "x");
        assert_eq!(json["active"], true);

        let (status, json) = send(&app, "GET", "/credentials/p1", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["active"], false);

        let (status, json) = send(&app, "GET", "/credentials/ghost", Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["kind"], "not_found");
    }

    #[tokio::test]
    async fn import_reports_counts() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_admin_router(test_state(&dir).await, 16);

        let body = "rt_a----at_a----1700000000\nnot-a-record\n\nrt_b----at_b----\n";
        let (status, json) = send(&app, "POST", "/credentials/import", Body::from(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["imported"], 2);
        assert_eq!(json["skipped"], 1);
        assert_eq!(json["rejected"][0]["line"], 2);
        assert_eq!(json["ids"].as_array().unwrap().len(), 2);

        let (_, json) = send(&app, "GET", "/credentials", Body::empty()).await;
        assert_eq!(json["credentials"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn delete_rejects_active_and_removes_others() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_admin_router(test_state(&dir).await, 16);

        let body = Body::from(r#"{"ids":["p2","x","ghost"]}"#);
        let (status, json) = send(&app, "DELETE", "/credentials", body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["removed"], 1);
        assert_eq!(json["rejected"][0]["id"], "x");
        assert_eq!(json["rejected"][0]["kind"], "not_deletable");
        assert_eq!(json["rejected"][1]["kind"], "not_found");
    }

    #[tokio::test]
    async fn activate_maps_errors_to_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_admin_router(test_state(&dir).await, 16);

        let (status, json) = send(&app, "POST", "/credentials/p2/activate", Body::empty()).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["kind"], "exhausted");

        let (status, _) = send(&app, "POST", "/credentials/ghost/activate", Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, json) = send(&app, "POST", "/credentials/p1/activate", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["from"], "x");
        assert_eq!(json["to"], "p1");
    }

    #[tokio::test]
    async fn failover_until_no_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_admin_router(test_state(&dir).await, 16);

        let (status, json) = send(&app, "POST", "/failover", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["to"], "p1");

        // p2 was exhausted already and x was benched as exhausted
        let (status, json) = send(&app, "POST", "/failover", Body::empty()).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["kind"], "no_candidate");
    }

    #[tokio::test]
    async fn probe_and_watcher_control() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_admin_router(test_state(&dir).await, 16);

        let (_, json) = send(&app, "POST", "/probe/start", Body::empty()).await;
        assert_eq!(json["started"], true);
        let (_, json) = send(&app, "POST", "/probe/start", Body::empty()).await;
        assert_eq!(json["started"], false);
        let (_, json) = send(&app, "POST", "/probe/stop", Body::empty()).await;
        assert_eq!(json["stopped"], true);
        assert_eq!(json["running"], false);

        let (_, json) = send(&app, "POST", "/watcher/start", Body::empty()).await;
        assert_eq!(json["running"], true);
        let (_, json) = send(&app, "POST", "/watcher/stop", Body::empty()).await;
        assert_eq!(json["running"], false);
    }

    #[tokio::test]
    async fn sweep_rechecks_benched_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_admin_router(test_state(&dir).await, 16);

        let (status, json) = send(&app, "POST", "/probe/sweep", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        let results = json["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        // The exhausted credential recovered
        assert_eq!(results[1]["id"], "p2");
        assert_eq!(results[1]["quota_state"], "healthy");
    }

    #[tokio::test]
    async fn events_stream_switches() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir).await;
        let coordinator = state.coordinator.clone();
        let app = build_admin_router(state, 16);

        let response = app
            .oneshot(Request::builder().uri("/events").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "text/event-stream"
        );

        coordinator.switch_to("p1").await.unwrap();

        let mut stream = response.into_body().into_data_stream();
        let chunk = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let text = String::from_utf8_lossy(&chunk);
        assert!(text.contains("event: switched"), "got: {text}");
        assert!(text.contains(r#""to":"p1""#), "got: {text}");
    }

    #[tokio::test]
    async fn event_streams_end_when_closed() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir).await;
        let handle = state.clone();
        let app = build_admin_router(state, 16);

        let response = app
            .oneshot(Request::builder().uri("/events").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        handle.close_event_streams();

        let body = tokio::time::timeout(
            Duration::from_secs(5),
            axum::body::to_bytes(response.into_body(), usize::MAX),
        )
        .await
        .expect("event stream should end after close")
        .unwrap();
        assert!(!String::from_utf8_lossy(&body).contains("event:"));
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_format() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_admin_router(test_state(&dir).await, 16);

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response.headers()["content-type"]
                .to_str()
                .unwrap()
                .starts_with("text/plain")
        );
    }

    #[tokio::test]
    async fn unknown_routes_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_admin_router(test_state(&dir).await, 16);

        let (status, _) = send(&app, "POST", "/probe/restart", Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
