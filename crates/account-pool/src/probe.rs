//! Periodic quota probe for the active credential
//!
//! Queries the remote usage endpoint (through a `QuotaProvider`) once on start
//! and then on a fixed period, and writes the resulting `QuotaState` back
//! through the coordinator. The probe only observes: it never switches.
//!
//! Every query is bounded by `query_timeout`. A timed-out or failed query is
//! recorded as `Error` and retried on the next tick.

use std::sync::Arc;
use std::time::Duration;

use account_auth::{Credential, QuotaState, now_millis};
use provider::{QuotaProvider, QuotaRequest, QuotaVerdict};
use tracing::{debug, info, warn};

use crate::coordinator::{QuotaUpdate, SwitchCoordinator};
use crate::error::Result;
use crate::task::TaskSlot;

/// Probe timing and reporting knobs.
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    /// Period between ticks; the first tick runs immediately on start
    pub interval: Duration,
    /// Upper bound on a single remote query
    pub query_timeout: Duration,
    /// Used ratio at which a still-healthy credential is reported as running low
    pub warn_threshold: f64,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(90),
            query_timeout: Duration::from_secs(30),
            warn_threshold: 0.9,
        }
    }
}

struct ProbeInner {
    coordinator: Arc<SwitchCoordinator>,
    provider: Arc<dyn QuotaProvider>,
    settings: ProbeSettings,
}

/// Background quota observer with `Stopped -> Running -> Stopped` control.
pub struct QuotaProbe {
    inner: Arc<ProbeInner>,
    task: TaskSlot,
}

impl QuotaProbe {
    pub fn new(
        coordinator: Arc<SwitchCoordinator>,
        provider: Arc<dyn QuotaProvider>,
        settings: ProbeSettings,
    ) -> Self {
        Self {
            inner: Arc::new(ProbeInner {
                coordinator,
                provider,
                settings,
            }),
            task: TaskSlot::new("quota_probe"),
        }
    }

    /// Start the periodic loop. Returns false if it is already running.
    pub fn start(&self) -> bool {
        let inner = self.inner.clone();
        self.task.start(self.inner.settings.interval, move || {
            let inner = inner.clone();
            async move {
                if let Err(e) = inner.check_active().await {
                    warn!(error = %e, "quota probe tick could not record its result");
                }
            }
        })
    }

    /// Stop the loop after any in-flight query has recorded its result.
    pub async fn stop(&self) -> bool {
        self.task.stop().await
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    /// Query the active credential once and record the result.
    ///
    /// Returns `None` without querying when the active slot is empty.
    pub async fn check_active(&self) -> Result<Option<QuotaState>> {
        self.inner.check_active().await
    }

    /// Query every pool credential once and record each result.
    ///
    /// Lets benched credentials recover from `Exhausted` or `Error` once their
    /// allowance is topped up. Credentials are checked one at a time.
    pub async fn check_pool(&self) -> Vec<(String, Result<QuotaState>)> {
        let pool = self.inner.coordinator.store().list().await;
        let mut results = Vec::with_capacity(pool.len());
        for credential in &pool {
            let result = self.inner.check(credential).await;
            results.push((credential.id.clone(), result));
        }
        info!(checked = results.len(), "pool sweep finished");
        results
    }
}

impl ProbeInner {
    async fn check_active(&self) -> Result<Option<QuotaState>> {
        if let Err(e) = self.coordinator.sync_active().await {
            warn!(error = %e, "could not re-read active file before probing");
        }

        let Some(active) = self.coordinator.store().active().await else {
            debug!("no active credential, skipping quota check");
            return Ok(None);
        };
        self.check(&active).await.map(Some)
    }

    async fn check(&self, credential: &Credential) -> Result<QuotaState> {
        let request = QuotaRequest {
            credential_id: &credential.id,
            access_token: &credential.access_token,
            refresh_token: &credential.refresh_token,
        };

        let update = match tokio::time::timeout(
            self.settings.query_timeout,
            self.provider.query(request),
        )
        .await
        {
            Ok(Ok(report)) => {
                let state = match report.verdict {
                    QuotaVerdict::Healthy => QuotaState::Healthy,
                    QuotaVerdict::Exhausted => QuotaState::Exhausted,
                };
                self.warn_if_running_low(credential, state, report.used_ratio);
                QuotaUpdate {
                    state,
                    checked_at: now_millis(),
                    used_ratio: report.used_ratio,
                    refreshed: report.refreshed,
                }
            }
            Ok(Err(e)) => {
                warn!(
                    credential_id = %credential.id,
                    provider = self.provider.id(),
                    error = %e,
                    "quota query failed"
                );
                Self::failed()
            }
            Err(_) => {
                warn!(
                    credential_id = %credential.id,
                    provider = self.provider.id(),
                    timeout_ms = self.settings.query_timeout.as_millis() as u64,
                    "quota query timed out"
                );
                Self::failed()
            }
        };

        let state = update.state;
        metrics::counter!("quota_checks_total", "state" => state.label()).increment(1);
        debug!(credential_id = %credential.id, state = state.label(), "quota checked");

        self.coordinator
            .record_quota(&credential.id, update)
            .await
            .map(|updated| updated.quota_state)
    }

    fn failed() -> QuotaUpdate {
        QuotaUpdate {
            state: QuotaState::Error,
            checked_at: now_millis(),
            used_ratio: None,
            refreshed: None,
        }
    }

    /// Log once when a healthy credential's ratio crosses the warn threshold.
    fn warn_if_running_low(&self, credential: &Credential, state: QuotaState, ratio: Option<f64>) {
        let threshold = self.settings.warn_threshold;
        let Some(ratio) = ratio else { return };
        let was_below = credential.used_ratio.is_none_or(|previous| previous < threshold);
        if state == QuotaState::Healthy && ratio >= threshold && was_below {
            warn!(
                credential_id = %credential.id,
                used_ratio = ratio,
                threshold,
                "credential is running low on quota"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::DEFAULT_LOCK_TIMEOUT;
    use crate::events::PoolEvent;
    use crate::store::{CredentialStore, tests::credential};
    use account_auth::{ActiveRecord, CredentialFiles};
    use common::Secret;
    use provider::{ProviderError, QuotaReport, RefreshedTokens};
    use std::collections::VecDeque;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Script {
        Report(QuotaReport),
        Fail,
        Hang,
    }

    /// Answers queries from a script; repeats a healthy verdict once it runs out.
    struct ScriptedProvider {
        script: Mutex<VecDeque<Script>>,
        calls: AtomicUsize,
        seen: Mutex<Vec<String>>,
    }

    impl ScriptedProvider {
        fn new(script: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl QuotaProvider for ScriptedProvider {
        fn id(&self) -> &str {
            "scripted"
        }

        fn query<'a>(
            &'a self,
            request: QuotaRequest<'a>,
        ) -> Pin<Box<dyn Future<Output = provider::Result<QuotaReport>> + Send + 'a>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen
                .lock()
                .unwrap()
                .push(request.credential_id.to_string());
            let next = self.script.lock().unwrap().pop_front();
            Box::pin(async move {
                match next {
                    Some(Script::Report(report)) => Ok(report),
                    Some(Script::Fail) => Err(ProviderError::Transport("connection refused".into())),
                    Some(Script::Hang) => std::future::pending().await,
                    None => Ok(QuotaReport::verdict(QuotaVerdict::Healthy)),
                }
            })
        }
    }

    async fn setup(
        dir: &tempfile::TempDir,
        pool: &[Credential],
        active: Option<&Credential>,
        provider: Arc<ScriptedProvider>,
        settings: ProbeSettings,
    ) -> (Arc<SwitchCoordinator>, QuotaProbe) {
        let files = CredentialFiles::new(dir.path().join("tokens.json"), dir.path().join("auth.json"));
        files.save_pool(pool).await.unwrap();
        if let Some(active) = active {
            files
                .save_active(&ActiveRecord::from_credential(active, Default::default()))
                .await
                .unwrap();
        }
        let store = Arc::new(CredentialStore::load(files).await.unwrap());
        let coordinator = Arc::new(SwitchCoordinator::new(store, DEFAULT_LOCK_TIMEOUT));
        let probe = QuotaProbe::new(coordinator.clone(), provider, settings);
        (coordinator, probe)
    }

    fn report(verdict: QuotaVerdict, ratio: f64) -> Script {
        Script::Report(QuotaReport {
            verdict,
            used_ratio: Some(ratio),
            refreshed: None,
        })
    }

    #[tokio::test]
    async fn healthy_result_is_recorded_with_ratio() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![report(QuotaVerdict::Healthy, 0.4)]);
        let (coordinator, probe) = setup(
            &dir,
            &[],
            Some(&credential("x", QuotaState::Unknown)),
            provider.clone(),
            ProbeSettings::default(),
        )
        .await;
        let mut events = coordinator.subscribe();

        let state = probe.check_active().await.unwrap();
        assert_eq!(state, Some(QuotaState::Healthy));

        let active = coordinator.store().active().await.unwrap();
        assert_eq!(active.quota_state, QuotaState::Healthy);
        assert_eq!(active.used_ratio, Some(0.4));
        assert!(active.last_checked_at.is_some());
        assert_eq!(
            events.recv().await.unwrap(),
            PoolEvent::QuotaUpdated {
                id: "x".into(),
                state: QuotaState::Healthy,
                used_ratio: Some(0.4),
            }
        );
    }

    #[tokio::test]
    async fn exhausted_result_is_recorded_without_switching() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![report(QuotaVerdict::Exhausted, 1.0)]);
        let (coordinator, probe) = setup(
            &dir,
            &[credential("p", QuotaState::Healthy)],
            Some(&credential("x", QuotaState::Healthy)),
            provider,
            ProbeSettings::default(),
        )
        .await;

        assert_eq!(probe.check_active().await.unwrap(), Some(QuotaState::Exhausted));

        let snapshot = coordinator.store().snapshot().await;
        let active = snapshot.active.unwrap();
        assert_eq!(active.id, "x");
        assert_eq!(active.quota_state, QuotaState::Exhausted);
        assert_eq!(snapshot.pool.len(), 1);
    }

    #[tokio::test]
    async fn provider_failure_is_recorded_as_error() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![Script::Fail]);
        let (coordinator, probe) = setup(
            &dir,
            &[],
            Some(&credential("x", QuotaState::Healthy)),
            provider,
            ProbeSettings::default(),
        )
        .await;

        assert_eq!(probe.check_active().await.unwrap(), Some(QuotaState::Error));
        let active = coordinator.store().active().await.unwrap();
        assert_eq!(active.quota_state, QuotaState::Error);
        assert!(active.last_checked_at.is_some());
    }

    #[tokio::test]
    async fn hung_query_times_out_as_error() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![Script::Hang]);
        let settings = ProbeSettings {
            query_timeout: Duration::from_millis(50),
            ..ProbeSettings::default()
        };
        let (_coordinator, probe) = setup(
            &dir,
            &[],
            Some(&credential("x", QuotaState::Healthy)),
            provider,
            settings,
        )
        .await;

        assert_eq!(probe.check_active().await.unwrap(), Some(QuotaState::Error));
    }

    #[tokio::test]
    async fn empty_active_slot_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![]);
        let (_coordinator, probe) =
            setup(&dir, &[], None, provider.clone(), ProbeSettings::default()).await;

        assert_eq!(probe.check_active().await.unwrap(), None);
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn refreshed_tokens_are_written_to_active_file() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![Script::Report(QuotaReport {
            verdict: QuotaVerdict::Healthy,
            used_ratio: Some(0.1),
            refreshed: Some(RefreshedTokens {
                access_token: Secret::from("at_new"),
                refresh_token: Secret::from("rt_new"),
            }),
        })]);
        let (coordinator, probe) = setup(
            &dir,
            &[],
            Some(&credential("x", QuotaState::Unknown)),
            provider,
            ProbeSettings::default(),
        )
        .await;

        probe.check_active().await.unwrap();

        let record = coordinator
            .store()
            .files()
            .load_active()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.access_token.expose(), "at_new");
        assert_eq!(record.refresh_token.expose(), "rt_new");
    }

    #[tokio::test]
    async fn check_pool_sweeps_every_benched_credential() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![
            report(QuotaVerdict::Healthy, 0.2),
            Script::Fail,
        ]);
        let (coordinator, probe) = setup(
            &dir,
            &[
                credential("a", QuotaState::Exhausted),
                credential("b", QuotaState::Unknown),
            ],
            Some(&credential("x", QuotaState::Unknown)),
            provider.clone(),
            ProbeSettings::default(),
        )
        .await;

        let results = probe.check_pool().await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "a");
        assert!(matches!(results[0].1, Ok(QuotaState::Healthy)));
        assert!(matches!(results[1].1, Ok(QuotaState::Error)));
        assert_eq!(*provider.seen.lock().unwrap(), vec!["a", "b"]);

        let pool = coordinator.store().list().await;
        assert_eq!(pool[0].quota_state, QuotaState::Healthy);
        assert_eq!(pool[1].quota_state, QuotaState::Error);
        // Active credential untouched by a pool sweep
        let active = coordinator.store().active().await.unwrap();
        assert_eq!(active.quota_state, QuotaState::Unknown);
    }

    #[tokio::test]
    async fn start_checks_immediately_and_stop_halts_ticks() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![]);
        let settings = ProbeSettings {
            interval: Duration::from_secs(3600),
            ..ProbeSettings::default()
        };
        let (coordinator, probe) = setup(
            &dir,
            &[],
            Some(&credential("x", QuotaState::Unknown)),
            provider.clone(),
            settings,
        )
        .await;
        let mut events = coordinator.subscribe();

        assert!(probe.start());
        assert!(probe.is_running());
        assert!(!probe.start());

        // The immediate first tick records a result
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, PoolEvent::QuotaUpdated { .. }));

        assert!(probe.stop().await);
        assert!(!probe.is_running());
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn checks_are_counted_by_state() {
        use metrics_exporter_prometheus::PrometheusBuilder;

        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![
            report(QuotaVerdict::Healthy, 0.5),
            Script::Fail,
        ]);
        let (_coordinator, probe) = setup(
            &dir,
            &[],
            Some(&credential("x", QuotaState::Unknown)),
            provider,
            ProbeSettings::default(),
        )
        .await;

        probe.check_active().await.unwrap();
        probe.check_active().await.unwrap();

        let output = handle.render();
        assert!(
            output.contains("quota_checks_total{state=\"healthy\"} 1"),
            "got: {output}"
        );
        assert!(
            output.contains("quota_checks_total{state=\"error\"} 1"),
            "got: {output}"
        );
    }
}
