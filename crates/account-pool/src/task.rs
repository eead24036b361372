//! Start/stop control for the background loops
//!
//! Both the quota probe and the log watcher follow `Stopped -> Running ->
//! Stopped`. A running loop ticks on a fixed period (first tick immediately)
//! and checks a stop signal between ticks, so a tick in flight always runs to
//! completion. Every tick is itself bounded by timeouts, which keeps `stop`
//! bounded too.

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

struct Running {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Holds at most one running periodic loop.
pub(crate) struct TaskSlot {
    name: &'static str,
    running: Mutex<Option<Running>>,
}

impl TaskSlot {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            running: Mutex::new(None),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Spawn the loop. Returns false if it is already running.
    pub(crate) fn start<F, Fut>(&self, period: Duration, mut tick: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            debug!(task = self.name, "already running");
            return false;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let name = self.name;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop_rx.changed() => break,
                }
                if *stop_rx.borrow() {
                    break;
                }
                tick().await;
            }
            debug!(task = name, "loop exited");
        });

        *running = Some(Running { stop_tx, handle });
        info!(task = self.name, period_ms = period.as_millis() as u64, "started");
        true
    }

    /// Signal the loop to stop and wait for the current tick to finish.
    ///
    /// Returns false if nothing was running.
    pub(crate) async fn stop(&self) -> bool {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(running) = running else {
            return false;
        };

        let _ = running.stop_tx.send(true);
        if let Err(e) = running.handle.await {
            warn!(task = self.name, error = %e, "loop ended abnormally");
        }
        info!(task = self.name, "stopped");
        true
    }
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        let running = self
            .running
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(running) = running {
            let _ = running.stop_tx.send(true);
        }
    }
}
