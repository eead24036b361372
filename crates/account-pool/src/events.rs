//! Events published by the engine for the presentation shell
//!
//! Delivered over a `tokio::sync::broadcast` channel owned by the
//! `SwitchCoordinator`. Slow subscribers lose the oldest events rather than
//! blocking a switch.

use account_auth::QuotaState;
use serde::Serialize;

/// Buffered events per subscriber before lagging ones start dropping.
pub const EVENT_BUFFER: usize = 256;

/// What initiated a switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchTrigger {
    Manual,
    AutoFailover,
    /// The CLI client logged into another account and rewrote the active file
    ClientLogin,
}

impl SwitchTrigger {
    pub fn label(&self) -> &'static str {
        match self {
            SwitchTrigger::Manual => "manual",
            SwitchTrigger::AutoFailover => "auto_failover",
            SwitchTrigger::ClientLogin => "client_login",
        }
    }
}

/// Why an automatic failover did not happen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum FailoverFailure {
    /// Every pool credential is exhausted, or the pool is empty
    NoCandidate,
    /// The switch itself failed (persistence, lock timeout)
    SwitchFailed(String),
}

/// Engine event stream item.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PoolEvent {
    Switched {
        from: Option<String>,
        to: String,
        trigger: SwitchTrigger,
    },
    FailoverTriggered {
        from: Option<String>,
        to: String,
    },
    FailoverFailed {
        failure: FailoverFailure,
    },
    QuotaUpdated {
        id: String,
        state: QuotaState,
        used_ratio: Option<f64>,
    },
}

impl PoolEvent {
    /// Same value as the serialized `kind` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            PoolEvent::Switched { .. } => "switched",
            PoolEvent::FailoverTriggered { .. } => "failover_triggered",
            PoolEvent::FailoverFailed { .. } => "failover_failed",
            PoolEvent::QuotaUpdated { .. } => "quota_updated",
        }
    }
}
