//! Switch coordinator: the single writer of the credential store
//!
//! Every mutation (manual switch, automatic failover, import, delete, quota
//! write-back) runs its whole read-modify-write under one switch lock. Lock
//! acquisition is bounded by `lock_timeout`, so a stuck writer surfaces as
//! `LockTimeout` instead of hanging a caller. Events are published once the
//! store has committed.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use account_auth::{Credential, QuotaState, parse_lines};
use provider::RefreshedTokens;
use tokio::sync::{Mutex, MutexGuard, broadcast};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::events::{EVENT_BUFFER, PoolEvent, SwitchTrigger};
use crate::store::{ActiveSync, CredentialStore, StoreState};

/// Default bound on waiting for the switch lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of a successful switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchOutcome {
    /// Previously active credential, now benched at the end of the pool
    pub from: Option<String>,
    pub to: String,
}

/// Result of an import batch.
#[derive(Debug, Default)]
pub struct ImportOutcome {
    pub imported: usize,
    pub skipped: usize,
    /// Ids minted for the accepted records, in input order
    pub ids: Vec<String>,
    /// 1-based line number and reason for every skipped record
    pub rejected: Vec<(usize, Error)>,
}

/// Result of a delete batch. Rejections never abort the rest of the batch.
#[derive(Debug, Default)]
pub struct DeleteOutcome {
    pub removed: usize,
    pub rejected: Vec<(String, Error)>,
}

/// A quota observation to write back onto a credential.
#[derive(Debug, Clone)]
pub struct QuotaUpdate {
    pub state: QuotaState,
    pub checked_at: u64,
    /// Replaces the stored ratio when present
    pub used_ratio: Option<f64>,
    /// Tokens rotated while answering the query
    pub refreshed: Option<RefreshedTokens>,
}

/// Serializes all mutations of the credential store.
pub struct SwitchCoordinator {
    store: Arc<CredentialStore>,
    switch_lock: Mutex<()>,
    lock_timeout: Duration,
    events: broadcast::Sender<PoolEvent>,
}

impl SwitchCoordinator {
    pub fn new(store: Arc<CredentialStore>, lock_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            store,
            switch_lock: Mutex::new(()),
            lock_timeout,
            events,
        }
    }

    /// Read access to the store (list, get, snapshot).
    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: PoolEvent) {
        // No subscribers is fine; the shell may not be listening.
        let _ = self.events.send(event);
    }

    async fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        tokio::time::timeout(self.lock_timeout, self.switch_lock.lock())
            .await
            .map_err(|_| {
                warn!(timeout_ms = self.lock_timeout.as_millis() as u64, "switch lock timed out");
                Error::LockTimeout(self.lock_timeout)
            })
    }

    /// Make a pool credential the active one.
    ///
    /// Fails with `NotFound` if `id` is not in the pool (including when it is
    /// already active) and with `Exhausted` if the target has no quota left.
    /// The previously active credential is appended to the pool unchanged.
    pub async fn switch_to(&self, id: &str) -> Result<SwitchOutcome> {
        let outcome = {
            let _guard = self.lock().await?;
            let current = self.synced_state().await;

            let idx = current
                .pool
                .iter()
                .position(|c| c.id == id)
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            if current.pool[idx].quota_state == QuotaState::Exhausted {
                return Err(Error::Exhausted(id.to_string()));
            }

            self.swap(current, idx).await?
        };

        self.announce_switch(&outcome, SwitchTrigger::Manual);
        Ok(outcome)
    }

    /// Replace the active credential with the first pool credential that is
    /// not exhausted, in insertion order.
    ///
    /// Performs the same swap as `switch_to`: the outgoing credential keeps its
    /// quota state, and the next probe of it records any exhaustion. Fails with
    /// `NoCandidate` (state untouched) when no pool credential qualifies.
    pub async fn auto_failover(&self) -> Result<SwitchOutcome> {
        let outcome = {
            let _guard = self.lock().await?;
            let current = self.synced_state().await;

            let Some(idx) = current
                .pool
                .iter()
                .position(|c| c.quota_state != QuotaState::Exhausted)
            else {
                error!(
                    pool = current.pool.len(),
                    "auto-failover found no usable credential"
                );
                return Err(Error::NoCandidate);
            };

            self.swap(current, idx).await?
        };

        self.announce_switch(&outcome, SwitchTrigger::AutoFailover);
        Ok(outcome)
    }

    /// Move `pool[idx]` into the active slot and bench the current active
    /// credential at the end of the pool. Caller holds the switch lock.
    async fn swap(&self, current: StoreState, idx: usize) -> Result<SwitchOutcome> {
        let mut next = current.clone();
        let incoming = next.pool.remove(idx);
        let from = next.active.take().map(|outgoing| {
            let id = outgoing.id.clone();
            next.pool.push(outgoing);
            id
        });
        let to = incoming.id.clone();
        next.active = Some(incoming);

        self.store.commit(&current, next).await?;
        Ok(SwitchOutcome { from, to })
    }

    fn announce_switch(&self, outcome: &SwitchOutcome, trigger: SwitchTrigger) {
        info!(
            from = outcome.from.as_deref().unwrap_or("none"),
            to = %outcome.to,
            trigger = trigger.label(),
            "switched active credential"
        );
        metrics::counter!("credential_switches_total", "trigger" => trigger.label()).increment(1);
        self.publish(PoolEvent::Switched {
            from: outcome.from.clone(),
            to: outcome.to.clone(),
            trigger,
        });
    }

    /// Current state after folding in the CLI client's changes to the active
    /// file. Caller holds the switch lock.
    async fn synced_state(&self) -> StoreState {
        match self.store.sync_active_from_disk().await {
            Ok(sync) => {
                self.announce_sync(sync);
            }
            Err(e) => warn!(error = %e, "could not re-read active file, using in-memory state"),
        }
        self.store.state().await
    }

    /// Re-read the active file under the switch lock.
    ///
    /// Adopts rotated tokens, and takes over an account the CLI client logged
    /// into on its own. Returns whether the store changed.
    pub async fn sync_active(&self) -> Result<bool> {
        let _guard = self.lock().await?;
        let sync = self.store.sync_active_from_disk().await?;
        Ok(self.announce_sync(sync))
    }

    fn announce_sync(&self, sync: ActiveSync) -> bool {
        match sync {
            ActiveSync::Unchanged => false,
            ActiveSync::Rotated => true,
            ActiveSync::Replaced { from, to } => {
                self.announce_switch(&SwitchOutcome { from, to }, SwitchTrigger::ClientLogin);
                true
            }
        }
    }

    /// Parse and append import lines to the pool.
    ///
    /// Malformed lines, and lines whose refresh token is already known (in the
    /// pool, the active slot or earlier in the batch), are skipped and counted.
    /// Blank lines are ignored.
    pub async fn import<'a, I>(&self, lines: I) -> Result<ImportOutcome>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let parsed = parse_lines(lines);
        let mut outcome = ImportOutcome::default();

        {
            let _guard = self.lock().await?;
            let current = self.store.state().await;
            let mut next = current.clone();

            let mut known: HashSet<String> = current
                .pool
                .iter()
                .chain(current.active.iter())
                .map(|c| c.refresh_token.expose().clone())
                .collect();

            for (line, result) in parsed {
                match result {
                    Ok(record) => {
                        if !known.insert(record.refresh_token.expose().clone()) {
                            outcome.skipped += 1;
                            outcome.rejected.push((
                                line,
                                Error::Malformed("refresh token already in the pool".into()),
                            ));
                            continue;
                        }
                        let credential = Credential::from_import(record);
                        outcome.ids.push(credential.id.clone());
                        next.pool.push(credential);
                        outcome.imported += 1;
                    }
                    Err(e) => {
                        debug!(line, error = %e, "skipping import line");
                        outcome.skipped += 1;
                        outcome.rejected.push((line, e.into()));
                    }
                }
            }

            if outcome.imported > 0 {
                self.store.commit(&current, next).await?;
            }
        }

        info!(
            imported = outcome.imported,
            skipped = outcome.skipped,
            "import finished"
        );
        metrics::counter!("credentials_imported_total").increment(outcome.imported as u64);
        Ok(outcome)
    }

    /// Remove pool credentials by id.
    ///
    /// The active credential is rejected with `NotDeletable` and unknown ids
    /// with `NotFound`; every other requested id is still removed.
    pub async fn delete<S: AsRef<str>>(&self, ids: &[S]) -> Result<DeleteOutcome> {
        let mut outcome = DeleteOutcome::default();

        {
            let _guard = self.lock().await?;
            let current = self.store.state().await;
            let mut next = current.clone();

            let mut requested = HashSet::new();
            for id in ids.iter().map(AsRef::as_ref) {
                if !requested.insert(id) {
                    continue;
                }
                if current.active_id() == Some(id) {
                    outcome
                        .rejected
                        .push((id.to_string(), Error::NotDeletable(id.to_string())));
                    continue;
                }
                match next.pool.iter().position(|c| c.id == id) {
                    Some(idx) => {
                        next.pool.remove(idx);
                        outcome.removed += 1;
                    }
                    None => outcome
                        .rejected
                        .push((id.to_string(), Error::NotFound(id.to_string()))),
                }
            }

            if outcome.removed > 0 {
                self.store.commit(&current, next).await?;
            }
        }

        info!(
            removed = outcome.removed,
            rejected = outcome.rejected.len(),
            "delete finished"
        );
        metrics::counter!("credentials_deleted_total").increment(outcome.removed as u64);
        Ok(outcome)
    }

    /// Write a quota observation onto a credential, wherever it currently sits.
    ///
    /// The credential may have been switched out between the query and this
    /// call; the update follows it into the pool. Fails with `NotFound` if it
    /// was deleted meanwhile.
    pub async fn record_quota(&self, id: &str, update: QuotaUpdate) -> Result<Credential> {
        let (updated, previous) = {
            let _guard = self.lock().await?;
            let current = self.store.state().await;
            let mut next = current.clone();

            let credential = next
                .find_mut(id)
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            let previous = credential.quota_state;
            credential.quota_state = update.state;
            credential.last_checked_at = Some(update.checked_at);
            if update.used_ratio.is_some() {
                credential.used_ratio = update.used_ratio;
            }
            if let Some(tokens) = update.refreshed {
                credential.access_token = tokens.access_token;
                credential.refresh_token = tokens.refresh_token;
                info!(credential_id = id, "stored refreshed tokens");
            }
            let updated = credential.clone();

            self.store.commit(&current, next).await?;
            (updated, previous)
        };

        if previous != updated.quota_state {
            info!(
                credential_id = id,
                from = previous.label(),
                to = updated.quota_state.label(),
                "quota state changed"
            );
        }
        self.publish(PoolEvent::QuotaUpdated {
            id: updated.id.clone(),
            state: updated.quota_state,
            used_ratio: updated.used_ratio,
        });
        Ok(updated)
    }
}
