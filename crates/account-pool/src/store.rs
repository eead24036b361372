//! In-memory credential pool and active slot, backed by the credential files
//!
//! The store holds the benched pool (insertion order) and the single active
//! credential. Readers get cloned snapshots and never wait on file I/O.
//! Mutations are crate-private: only the `SwitchCoordinator` calls `commit`,
//! under its switch lock, and a commit updates memory only after the files
//! are written.
//!
//! A switch touches both files. It is written in three steps so that a crash
//! between any two of them leaves files that `load` reconciles to either the
//! old or the new state:
//! 1. pool file = new pool plus the incoming credential (a superset)
//! 2. active file = incoming credential
//! 3. pool file = new pool
//!
//! `load` drops any pool record whose id equals the active id, which is
//! exactly the duplicate left behind by an interrupted switch. A switch is
//! therefore complete once step 2 succeeds; a failure at step 3 is only
//! logged.

use std::collections::HashSet;

use account_auth::{ActiveRecord, Credential, CredentialFiles, credentials::new_id};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Consistent view of the pool and active slot at one instant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    pub pool: Vec<Credential>,
    pub active: Option<Credential>,
}

impl StoreSnapshot {
    /// Number of credentials across pool and active slot.
    pub fn total(&self) -> usize {
        self.pool.len() + usize::from(self.active.is_some())
    }
}

/// Full mutable state, including the CLI client's foreign active-file fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct StoreState {
    pub(crate) pool: Vec<Credential>,
    pub(crate) active: Option<Credential>,
    pub(crate) active_extra: Map<String, Value>,
}

impl StoreState {
    pub(crate) fn find(&self, id: &str) -> Option<&Credential> {
        self.active
            .as_ref()
            .filter(|c| c.id == id)
            .or_else(|| self.pool.iter().find(|c| c.id == id))
    }

    pub(crate) fn find_mut(&mut self, id: &str) -> Option<&mut Credential> {
        match self.active.as_mut() {
            Some(active) if active.id == id => Some(active),
            _ => self.pool.iter_mut().find(|c| c.id == id),
        }
    }

    pub(crate) fn active_id(&self) -> Option<&str> {
        self.active.as_ref().map(|c| c.id.as_str())
    }
}

/// Durable pool + active-slot state.
pub struct CredentialStore {
    files: CredentialFiles,
    state: RwLock<StoreState>,
}

impl CredentialStore {
    /// Load both files and reconcile them.
    ///
    /// Reconciliation restores the uniqueness invariants before anything else
    /// runs:
    /// - duplicate ids inside the pool keep their first occurrence
    /// - an active file without an id (rewritten by the CLI client after its
    ///   own login) adopts the id of the pool record with the same refresh
    ///   token, or a freshly minted one
    /// - a pool record sharing the active id is dropped; the active file's
    ///   tokens are newer
    ///
    /// Any repair is persisted before returning.
    pub async fn load(files: CredentialFiles) -> Result<Self> {
        let mut pool = files.load_pool().await?;
        let record = files.load_active().await?;

        let mut pool_dirty = false;
        let mut active_dirty = false;

        let mut seen = HashSet::new();
        let before = pool.len();
        pool.retain(|c| seen.insert(c.id.clone()));
        if pool.len() != before {
            warn!(dropped = before - pool.len(), "pool file contained duplicate ids");
            pool_dirty = true;
        }

        let (active, active_extra) = match record {
            None => (None, Map::new()),
            Some(record) => {
                let has_id = record.id.as_deref().is_some_and(|id| !id.trim().is_empty());
                let before = pool.len();
                let (credential, extra) = if has_id {
                    record.into_parts(new_id)
                } else {
                    let (credential, extra) = identify(&mut pool, record);
                    info!(credential_id = %credential.id, "assigned id to active credential");
                    active_dirty = true;
                    (credential, extra)
                };

                pool.retain(|c| c.id != credential.id);
                if has_id && pool.len() != before {
                    warn!(
                        credential_id = %credential.id,
                        "active credential also present in pool, dropping pool copy"
                    );
                }
                pool_dirty |= pool.len() != before;
                (Some(credential), extra)
            }
        };

        let state = StoreState {
            pool,
            active,
            active_extra,
        };

        if active_dirty {
            if let Some(active) = &state.active {
                files
                    .save_active(&ActiveRecord::from_credential(active, state.active_extra.clone()))
                    .await?;
            }
        }
        if pool_dirty {
            files.save_pool(&state.pool).await?;
        }

        info!(
            pool = state.pool.len(),
            active = state.active_id().unwrap_or("none"),
            "credential store loaded"
        );

        Ok(Self {
            files,
            state: RwLock::new(state),
        })
    }

    /// Pool credentials in insertion order. The active credential is not included.
    pub async fn list(&self) -> Vec<Credential> {
        self.state.read().await.pool.clone()
    }

    /// Look up a credential by id in the pool or the active slot.
    pub async fn get(&self, id: &str) -> Result<Credential> {
        self.state
            .read()
            .await
            .find(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// The active credential, if any.
    pub async fn active(&self) -> Option<Credential> {
        self.state.read().await.active.clone()
    }

    /// Pool and active slot captured together.
    pub async fn snapshot(&self) -> StoreSnapshot {
        let state = self.state.read().await;
        StoreSnapshot {
            pool: state.pool.clone(),
            active: state.active.clone(),
        }
    }

    pub fn files(&self) -> &CredentialFiles {
        &self.files
    }

    pub(crate) async fn state(&self) -> StoreState {
        self.state.read().await.clone()
    }

    /// Persist the transition from `current` to `next`, then publish `next` in memory.
    ///
    /// Only files whose contents change are written. If the active slot changes
    /// together with the pool, the three-step order from the module docs is used.
    pub(crate) async fn commit(&self, current: &StoreState, next: StoreState) -> Result<()> {
        let pool_changed = current.pool != next.pool;
        let active_changed =
            current.active != next.active || current.active_extra != next.active_extra;

        match (pool_changed, active_changed) {
            (false, false) => {}
            (true, false) => self.files.save_pool(&next.pool).await?,
            (false, true) => self.save_active(&next).await?,
            (true, true) => self.write_switch(current, &next).await?,
        }

        *self.state.write().await = next;
        Ok(())
    }

    async fn write_switch(&self, current: &StoreState, next: &StoreState) -> Result<()> {
        let mut staging = next.pool.clone();
        if let Some(incoming) = &next.active {
            if !staging.iter().any(|c| c.id == incoming.id) {
                staging.push(incoming.clone());
            }
        }
        self.files.save_pool(&staging).await?;

        if let Err(e) = self.save_active(next).await {
            // The active file is untouched; put the pool file back as well.
            if let Err(restore) = self.files.save_pool(&current.pool).await {
                warn!(error = %restore, "failed to restore pool file after aborted switch");
            }
            return Err(e);
        }

        // The switch is durable once the active file is written. A pool file
        // still holding the incoming credential is reconciled by `load`, and
        // the next pool write replaces it.
        if let Err(e) = self.files.save_pool(&next.pool).await {
            warn!(
                error = %e,
                pool_path = %self.files.pool_path().display(),
                "active credential switched but pool file not rewritten"
            );
        }
        Ok(())
    }

    async fn save_active(&self, state: &StoreState) -> Result<()> {
        match &state.active {
            Some(active) => {
                let record = ActiveRecord::from_credential(active, state.active_extra.clone());
                self.files.save_active(&record).await?;
                Ok(())
            }
            // The active slot is never emptied by any operation.
            None => Ok(()),
        }
    }

    /// Re-read the active file and fold the CLI client's changes into the store.
    ///
    /// A file that still describes the active credential (same id, or no id
    /// and the same refresh token) only contributes rotated tokens and foreign
    /// fields; that is kept in memory and written by the next commit.
    ///
    /// An id-less file with another refresh token means the client logged into
    /// a different account. It is identified the same way `load` does, the
    /// previous active credential is benched unchanged, and both files are
    /// written. A file naming some other id is ignored.
    pub(crate) async fn sync_active_from_disk(&self) -> Result<ActiveSync> {
        let Some(record) = self.files.load_active().await? else {
            return Ok(ActiveSync::Unchanged);
        };

        let current = self.state().await;
        let file_id = record
            .id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_owned);
        let refresh = record.refresh_token.expose().trim().to_owned();

        let describes_active = current.active.as_ref().is_some_and(|active| match &file_id {
            Some(id) => *id == active.id,
            None => active.refresh_token.expose().as_str() == refresh,
        });

        if describes_active {
            let mut state = self.state.write().await;
            let Some(active) = state.active.as_mut() else {
                return Ok(ActiveSync::Unchanged);
            };
            let access = record.access_token.expose().trim();
            let mut changed = false;
            if !refresh.is_empty() && refresh != *active.refresh_token.expose() {
                active.refresh_token = refresh.clone().into();
                changed = true;
            }
            if !access.is_empty() && access != active.access_token.expose() {
                active.access_token = access.to_owned().into();
                changed = true;
            }
            if changed {
                debug!(credential_id = %active.id, "adopted tokens rotated by the CLI client");
            }
            if state.active_extra != record.extra {
                state.active_extra = record.extra;
                changed = true;
            }
            return Ok(if changed {
                ActiveSync::Rotated
            } else {
                ActiveSync::Unchanged
            });
        }

        if let Some(id) = file_id {
            warn!(
                file_id = %id,
                credential_id = current.active_id().unwrap_or("none"),
                "active file describes a different credential, ignoring"
            );
            return Ok(ActiveSync::Unchanged);
        }

        let mut next = current.clone();
        let (incoming, extra) = identify(&mut next.pool, record);
        let from = next.active.take().map(|outgoing| {
            let id = outgoing.id.clone();
            next.pool.push(outgoing);
            id
        });
        let to = incoming.id.clone();
        next.active = Some(incoming);
        next.active_extra = extra;

        info!(
            from = from.as_deref().unwrap_or("none"),
            to = %to,
            "CLI client logged into another account"
        );
        self.commit(&current, next).await?;
        Ok(ActiveSync::Replaced { from, to })
    }
}

/// What re-reading the active file changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ActiveSync {
    Unchanged,
    /// Same credential, new tokens or foreign fields
    Rotated,
    /// The client switched accounts on its own
    Replaced { from: Option<String>, to: String },
}

/// Give an id-less active-file record its identity.
///
/// Reuses the pool record with the same refresh token (removing it from the
/// pool and carrying its quota fields over), or mints a fresh id. The file's
/// tokens are kept; they are the newest.
fn identify(pool: &mut Vec<Credential>, record: ActiveRecord) -> (Credential, Map<String, Value>) {
    let refresh = record.refresh_token.expose().trim().to_owned();
    let matched = pool
        .iter()
        .position(|c| !refresh.is_empty() && *c.refresh_token.expose() == refresh)
        .map(|idx| pool.remove(idx));

    let fallback = matched.as_ref().map(|c| c.id.clone());
    let (mut credential, extra) = record.into_parts(|| fallback.unwrap_or_else(new_id));
    if let Some(benched) = matched {
        credential.quota_state = benched.quota_state;
        credential.last_checked_at = benched.last_checked_at;
        credential.used_ratio = benched.used_ratio;
        if credential.imported_at.is_none() {
            credential.imported_at = benched.imported_at;
        }
    }
    (credential, extra)
}
