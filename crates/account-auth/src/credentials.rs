//! Credential records and their durable files
//!
//! Two JSON files back the engine. The pool file is an array of benched
//! credentials in insertion order. The active file is a single object read by
//! the CLI client; its absence means no credential is active. Every write goes
//! to a temporary sibling first and is then renamed over the target, so a
//! concurrent reader only ever sees the old or the new document.
//!
//! The active file is shared with the CLI client, which may add fields of its
//! own. Unknown fields are kept in `ActiveRecord::extra` and written back.

use std::path::{Path, PathBuf};

use common::Secret;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::import::ImportRecord;

/// Health of a credential's remaining allowance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaState {
    /// Never checked since import
    #[default]
    Unknown,
    Healthy,
    /// Fully depleted; never eligible to become active
    Exhausted,
    /// Last check failed (network, parse or auth error)
    Error,
}

impl QuotaState {
    /// Status label for logging and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            QuotaState::Unknown => "unknown",
            QuotaState::Healthy => "healthy",
            QuotaState::Exhausted => "exhausted",
            QuotaState::Error => "error",
        }
    }
}

/// A minted token pair managed by the switcher.
///
/// `last_checked_at` is a unix timestamp in milliseconds. `imported_at` is the
/// free-form third field of the import line, kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub id: String,
    pub refresh_token: Secret<String>,
    pub access_token: Secret<String>,
    #[serde(default)]
    pub imported_at: Option<String>,
    #[serde(default)]
    pub quota_state: QuotaState,
    #[serde(default)]
    pub last_checked_at: Option<u64>,
    /// Used fraction of the allowance from the last successful check
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_ratio: Option<f64>,
}

impl Credential {
    /// Build a fresh credential from an accepted import record.
    ///
    /// Ids are random v4 UUIDs, so an id is never handed out twice, even
    /// after the credential that carried it was deleted.
    pub fn from_import(record: ImportRecord) -> Self {
        Self {
            id: new_id(),
            refresh_token: record.refresh_token,
            access_token: record.access_token,
            imported_at: record.timestamp,
            quota_state: QuotaState::Unknown,
            last_checked_at: None,
            used_ratio: None,
        }
    }
}

/// Mint a new credential id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// On-disk shape of the active credential file.
///
/// `id` is optional because the CLI client rewrites this file after its own
/// login and drops fields it does not know. Token fields default to empty so
/// such a file still parses; `into_parts` rejects it if both are empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub refresh_token: Secret<String>,
    #[serde(default)]
    pub access_token: Secret<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_at: Option<String>,
    #[serde(default)]
    pub quota_state: QuotaState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_ratio: Option<f64>,
    /// Fields written by the CLI client that the switcher does not manage
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ActiveRecord {
    /// Wrap a credential for the active file, carrying the client's foreign fields along.
    pub fn from_credential(
        credential: &Credential,
        extra: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            id: Some(credential.id.clone()),
            refresh_token: credential.refresh_token.clone(),
            access_token: credential.access_token.clone(),
            imported_at: credential.imported_at.clone(),
            quota_state: credential.quota_state,
            last_checked_at: credential.last_checked_at,
            used_ratio: credential.used_ratio,
            extra,
        }
    }

    /// Whether the record carries any token at all.
    pub fn has_tokens(&self) -> bool {
        !self.refresh_token.expose().trim().is_empty()
            || !self.access_token.expose().trim().is_empty()
    }

    /// Split into a credential (using `fallback_id` when the file had none)
    /// and the foreign fields.
    pub fn into_parts(
        self,
        fallback_id: impl FnOnce() -> String,
    ) -> (Credential, serde_json::Map<String, serde_json::Value>) {
        let id = match self.id {
            Some(id) if !id.trim().is_empty() => id,
            _ => fallback_id(),
        };
        let credential = Credential {
            id,
            refresh_token: Secret::new(self.refresh_token.expose().trim().to_owned()),
            access_token: Secret::new(self.access_token.expose().trim().to_owned()),
            imported_at: self.imported_at,
            quota_state: self.quota_state,
            last_checked_at: self.last_checked_at,
            used_ratio: self.used_ratio,
        };
        (credential, self.extra)
    }
}

/// Pool file contents. Older pool files wrap the array in `{"tokens": [...]}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum PoolDocument {
    List(Vec<Credential>),
    Wrapped { tokens: Vec<Credential> },
}

/// Locations of the pool file and the active credential file.
#[derive(Debug, Clone)]
pub struct CredentialFiles {
    pool_path: PathBuf,
    active_path: PathBuf,
}

impl CredentialFiles {
    pub fn new(pool_path: PathBuf, active_path: PathBuf) -> Self {
        Self {
            pool_path,
            active_path,
        }
    }

    pub fn pool_path(&self) -> &Path {
        &self.pool_path
    }

    pub fn active_path(&self) -> &Path {
        &self.active_path
    }

    /// Load the pool file.
    ///
    /// If the file doesn't exist, creates it as `[]` (cold start with an empty
    /// pool) and returns no credentials.
    pub async fn load_pool(&self) -> Result<Vec<Credential>> {
        if !tokio::fs::try_exists(&self.pool_path).await.unwrap_or(false) {
            info!(path = %self.pool_path.display(), "pool file not found, starting with empty pool");
            self.save_pool(&[]).await?;
            return Ok(Vec::new());
        }

        let contents = tokio::fs::read_to_string(&self.pool_path)
            .await
            .map_err(|e| Error::Io(format!("reading pool file: {e}")))?;
        let document: PoolDocument = serde_json::from_str(&contents)
            .map_err(|e| Error::CredentialParse(format!("parsing pool file: {e}")))?;
        let pool = match document {
            PoolDocument::List(pool) => pool,
            PoolDocument::Wrapped { tokens } => tokens,
        };
        info!(path = %self.pool_path.display(), credentials = pool.len(), "loaded pool");
        Ok(pool)
    }

    /// Persist the pool atomically.
    pub async fn save_pool(&self, pool: &[Credential]) -> Result<()> {
        write_atomic(&self.pool_path, &pool).await
    }

    /// Load the active credential file.
    ///
    /// Returns `None` when the file is absent or holds no tokens.
    pub async fn load_active(&self) -> Result<Option<ActiveRecord>> {
        let contents = match tokio::fs::read_to_string(&self.active_path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.active_path.display(), "no active credential file");
                return Ok(None);
            }
            Err(e) => return Err(Error::Io(format!("reading active file: {e}"))),
        };

        let record: ActiveRecord = serde_json::from_str(&contents)
            .map_err(|e| Error::CredentialParse(format!("parsing active file: {e}")))?;
        if !record.has_tokens() {
            warn!(path = %self.active_path.display(), "active file has no tokens, treating as empty");
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// Persist the active credential atomically.
    pub async fn save_active(&self, record: &ActiveRecord) -> Result<()> {
        write_atomic(&self.active_path, record).await
    }
}

/// Write a JSON document to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. The parent directory is created when missing (the CLI client's
/// config directory may not exist yet). Sets file permissions to 0600 since
/// the document contains tokens. The temp file is removed if any step fails.
async fn write_atomic<T: Serialize + ?Sized>(path: &Path, data: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| Error::Io(format!("creating {}: {e}", dir.display())))?;

    let file_name = path
        .file_name()
        .ok_or_else(|| Error::Io(format!("{} has no file name", path.display())))?
        .to_string_lossy();
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    let result = write_and_rename(&tmp_path, path, json.as_bytes()).await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp_path).await;
    }
    result?;

    debug!(path = %path.display(), "persisted credentials");
    Ok(())
}

async fn write_and_rename(tmp_path: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
    tokio::fs::write(tmp_path, bytes)
        .await
        .map_err(|e| Error::Io(format!("writing temp file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting file permissions: {e}")))?;
    }

    tokio::fs::rename(tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp file: {e}")))
}
