//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Every section has defaults, so an empty file is a valid config.

use account_auth::{ACTIVE_FILE_RELATIVE, CLIENT_ID, DEFAULT_POOL_FILE, REFRESH_URL, USAGE_URL};
use account_pool::{DEFAULT_EXHAUSTION_PATTERNS, ProbeSettings, Signature, WatcherSettings};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub files: FilesConfig,
    pub coordinator: CoordinatorConfig,
    pub probe: ProbeConfig,
    pub watcher: WatcherConfig,
    pub admin: AdminConfig,
}

/// Locations of the pool file and the CLI client's active credential file
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    pub pool_path: PathBuf,
    pub active_path: PathBuf,
}

impl Default for FilesConfig {
    fn default() -> Self {
        let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_default();
        Self {
            pool_path: PathBuf::from(DEFAULT_POOL_FILE),
            active_path: home.join(ACTIVE_FILE_RELATIVE),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub lock_timeout_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            lock_timeout_secs: 10,
        }
    }
}

/// Quota probe settings and the remote endpoints it talks to
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub warn_threshold: f64,
    pub usage_url: String,
    pub refresh_url: String,
    pub client_id: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 90,
            timeout_secs: 30,
            warn_threshold: 0.9,
            usage_url: USAGE_URL.to_string(),
            refresh_url: REFRESH_URL.to_string(),
            client_id: CLIENT_ID.to_string(),
        }
    }
}

/// Log watcher settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub enabled: bool,
    pub log_paths: Vec<PathBuf>,
    pub poll_interval_ms: u64,
    pub signatures: Vec<String>,
    pub start_from_end: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_paths: Vec::new(),
            poll_interval_ms: 1000,
            signatures: DEFAULT_EXHAUSTION_PATTERNS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            start_from_end: true,
        }
    }
}

/// Admin API listener
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub listen_addr: SocketAddr,
    pub max_connections: usize,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 9090)),
            max_connections: 64,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// `POOL_PATH` and `ACTIVE_CREDENTIAL_PATH` override the file locations.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| common::Error::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config =
            toml::from_str(&contents).map_err(|source| common::Error::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        if let Some(p) = std::env::var_os("POOL_PATH") {
            config.files.pool_path = PathBuf::from(p);
        }
        if let Some(p) = std::env::var_os("ACTIVE_CREDENTIAL_PATH") {
            config.files.active_path = PathBuf::from(p);
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let invalid = |field: &'static str, reason: String| -> common::Result<()> {
            Err(common::Error::Invalid { field, reason })
        };
        let positive = "must be greater than 0".to_string();

        if self.coordinator.lock_timeout_secs == 0 {
            return invalid("lock_timeout_secs", positive);
        }
        if self.probe.interval_secs == 0 {
            return invalid("interval_secs", positive);
        }
        if self.probe.timeout_secs == 0 {
            return invalid("timeout_secs", positive);
        }
        if !(self.probe.warn_threshold > 0.0 && self.probe.warn_threshold <= 1.0) {
            return invalid(
                "warn_threshold",
                format!("must be in (0, 1], got: {}", self.probe.warn_threshold),
            );
        }
        for (field, url) in [
            ("usage_url", &self.probe.usage_url),
            ("refresh_url", &self.probe.refresh_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return invalid(
                    field,
                    format!("must start with http:// or https://, got: {url}"),
                );
            }
        }
        if self.watcher.poll_interval_ms == 0 {
            return invalid("poll_interval_ms", positive);
        }
        if Signature::new(&self.watcher.signatures).is_empty() {
            return invalid(
                "signatures",
                "must contain at least one non-empty pattern".into(),
            );
        }
        if self.admin.max_connections == 0 {
            return invalid("max_connections", positive);
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("token-switcher.toml")
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.coordinator.lock_timeout_secs)
    }

    pub fn probe_settings(&self) -> ProbeSettings {
        ProbeSettings {
            interval: Duration::from_secs(self.probe.interval_secs),
            query_timeout: Duration::from_secs(self.probe.timeout_secs),
            warn_threshold: self.probe.warn_threshold,
        }
    }

    pub fn watcher_settings(&self) -> WatcherSettings {
        WatcherSettings {
            paths: self.watcher.log_paths.clone(),
            poll_interval: Duration::from_millis(self.watcher.poll_interval_ms),
            start_from_end: self.watcher.start_from_end,
            signature: Signature::new(&self.watcher.signatures),
        }
    }
}
