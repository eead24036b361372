//! Log-driven failover
//!
//! Tails the CLI client's log files and asks the coordinator for an automatic
//! failover when the exhaustion notice shows up. Each file keeps its own byte
//! offset, so lines are never processed twice across polls or across a
//! stop/start. Only complete lines are consumed; a trailing partial line waits
//! for its newline.
//!
//! A file that shrinks below its offset was truncated or rotated, and is read
//! again from the start.

use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::coordinator::{SwitchCoordinator, SwitchOutcome};
use crate::error::{Error, Result};
use crate::events::{FailoverFailure, PoolEvent};
use crate::signature::Signature;
use crate::task::TaskSlot;

/// Most bytes consumed from one file in a single poll.
const MAX_READ_BYTES: u64 = 1024 * 1024;

/// Which files to tail and how.
#[derive(Debug, Clone)]
pub struct WatcherSettings {
    pub paths: Vec<PathBuf>,
    pub poll_interval: Duration,
    /// Skip content already present when a file is first seen
    pub start_from_end: bool,
    pub signature: Signature,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            poll_interval: Duration::from_secs(1),
            start_from_end: true,
            signature: Signature::default(),
        }
    }
}

/// Read position in one append-only log file.
#[derive(Debug)]
pub struct LogTail {
    path: PathBuf,
    offset: Option<u64>,
}

impl LogTail {
    pub fn new(path: PathBuf) -> Self {
        Self { path, offset: None }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last consumed byte offset; `None` until the first read.
    pub fn offset(&self) -> Option<u64> {
        self.offset
    }

    /// Read the complete lines appended since the last call.
    ///
    /// On first contact the offset is set to the current end of the file when
    /// `start_from_end` is set. A file that does not exist yet starts at 0, so
    /// everything written to it later is seen.
    pub async fn read_new_lines(&mut self, start_from_end: bool) -> std::io::Result<Vec<String>> {
        let len = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.offset.get_or_insert(0);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let offset = match self.offset {
            None => {
                let start = if start_from_end { len } else { 0 };
                debug!(path = %self.path.display(), offset = start, "tailing log file");
                self.offset = Some(start);
                start
            }
            Some(offset) if len < offset => {
                info!(
                    path = %self.path.display(),
                    offset,
                    len,
                    "log file shrank, reading from the start"
                );
                self.offset = Some(0);
                0
            }
            Some(offset) => offset,
        };
        if len == offset {
            return Ok(Vec::new());
        }

        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::new();
        file.take((len - offset).min(MAX_READ_BYTES))
            .read_to_end(&mut buf)
            .await?;

        let consumed = match buf.iter().rposition(|&b| b == b'\n') {
            Some(newline) => newline + 1,
            // A single line longer than the read cap is taken as is
            None if buf.len() as u64 >= MAX_READ_BYTES => buf.len(),
            None => return Ok(Vec::new()),
        };
        self.offset = Some(offset + consumed as u64);

        Ok(String::from_utf8_lossy(&buf[..consumed])
            .lines()
            .map(str::to_owned)
            .collect())
    }
}

struct WatcherInner {
    coordinator: Arc<SwitchCoordinator>,
    settings: WatcherSettings,
    tails: Mutex<Vec<LogTail>>,
}

/// Background log tailer with `Stopped -> Running -> Stopped` control.
pub struct LogFailoverWatcher {
    inner: Arc<WatcherInner>,
    task: TaskSlot,
}

impl LogFailoverWatcher {
    pub fn new(coordinator: Arc<SwitchCoordinator>, settings: WatcherSettings) -> Self {
        let tails = settings.paths.iter().cloned().map(LogTail::new).collect();
        Self {
            inner: Arc::new(WatcherInner {
                coordinator,
                settings,
                tails: Mutex::new(tails),
            }),
            task: TaskSlot::new("log_watcher"),
        }
    }

    /// Start polling. Returns false if already running or nothing is configured to watch.
    pub fn start(&self) -> bool {
        if self.inner.settings.paths.is_empty() {
            warn!("no log paths configured, log watcher not started");
            return false;
        }
        let inner = self.inner.clone();
        self.task.start(self.inner.settings.poll_interval, move || {
            let inner = inner.clone();
            async move {
                inner.poll_once().await;
            }
        })
    }

    /// Stop polling. Offsets are kept, so a restart resumes where it left off.
    pub async fn stop(&self) -> bool {
        self.task.stop().await
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    /// Read every file once. If any new line carries the exhaustion notice,
    /// run one automatic failover and return its result.
    pub async fn poll_once(&self) -> Option<Result<SwitchOutcome>> {
        self.inner.poll_once().await
    }

    /// Current offset per watched file.
    pub async fn offsets(&self) -> Vec<(PathBuf, Option<u64>)> {
        self.inner
            .tails
            .lock()
            .await
            .iter()
            .map(|t| (t.path.clone(), t.offset))
            .collect()
    }
}

impl WatcherInner {
    async fn poll_once(&self) -> Option<Result<SwitchOutcome>> {
        let mut detected = false;
        {
            let mut tails = self.tails.lock().await;
            for tail in tails.iter_mut() {
                let lines = match tail.read_new_lines(self.settings.start_from_end).await {
                    Ok(lines) => lines,
                    Err(e) => {
                        warn!(path = %tail.path.display(), error = %e, "failed to read log file");
                        continue;
                    }
                };
                // Keep reading the other files so their offsets advance too
                if let Some(line) = lines.iter().find(|l| self.settings.signature.matches(l)) {
                    info!(
                        path = %tail.path.display(),
                        line = line.trim(),
                        "exhaustion notice detected"
                    );
                    detected = true;
                }
            }
        }

        if detected {
            Some(self.failover().await)
        } else {
            None
        }
    }

    async fn failover(&self) -> Result<SwitchOutcome> {
        let result = self.coordinator.auto_failover().await;
        let (outcome, event) = match &result {
            Ok(switch) => (
                "switched",
                PoolEvent::FailoverTriggered {
                    from: switch.from.clone(),
                    to: switch.to.clone(),
                },
            ),
            Err(Error::NoCandidate) => {
                error!("failover requested but every pool credential is exhausted");
                (
                    "no_candidate",
                    PoolEvent::FailoverFailed {
                        failure: FailoverFailure::NoCandidate,
                    },
                )
            }
            Err(e) => {
                warn!(error = %e, "failover requested but the switch failed");
                (
                    "error",
                    PoolEvent::FailoverFailed {
                        failure: FailoverFailure::SwitchFailed(e.to_string()),
                    },
                )
            }
        };
        metrics::counter!("failover_attempts_total", "outcome" => outcome).increment(1);
        self.coordinator.publish(event);
        result
    }
}
