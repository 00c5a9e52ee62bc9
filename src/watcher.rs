//! Polls the configuration file and reloads it when it changes

use crate::config::load_from_path;
use crate::error::ConfigError;
use crate::logging::{log_error, log_info};
use crate::routes::ProxyConfig;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tracing::debug;

const TAG: &str = "watcher";

/// What one poll did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Modification time unchanged
    Unchanged,
    /// File changed and was installed
    Reloaded,
    /// File changed but was rejected; it is retried next poll
    ReloadFailed,
    /// The file could not be stat'ed
    StatFailed,
}

pub struct ConfigWatcher {
    config: Arc<ProxyConfig>,
    path: PathBuf,
    last_modified: SystemTime,
    reloads: u64,
}

fn modified(path: &Path) -> Result<SystemTime, ConfigError> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|source| ConfigError::NotFound {
            path: path.to_path_buf(),
            source,
        })
}

impl ConfigWatcher {
    /// Start watching `path`. The current modification time counts as
    /// already loaded.
    pub fn new(config: Arc<ProxyConfig>, path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let last_modified = modified(&path)?;

        Ok(Self {
            config,
            path,
            last_modified,
            reloads: 0,
        })
    }

    /// Successful reloads so far
    pub fn reloads(&self) -> u64 {
        self.reloads
    }

    pub fn poll(&mut self) -> PollOutcome {
        let current = match modified(&self.path) {
            Ok(time) => time,
            Err(e) => {
                log_error(TAG, &e.to_string());
                return PollOutcome::StatFailed;
            }
        };

        if current == self.last_modified {
            return PollOutcome::Unchanged;
        }

        match load_from_path(&self.config, &self.path) {
            Ok(()) => {
                self.last_modified = current;
                self.reloads += 1;
                log_info(TAG, &format!("reloaded configuration from '{}'", self.path.display()));
                PollOutcome::Reloaded
            }
            Err(e) => {
                log_error(
                    TAG,
                    &format!("keeping previous configuration, reload of '{}' failed: {}", self.path.display(), e),
                );
                PollOutcome::ReloadFailed
            }
        }
    }

    /// Poll every `interval` until `shutdown_rx` turns true.
    /// Each poll stats, reads and parses the file on the blocking pool.
    pub async fn run(self, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        if *shutdown_rx.borrow() {
            return;
        }
        debug!(path = %self.path.display(), interval_ms = interval.as_millis() as u64, "Watching configuration file");

        let mut watcher = self;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let polling = tokio::task::spawn_blocking(move || {
                        watcher.poll();
                        watcher
                    });
                    watcher = match polling.await {
                        Ok(watcher) => watcher,
                        Err(e) => {
                            log_error(TAG, &format!("configuration poll aborted: {}", e));
                            return;
                        }
                    };
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        debug!(path = %watcher.path.display(), reloads = watcher.reloads, "Configuration watcher stopped");
    }
}

/// Watch `path` and reload `config` whenever the file changes.
///
/// Returns immediately when `config` is `None` or the file cannot be
/// stat'ed at start.
pub async fn watch_config_file(
    config: Option<Arc<ProxyConfig>>,
    path: impl Into<PathBuf>,
    interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
) {
    let Some(config) = config else {
        return;
    };

    match ConfigWatcher::new(config, path) {
        Ok(watcher) => watcher.run(interval, shutdown_rx).await,
        Err(e) => log_error(TAG, &format!("not watching configuration: {}", e)),
    }
}
