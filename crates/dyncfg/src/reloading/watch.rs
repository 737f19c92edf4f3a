//! Background reload checks
//!
//! Runs [`ReloadCheck::check_for_reloading`] on a tokio task, periodically
//! and whenever one of the watched files is touched.

use notify::RecursiveMode;
use notify_debouncer_mini::new_debouncer;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use super::ReloadCheck;
use crate::ConfigError;

/// How often pending file notifications are drained
const NOTIFY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Configuration for the reload watcher
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Interval of unconditional checks; `None` checks on file events only
    pub check_interval: Option<Duration>,
    /// Files whose modification triggers an immediate check
    pub paths: Vec<PathBuf>,
    /// Debounce duration for rapid changes
    pub debounce: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            check_interval: Some(Duration::from_secs(5)),
            paths: Vec::new(),
            debounce: Duration::from_millis(500),
        }
    }
}

impl WatchConfig {
    /// Check every `interval`
    pub fn every(interval: Duration) -> Self {
        Self {
            check_interval: Some(interval),
            ..Default::default()
        }
    }

    /// Also check when `path` changes
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.paths.push(path.into());
        self
    }

    /// Set debounce duration
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }
}

/// Spawns reload checks on the current tokio runtime
pub struct ReloadWatcher {
    config: WatchConfig,
}

impl ReloadWatcher {
    pub fn new(config: WatchConfig) -> Self {
        Self { config }
    }

    /// Start checking `controller` in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<C>(&self, controller: Arc<C>) -> Result<WatchHandle, ConfigError>
    where
        C: ReloadCheck + 'static,
    {
        let paths = self.config.paths.clone();
        let check_interval = self.config.check_interval;

        // Watch parent directories; editors often replace files instead of writing them
        let watch_dirs: BTreeSet<PathBuf> = paths
            .iter()
            .map(|path| {
                path.parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .map(|p| p.to_path_buf())
                    .unwrap_or_else(|| PathBuf::from("."))
            })
            .collect();

        // Create channel for debounced events
        let (notify_tx, notify_rx) = std::sync::mpsc::channel();

        let debouncer = if watch_dirs.is_empty() {
            None
        } else {
            let mut debouncer = new_debouncer(self.config.debounce, notify_tx)
                .map_err(|e| ConfigError::watcher(format!("Failed to create file watcher: {e}")))?;
            for dir in &watch_dirs {
                debouncer
                    .watcher()
                    .watch(dir, RecursiveMode::NonRecursive)
                    .map_err(|e| {
                        ConfigError::watcher(format!("Failed to watch path {}: {e}", dir.display()))
                    })?;
            }
            Some(debouncer)
        };
        let notifications = debouncer.is_some();

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut periodic = check_interval.map(|every| {
                let mut interval = tokio::time::interval(every);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                interval
            });

            info!(
                paths = paths.len(),
                interval_ms = check_interval.map(|d| d.as_millis() as u64),
                "Started reload watcher"
            );

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        info!("Reload watcher shutting down");
                        break;
                    }
                    _ = tick(&mut periodic) => {
                        run_check(controller.as_ref(), "interval");
                    }
                    _ = tokio::time::sleep(NOTIFY_POLL_INTERVAL), if notifications => {
                        let mut touched = false;
                        while let Ok(events) = notify_rx.try_recv() {
                            match events {
                                Ok(events) => {
                                    touched |= events.iter().any(|event| {
                                        paths.iter().any(|p| p.file_name() == event.path.file_name())
                                    });
                                }
                                Err(e) => {
                                    error!("File watcher error: {:?}", e);
                                }
                            }
                        }
                        if touched {
                            run_check(controller.as_ref(), "file event");
                        }
                    }
                }
            }

            drop(debouncer);
        });

        Ok(WatchHandle::new(handle, shutdown_tx))
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn run_check<C: ReloadCheck + ?Sized>(controller: &C, trigger: &str) {
    if controller.check_for_reloading(None) {
        info!(trigger, "Reload pending after check");
    } else {
        debug!(trigger, "No configuration change");
    }
}

/// Handle for a running watcher
pub struct WatchHandle {
    /// Task handle for the watcher
    handle: tokio::task::JoinHandle<()>,
    /// Shutdown signal
    shutdown: tokio::sync::oneshot::Sender<()>,
}

impl WatchHandle {
    /// Create a new watch handle
    pub fn new(
        handle: tokio::task::JoinHandle<()>,
        shutdown: tokio::sync::oneshot::Sender<()>,
    ) -> Self {
        Self { handle, shutdown }
    }

    /// Whether the watcher task has ended
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the watcher
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.handle.await;
    }
}
