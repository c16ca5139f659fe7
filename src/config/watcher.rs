//! Configuration file watcher for hot reload.
//!
//! Editors and atomic renames fire several events per save. Raw events only
//! mark the file dirty; a reload runs once the file has been quiet for the
//! debounce window, and a reload that parses to the running config is
//! dropped.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::NlbConfig;

/// Quiet period before a burst of file events is reloaded.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// Monitors the configuration file and emits every valid, changed version.
pub struct ConfigWatcher {
    path: PathBuf,
    current: Option<NlbConfig>,
    update_tx: mpsc::UnboundedSender<NlbConfig>,
}

impl ConfigWatcher {
    /// Returns the watcher and a receiver for configuration updates.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<NlbConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        (
            Self {
                path: path.to_path_buf(),
                current: None,
                update_tx,
            },
            update_rx,
        )
    }

    /// The config already running, so an unchanged save is not re-emitted.
    pub fn with_current(mut self, config: NlbConfig) -> Self {
        self.current = Some(config);
        self
    }

    /// Start watching. Must be called inside a tokio runtime.
    ///
    /// The returned handle must be kept alive; dropping it ends the reload
    /// loop. Invalid files are logged and skipped; the running config stays.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let (dirty_tx, dirty_rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    let _ = dirty_tx.send(());
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = ?e, "Config watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;
        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;
        tracing::info!(path = ?self.path, debounce = ?DEFAULT_DEBOUNCE, "Config watcher started");

        tokio::spawn(coalesce_reloads(
            self.path,
            dirty_rx,
            self.update_tx,
            DEFAULT_DEBOUNCE,
            self.current,
        ));
        Ok(watcher)
    }
}

/// Turn bursts of change marks into at most one load each.
///
/// Ends when either channel closes.
async fn coalesce_reloads(
    path: PathBuf,
    mut dirty: mpsc::UnboundedReceiver<()>,
    updates: mpsc::UnboundedSender<NlbConfig>,
    debounce: Duration,
    mut current: Option<NlbConfig>,
) {
    while dirty.recv().await.is_some() {
        let mut coalesced = 1usize;
        loop {
            match tokio::time::timeout(debounce, dirty.recv()).await {
                Ok(Some(())) => coalesced += 1,
                Ok(None) => return,
                Err(_) => break,
            }
        }

        tracing::info!(path = ?path, events = coalesced, "Config file change detected, reloading");
        match load_config(&path) {
            Ok(config) if current.as_ref() == Some(&config) => {
                tracing::debug!(path = ?path, "Config contents unchanged, skipping reload");
            }
            Ok(config) => {
                current = Some(config.clone());
                if updates.send(config).is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to reload config, keeping current configuration");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(file: &tempfile::NamedTempFile, level: &str) {
        std::fs::write(file.path(), format!("[observability]\nlog_level = \"{level}\"\n")).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_reloads_once_and_skips_unchanged() {
        let file = tempfile::NamedTempFile::new().unwrap();
        write_config(&file, "info");
        let running = load_config(file.path()).unwrap();

        let (dirty_tx, dirty_rx) = mpsc::unbounded_channel();
        let (update_tx, mut updates) = mpsc::unbounded_channel();
        let task = tokio::spawn(coalesce_reloads(
            file.path().to_path_buf(),
            dirty_rx,
            update_tx,
            Duration::from_millis(300),
            Some(running),
        ));

        // A save that leaves the contents as they were.
        dirty_tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(updates.try_recv().is_err());

        // One edit, five events spread inside the window.
        write_config(&file, "debug");
        for _ in 0..5 {
            dirty_tx.send(()).unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        let update = updates.try_recv().expect("one reload");
        assert_eq!(update.observability.log_level, "debug");
        assert!(updates.try_recv().is_err());

        // An invalid write keeps quiet.
        std::fs::write(file.path(), "not = [valid").unwrap();
        dirty_tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(updates.try_recv().is_err());

        drop(dirty_tx);
        task.await.unwrap();
    }
}
