//! File system change notifications for the filter directory.
//!
//! The filter source watcher polls on a fixed interval; this watcher only
//! shortens the wait after an edit. Notifications are coalesced into a
//! single pending nudge, so a burst of writes triggers one extra poll.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

/// Watches a directory and nudges the poll loop when it changes.
pub struct DirectoryNudge {
    path: PathBuf,
    nudge_tx: mpsc::Sender<()>,
}

impl DirectoryNudge {
    /// Create a new DirectoryNudge.
    ///
    /// Returns the watcher and a receiver that yields one item per burst of changes.
    pub fn new(path: &Path) -> (Self, mpsc::Receiver<()>) {
        let (nudge_tx, nudge_rx) = mpsc::channel(1);

        (
            Self {
                path: path.to_path_buf(),
                nudge_tx,
            },
            nudge_rx,
        )
    }

    /// Start watching. The returned handle must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.nudge_tx.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove() {
                        tracing::debug!(paths = ?event.paths, "Filter directory changed");
                        // Full means a poll is already pending.
                        let _ = tx.try_send(());
                    }
                }
                Err(e) => tracing::error!(error = %e, "Filter directory watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?self.path, "Filter directory watcher started");
        Ok(watcher)
    }
}
