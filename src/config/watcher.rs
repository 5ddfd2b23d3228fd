//! Model file watcher for hot reload.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::model::ModelStore;

/// Watches the model store file and swaps in external edits.
pub struct ModelWatcher {
    path: PathBuf,
    store: Arc<ModelStore>,
    update_tx: mpsc::UnboundedSender<u64>,
}

impl ModelWatcher {
    /// Create a new watcher.
    ///
    /// Returns the watcher and a receiver of the versions published by each
    /// successful reload.
    pub fn new(path: &Path, store: Arc<ModelStore>) -> (Self, mpsc::UnboundedReceiver<u64>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        (
            Self {
                path: path.to_path_buf(),
                store,
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching the file in a background thread.
    ///
    /// The returned handle must be kept alive for the watch to continue.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.update_tx.clone();
        let store = Arc::clone(&self.store);

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if !(event.kind.is_modify() || event.kind.is_create()) {
                        return;
                    }
                    match store.reload() {
                        Ok(Some(version)) => {
                            tracing::info!(version, "Model file change detected, reloaded");
                            let _ = tx.send(version);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to reload model file, keeping current model");
                        }
                    }
                }
                Err(e) => tracing::error!(error = ?e, "Watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?self.path, "Model watcher started");
        Ok(watcher)
    }
}
