//! Volume change watcher.
//!
//! Observes filesystem notifications under a volume root and invokes a
//! user-installed callback on create/write/remove events. The watcher does
//! not push updates by itself; replicas pull on their own schedule. New
//! directories are added to the watch set as they appear.

use crate::error::{Error, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::mpsc;
use tracing::{error, info};

/// Callback invoked with the path that changed.
pub type ChangeCallback = Box<dyn Fn(&Path) + Send + 'static>;

/// Recursive watcher over one volume root.
pub struct VolumeWatcher {
    // Held for its Drop: dropping the watcher stops the notify backend.
    _watcher: RecommendedWatcher,
    handle: Option<std::thread::JoinHandle<()>>,
    stop_tx: mpsc::Sender<()>,
}

impl VolumeWatcher {
    /// Starts watching `root`, invoking `on_change` for every relevant
    /// event.
    pub fn new(root: &Path, on_change: ChangeCallback) -> Result<Self> {
        if !root.exists() {
            return Err(Error::Validation {
                field: "path".to_string(),
                reason: format!("path does not exist: {}", root.display()),
            });
        }

        let (event_tx, event_rx) = mpsc::channel::<notify::Result<Event>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let mut watcher = notify::recommended_watcher(event_tx)
            .map_err(|e| Error::Internal(format!("failed to create watcher: {e}")))?;
        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| Error::Internal(format!("failed to watch {}: {e}", root.display())))?;

        // RecursiveMode::Recursive covers directories created later; the
        // notify backend does its own re-add bookkeeping.
        let handle = std::thread::spawn(move || loop {
            if stop_rx.try_recv().is_ok() {
                return;
            }
            let event = match event_rx.recv_timeout(std::time::Duration::from_millis(250)) {
                Ok(Ok(event)) => event,
                Ok(Err(e)) => {
                    error!("watcher error: {e}");
                    continue;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => return,
            };

            let relevant = matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
            );
            if !relevant {
                continue;
            }

            for path in &event.paths {
                info!("volume changed: {}", path.display());
                on_change(path);
            }
        });

        Ok(Self {
            _watcher: watcher,
            handle: Some(handle),
            stop_tx,
        })
    }

    /// Stops the watcher and joins its dispatch thread.
    pub fn close(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for VolumeWatcher {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_write_event_invokes_callback() {
        let dir = TempDir::new().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_cb = Arc::clone(&hits);

        let watcher = VolumeWatcher::new(
            dir.path(),
            Box::new(move |_| {
                hits_cb.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        std::fs::write(dir.path().join("f.txt"), b"data").unwrap();

        // The notify backend delivers asynchronously.
        for _ in 0..40 {
            if hits.load(Ordering::SeqCst) > 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        assert!(hits.load(Ordering::SeqCst) > 0);
        watcher.close();
    }

    #[test]
    fn test_missing_root_rejected() {
        let result = VolumeWatcher::new(Path::new("/nonexistent/budgie-test"), Box::new(|_| {}));
        assert!(result.is_err());
    }
}
