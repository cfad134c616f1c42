//! Mailbox change notifications.
//!
//! Wraps a `notify` watcher on the mailbox data directory and turns events
//! touching the mailbox file into a wake-up signal for listeners. Writers
//! replace the file by rename, so the directory (not the file) is watched.

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::Path;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;

/// Wakes listeners when the mailbox file changes.
pub struct MailboxWatcher {
    // Dropping the watcher stops the OS watch.
    _watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<()>,
}

impl MailboxWatcher {
    /// Watch `file` for changes.
    pub fn start(file: &Path) -> Result<Self> {
        let dir = file.parent().unwrap_or_else(|| Path::new("."));
        let file_name: OsString = file.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |res: std::result::Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    let touches_file = event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(|n| n == file_name.as_os_str()).unwrap_or(false));
                    if touches_file {
                        let _ = tx.send(());
                    }
                }
                Err(e) => warn!(error = %e, "Mailbox watch error"),
            }
        })?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        debug!(dir = %dir.display(), "Watching mailbox directory");

        Ok(Self {
            _watcher: watcher,
            rx,
        })
    }

    /// Wait for the next change. Bursts of events collapse into one wake-up.
    pub async fn changed(&mut self) -> Option<()> {
        let first = self.rx.recv().await;
        while self.rx.try_recv().is_ok() {}
        first
    }
}

/// Wait on an optional watcher; never resolves when there is none or its
/// channel has closed, leaving the fallback poll in charge.
pub async fn next_change(watcher: &mut Option<MailboxWatcher>) {
    if let Some(w) = watcher.as_mut() {
        if w.changed().await.is_some() {
            return;
        }
        *watcher = None;
    }
    std::future::pending::<()>().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_next_change_without_watcher_pends() {
        let mut none: Option<MailboxWatcher> = None;
        let waited = tokio::time::timeout(Duration::from_millis(50), next_change(&mut none)).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_start_on_missing_dir_fails() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("missing").join("inbox.json");
        assert!(MailboxWatcher::start(&file).is_err());
    }
}
