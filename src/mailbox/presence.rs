//! Presence tracking - who is connected to the mailbox and what they're doing.
//!
//! Every mailbox operation refreshes the caller's heartbeat in `status.json`.
//! Heartbeats are best-effort: a failed write is logged and ignored.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

use super::fs::{atomic_write_json, now_ms, now_timestamp, parse_timestamp_ms, read_json_or};

pub const STATUS_FILE: &str = "status.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusDocument {
    #[serde(default)]
    pub statuses: Vec<InstanceStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub instance_id: String,
    pub status: String,
    #[serde(default)]
    pub current_task: Option<String>,
    pub last_heartbeat: String,
}

/// A status entry annotated with staleness.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEntry {
    pub status: InstanceStatus,
    pub stale: bool,
}

impl std::fmt::Display for PresenceEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {}{} - {}",
            self.status.instance_id,
            self.status.status,
            if self.stale { " [STALE]" } else { "" },
            self.status.current_task.as_deref().unwrap_or("idle")
        )
    }
}

/// File-backed presence store.
#[derive(Debug, Clone)]
pub struct PresenceStore {
    path: PathBuf,
    stale_after: Duration,
    write_lock: Arc<Mutex<()>>,
}

impl PresenceStore {
    pub fn new(data_dir: &Path, stale_after: Duration) -> Self {
        Self::with_lock(data_dir, stale_after, Arc::new(Mutex::new(())))
    }

    /// Share `write_lock` with the owning mailbox store. Callers must not hold
    /// it while heartbeating.
    pub fn with_lock(data_dir: &Path, stale_after: Duration, write_lock: Arc<Mutex<()>>) -> Self {
        Self {
            path: data_dir.join(STATUS_FILE),
            stale_after,
            write_lock,
        }
    }

    /// Record a heartbeat for `instance_id`.
    pub async fn heartbeat(&self, instance_id: &str, status: &str, current_task: Option<&str>) {
        let _guard = self.write_lock.lock().await;
        let mut doc: StatusDocument = read_json_or(&self.path, StatusDocument::default()).await;
        let entry = InstanceStatus {
            instance_id: instance_id.to_string(),
            status: status.to_string(),
            current_task: current_task.map(str::to_string),
            last_heartbeat: now_timestamp(),
        };

        match doc.statuses.iter_mut().find(|s| s.instance_id == instance_id) {
            Some(existing) => *existing = entry,
            None => doc.statuses.push(entry),
        }

        if let Err(e) = atomic_write_json(&self.path, &doc).await {
            warn!(instance_id, error = %e, "Failed to update heartbeat");
        }
    }

    /// All known instances, flagged stale when their heartbeat is old.
    pub async fn list(&self) -> Vec<PresenceEntry> {
        let doc: StatusDocument = read_json_or(&self.path, StatusDocument::default()).await;
        let now = now_ms();
        let stale_ms = self.stale_after.as_millis() as u64;

        doc.statuses
            .into_iter()
            .map(|status| {
                let last = parse_timestamp_ms(&status.last_heartbeat).unwrap_or(0);
                PresenceEntry {
                    stale: now.saturating_sub(last) > stale_ms,
                    status,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_heartbeat_upserts() {
        let dir = TempDir::new().unwrap();
        let store = PresenceStore::new(dir.path(), Duration::from_secs(120));

        store.heartbeat("voice-claude", "active", Some("Checking inbox")).await;
        store.heartbeat("voice-claude", "idle", None).await;
        store.heartbeat("nathan", "active", None).await;

        let entries = store.list().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].status.status, "idle");
        assert!(entries.iter().all(|e| !e.stale));
        assert_eq!(entries[0].to_string(), "[voice-claude] idle - idle");
    }

    #[tokio::test]
    async fn test_concurrent_heartbeats_all_land() {
        let dir = TempDir::new().unwrap();
        let store = PresenceStore::new(dir.path(), Duration::from_secs(120));

        let beats: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store.heartbeat(&format!("instance-{}", i), "active", None).await;
                })
            })
            .collect();
        for beat in beats {
            beat.await.unwrap();
        }

        assert_eq!(store.list().await.len(), 16);
    }

    #[tokio::test]
    async fn test_stale_entries() {
        let dir = TempDir::new().unwrap();
        let store = PresenceStore::new(dir.path(), Duration::from_secs(120));
        let doc = StatusDocument {
            statuses: vec![InstanceStatus {
                instance_id: "old".into(),
                status: "active".into(),
                current_task: Some("Listening".into()),
                last_heartbeat: "2020-01-01T00:00:00.000Z".into(),
            }],
        };
        atomic_write_json(&dir.path().join(STATUS_FILE), &doc).await.unwrap();

        let entries = store.list().await;
        assert!(entries[0].stale);
        assert_eq!(entries[0].to_string(), "[old] active [STALE] - Listening");
    }
}
