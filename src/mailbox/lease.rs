//! Listener lease - cooperative single-listener mutex over a file.
//!
//! Only one instance may long-poll the mailbox at a time; two listeners would
//! each answer the same voice turn and the user would hear the reply twice.
//! The lease lives in `listener_lock.json` as
//! `{instance_id, acquired_at, expires_at}` (epoch ms).
//!
//! The lease is advisory. Acquisition reads the current record, writes a new
//! one and reads it back to verify ownership; this narrows but does not close
//! the window in which two processes can both believe they hold it.
//!
//! When the lease file cannot be read or written for reasons other than
//! absence or corruption, [`LeasePolicy`] decides the outcome. The default,
//! [`LeasePolicy::FailOpen`], treats the lease as acquired: a lost lease costs
//! at most a duplicated spoken reply, while a stuck lease silences the agent.
//! Deployments that prefer strict exclusion set `fail_closed`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::fs::{atomic_write_json, now_ms};

/// Lease file name inside the mailbox data directory.
pub const LEASE_FILE: &str = "listener_lock.json";

/// Behaviour when the lease file hits an unexpected I/O error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeasePolicy {
    /// Treat the lease as acquired.
    #[default]
    FailOpen,
    /// Refuse to listen.
    FailClosed,
}

/// On-disk lease record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub instance_id: String,
    pub acquired_at: u64,
    pub expires_at: u64,
}

impl LeaseRecord {
    pub fn is_valid_at(&self, now_ms: u64) -> bool {
        self.expires_at > now_ms
    }
}

/// Result of an acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseAcquisition {
    /// The caller owns a fresh lease.
    Acquired,
    /// The lease file could not be used and the policy is fail-open.
    AcquiredUnverified { reason: String },
    /// Another instance holds a valid lease.
    Held { holder: String, expires_at: u64 },
    /// The lease file could not be used and the policy is fail-closed.
    Unavailable { reason: String },
}

impl LeaseAcquisition {
    /// Whether the caller may proceed as the listener.
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired | Self::AcquiredUnverified { .. })
    }
}

/// File-backed listener lease.
#[derive(Debug, Clone)]
pub struct ListenerLease {
    path: PathBuf,
    ttl: Duration,
    policy: LeasePolicy,
}

impl ListenerLease {
    /// Create a lease handle for `data_dir/listener_lock.json`.
    pub fn new(data_dir: &Path, ttl: Duration, policy: LeasePolicy) -> Self {
        Self {
            path: data_dir.join(LEASE_FILE),
            ttl,
            policy,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn policy(&self) -> LeasePolicy {
        self.policy
    }

    /// The current lease, if one exists and has not expired.
    pub async fn current(&self) -> Option<LeaseRecord> {
        match self.read_record().await {
            Ok(Some(record)) if record.is_valid_at(now_ms()) => Some(record),
            _ => None,
        }
    }

    /// Try to become the listener.
    ///
    /// Fails immediately when another instance holds a valid lease. The
    /// caller's own lease (e.g. left behind by a crashed listen) is simply
    /// renewed.
    pub async fn acquire(&self, instance_id: &str) -> LeaseAcquisition {
        let now = now_ms();
        match self.read_record().await {
            Ok(Some(existing)) if existing.is_valid_at(now) && existing.instance_id != instance_id => {
                debug!(holder = %existing.instance_id, "Listener lease held");
                return LeaseAcquisition::Held {
                    holder: existing.instance_id,
                    expires_at: existing.expires_at,
                };
            }
            Ok(_) => {}
            Err(e) => return self.io_failure(format!("Failed to read lease: {}", e)),
        }

        let record = LeaseRecord {
            instance_id: instance_id.to_string(),
            acquired_at: now,
            expires_at: now + self.ttl.as_millis() as u64,
        };
        if let Err(e) = atomic_write_json(&self.path, &record).await {
            return self.io_failure(format!("Failed to write lease: {}", e));
        }

        // Verify: a concurrent acquirer may have renamed its record over ours
        match self.read_record().await {
            Ok(Some(written)) if written.instance_id == instance_id => {
                info!(instance_id, "Listener lease acquired");
                LeaseAcquisition::Acquired
            }
            Ok(Some(other)) => {
                warn!(holder = %other.instance_id, instance_id, "Lost listener lease race");
                LeaseAcquisition::Held {
                    holder: other.instance_id,
                    expires_at: other.expires_at,
                }
            }
            Ok(None) => self.io_failure("Lease missing after write".to_string()),
            Err(e) => self.io_failure(format!("Failed to verify lease: {}", e)),
        }
    }

    /// Extend the caller's lease. Returns `false` if the caller is not the owner.
    pub async fn refresh(&self, instance_id: &str) -> bool {
        match self.read_record().await {
            Ok(Some(mut record)) if record.instance_id == instance_id => {
                record.expires_at = now_ms() + self.ttl.as_millis() as u64;
                match atomic_write_json(&self.path, &record).await {
                    Ok(()) => {
                        debug!(instance_id, "Listener lease refreshed");
                        true
                    }
                    Err(e) => {
                        warn!(instance_id, error = %e, "Failed to refresh listener lease");
                        false
                    }
                }
            }
            _ => false,
        }
    }

    /// Drop the caller's lease. Returns `false` if the caller is not the owner.
    pub async fn release(&self, instance_id: &str) -> bool {
        match self.read_record().await {
            Ok(Some(record)) if record.instance_id == instance_id => {
                match tokio::fs::remove_file(&self.path).await {
                    Ok(()) => {
                        info!(instance_id, "Listener lease released");
                        true
                    }
                    Err(e) => {
                        warn!(instance_id, error = %e, "Failed to release listener lease");
                        false
                    }
                }
            }
            _ => false,
        }
    }

    /// Acquire-side handle that releases the lease for `instance_id` on drop.
    pub fn guard(&self, instance_id: &str) -> LeaseGuard {
        LeaseGuard {
            lease: self.clone(),
            instance_id: instance_id.to_string(),
            released: false,
        }
    }

    /// Synchronous release for drop paths, where awaiting is impossible.
    fn release_now(&self, instance_id: &str) -> bool {
        let owned = std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|data| serde_json::from_str::<LeaseRecord>(&data).ok())
            .is_some_and(|record| record.instance_id == instance_id);
        if !owned {
            return false;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!(instance_id, "Listener lease released on drop");
                true
            }
            Err(e) => {
                warn!(instance_id, error = %e, "Failed to release listener lease on drop");
                false
            }
        }
    }

    /// Missing and corrupt files read as "no lease"; other I/O errors surface.
    async fn read_record(&self) -> std::io::Result<Option<LeaseRecord>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => Ok(serde_json::from_str(&data).ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn io_failure(&self, reason: String) -> LeaseAcquisition {
        match self.policy {
            LeasePolicy::FailOpen => {
                warn!(%reason, "Listener lease unavailable, proceeding without exclusion");
                LeaseAcquisition::AcquiredUnverified { reason }
            }
            LeasePolicy::FailClosed => {
                warn!(%reason, "Listener lease unavailable, refusing to listen");
                LeaseAcquisition::Unavailable { reason }
            }
        }
    }
}

/// Releases a held lease when dropped.
///
/// A listen future can be dropped mid-wait (a timeout wrapper, a `select!`
/// branch, Ctrl-C); the guard keeps that from leaving the lease on disk
/// until it expires. Call [`LeaseGuard::release`] on the normal exit path.
#[derive(Debug)]
pub struct LeaseGuard {
    lease: ListenerLease,
    instance_id: String,
    released: bool,
}

impl LeaseGuard {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub async fn release(mut self) -> bool {
        self.released = true;
        self.lease.release(&self.instance_id).await
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if !self.released {
            self.lease.release_now(&self.instance_id);
        }
    }
}
