//! Mailbox module - durable cross-process message log
//!
//! The mailbox is how the UI process and the agent process exchange voice and
//! text turns. It is a single JSON document on disk plus two side files:
//!
//! - `inbox.json` - the message log (`{"messages": [...]}`)
//! - `listener_lock.json` - the single-listener [lease](lease)
//! - `status.json` - [presence](presence) heartbeats
//!
//! Every write goes through a temp file and a rename, so a concurrent reader
//! sees either the old or the new document, never a partial one. Every read
//! tolerates a missing or corrupt document and treats it as an empty inbox.
//!
//! # Example
//!
//! ```no_run
//! use mirrorclaw::config::MailboxConfig;
//! use mirrorclaw::mailbox::{MailboxStore, ReadQuery, SendRequest};
//!
//! # async fn demo() -> mirrorclaw::error::Result<()> {
//! let store = MailboxStore::open("/tmp/mirror-data", MailboxConfig::default()).await?;
//! store.send(SendRequest::new("nathan", "Hello")).await?;
//!
//! let unread = store.read(ReadQuery::new("voice-claude")).await;
//! assert_eq!(unread[0].message, "Hello");
//! # Ok(())
//! # }
//! ```

pub mod fs;
pub mod lease;
pub mod presence;
pub mod types;
pub mod watcher;

pub use lease::{LeaseAcquisition, LeasePolicy, LeaseRecord, ListenerLease};
pub use presence::{PresenceEntry, PresenceStore};
pub use types::{MailboxDocument, MailboxEvent, MailboxMessage, MessageTrigger};

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::MailboxConfig;
use crate::error::{MirrorError, Result};

use fs::{atomic_write_json, now_ms, read_json_or};
use watcher::{next_change, MailboxWatcher};

pub const INBOX_FILE: &str = "inbox.json";
pub const TRIGGER_FILE: &str = "message_trigger.json";

/// Characters of the message echoed back in a send confirmation.
const PREVIEW_CHARS: usize = 100;

/// A message to append to the mailbox.
#[derive(Debug, Clone, Default)]
pub struct SendRequest {
    pub instance_id: String,
    pub message: String,
    pub thread_id: Option<String>,
    pub reply_to: Option<String>,
    pub image_path: Option<String>,
}

impl SendRequest {
    pub fn new(instance_id: &str, message: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            message: message.to_string(),
            ..Default::default()
        }
    }

    pub fn in_thread(mut self, thread_id: &str) -> Self {
        self.thread_id = Some(thread_id.to_string());
        self
    }

    pub fn reply_to(mut self, parent_id: &str) -> Self {
        self.reply_to = Some(parent_id.to_string());
        self
    }

    pub fn with_image(mut self, path: &str) -> Self {
        self.image_path = Some(path.to_string());
        self
    }
}

/// Confirmation of a successful send.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub message: MailboxMessage,
    pub thread_id: String,
}

impl SendReceipt {
    /// Human-readable confirmation with a short preview of the text.
    pub fn summary(&self) -> String {
        let text = &self.message.message;
        let preview = if text.chars().count() > PREVIEW_CHARS {
            format!("{}...", text.chars().take(PREVIEW_CHARS).collect::<String>())
        } else {
            text.clone()
        };
        format!("Message sent in thread [{}]:\n\"{}\"", self.thread_id, preview)
    }
}

/// Filter for [`MailboxStore::read`].
#[derive(Debug, Clone)]
pub struct ReadQuery {
    pub instance_id: String,
    pub limit: usize,
    pub include_read: bool,
    pub mark_as_read: bool,
}

impl ReadQuery {
    /// Unread messages for `instance_id`, ten at most, without marking.
    pub fn new(instance_id: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            limit: 10,
            include_read: false,
            mark_as_read: false,
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn include_read(mut self, include: bool) -> Self {
        self.include_read = include;
        self
    }

    pub fn mark_as_read(mut self, mark: bool) -> Self {
        self.mark_as_read = mark;
        self
    }
}

/// Parameters for [`MailboxStore::listen`].
#[derive(Debug, Clone)]
pub struct ListenRequest {
    pub instance_id: String,
    pub from_sender: String,
    pub thread_id: Option<String>,
    /// Clamped to the configured maximum; `None` uses the configured default.
    pub timeout_secs: Option<u64>,
}

impl ListenRequest {
    pub fn new(instance_id: &str, from_sender: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            from_sender: from_sender.to_string(),
            thread_id: None,
            timeout_secs: None,
        }
    }

    pub fn in_thread(mut self, thread_id: &str) -> Self {
        self.thread_id = Some(thread_id.to_string());
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// How a listen ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ListenOutcome {
    /// A qualifying message arrived.
    Received {
        message: MailboxMessage,
        waited_secs: u64,
    },
    /// Nothing arrived before the timeout.
    TimedOut { timeout_secs: u64 },
    /// Another instance is already listening.
    LeaseHeld { holder: String },
}

/// Durable message log shared between processes.
pub struct MailboxStore {
    data_dir: PathBuf,
    config: MailboxConfig,
    lease: ListenerLease,
    presence: PresenceStore,
    events: broadcast::Sender<MailboxEvent>,
    // Serialises read-modify-write cycles within this process; shared with presence.
    write_lock: Arc<Mutex<()>>,
}

impl MailboxStore {
    /// Open (and create if needed) the mailbox in `data_dir`.
    pub async fn open(data_dir: impl Into<PathBuf>, config: MailboxConfig) -> Result<Self> {
        let data_dir = data_dir.into();
        tokio::fs::create_dir_all(&data_dir).await?;

        let lease = ListenerLease::new(
            &data_dir,
            Duration::from_millis(config.lease_ttl_ms),
            config.lease_policy,
        );
        let write_lock = Arc::new(Mutex::new(()));
        let presence = PresenceStore::with_lock(
            &data_dir,
            Duration::from_secs(config.stale_after_secs),
            write_lock.clone(),
        );
        let (events, _) = broadcast::channel(64);

        Ok(Self {
            data_dir,
            config,
            lease,
            presence,
            events,
            write_lock,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn inbox_path(&self) -> PathBuf {
        self.data_dir.join(INBOX_FILE)
    }

    pub fn config(&self) -> &MailboxConfig {
        &self.config
    }

    pub fn lease(&self) -> &ListenerLease {
        &self.lease
    }

    pub fn presence(&self) -> &PresenceStore {
        &self.presence
    }

    /// Subscribe to in-process send notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<MailboxEvent> {
        self.events.subscribe()
    }

    /// Append a message.
    ///
    /// The thread is resolved in order: explicit thread id, the parent's
    /// thread when replying, the voice thread for the voice instance, and
    /// otherwise a new thread.
    pub async fn send(&self, request: SendRequest) -> Result<SendReceipt> {
        if request.instance_id.trim().is_empty() {
            return Err(MirrorError::Mailbox("instance_id is required".into()));
        }
        if request.message.is_empty() && request.image_path.is_none() {
            return Err(MirrorError::Mailbox("message is required".into()));
        }

        self.presence
            .heartbeat(&request.instance_id, "active", Some("Sending message"))
            .await;

        let _guard = self.write_lock.lock().await;
        let path = self.inbox_path();
        let mut doc = self.load().await;

        let thread_id = self.resolve_thread(&doc, &request);
        let mut message = MailboxMessage::new(&request.instance_id, &request.message, &thread_id);
        message.reply_to = request.reply_to.clone();
        message.image_path = request.image_path.clone();

        doc.messages.push(message.clone());
        if doc.messages.len() > self.config.max_messages {
            let excess = doc.messages.len() - self.config.max_messages;
            doc.messages.drain(..excess);
        }

        atomic_write_json(&path, &doc)
            .await
            .map_err(|e| MirrorError::Mailbox(format!("Failed to write mailbox: {}", e)))?;

        info!(
            from = %message.from,
            id = %message.id,
            thread = %thread_id,
            "Mailbox message sent"
        );
        self.notify_sent(&message, &thread_id).await;

        Ok(SendReceipt { message, thread_id })
    }

    /// Read messages addressed to (i.e. not sent by) `query.instance_id`.
    ///
    /// Expired entries are purged first. Never fails: an unreadable mailbox
    /// is an empty one.
    pub async fn read(&self, query: ReadQuery) -> Vec<MailboxMessage> {
        let reader = query.instance_id.as_str();
        self.presence
            .heartbeat(reader, "active", Some("Checking inbox"))
            .await;

        let _guard = self.write_lock.lock().await;
        let path = self.inbox_path();
        let mut doc = self.load().await;

        let mut changed = self.prune(&mut doc);
        let before_marking: Vec<bool> = doc.messages.iter().map(|m| m.is_read_by(reader)).collect();

        if query.mark_as_read {
            for msg in doc.messages.iter_mut().filter(|m| m.from != reader) {
                changed |= msg.mark_read_by(reader);
            }
        }

        if changed {
            if let Err(e) = atomic_write_json(&path, &doc).await {
                warn!(reader, error = %e, "Failed to persist mailbox after read");
            }
        }

        // Unread is judged against the state before this call's marking
        let visible: Vec<MailboxMessage> = doc
            .messages
            .into_iter()
            .zip(before_marking)
            .filter(|(m, _)| m.from != reader)
            .filter(|(_, was_read)| query.include_read || !was_read)
            .map(|(m, _)| m)
            .collect();

        let limit = query.limit.clamp(1, 100);
        let start = visible.len().saturating_sub(limit);
        visible[start..].to_vec()
    }

    /// Wait for a new message from `from_sender`.
    ///
    /// Holds the listener lease for the whole wait and releases it on every
    /// exit path, including the future being dropped mid-wait.
    ///
    /// # Errors
    ///
    /// Fails on missing ids, and with [`MirrorError::Lease`] when the lease
    /// file is unusable under [`LeasePolicy::FailClosed`].
    pub async fn listen(&self, request: ListenRequest) -> Result<ListenOutcome> {
        if request.instance_id.trim().is_empty() {
            return Err(MirrorError::Mailbox("instance_id is required".into()));
        }
        if request.from_sender.trim().is_empty() {
            return Err(MirrorError::Mailbox("from_sender is required".into()));
        }
        let instance_id = request.instance_id.as_str();

        // Armed before acquiring so a drop mid-acquire cannot strand the lease
        let guard = self.lease.guard(instance_id);
        match self.lease.acquire(instance_id).await {
            LeaseAcquisition::Acquired | LeaseAcquisition::AcquiredUnverified { .. } => {}
            LeaseAcquisition::Held { holder, .. } => return Ok(ListenOutcome::LeaseHeld { holder }),
            LeaseAcquisition::Unavailable { reason } => return Err(MirrorError::Lease(reason)),
        }

        self.presence
            .heartbeat(
                instance_id,
                "active",
                Some(&format!("Listening for {}", request.from_sender)),
            )
            .await;

        let outcome = self.wait_for_message(&request).await;
        guard.release().await;
        Ok(outcome)
    }

    async fn wait_for_message(&self, request: &ListenRequest) -> ListenOutcome {
        let timeout_secs = request
            .timeout_secs
            .unwrap_or(self.config.default_listen_timeout_secs)
            .min(self.config.max_listen_timeout_secs);
        let started = Instant::now();
        let deadline = started + Duration::from_secs(timeout_secs);

        let existing: HashSet<String> = self.load().await.messages.into_iter().map(|m| m.id).collect();

        let mut watcher = match MailboxWatcher::start(&self.inbox_path()) {
            Ok(w) => Some(w),
            Err(e) => {
                warn!(error = %e, "Mailbox watcher unavailable, polling only");
                None
            }
        };

        let poll_every = Duration::from_millis(self.config.poll_interval_ms.max(10));
        let mut poll = interval_at(started + poll_every, poll_every);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let refresh_every = Duration::from_secs(self.config.lease_refresh_secs.max(1));
        let mut refresh = interval_at(started + refresh_every, refresh_every);

        debug!(
            instance_id = %request.instance_id,
            from = %request.from_sender,
            timeout_secs,
            "Listening for mailbox message"
        );

        loop {
            if let Some(message) = self.find_new(&existing, request).await {
                let waited_secs = started.elapsed().as_secs();
                info!(from = %message.from, id = %message.id, waited_secs, "Listen matched");
                return ListenOutcome::Received { message, waited_secs };
            }

            tokio::select! {
                _ = sleep_until(deadline) => break,
                _ = next_change(&mut watcher) => {}
                _ = poll.tick() => {}
                _ = refresh.tick() => {
                    self.lease.refresh(&request.instance_id).await;
                }
            }
        }

        info!(from = %request.from_sender, timeout_secs, "Listen timed out");
        ListenOutcome::TimedOut { timeout_secs }
    }

    /// Newest message not in `existing` that matches sender and thread.
    async fn find_new(&self, existing: &HashSet<String>, request: &ListenRequest) -> Option<MailboxMessage> {
        self.load()
            .await
            .messages
            .into_iter()
            .filter(|m| m.is_from(&request.from_sender))
            .filter(|m| match request.thread_id.as_deref() {
                Some(thread) => m.thread_id.as_deref() == Some(thread),
                None => true,
            })
            .rfind(|m| !existing.contains(&m.id))
    }

    async fn load(&self) -> MailboxDocument {
        read_json_or(&self.inbox_path(), MailboxDocument::default()).await
    }

    fn resolve_thread(&self, doc: &MailboxDocument, request: &SendRequest) -> String {
        if let Some(thread) = request.thread_id.as_deref().filter(|t| !t.is_empty()) {
            return thread.to_string();
        }
        if let Some(parent) = request.reply_to.as_deref() {
            if let Some(thread) = doc
                .messages
                .iter()
                .find(|m| m.id == parent)
                .and_then(|m| m.thread_id.clone())
            {
                return thread;
            }
        }
        if request.instance_id == self.config.voice_instance_id {
            return self.config.voice_thread_id.clone();
        }
        format!("thread_{}", uuid::Uuid::new_v4().simple())
    }

    /// Drop expired entries and apply the hard cap. Returns `true` if anything was removed.
    fn prune(&self, doc: &mut MailboxDocument) -> bool {
        let before = doc.messages.len();
        let cutoff = now_ms().saturating_sub(self.config.retention_hours * 60 * 60 * 1000);
        doc.messages.retain(|m| m.timestamp_ms() > cutoff);

        if doc.messages.len() > self.config.max_total_messages {
            let excess = doc.messages.len() - self.config.max_total_messages;
            doc.messages.drain(..excess);
        }

        let removed = before - doc.messages.len();
        if removed > 0 {
            debug!(removed, "Pruned mailbox");
        }
        removed > 0
    }

    async fn notify_sent(&self, message: &MailboxMessage, thread_id: &str) {
        let trigger = MessageTrigger {
            from: message.from.clone(),
            message_id: message.id.clone(),
            timestamp: message.timestamp.clone(),
            thread_id: Some(thread_id.to_string()),
        };
        if let Err(e) = atomic_write_json(&self.data_dir.join(TRIGGER_FILE), &trigger).await {
            warn!(error = %e, "Failed to write message trigger");
        }

        // No subscribers is fine
        let _ = self.events.send(MailboxEvent::MessageSent {
            id: message.id.clone(),
            from: message.from.clone(),
            thread_id: thread_id.to_string(),
        });
    }
}
