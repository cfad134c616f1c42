//! Configuration for MirrorClaw
//!
//! Configuration is read from `<config dir>/mirrorclaw/config.json` and then
//! overridden by environment variables. Every field has a default, so a
//! missing file or a partial file is fine.
//!
//! # Environment overrides
//!
//! | Variable | Field |
//! |----------|-------|
//! | `MIRRORCLAW_HOME` | configuration directory |
//! | `MIRRORCLAW_DATA_DIR` | `mailbox.data_dir` |
//! | `MIRRORCLAW_PROVIDER` | `provider.kind` |
//! | `MIRRORCLAW_MODEL` | `provider.model` |
//! | `MIRRORCLAW_BASE_URL` | `provider.base_url` |
//! | `MIRRORCLAW_API_KEY` | `provider.api_key` |
//! | `MIRRORCLAW_ENABLED_GROUPS` | `tools.enabled_groups` (comma separated) |

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{MirrorError, Result};
use crate::mailbox::lease::LeasePolicy;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Mailbox, lease and presence settings.
    pub mailbox: MailboxConfig,
    /// Tool group settings.
    pub tools: ToolsConfig,
    /// LLM backend and session settings.
    pub provider: ProviderConfig,
}

/// Mailbox store and listener lease settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailboxConfig {
    /// Directory holding `inbox.json`, `listener_lock.json` and `status.json`.
    /// Defaults to `<config dir>/data`.
    pub data_dir: Option<PathBuf>,
    /// Messages kept after each send.
    pub max_messages: usize,
    /// Hard cap applied on read, between sends.
    pub max_total_messages: usize,
    /// Messages older than this are purged on read.
    pub retention_hours: u64,
    /// Fallback poll interval while listening.
    pub poll_interval_ms: u64,
    /// Lease lifetime; must exceed the listen refresh interval.
    pub lease_ttl_ms: u64,
    /// How often a waiting listener refreshes its lease.
    pub lease_refresh_secs: u64,
    /// What to do when the lease file cannot be read or written.
    pub lease_policy: LeasePolicy,
    /// Instance id used by the voice agent.
    pub voice_instance_id: String,
    /// Thread used by the voice agent when no thread is given.
    pub voice_thread_id: String,
    /// Listen timeout when the caller gives none.
    pub default_listen_timeout_secs: u64,
    /// Upper bound on any listen timeout.
    pub max_listen_timeout_secs: u64,
    /// Heartbeats older than this are shown as stale.
    pub stale_after_secs: u64,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            max_messages: 100,
            max_total_messages: 500,
            retention_hours: 24,
            poll_interval_ms: 5_000,
            lease_ttl_ms: 310_000,
            lease_refresh_secs: 30,
            lease_policy: LeasePolicy::FailOpen,
            voice_instance_id: "voice-claude".to_string(),
            voice_thread_id: "voice-mirror".to_string(),
            default_listen_timeout_secs: 300,
            max_listen_timeout_secs: 600,
            stale_after_secs: 120,
        }
    }
}

/// Tool group settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Dynamic groups idle for more than this many tool calls are unloaded.
    pub idle_unload_after_calls: u64,
    /// Groups loaded at startup in addition to the always-loaded ones.
    pub enabled_groups: Vec<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            idle_unload_after_calls: 15,
            enabled_groups: Vec::new(),
        }
    }
}

/// LLM backend and conversation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Backend tag, e.g. `ollama`, `lmstudio`, `openai`, `groq`.
    pub kind: String,
    /// Model id; the backend default is used when unset.
    pub model: Option<String>,
    /// Base URL; the backend default is used when unset.
    pub base_url: Option<String>,
    /// Bearer token for hosted backends.
    pub api_key: Option<String>,
    /// Context window in tokens.
    pub context_length: u32,
    /// Tool calls allowed per user turn.
    pub max_tool_iterations: u32,
    /// Non-system messages kept in history.
    pub history_limit: usize,
    /// Most recent messages allowed to keep image payloads.
    pub image_history_limit: usize,
    /// Hard timeout for a single request.
    pub request_timeout_secs: u64,
    /// Warn when no response has started after this long.
    pub slow_response_warning_secs: u64,
    /// System prompt seeded on session start.
    pub system_prompt: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: "ollama".to_string(),
            model: None,
            base_url: None,
            api_key: None,
            context_length: 32_768,
            max_tool_iterations: 10,
            history_limit: 20,
            image_history_limit: 4,
            request_timeout_secs: 120,
            slow_response_warning_secs: 60,
            system_prompt: None,
        }
    }
}

impl Config {
    /// Configuration directory (`~/.config/mirrorclaw` on Linux).
    pub fn dir() -> PathBuf {
        if let Ok(home) = std::env::var("MIRRORCLAW_HOME") {
            return PathBuf::from(home);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mirrorclaw")
    }

    /// Path of the configuration file.
    pub fn path() -> PathBuf {
        Self::dir().join("config.json")
    }

    /// Load configuration from the default path and apply env overrides.
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();
        let mut config = Self::load_from(&Self::path())?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a file, returning defaults if it doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| MirrorError::Config(format!("{}: {}", path.display(), e)))?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Apply `MIRRORCLAW_*` environment variables on top of file values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = get("MIRRORCLAW_DATA_DIR") {
            self.mailbox.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(kind) = get("MIRRORCLAW_PROVIDER") {
            self.provider.kind = kind;
        }
        if let Some(model) = get("MIRRORCLAW_MODEL") {
            self.provider.model = Some(model);
        }
        if let Some(url) = get("MIRRORCLAW_BASE_URL") {
            self.provider.base_url = Some(url);
        }
        if let Some(key) = get("MIRRORCLAW_API_KEY") {
            self.provider.api_key = Some(key);
        }
        if let Some(groups) = get("MIRRORCLAW_ENABLED_GROUPS") {
            self.tools.enabled_groups = groups
                .split(',')
                .map(|g| g.trim().to_string())
                .filter(|g| !g.is_empty())
                .collect();
        }
    }

    /// Resolved mailbox data directory.
    pub fn data_dir(&self) -> PathBuf {
        self.mailbox
            .data_dir
            .clone()
            .unwrap_or_else(|| Self::dir().join("data"))
    }
}
