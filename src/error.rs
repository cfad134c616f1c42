//! Error types for MirrorClaw
//!
//! A single error enum is shared by every module. Most failure paths in the
//! runtime are reported as text rather than raised (a held lease, an iteration
//! cap, a failed tool call), so these variants cover the genuinely exceptional
//! cases: I/O, serialization, transport and invalid requests.

use thiserror::Error;

/// Errors produced by the MirrorClaw runtime.
#[derive(Debug, Error)]
pub enum MirrorError {
    /// Configuration could not be loaded or is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filesystem or stream I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client failure before a response was received.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// LLM backend returned an error status or unusable response.
    #[error("Provider error: {0}")]
    Provider(String),

    /// Tool execution failed.
    #[error("Tool error: {0}")]
    Tool(String),

    /// Mailbox request was invalid or could not be persisted.
    #[error("Mailbox error: {0}")]
    Mailbox(String),

    /// Listener lease file is unusable and the policy refuses to proceed.
    #[error("{0}")]
    Lease(String),

    /// Tool group request was rejected.
    #[error("{0}")]
    ToolGroup(String),

    /// Filesystem watcher could not be created.
    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MirrorError>;
