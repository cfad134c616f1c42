//! MirrorClaw - mailbox and tool orchestration for a local voice agent
//!
//! MirrorClaw lets a voice front end and one or more assistant instances
//! talk through a shared mailbox on disk, and drives conversations with
//! OpenAI-compatible chat backends.
//!
//! # Modules
//!
//! - [`mailbox`]: message store, single-listener lease and presence board
//! - [`tools`]: tool groups loaded on demand, by intent, and evicted when idle
//! - [`session`]: conversation history, trimming and context accounting
//! - [`providers`]: backend families, request encoding and stream decoding
//! - [`agent`]: the provider session and its tool loop
//! - [`handlers`]: the mailbox and group tools in MCP result form
//! - [`config`]: file and environment configuration
//! - [`error`]: the shared error type

pub mod agent;
pub mod config;
pub mod error;
pub mod handlers;
pub mod mailbox;
pub mod providers;
pub mod session;
pub mod tools;

pub use config::Config;
pub use error::{MirrorError, Result};
