//! Agent module - provider sessions and their turn loop
//!
//! A [`ProviderSession`] holds one conversation with a chat backend and
//! drives it one user turn at a time:
//!
//! - Trimming history and building the request for the backend family
//! - Streaming the reply to an [`OutputSink`] as it arrives
//! - Executing tool calls, native or written as text directives, and
//!   feeding results back until the model answers in plain text
//! - Reporting context usage after every turn
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────────┐     ┌───────────────┐
//! │  send_input │────>│ ProviderSession │────>│ ChatTransport │
//! └─────────────┘     │   (turn loop)   │     │  (SSE bytes)  │
//!                     └─────────────────┘     └───────────────┘
//!                        │       │     │
//!                        ▼       ▼     ▼
//!              ┌──────────┐ ┌────────┐ ┌───────────────────┐
//!              │OutputSink│ │  Tool  │ │ ToolGroupRegistry │
//!              │          │ │Executor│ │  (active schemas) │
//!              └──────────┘ └────────┘ └───────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use mirrorclaw::agent::{NullSink, ProviderSession, SessionSettings};
//! use mirrorclaw::providers::{HttpTransport, ProviderKind};
//! use mirrorclaw::tools::ToolGroupRegistry;
//!
//! async fn run(executor: Arc<dyn mirrorclaw::tools::ToolExecutor>) {
//!     let settings = SessionSettings::for_kind(ProviderKind::Ollama);
//!     let transport = HttpTransport::new(settings.kind, None, None).unwrap();
//!     let registry = Arc::new(ToolGroupRegistry::new(Vec::new(), 15));
//!     let session = ProviderSession::new(
//!         settings,
//!         Arc::new(transport),
//!         executor,
//!         registry,
//!         Arc::new(NullSink),
//!     );
//!
//!     session.start().await;
//!     let outcome = session.send_input("What's on my screen?", None).await.unwrap();
//!     println!("{:?}", outcome);
//! }
//! ```

mod context;
mod r#loop;
mod sink;

pub use context::{tool_followup, tool_instructions, ContextBuilder, DEFAULT_SYSTEM_PROMPT};
pub use r#loop::{ProviderSession, SessionSettings, TurnOutcome};
pub use sink::{ChannelSink, NullSink, OutputSink, SessionEvent};
