//! Providers module - chat backends
//!
//! Every supported backend speaks the OpenAI-compatible chat completions
//! protocol over server-sent events. This module covers the pieces of a
//! request that depend on the backend:
//!
//! - [`ProviderKind`] - backend family, defaults and capabilities
//! - [`ChatRequest`] - request body construction
//! - [`StreamDecoder`] - incremental SSE decoding
//! - [`ChatTransport`] - the byte stream, with [`HttpTransport`] for real use

pub mod kind;
pub mod request;
pub mod stream;
pub mod transport;

pub use kind::ProviderKind;
pub use request::ChatRequest;
pub use stream::{PartialToolCall, StreamDecoder};
pub use transport::{ByteStream, ChatTransport, HttpTransport};
