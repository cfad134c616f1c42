//! Byte transport for streaming requests.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::pin::Pin;
use std::time::Duration;
use tracing::debug;

use super::kind::ProviderKind;
use crate::error::{MirrorError, Result};

/// Raw response bytes, chunked as they arrive.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// Opens a streaming chat completions request.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send `body` and return the response byte stream.
    ///
    /// A non-success status is an error; the stream itself only carries
    /// body chunks.
    async fn open_stream(&self, body: &Value) -> Result<ByteStream>;
}

/// HTTP transport backed by `reqwest`.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpTransport {
    pub fn new(kind: ProviderKind, base_url: Option<&str>, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: kind.chat_endpoint(base_url),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn open_stream(&self, body: &Value) -> Result<ByteStream> {
        debug!(url = %self.url, "Opening chat stream");
        let mut request = self
            .client
            .post(&self.url)
            .header("Accept", "text/event-stream")
            .json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let detail: String = text.chars().take(300).collect();
            return Err(MirrorError::Provider(format!(
                "{} returned {}: {}",
                self.url, status, detail
            )));
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(MirrorError::from));
        Ok(Box::pin(stream))
    }
}
