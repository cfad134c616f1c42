//! Server-sent event decoding for streamed chat completions.
//!
//! Chunks arrive as `data: {...}` lines. The decoder buffers partial lines
//! across network reads, accumulates visible text and tool call fragments,
//! and tracks the finish reason. Malformed payloads are logged and skipped.

use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::session::ToolCall;

/// A tool call being assembled from stream fragments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialToolCall {
    /// Usually only present on the first fragment.
    pub id: Option<String>,
    pub name: String,
    pub arguments: String,
}

/// Incremental decoder for one streamed response.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
    text: String,
    tool_calls: BTreeMap<usize, PartialToolCall>,
    finish_reason: Option<String>,
    error: Option<String>,
    parse_failures: usize,
    done: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes. Returns the visible text decoded from complete lines.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut deltas = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(delta) = self.handle_line(line.trim()) {
                deltas.push(delta);
            }
        }
        deltas
    }

    /// Flush a trailing line that had no newline.
    pub fn finish(&mut self) -> Vec<String> {
        if self.buffer.is_empty() {
            return Vec::new();
        }
        let line = std::mem::take(&mut self.buffer);
        let line = String::from_utf8_lossy(&line);
        self.handle_line(line.trim()).into_iter().collect()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    /// An error object reported inside the stream.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn parse_failures(&self) -> usize {
        self.parse_failures
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.values().any(|c| !c.name.is_empty())
    }

    /// Whether the response ended asking for tool execution.
    pub fn wants_tools(&self) -> bool {
        match self.finish_reason() {
            Some("tool_calls") | Some("function_call") => self.has_tool_calls(),
            Some("stop") | None => self.has_tool_calls(),
            _ => false,
        }
    }

    /// Assembled tool calls in index order. Calls without a name are dropped
    /// and missing ids are generated.
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.tool_calls
            .iter()
            .filter(|(_, c)| !c.name.is_empty())
            .map(|(index, c)| {
                let id = c.id.clone().unwrap_or_else(|| {
                    let suffix = uuid::Uuid::new_v4().simple().to_string();
                    format!("call_{}_{}", index, &suffix[..8])
                });
                ToolCall::new(&id, &c.name, &c.arguments)
            })
            .collect()
    }

    fn handle_line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() || line.starts_with(':') {
            return None;
        }
        let payload = match line.strip_prefix("data:") {
            Some(rest) => rest.trim_start(),
            None if line.starts_with('{') => line,
            // event:, id:, retry:
            None => return None,
        };
        if payload == "[DONE]" {
            self.done = true;
            return None;
        }

        match serde_json::from_str::<Value>(payload) {
            Ok(chunk) => self.apply_chunk(&chunk),
            Err(e) => {
                self.parse_failures += 1;
                if self.parse_failures == 1 {
                    warn!(error = %e, "Skipping malformed stream chunk");
                } else {
                    debug!(error = %e, count = self.parse_failures, "Skipping malformed stream chunk");
                }
                None
            }
        }
    }

    fn apply_chunk(&mut self, chunk: &Value) -> Option<String> {
        if let Some(err) = chunk.get("error") {
            let message = err
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string());
            self.error = Some(message);
            return None;
        }

        let choice = chunk.get("choices")?.get(0)?;
        if let Some(reason) = choice.get("finish_reason").and_then(|r| r.as_str()) {
            self.finish_reason = Some(reason.to_string());
        }

        let delta = choice.get("delta")?;
        if let Some(calls) = delta.get("tool_calls").and_then(|c| c.as_array()) {
            for (position, fragment) in calls.iter().enumerate() {
                self.merge_tool_fragment(position, fragment);
            }
        }

        match delta.get("content").and_then(|c| c.as_str()) {
            Some(content) if !content.is_empty() => {
                self.text.push_str(content);
                Some(content.to_string())
            }
            _ => None,
        }
    }

    fn merge_tool_fragment(&mut self, position: usize, fragment: &Value) {
        let index = fragment
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let entry = self.tool_calls.entry(index).or_default();

        if let Some(id) = fragment.get("id").and_then(|v| v.as_str()) {
            if entry.id.is_none() && !id.is_empty() {
                entry.id = Some(id.to_string());
            }
        }
        if let Some(function) = fragment.get("function") {
            if let Some(name) = function.get("name").and_then(|v| v.as_str()) {
                if entry.name.is_empty() {
                    entry.name = name.to_string();
                }
            }
            match function.get("arguments") {
                Some(Value::String(args)) => entry.arguments.push_str(args),
                // Some servers send the arguments already parsed
                Some(obj @ Value::Object(_)) => entry.arguments.push_str(&obj.to_string()),
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(content: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"delta": {"content": content}}]})
        )
    }

    #[test]
    fn test_malformed_chunk_then_text() {
        let mut decoder = StreamDecoder::new();
        let mut out = decoder.feed(b"data: {not json}\n\n");
        out.extend(decoder.feed(chunk("hi").as_bytes()));

        assert_eq!(out, vec!["hi"]);
        assert_eq!(decoder.text(), "hi");
        assert_eq!(decoder.parse_failures(), 1);
    }

    #[test]
    fn test_lines_split_across_reads() {
        let mut decoder = StreamDecoder::new();
        let full = format!("{}{}data: [DONE]\n", chunk("Hel"), chunk("lo wörld"));
        let bytes = full.as_bytes();
        let mut out = Vec::new();
        for piece in bytes.chunks(7) {
            out.extend(decoder.feed(piece));
        }

        assert_eq!(out.concat(), "Hello wörld");
        assert!(decoder.is_done());
        assert_eq!(decoder.parse_failures(), 0);
    }

    #[test]
    fn test_tool_calls_merge_by_index() {
        let mut decoder = StreamDecoder::new();
        let lines = [
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"load_tools","arguments":""}}]}}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":1,"id":"call_b","function":{"name":"voice_inbox","arguments":"{}"}}]}}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"group\":"}}]}}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"n8n\"}"}}]}}]}"#,
            r#"data: {"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
        ];
        for line in lines {
            decoder.feed(format!("{}\n", line).as_bytes());
        }

        assert!(decoder.wants_tools());
        let calls = decoder.tool_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_a");
        assert_eq!(calls[0].parsed_arguments()["group"], "n8n");
        assert_eq!(calls[1].name, "voice_inbox");
    }

    #[test]
    fn test_missing_id_is_generated() {
        let mut decoder = StreamDecoder::new();
        decoder.feed(
            br#"data: {"choices":[{"delta":{"tool_calls":[{"function":{"name":"capture_screen"}}]},"finish_reason":"stop"}]}
"#,
        );
        assert!(decoder.wants_tools());
        let calls = decoder.tool_calls();
        assert!(calls[0].id.starts_with("call_0_"));
        assert_eq!(calls[0].arguments, "");
    }

    #[test]
    fn test_finish_and_error() {
        let mut decoder = StreamDecoder::new();
        decoder.feed(b": keep-alive\nevent: message\n");
        let out = decoder.feed(br#"data: {"choices":[{"delta":{"content":"tail"},"finish_reason":"length"}]}"#);
        assert!(out.is_empty());
        assert_eq!(decoder.finish(), vec!["tail"]);
        assert_eq!(decoder.finish_reason(), Some("length"));
        assert!(!decoder.wants_tools());

        let mut decoder = StreamDecoder::new();
        decoder.feed(b"data: {\"error\":{\"message\":\"model not found\"}}\n");
        assert_eq!(decoder.error(), Some("model not found"));
    }
}
