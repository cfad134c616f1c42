//! Handlers module - the mailbox and tool-group tool surface
//!
//! [`MailboxHandlers`] serves the always-loaded tools over a
//! [`MailboxStore`] and a [`ToolGroupRegistry`]:
//!
//! - `voice_send`, `voice_inbox`, `voice_listen`, `voice_status`
//! - `load_tools`, `unload_tools`, `list_tool_groups`
//!
//! Results use the MCP tool result shape (`content` items plus `isError`).
//! [`MailboxHandlers::call_tool`] is the full entry point: it counts the call
//! for idle tracking, enforces confirmation on destructive tools, and runs
//! idle eviction afterwards. The [`ToolExecutor`] impl lets a provider
//! session drive the same tools; the session does its own call accounting.
//! [`server::McpServer`] exposes the handlers to MCP clients over stdio.

pub mod server;

pub use server::McpServer;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::MirrorError;
use crate::mailbox::fs::format_time;
use crate::mailbox::{ListenOutcome, ListenRequest, MailboxMessage, MailboxStore, ReadQuery, SendRequest};
use crate::session::ImageAttachment;
use crate::tools::{ToolDescriptor, ToolExecutor, ToolGroupRegistry, ToolOutcome};

/// One content item of a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
}

/// Result of a tool call, in MCP form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl ToolResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: true,
        }
    }

    /// Text with an image placed before it.
    pub fn with_image(text: impl Into<String>, image: Option<ImageAttachment>) -> Self {
        let mut content = Vec::new();
        if let Some(image) = image {
            content.push(ToolContent::Image {
                data: image.data,
                mime_type: image.mime_type,
            });
        }
        content.push(ToolContent::Text { text: text.into() });
        Self {
            content,
            is_error: false,
        }
    }

    /// All text items, joined by blank lines.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                ToolContent::Text { text } => Some(text.as_str()),
                ToolContent::Image { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn first_image(&self) -> Option<ImageAttachment> {
        self.content.iter().find_map(|c| match c {
            ToolContent::Image { data, mime_type } => {
                Some(ImageAttachment::new(mime_type.clone(), data.clone()))
            }
            ToolContent::Text { .. } => None,
        })
    }
}

/// Serves the core and meta tools.
pub struct MailboxHandlers {
    mailbox: Arc<MailboxStore>,
    registry: Arc<ToolGroupRegistry>,
}

impl MailboxHandlers {
    pub fn new(mailbox: Arc<MailboxStore>, registry: Arc<ToolGroupRegistry>) -> Self {
        Self { mailbox, registry }
    }

    pub fn mailbox(&self) -> &Arc<MailboxStore> {
        &self.mailbox
    }

    pub fn registry(&self) -> &Arc<ToolGroupRegistry> {
        &self.registry
    }

    /// Schemas of the tools currently in context.
    pub async fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.registry.active_tools().await
    }

    /// Handle a tool call from an external client.
    pub async fn call_tool(&self, name: &str, args: &Value) -> ToolResponse {
        self.registry.record_tool_call(name).await;
        let response = self.guarded(name, args).await;
        self.registry.auto_unload_idle().await;
        response
    }

    async fn guarded(&self, name: &str, args: &Value) -> ToolResponse {
        if self.registry.is_destructive(name) && !bool_arg(args, "confirmed", false) {
            return ToolResponse::text(format!(
                "CONFIRMATION REQUIRED: \"{name}\" is a destructive operation.\n\
                 Ask the user for voice confirmation before proceeding.\n\
                 To execute, call {name} again with confirmed: true in the arguments."
            ));
        }
        self.dispatch(name, args).await
    }

    /// Route a call without accounting or confirmation checks.
    pub async fn dispatch(&self, name: &str, args: &Value) -> ToolResponse {
        debug!(tool = name, "Dispatching tool call");
        match name {
            "voice_send" => self.voice_send(args).await,
            "voice_inbox" => self.voice_inbox(args).await,
            "voice_listen" => self.voice_listen(args).await,
            "voice_status" => self.voice_status(args).await,
            "load_tools" => self.load_tools(args).await,
            "unload_tools" => self.unload_tools(args).await,
            "list_tool_groups" => self.list_tool_groups().await,
            other => match self.registry.group_of(other) {
                Some(group) => ToolResponse::error(format!(
                    "Tool \"{}\" (group \"{}\") is not served by this process",
                    other, group
                )),
                None => ToolResponse::error(format!("Unknown tool: {}", other)),
            },
        }
    }

    async fn voice_send(&self, args: &Value) -> ToolResponse {
        let instance_id = match required_str(args, "instance_id") {
            Ok(v) => v,
            Err(e) => return e,
        };
        let message = match required_str(args, "message") {
            Ok(v) => v,
            Err(e) => return e,
        };

        let mut request = SendRequest::new(instance_id, message);
        if let Some(thread) = str_arg(args, "thread_id") {
            request = request.in_thread(thread);
        }
        if let Some(parent) = str_arg(args, "reply_to") {
            request = request.reply_to(parent);
        }
        if let Some(path) = str_arg(args, "image_path") {
            request = request.with_image(path);
        }

        match self.mailbox.send(request).await {
            Ok(receipt) => ToolResponse::text(receipt.summary()),
            Err(e) => ToolResponse::error(format!("Error: {}", e)),
        }
    }

    async fn voice_inbox(&self, args: &Value) -> ToolResponse {
        let instance_id = match required_str(args, "instance_id") {
            Ok(v) => v,
            Err(e) => return e,
        };
        let query = ReadQuery::new(instance_id)
            .limit(args.get("limit").and_then(|v| v.as_u64()).unwrap_or(10) as usize)
            .include_read(bool_arg(args, "include_read", false))
            .mark_as_read(bool_arg(args, "mark_as_read", false));

        let messages = self.mailbox.read(query).await;
        if messages.is_empty() {
            return ToolResponse::text("No new messages.");
        }

        let observed: Vec<&str> = messages.iter().map(|m| m.message.as_str()).collect();
        self.registry.auto_load_by_intent(&observed.join("\n")).await;

        let mut content = Vec::new();
        let mut parts = Vec::new();
        for m in &messages {
            parts.push(format!(
                "[{}] [{}] (id: {}):\n{}",
                format_time(&m.timestamp),
                m.from,
                m.id,
                m.message
            ));
            if let Some(image) = message_image(m).await {
                content.push(ToolContent::Image {
                    data: image.data,
                    mime_type: image.mime_type,
                });
            }
        }
        content.push(ToolContent::Text {
            text: format!(
                "=== Inbox ({} message(s)) ===\n\n{}",
                parts.len(),
                parts.join("\n\n")
            ),
        });

        ToolResponse {
            content,
            is_error: false,
        }
    }

    async fn voice_listen(&self, args: &Value) -> ToolResponse {
        let instance_id = match required_str(args, "instance_id") {
            Ok(v) => v,
            Err(e) => return e,
        };
        let from_sender = match required_str(args, "from_sender") {
            Ok(v) => v,
            Err(e) => return e,
        };

        let mut request = ListenRequest::new(instance_id, from_sender);
        if let Some(thread) = str_arg(args, "thread_id") {
            request = request.in_thread(thread);
        }
        if let Some(secs) = args.get("timeout_seconds").and_then(|v| v.as_u64()) {
            request = request.timeout_secs(secs);
        }

        match self.mailbox.listen(request).await {
            Ok(ListenOutcome::Received {
                message,
                waited_secs,
            }) => {
                self.registry.auto_load_by_intent(&message.message).await;
                let text = format!(
                    "=== Message from {} (after {}s) ===\nThread: {}\nTime: {}\nID: {}\n\n{}",
                    from_sender,
                    waited_secs,
                    message.thread_id.as_deref().unwrap_or("none"),
                    message.timestamp,
                    message.id,
                    message.message
                );
                ToolResponse::with_image(text, message_image(&message).await)
            }
            Ok(ListenOutcome::TimedOut { timeout_secs }) => ToolResponse::text(format!(
                "Timeout: No message from {} after {}s.",
                from_sender, timeout_secs
            )),
            Ok(ListenOutcome::LeaseHeld { holder }) => ToolResponse::error(format!(
                "Cannot listen: Another instance ({}) is already listening.\n\
                 Only one listener is allowed to prevent duplicate responses.",
                holder
            )),
            Err(MirrorError::Lease(reason)) => {
                ToolResponse::error(format!("Cannot listen: {}", reason))
            }
            Err(e) => ToolResponse::error(format!("Error: {}", e)),
        }
    }

    async fn voice_status(&self, args: &Value) -> ToolResponse {
        let presence = self.mailbox.presence();
        if str_arg(args, "action") == Some("list") {
            let entries = presence.list().await;
            if entries.is_empty() {
                return ToolResponse::text("No active instances.");
            }
            let lines: Vec<String> = entries.iter().map(|e| e.to_string()).collect();
            return ToolResponse::text(format!("=== Instances ===\n\n{}", lines.join("\n")));
        }

        let instance_id = match required_str(args, "instance_id") {
            Ok(v) => v,
            Err(e) => return e,
        };
        let status = str_arg(args, "status").unwrap_or("active");
        let task = str_arg(args, "current_task");
        presence.heartbeat(instance_id, status, task).await;

        let task_info = task.map(|t| format!(" - {}", t)).unwrap_or_default();
        ToolResponse::text(format!(
            "Status updated: [{}] {}{}",
            instance_id, status, task_info
        ))
    }

    async fn load_tools(&self, args: &Value) -> ToolResponse {
        let group = match required_str(args, "group") {
            Ok(v) => v,
            Err(e) => return e,
        };
        match self.registry.load(group).await {
            Ok(report) if report.already_loaded() => ToolResponse::text(format!(
                "Tool group \"{}\" is already loaded ({} tools).",
                group,
                report.tool_names.len()
            )),
            Ok(report) => ToolResponse::text(format!(
                "Loaded tool group \"{}\" ({} tools):\n{}",
                group,
                report.tool_names.len(),
                report.tool_names.join(", ")
            )),
            Err(e) => ToolResponse::error(e.to_string()),
        }
    }

    async fn unload_tools(&self, args: &Value) -> ToolResponse {
        let group = match required_str(args, "group") {
            Ok(v) => v,
            Err(e) => return e,
        };
        match self.registry.unload(group).await {
            Ok(0) => ToolResponse::text(format!("Tool group \"{}\" is not loaded.", group)),
            Ok(count) => ToolResponse::text(format!(
                "Unloaded tool group \"{}\". {} tools removed from context.",
                group, count
            )),
            Err(e) => ToolResponse::error(e.to_string()),
        }
    }

    async fn list_tool_groups(&self) -> ToolResponse {
        let mut lines = vec!["=== Tool Groups ===".to_string(), String::new()];
        for group in self.registry.list().await {
            lines.push(group.to_string());
            lines.push(format!("  Tools: {}", group.tool_names.join(", ")));
            lines.push(String::new());
        }
        ToolResponse::text(lines.join("\n").trim_end().to_string())
    }
}

#[async_trait]
impl ToolExecutor for MailboxHandlers {
    async fn execute(&self, name: &str, args: Value) -> ToolOutcome {
        let response = self.guarded(name, &args).await;
        let text = response.text_content();
        if response.is_error {
            return ToolOutcome::error(text);
        }
        match response.first_image() {
            Some(image) => ToolOutcome::ok(json!({ "text": text, "image": image.data_url() })),
            None => ToolOutcome::text(text),
        }
    }
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
}

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolResponse> {
    str_arg(args, key).ok_or_else(|| ToolResponse::error(format!("Error: {} is required", key)))
}

fn bool_arg(args: &Value, key: &str, default: bool) -> bool {
    args.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
}

/// Image attached to a mailbox message, from its data URL or its file.
async fn message_image(message: &MailboxMessage) -> Option<ImageAttachment> {
    if let Some(url) = &message.image_data_url {
        if let Some(image) = ImageAttachment::from_data_url(url) {
            return Some(image);
        }
        warn!(id = %message.id, "Ignoring malformed image data URL");
    }
    let path = message.image_path.as_deref()?;
    match ImageAttachment::from_path(Path::new(path)).await {
        Ok(image) => Some(image),
        Err(e) => {
            warn!(id = %message.id, path, error = %e, "Failed to load message image");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MailboxConfig, ToolsConfig};
    use std::time::Duration;
    use tempfile::TempDir;

    async fn handlers(dir: &TempDir) -> MailboxHandlers {
        let config = MailboxConfig {
            poll_interval_ms: 50,
            ..Default::default()
        };
        let mailbox = MailboxStore::open(dir.path(), config).await.unwrap();
        let registry = ToolGroupRegistry::from_config(&ToolsConfig::default());
        MailboxHandlers::new(Arc::new(mailbox), Arc::new(registry))
    }

    #[tokio::test]
    async fn test_send_then_inbox() {
        let dir = TempDir::new().unwrap();
        let h = handlers(&dir).await;

        let sent = h
            .call_tool("voice_send", &json!({"instance_id": "nathan", "message": "Hello"}))
            .await;
        assert!(!sent.is_error);
        assert!(sent.text_content().starts_with("Message sent in thread [thread_"));

        let inbox = h
            .call_tool("voice_inbox", &json!({"instance_id": "voice-claude"}))
            .await;
        let text = inbox.text_content();
        assert!(text.starts_with("=== Inbox (1 message(s)) ==="));
        assert!(text.contains("[nathan]"));
        assert!(text.ends_with("Hello"));

        let own = h.call_tool("voice_inbox", &json!({"instance_id": "nathan"})).await;
        assert_eq!(own.text_content(), "No new messages.");
    }

    #[tokio::test]
    async fn test_missing_arguments() {
        let dir = TempDir::new().unwrap();
        let h = handlers(&dir).await;

        let resp = h.call_tool("voice_send", &json!({"message": "hi"})).await;
        assert!(resp.is_error);
        assert_eq!(resp.text_content(), "Error: instance_id is required");

        let resp = h.call_tool("load_tools", &json!({})).await;
        assert_eq!(resp.text_content(), "Error: group is required");
    }

    #[tokio::test]
    async fn test_inbox_auto_loads_by_intent() {
        let dir = TempDir::new().unwrap();
        let h = handlers(&dir).await;
        h.call_tool(
            "voice_send",
            &json!({"instance_id": "nathan", "message": "Can you check my n8n workflows?"}),
        )
        .await;

        assert!(!h.registry().is_loaded("n8n").await);
        h.call_tool("voice_inbox", &json!({"instance_id": "voice-claude"})).await;
        assert!(h.registry().is_loaded("n8n").await);
    }

    #[tokio::test]
    async fn test_listen_receives_and_reports_lease() {
        let dir = TempDir::new().unwrap();
        let h = Arc::new(handlers(&dir).await);

        let listener = {
            let h = h.clone();
            tokio::spawn(async move {
                h.call_tool(
                    "voice_listen",
                    &json!({"instance_id": "a", "from_sender": "Nathan", "timeout_seconds": 5}),
                )
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;

        let blocked = h
            .call_tool(
                "voice_listen",
                &json!({"instance_id": "b", "from_sender": "nathan", "timeout_seconds": 1}),
            )
            .await;
        assert!(blocked.is_error);
        assert!(blocked.text_content().contains("Another instance (a)"));

        h.call_tool(
            "voice_send",
            &json!({"instance_id": "nathan", "message": "take a screenshot please"}),
        )
        .await;

        let received = listener.await.unwrap();
        let text = received.text_content();
        assert!(text.starts_with("=== Message from Nathan (after "));
        assert!(text.ends_with("take a screenshot please"));
        assert!(h.registry().is_loaded("screen").await);
    }

    #[tokio::test]
    async fn test_listen_timeout_text() {
        let dir = TempDir::new().unwrap();
        let h = handlers(&dir).await;
        let resp = h
            .call_tool(
                "voice_listen",
                &json!({"instance_id": "a", "from_sender": "nathan", "timeout_seconds": 0}),
            )
            .await;
        assert_eq!(resp.text_content(), "Timeout: No message from nathan after 0s.");
    }

    #[tokio::test]
    async fn test_voice_status() {
        let dir = TempDir::new().unwrap();
        let h = handlers(&dir).await;

        let empty = h.call_tool("voice_status", &json!({"action": "list"})).await;
        assert_eq!(empty.text_content(), "No active instances.");

        let updated = h
            .call_tool(
                "voice_status",
                &json!({"instance_id": "voice-claude", "current_task": "Listening"}),
            )
            .await;
        assert_eq!(
            updated.text_content(),
            "Status updated: [voice-claude] active - Listening"
        );

        let list = h.call_tool("voice_status", &json!({"action": "list"})).await;
        assert!(list
            .text_content()
            .contains("[voice-claude] active - Listening"));
    }

    #[tokio::test]
    async fn test_group_tools() {
        let dir = TempDir::new().unwrap();
        let h = handlers(&dir).await;

        let loaded = h.call_tool("load_tools", &json!({"group": "browser"})).await;
        assert!(loaded
            .text_content()
            .starts_with("Loaded tool group \"browser\" (16 tools):"));
        assert!(h.registry().is_loaded("screen").await);

        let again = h.call_tool("load_tools", &json!({"group": "browser"})).await;
        assert!(again.text_content().contains("already loaded"));

        let core = h.call_tool("unload_tools", &json!({"group": "core"})).await;
        assert!(core.is_error);

        let unloaded = h.call_tool("unload_tools", &json!({"group": "browser"})).await;
        assert_eq!(
            unloaded.text_content(),
            "Unloaded tool group \"browser\". 16 tools removed from context."
        );

        let list = h.call_tool("list_tool_groups", &json!({})).await;
        let text = list.text_content();
        assert!(text.starts_with("=== Tool Groups ==="));
        assert!(text.contains("[loaded] screen (1 tools)"));
        assert!(text.contains("  Tools: voice_send, voice_inbox, voice_listen, voice_status"));

        let unknown = h.call_tool("load_tools", &json!({"group": "nope"})).await;
        assert!(unknown.is_error);
        assert!(unknown.text_content().contains("Available: core, meta"));
    }

    #[tokio::test]
    async fn test_destructive_requires_confirmation() {
        let dir = TempDir::new().unwrap();
        let h = handlers(&dir).await;

        let resp = h.call_tool("memory_forget", &json!({"content_or_id": "x"})).await;
        assert!(!resp.is_error);
        assert!(resp.text_content().starts_with("CONFIRMATION REQUIRED"));

        let resp = h
            .call_tool("memory_forget", &json!({"content_or_id": "x", "confirmed": true}))
            .await;
        assert!(resp.is_error);
        assert!(resp.text_content().contains("not served by this process"));

        let unknown = h.call_tool("does_not_exist", &json!({})).await;
        assert_eq!(unknown.text_content(), "Unknown tool: does_not_exist");
    }

    #[tokio::test]
    async fn test_call_tool_runs_idle_eviction() {
        let dir = TempDir::new().unwrap();
        let h = handlers(&dir).await;
        h.call_tool("load_tools", &json!({"group": "n8n"})).await;

        for _ in 0..16 {
            h.call_tool("voice_status", &json!({"action": "list"})).await;
        }
        assert!(!h.registry().is_loaded("n8n").await);
    }

    #[tokio::test]
    async fn test_executor_outcomes() {
        let dir = TempDir::new().unwrap();
        let h = handlers(&dir).await;

        let image_path = dir.path().join("shot.png");
        std::fs::write(&image_path, [0x89, b'P', b'N', b'G']).unwrap();
        h.dispatch(
            "voice_send",
            &json!({
                "instance_id": "nathan",
                "message": "look",
                "image_path": image_path.to_string_lossy()
            }),
        )
        .await;

        let outcome = h
            .execute("voice_inbox", json!({"instance_id": "voice-claude"}))
            .await;
        assert!(outcome.success);
        let formatted = h.format_result("voice_inbox", &outcome.result);
        assert!(formatted.text.contains("look"));
        assert_eq!(formatted.image.unwrap().data, "iVBORw==");

        let failed = h.execute("voice_inbox", json!({})).await;
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("Error: instance_id is required"));
    }

    #[test]
    fn test_response_serialization() {
        let resp = ToolResponse::with_image("hi", Some(ImageAttachment::new("image/png", "AAAA")));
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["isError"], false);
        assert_eq!(value["content"][0]["type"], "image");
        assert_eq!(value["content"][0]["mimeType"], "image/png");
        assert_eq!(value["content"][1]["text"], "hi");
    }
}
