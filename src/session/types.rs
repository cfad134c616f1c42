//! Conversation message types.

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{MirrorError, Result};

/// Role of a message in the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// An image carried by a message, kept as base64 plus MIME type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAttachment {
    pub mime_type: String,
    /// Base64 payload without the `data:` prefix.
    pub data: String,
}

impl ImageAttachment {
    pub fn new(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    /// Parse a `data:<mime>;base64,<payload>` URL.
    pub fn from_data_url(url: &str) -> Option<Self> {
        let rest = url.strip_prefix("data:")?;
        let (mime, data) = rest.split_once(";base64,")?;
        if mime.is_empty() || data.is_empty() {
            return None;
        }
        Some(Self::new(mime, data))
    }

    /// Read an image file and encode it. The MIME type comes from the extension.
    pub async fn from_path(path: &Path) -> Result<Self> {
        let mime = match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("png") => "image/png",
            Some("jpg") | Some("jpeg") => "image/jpeg",
            Some("gif") => "image/gif",
            Some("webp") => "image/webp",
            _ => {
                return Err(MirrorError::Tool(format!(
                    "Unsupported image type: {}",
                    path.display()
                )))
            }
        };
        let bytes = tokio::fs::read(path).await?;
        Ok(Self::new(
            mime,
            base64::engine::general_purpose::STANDARD.encode(bytes),
        ))
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }
}

/// A tool call requested by the assistant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON argument string as produced by the model.
    pub arguments: String,
}

impl ToolCall {
    pub fn new(id: &str, name: &str, arguments: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            arguments: arguments.to_string(),
        }
    }

    /// Parsed arguments; malformed or empty argument strings become `{}`.
    pub fn parsed_arguments(&self) -> serde_json::Value {
        if self.arguments.trim().is_empty() {
            return serde_json::json!({});
        }
        serde_json::from_str(&self.arguments).unwrap_or_else(|_| serde_json::json!({}))
    }
}

/// A single conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageAttachment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn with_role(role: Role, content: &str) -> Self {
        Self {
            role,
            content: content.to_string(),
            image: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: &str) -> Self {
        Self::with_role(Role::System, content)
    }

    pub fn user(content: &str) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn user_with_image(content: &str, image: ImageAttachment) -> Self {
        Self {
            image: Some(image),
            ..Self::with_role(Role::User, content)
        }
    }

    pub fn assistant(content: &str) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    pub fn assistant_with_tools(content: &str, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::with_role(Role::Assistant, content)
        }
    }

    pub fn tool_result(tool_call_id: &str, content: &str) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.to_string()),
            ..Self::with_role(Role::Tool, content)
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    pub fn is_tool_result(&self) -> bool {
        self.role == Role::Tool && self.tool_call_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_message_creation() {
        let user_msg = Message::user("Hello");
        assert_eq!(user_msg.role, Role::User);
        assert_eq!(user_msg.content, "Hello");

        let tool_msg = Message::tool_result("call_1", "Success");
        assert_eq!(tool_msg.role, Role::Tool);
        assert!(tool_msg.is_tool_result());

        let assistant = Message::assistant_with_tools(
            "",
            vec![ToolCall::new("call_1", "voice_inbox", "{}")],
        );
        assert!(assistant.has_tool_calls());
    }

    #[test]
    fn test_data_url_roundtrip() {
        let image = ImageAttachment::from_data_url("data:image/png;base64,iVBORw0KGgo=").unwrap();
        assert_eq!(image.mime_type, "image/png");
        assert_eq!(image.data, "iVBORw0KGgo=");
        assert_eq!(image.data_url(), "data:image/png;base64,iVBORw0KGgo=");

        assert!(ImageAttachment::from_data_url("https://example.com/a.png").is_none());
        assert!(ImageAttachment::from_data_url("data:image/png;base64,").is_none());
    }

    #[tokio::test]
    async fn test_image_from_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shot.PNG");
        std::fs::write(&path, [0x89, b'P', b'N', b'G']).unwrap();

        let image = ImageAttachment::from_path(&path).await.unwrap();
        assert_eq!(image.mime_type, "image/png");
        assert_eq!(image.data, "iVBORw==");

        let missing = ImageAttachment::from_path(&dir.path().join("gone.png")).await;
        assert!(matches!(missing, Err(MirrorError::Io(_))));

        let err = ImageAttachment::from_path(&dir.path().join("notes.txt"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Unsupported image type"));
    }

    #[test]
    fn test_parsed_arguments() {
        let call = ToolCall::new("c", "load_tools", r#"{"group":"browser"}"#);
        assert_eq!(call.parsed_arguments()["group"], "browser");
        assert_eq!(ToolCall::new("c", "x", "").parsed_arguments(), serde_json::json!({}));
        assert_eq!(ToolCall::new("c", "x", "{oops").parsed_arguments(), serde_json::json!({}));
    }

    #[test]
    fn test_role_serde() {
        assert_eq!(serde_json::to_string(&Role::Tool).unwrap(), "\"tool\"");
        assert_eq!(Role::Assistant.as_str(), "assistant");
    }
}
