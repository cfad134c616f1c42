//! Tools module - the contract between the agent and its callable tools
//!
//! Tools themselves (browser control, screen capture, memory, workflow
//! automation) live outside this crate. The agent sees them through:
//!
//! - [`ToolExecutor`] - executes a named tool and formats its result
//! - [`groups::ToolGroupRegistry`] - decides which tool schemas the model
//!   currently sees, loading bundles on demand and evicting idle ones
//! - [`catalog`] - the static list of tool groups
//! - [`embedded`] - finds tool calls written into plain model text, for
//!   backends without native function calling

pub mod catalog;
pub mod embedded;
pub mod groups;

pub use embedded::EmbeddedCall;
pub use groups::{GroupSummary, ToolGroup, ToolGroupRegistry, ToolListChanged};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::session::ImageAttachment;

/// Schema of a single callable tool, in function-calling form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    /// Destructive tools require `confirmed: true` in their arguments.
    #[serde(default)]
    pub destructive: bool,
}

impl ToolDescriptor {
    pub fn new(name: &str, description: &str, input_schema: Value) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            input_schema,
            destructive: false,
        }
    }

    pub fn destructive(mut self) -> Self {
        self.destructive = true;
        self
    }

    /// OpenAI-style `{"type": "function", "function": {...}}` entry.
    pub fn to_function_schema(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.input_schema,
            }
        })
    }
}

/// Structured outcome of a tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result,
            error: None,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::ok(Value::String(text.into()))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: Value::Null,
            error: Some(message.into()),
        }
    }
}

/// Text (and optionally an image) to feed back to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct FormattedResult {
    pub text: String,
    pub image: Option<ImageAttachment>,
}

impl FormattedResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            image: None,
        }
    }
}

/// Executes tools on behalf of a provider session.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Run `name` with `args`. Failures are reported in the outcome, not raised.
    async fn execute(&self, name: &str, args: Value) -> ToolOutcome;

    /// Render a successful result for the model.
    ///
    /// The default understands plain strings, `{"text": ..., "image": <data url>}`
    /// objects, and falls back to pretty JSON.
    fn format_result(&self, _name: &str, result: &Value) -> FormattedResult {
        default_format(result)
    }

    /// Find a tool call embedded in free model text.
    fn parse_embedded_call(&self, raw: &str) -> Option<EmbeddedCall> {
        embedded::parse_embedded_call(raw)
    }
}

fn default_format(result: &Value) -> FormattedResult {
    match result {
        Value::String(s) => FormattedResult::text(s.clone()),
        Value::Null => FormattedResult::text("Done."),
        Value::Object(map) if map.contains_key("text") => FormattedResult {
            text: map
                .get("text")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string(),
            image: map
                .get("image")
                .and_then(|i| i.as_str())
                .and_then(ImageAttachment::from_data_url),
        },
        other => FormattedResult::text(
            serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoExecutor;

    #[async_trait]
    impl ToolExecutor for EchoExecutor {
        async fn execute(&self, name: &str, args: Value) -> ToolOutcome {
            ToolOutcome::ok(json!({ "tool": name, "args": args }))
        }
    }

    #[tokio::test]
    async fn test_default_executor_methods() {
        let exec = EchoExecutor;
        let outcome = exec.execute("voice_inbox", json!({"limit": 1})).await;
        assert!(outcome.success);

        let formatted = exec.format_result("voice_inbox", &outcome.result);
        assert!(formatted.text.contains("\"tool\": \"voice_inbox\""));
        assert!(formatted.image.is_none());

        let call = exec
            .parse_embedded_call(r#"{"tool": "capture_screen", "args": {}}"#)
            .unwrap();
        assert_eq!(call.name, "capture_screen");
    }

    #[test]
    fn test_default_format_variants() {
        assert_eq!(default_format(&json!("plain")).text, "plain");
        assert_eq!(default_format(&Value::Null).text, "Done.");

        let with_image = default_format(&json!({
            "text": "Screenshot captured.",
            "image": "data:image/png;base64,AAAA"
        }));
        assert_eq!(with_image.text, "Screenshot captured.");
        assert_eq!(with_image.image.unwrap().mime_type, "image/png");
    }

    #[test]
    fn test_function_schema() {
        let tool = ToolDescriptor::new("capture_screen", "Capture the screen", json!({"type": "object"}));
        let schema = tool.to_function_schema();
        assert_eq!(schema["type"], "function");
        assert_eq!(schema["function"]["name"], "capture_screen");
        assert_eq!(schema["function"]["parameters"]["type"], "object");
    }

    #[test]
    fn test_outcome_constructors() {
        let err = ToolOutcome::error("boom");
        assert!(!err.success);
        assert_eq!(err.error.as_deref(), Some("boom"));
        assert_eq!(ToolOutcome::text("ok").result, json!("ok"));
    }
}
