//! Chat completions request bodies.

use serde_json::{json, Map, Value};

use super::kind::ProviderKind;
use crate::session::{Message, Role};
use crate::tools::ToolDescriptor;

/// Everything that goes into one streaming request.
#[derive(Debug, Clone)]
pub struct ChatRequest<'a> {
    pub kind: ProviderKind,
    pub model: &'a str,
    pub messages: &'a [Message],
    pub tools: &'a [ToolDescriptor],
    pub context_length: usize,
}

impl ChatRequest<'_> {
    /// Whether the body carries a `tools` schema.
    pub fn sends_tools(&self) -> bool {
        self.kind.supports_native_tools() && !self.tools.is_empty()
    }

    /// Serialize to the JSON body.
    pub fn to_body(&self) -> Value {
        let messages: Vec<Value> = self
            .messages
            .iter()
            .map(|m| encode_message(self.kind, m))
            .collect();

        let mut body = Map::new();
        body.insert("model".into(), json!(self.model));
        body.insert("messages".into(), Value::Array(messages));
        body.insert("stream".into(), json!(true));

        if self.sends_tools() {
            let tools: Vec<Value> = self.tools.iter().map(|t| t.to_function_schema()).collect();
            body.insert("tools".into(), Value::Array(tools));
            body.insert("tool_choice".into(), json!("auto"));
        }

        if self.kind.is_local() && self.context_length > 0 {
            body.insert("options".into(), json!({ "num_ctx": self.context_length }));
        }

        Value::Object(body)
    }
}

fn encode_message(kind: ProviderKind, message: &Message) -> Value {
    let mut obj = Map::new();
    obj.insert("role".into(), json!(message.role.as_str()));

    match (&message.image, kind.uses_inline_images()) {
        (Some(image), true) => {
            obj.insert("content".into(), json!(message.content));
            obj.insert("images".into(), json!([image.data]));
        }
        (Some(image), false) => {
            let mut parts = Vec::new();
            if !message.content.is_empty() {
                parts.push(json!({"type": "text", "text": message.content}));
            }
            parts.push(json!({
                "type": "image_url",
                "image_url": {"url": image.data_url()}
            }));
            obj.insert("content".into(), Value::Array(parts));
        }
        (None, _) => {
            obj.insert("content".into(), json!(message.content));
        }
    }

    if message.role == Role::Assistant && message.has_tool_calls() {
        let calls: Vec<Value> = message
            .tool_calls
            .iter()
            .map(|c| {
                json!({
                    "id": c.id,
                    "type": "function",
                    "function": {"name": c.name, "arguments": c.arguments}
                })
            })
            .collect();
        obj.insert("tool_calls".into(), Value::Array(calls));
    }

    if let Some(id) = &message.tool_call_id {
        obj.insert("tool_call_id".into(), json!(id));
    }

    Value::Object(obj)
}
