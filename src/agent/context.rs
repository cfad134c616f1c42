//! Prompt assembly for provider requests.

use serde_json::Value;

use crate::session::{Message, Role};
use crate::tools::ToolDescriptor;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Voice Mirror, a voice assistant running on the user's computer. \
Your replies are spoken aloud, so keep them short and conversational and do not use markdown.";

/// Instruction appended to a tool result on the text-directive path.
pub const SPOKEN_ANSWER_INSTRUCTION: &str = "Answer the user's question using only the data above. \
Respond in plain spoken language, under 100 words, without markdown.";

/// Builds the message list for a request.
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    system_prompt: String,
}

impl ContextBuilder {
    pub fn new(system_prompt: Option<&str>) -> Self {
        Self {
            system_prompt: system_prompt
                .filter(|p| !p.trim().is_empty())
                .unwrap_or(DEFAULT_SYSTEM_PROMPT)
                .to_string(),
        }
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// Messages to send for `history`.
    ///
    /// Backends with native tool support get the history unchanged. Others get
    /// the tool directive format and tool list added to the system prompt.
    pub fn build_messages(
        &self,
        history: &[Message],
        tools: &[ToolDescriptor],
        native_tools: bool,
    ) -> Vec<Message> {
        let mut messages = history.to_vec();
        if native_tools || tools.is_empty() {
            return messages;
        }

        let instructions = tool_instructions(tools);
        match messages.first_mut() {
            Some(first) if first.role == Role::System => {
                first.content = format!("{}\n\n{}", first.content, instructions);
            }
            _ => messages.insert(0, Message::system(&instructions)),
        }
        messages
    }
}

/// Describe the directive format and the available tools.
pub fn tool_instructions(tools: &[ToolDescriptor]) -> String {
    let mut lines = vec![
        "You can use tools. To call one, reply with only a JSON object and nothing else:".to_string(),
        r#"{"tool": "<tool name>", "args": {<arguments>}}"#.to_string(),
        "After the tool runs you will receive its result.".to_string(),
        String::new(),
        "Available tools:".to_string(),
    ];
    for tool in tools {
        lines.push(format!(
            "- {}({}): {}",
            tool.name,
            signature(&tool.input_schema),
            tool.description
        ));
    }
    lines.join("\n")
}

/// The user message that carries a tool result back on the text path.
pub fn tool_followup(tool: &str, result: &str) -> String {
    format!(
        "Tool result from {}:\n{}\n\n{}",
        tool, result, SPOKEN_ANSWER_INSTRUCTION
    )
}

fn signature(schema: &Value) -> String {
    let required: Vec<&str> = schema
        .get("required")
        .and_then(|r| r.as_array())
        .map(|r| r.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();

    schema
        .get("properties")
        .and_then(|p| p.as_object())
        .map(|props| {
            props
                .keys()
                .map(|k| {
                    if required.contains(&k.as_str()) {
                        k.clone()
                    } else {
                        format!("{}?", k)
                    }
                })
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tools() -> Vec<ToolDescriptor> {
        vec![ToolDescriptor::new(
            "memory_search",
            "Search stored memories",
            json!({
                "type": "object",
                "properties": {"query": {"type": "string"}, "max_results": {"type": "integer"}},
                "required": ["query"]
            }),
        )]
    }

    #[test]
    fn test_default_prompt() {
        assert_eq!(ContextBuilder::new(None).system_prompt(), DEFAULT_SYSTEM_PROMPT);
        assert_eq!(ContextBuilder::new(Some("custom")).system_prompt(), "custom");
    }

    #[test]
    fn test_native_history_unchanged() {
        let builder = ContextBuilder::new(None);
        let history = vec![Message::system("p"), Message::user("hi")];
        assert_eq!(builder.build_messages(&history, &tools(), true), history);
    }

    #[test]
    fn test_text_mode_extends_system_prompt() {
        let builder = ContextBuilder::new(None);
        let history = vec![Message::system("p"), Message::user("hi")];
        let messages = builder.build_messages(&history, &tools(), false);

        assert_eq!(messages.len(), 2);
        assert!(messages[0].content.starts_with("p\n\nYou can use tools."));
        assert!(messages[0]
            .content
            .contains("- memory_search(max_results?, query): Search stored memories"));

        let bare = builder.build_messages(&[Message::user("hi")], &tools(), false);
        assert_eq!(bare[0].role, Role::System);
        assert_eq!(bare.len(), 2);
    }

    #[test]
    fn test_tool_followup() {
        let text = tool_followup("voice_inbox", "No new messages.");
        assert!(text.starts_with("Tool result from voice_inbox:\nNo new messages."));
        assert!(text.ends_with(SPOKEN_ANSWER_INSTRUCTION));
    }
}
