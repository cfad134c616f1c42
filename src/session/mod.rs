//! Session module - conversation history for a provider session
//!
//! This module owns the message list that is sent to the model on every
//! request. It provides:
//! - Role-tagged messages with optional images and tool calls
//! - History trimming that keeps requests bounded
//! - Image stripping for older turns
//! - A character-based context usage estimate
//!
//! # Example
//!
//! ```
//! use mirrorclaw::session::{Conversation, Message};
//!
//! let mut conversation = Conversation::new(Some("You are a voice assistant."));
//! conversation.push(Message::user("Hello!"));
//! conversation.push(Message::assistant("Hi there!"));
//!
//! conversation.trim(20, 4);
//! let usage = conversation.estimate_context(32768);
//! assert!(usage.used > 0);
//! ```

pub mod types;

pub use types::{ImageAttachment, Message, Role, ToolCall};

use serde::Serialize;

/// Placeholder left behind when an old image is stripped.
pub const IMAGE_PLACEHOLDER: &str = "[image omitted]";

/// Characters an image is counted as when estimating context.
pub const IMAGE_CHAR_COST: usize = 3000;

/// Characters per token used by the context estimate.
pub const CHARS_PER_TOKEN: usize = 4;

/// Estimated context usage, in tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ContextUsage {
    pub used: usize,
    pub limit: usize,
}

impl ContextUsage {
    /// Fraction of the window in use, 0.0 when the limit is unknown.
    pub fn ratio(&self) -> f64 {
        if self.limit == 0 {
            return 0.0;
        }
        self.used as f64 / self.limit as f64
    }
}

/// Ordered conversation history.
///
/// Leading system messages are treated as the prompt and survive trimming
/// and [`Conversation::clear`].
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    /// Create a conversation, seeded with a system prompt when one is given.
    pub fn new(system_prompt: Option<&str>) -> Self {
        let mut conversation = Self::default();
        conversation.reset(system_prompt);
        conversation
    }

    /// Replace all history with just the system prompt.
    pub fn reset(&mut self, system_prompt: Option<&str>) {
        self.messages.clear();
        if let Some(prompt) = system_prompt.filter(|p| !p.trim().is_empty()) {
            self.messages.push(Message::system(prompt));
        }
    }

    /// Drop everything except the leading system messages.
    pub fn clear(&mut self) {
        let keep = self.system_prefix_len();
        self.messages.truncate(keep);
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Bound the history before a request.
    ///
    /// Keeps the leading system messages and the most recent `limit` of the
    /// rest. A retained tail never starts with a `tool` message, since a tool
    /// result without its assistant call is rejected by most backends. Images
    /// are stripped from all but the `image_limit` most recent messages.
    ///
    /// # Arguments
    /// * `limit` - Non-system messages to keep
    /// * `image_limit` - Most recent messages allowed to keep their image
    pub fn trim(&mut self, limit: usize, image_limit: usize) {
        let prefix = self.system_prefix_len();
        let rest = self.messages.len() - prefix;

        let mut start = prefix + rest.saturating_sub(limit);
        while start < self.messages.len() && self.messages[start].role == Role::Tool {
            start += 1;
        }
        if start > prefix {
            self.messages.drain(prefix..start);
        }

        let keep_from = self.messages.len().saturating_sub(image_limit);
        for message in &mut self.messages[..keep_from] {
            if message.image.take().is_some() {
                if message.content.is_empty() {
                    message.content = IMAGE_PLACEHOLDER.to_string();
                } else {
                    message.content = format!("{}\n{}", message.content, IMAGE_PLACEHOLDER);
                }
            }
        }
    }

    /// Estimate token usage from message characters.
    ///
    /// Each image counts as [`IMAGE_CHAR_COST`] characters; the total is
    /// divided by [`CHARS_PER_TOKEN`].
    pub fn estimate_context(&self, limit: usize) -> ContextUsage {
        let chars: usize = self
            .messages
            .iter()
            .map(|m| {
                let tool_chars: usize = m
                    .tool_calls
                    .iter()
                    .map(|c| c.name.len() + c.arguments.len())
                    .sum();
                m.content.chars().count()
                    + tool_chars
                    + if m.image.is_some() { IMAGE_CHAR_COST } else { 0 }
            })
            .sum();

        ContextUsage {
            used: chars / CHARS_PER_TOKEN,
            limit,
        }
    }

    fn system_prefix_len(&self) -> usize {
        self.messages
            .iter()
            .take_while(|m| m.role == Role::System)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> ImageAttachment {
        ImageAttachment::new("image/png", "AAAA")
    }

    #[test]
    fn test_new_and_clear() {
        let mut conv = Conversation::new(Some("prompt"));
        conv.push(Message::user("hi"));
        conv.push(Message::assistant("hello"));
        assert_eq!(conv.len(), 3);

        conv.clear();
        assert_eq!(conv.len(), 1);
        assert_eq!(conv.messages()[0].role, Role::System);

        let empty = Conversation::new(Some("  "));
        assert!(empty.is_empty());
    }

    #[test]
    fn test_trim_keeps_system_and_recent() {
        let mut conv = Conversation::new(Some("prompt"));
        for i in 0..30 {
            conv.push(Message::user(&format!("u{}", i)));
        }
        conv.trim(20, 4);

        assert_eq!(conv.len(), 21);
        assert_eq!(conv.messages()[0].content, "prompt");
        assert_eq!(conv.messages()[1].content, "u10");
        assert_eq!(conv.last().unwrap().content, "u29");
    }

    #[test]
    fn test_trim_drops_leading_tool_results() {
        let mut conv = Conversation::new(Some("prompt"));
        conv.push(Message::user("q"));
        conv.push(Message::assistant_with_tools(
            "",
            vec![ToolCall::new("c1", "voice_inbox", "{}"), ToolCall::new("c2", "voice_status", "{}")],
        ));
        conv.push(Message::tool_result("c1", "no messages"));
        conv.push(Message::tool_result("c2", "nobody online"));
        conv.push(Message::assistant("Your inbox is empty."));

        // Window starts on the first tool result
        conv.trim(3, 4);
        assert_eq!(conv.len(), 2);
        assert_eq!(conv.messages()[0].role, Role::System);
        assert_eq!(conv.messages()[1].role, Role::Assistant);
        assert!(conv.messages()[1..].first().map(|m| m.role != Role::Tool).unwrap());
    }

    #[test]
    fn test_trim_under_limit_is_noop() {
        let mut conv = Conversation::new(None);
        conv.push(Message::user("a"));
        conv.push(Message::assistant("b"));
        conv.trim(20, 4);
        assert_eq!(conv.len(), 2);
    }

    #[test]
    fn test_trim_strips_old_images() {
        let mut conv = Conversation::new(None);
        conv.push(Message::user_with_image("look", image()));
        conv.push(Message::user_with_image("", image()));
        for i in 0..4 {
            conv.push(Message::user_with_image(&format!("recent {}", i), image()));
        }
        conv.trim(20, 4);

        let msgs = conv.messages();
        assert!(msgs[0].image.is_none());
        assert_eq!(msgs[0].content, "look\n[image omitted]");
        assert_eq!(msgs[1].content, IMAGE_PLACEHOLDER);
        assert!(msgs[2..].iter().all(|m| m.image.is_some()));
    }

    #[test]
    fn test_estimate_context() {
        let mut conv = Conversation::new(None);
        conv.push(Message::user(&"x".repeat(400)));
        assert_eq!(conv.estimate_context(1000), ContextUsage { used: 100, limit: 1000 });

        conv.push(Message::user_with_image("", image()));
        assert_eq!(conv.estimate_context(1000).used, 850);
        assert!((conv.estimate_context(1000).ratio() - 0.85).abs() < f64::EPSILON);
        assert_eq!(ContextUsage { used: 5, limit: 0 }.ratio(), 0.0);
    }
}
