//! Backend families.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{MirrorError, Result};

/// A chat backend. Every backend speaks the OpenAI-compatible chat
/// completions protocol; they differ in defaults, image encoding and whether
/// they support native function calling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Ollama,
    LmStudio,
    Jan,
    OpenAi,
    Groq,
    Mistral,
    OpenRouter,
    DeepSeek,
    Grok,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 9] = [
        ProviderKind::Ollama,
        ProviderKind::LmStudio,
        ProviderKind::Jan,
        ProviderKind::OpenAi,
        ProviderKind::Groq,
        ProviderKind::Mistral,
        ProviderKind::OpenRouter,
        ProviderKind::DeepSeek,
        ProviderKind::Grok,
    ];

    /// Look up a backend by its config tag (case-insensitive).
    pub fn from_tag(tag: &str) -> Result<Self> {
        let lowered = tag.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|k| k.tag() == lowered)
            .ok_or_else(|| {
                let known: Vec<&str> = Self::ALL.iter().map(|k| k.tag()).collect();
                MirrorError::Config(format!(
                    "Unknown provider '{}'. Expected one of: {}",
                    tag,
                    known.join(", ")
                ))
            })
    }

    pub fn tag(&self) -> &'static str {
        match self {
            ProviderKind::Ollama => "ollama",
            ProviderKind::LmStudio => "lmstudio",
            ProviderKind::Jan => "jan",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Groq => "groq",
            ProviderKind::Mistral => "mistral",
            ProviderKind::OpenRouter => "openrouter",
            ProviderKind::DeepSeek => "deepseek",
            ProviderKind::Grok => "grok",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderKind::Ollama => "Ollama",
            ProviderKind::LmStudio => "LM Studio",
            ProviderKind::Jan => "Jan",
            ProviderKind::OpenAi => "OpenAI",
            ProviderKind::Groq => "Groq",
            ProviderKind::Mistral => "Mistral",
            ProviderKind::OpenRouter => "OpenRouter",
            ProviderKind::DeepSeek => "DeepSeek",
            ProviderKind::Grok => "Grok",
        }
    }

    /// Local model servers running on this machine.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            ProviderKind::Ollama | ProviderKind::LmStudio | ProviderKind::Jan
        )
    }

    /// Whether tool schemas are sent as `tools`. Backends without this get
    /// tool calls through text directives instead.
    pub fn supports_native_tools(&self) -> bool {
        !self.is_local()
    }

    /// Local backends take images as a base64 `images` array on the message;
    /// the rest take OpenAI content parts.
    pub fn uses_inline_images(&self) -> bool {
        self.is_local()
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::Ollama => "http://127.0.0.1:11434",
            ProviderKind::LmStudio => "http://127.0.0.1:1234",
            ProviderKind::Jan => "http://127.0.0.1:1337",
            ProviderKind::OpenAi => "https://api.openai.com",
            ProviderKind::Groq => "https://api.groq.com/openai",
            ProviderKind::Mistral => "https://api.mistral.ai",
            ProviderKind::OpenRouter => "https://openrouter.ai/api",
            ProviderKind::DeepSeek => "https://api.deepseek.com",
            ProviderKind::Grok => "https://api.x.ai",
        }
    }

    /// Full chat completions URL for `base_url` (or the default base).
    pub fn chat_endpoint(&self, base_url: Option<&str>) -> String {
        let base = base_url
            .filter(|b| !b.trim().is_empty())
            .unwrap_or(self.default_base_url())
            .trim_end_matches('/');
        if base.ends_with("/v1") {
            format!("{}/chat/completions", base)
        } else {
            format!("{}/v1/chat/completions", base)
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            ProviderKind::Ollama => "llama3.2:latest",
            ProviderKind::LmStudio => "local-model",
            ProviderKind::Jan => "llama3.2-3b-instruct",
            ProviderKind::OpenAi => "gpt-4o-mini",
            ProviderKind::Groq => "llama-3.3-70b-versatile",
            ProviderKind::Mistral => "mistral-small-latest",
            ProviderKind::OpenRouter => "openai/gpt-4o-mini",
            ProviderKind::DeepSeek => "deepseek-chat",
            ProviderKind::Grok => "grok-2-latest",
        }
    }

    pub fn requires_api_key(&self) -> bool {
        !self.is_local()
    }

    /// Best-effort guess at whether `model` accepts images.
    pub fn supports_vision(&self, model: &str) -> bool {
        const VISION_HINTS: [&str; 12] = [
            "vision", "llava", "bakllava", "moondream", "minicpm-v", "gemma3", "-vl", "vl-",
            "pixtral", "gpt-4o", "gpt-4.1", "gpt-5",
        ];
        let model = model.to_ascii_lowercase();
        VISION_HINTS.iter().any(|hint| model.contains(hint))
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_tag() {
        assert_eq!(ProviderKind::from_tag("Ollama").unwrap(), ProviderKind::Ollama);
        assert_eq!(ProviderKind::from_tag(" lmstudio ").unwrap(), ProviderKind::LmStudio);
        let err = ProviderKind::from_tag("claude-cli").unwrap_err();
        assert!(err.to_string().contains("Unknown provider 'claude-cli'"));
    }

    #[test]
    fn test_families() {
        assert!(!ProviderKind::Ollama.supports_native_tools());
        assert!(ProviderKind::Ollama.uses_inline_images());
        assert!(ProviderKind::Groq.supports_native_tools());
        assert!(!ProviderKind::OpenAi.uses_inline_images());
        assert!(ProviderKind::OpenRouter.requires_api_key());
    }

    #[test]
    fn test_chat_endpoint() {
        assert_eq!(
            ProviderKind::Ollama.chat_endpoint(None),
            "http://127.0.0.1:11434/v1/chat/completions"
        );
        assert_eq!(
            ProviderKind::OpenAi.chat_endpoint(Some("http://proxy.local/v1/")),
            "http://proxy.local/v1/chat/completions"
        );
        assert_eq!(
            ProviderKind::Groq.chat_endpoint(Some("")),
            "https://api.groq.com/openai/v1/chat/completions"
        );
    }

    #[test]
    fn test_supports_vision() {
        assert!(ProviderKind::Ollama.supports_vision("llava:13b"));
        assert!(ProviderKind::Ollama.supports_vision("qwen2.5-vl:7b"));
        assert!(ProviderKind::OpenAi.supports_vision("gpt-4o-mini"));
        assert!(!ProviderKind::Ollama.supports_vision("llama3.1:8b"));
        assert!(!ProviderKind::DeepSeek.supports_vision("deepseek-chat"));
    }

    #[test]
    fn test_tags_roundtrip() {
        for kind in ProviderKind::ALL {
            assert_eq!(ProviderKind::from_tag(kind.tag()).unwrap(), kind);
        }
    }
}
