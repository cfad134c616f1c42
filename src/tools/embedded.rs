//! Tool calls embedded in plain model text.
//!
//! Backends without native function calling are prompted to answer with a
//! JSON directive when they want a tool:
//!
//! ```text
//! {"tool": "capture_screen", "args": {}}
//! ```
//!
//! The directive may stand alone, sit inside a fenced code block, or be
//! surrounded by prose. `arguments` is accepted as an alias of `args`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};

static FENCED_JSON: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"```(?:json)?\s*(\{[\s\S]*?\})\s*```").expect("valid fenced JSON pattern")
});

static TOOL_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""tool"\s*:"#).expect("valid tool key pattern"));

/// A tool call found in model text.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedCall {
    pub is_call: bool,
    pub name: String,
    pub args: Value,
    /// Set when the text looked like a directive but could not be used.
    pub error: Option<String>,
}

impl EmbeddedCall {
    /// A call that can be dispatched.
    pub fn is_valid(&self) -> bool {
        self.is_call && self.error.is_none() && !self.name.is_empty()
    }

    fn invalid(error: impl Into<String>) -> Self {
        Self {
            is_call: true,
            name: String::new(),
            args: json!({}),
            error: Some(error.into()),
        }
    }
}

/// Scan `raw` for a tool directive.
///
/// Returns `None` when the text contains no directive at all, and a call with
/// `error` set when it contains something that looks like one but is malformed.
pub fn parse_embedded_call(raw: &str) -> Option<EmbeddedCall> {
    if !TOOL_KEY.is_match(raw) {
        return None;
    }

    let mut candidates: Vec<&str> = FENCED_JSON
        .captures_iter(raw)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();
    if let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) {
        if start < end {
            candidates.push(&raw[start..=end]);
        }
    }

    let mut last_error = None;
    for candidate in candidates {
        match serde_json::from_str::<Value>(candidate) {
            Ok(Value::Object(map)) => match call_from_object(&map) {
                Ok(call) => return Some(call),
                Err(e) => last_error = Some(e),
            },
            Ok(_) => last_error = Some("Tool directive is not a JSON object".to_string()),
            Err(e) => last_error = Some(format!("Invalid tool directive JSON: {}", e)),
        }
    }

    Some(EmbeddedCall::invalid(
        last_error.unwrap_or_else(|| "Tool directive not found".to_string()),
    ))
}

fn call_from_object(map: &Map<String, Value>) -> Result<EmbeddedCall, String> {
    let name = match map.get("tool") {
        Some(Value::String(name)) if !name.trim().is_empty() => name.trim().to_string(),
        Some(_) => return Err("Tool name must be a non-empty string".to_string()),
        None => return Err("Missing 'tool' field".to_string()),
    };

    let args = match map.get("args").or_else(|| map.get("arguments")) {
        None | Some(Value::Null) => json!({}),
        Some(Value::Object(obj)) => Value::Object(obj.clone()),
        // Some models double-encode the arguments
        Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Object(obj)) => Value::Object(obj),
            _ => return Err(format!("Arguments for '{}' must be an object", name)),
        },
        Some(_) => return Err(format!("Arguments for '{}' must be an object", name)),
    };

    Ok(EmbeddedCall {
        is_call: true,
        name,
        args,
        error: None,
    })
}
