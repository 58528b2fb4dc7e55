//! Provider-facing wire types (§6 EXTERNAL INTERFACES, §9 DESIGN NOTES).
//!
//! The source treats provider response content as a loose array of tagged
//! objects; here it is an explicit serde tagged enum with one variant per
//! documented content kind.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: serde_json::Value },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
    Thinking { text: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, content: vec![ContentBlock::Text { text: text.into() }] }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: vec![ContentBlock::Text { text: text.into() }] }
    }

    pub fn assistant_tool_use(blocks: Vec<ContentBlock>) -> Self {
        Self { role: Role::Assistant, content: blocks }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        Self {
            role: Role::Tool,
            content: vec![ContentBlock::ToolResult { tool_use_id: tool_use_id.into(), content: content.into(), is_error }],
        }
    }

    /// Flattened text view used by the complexity heuristic and logging.
    pub fn as_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::Thinking { text } => Some(text.as_str()),
                ContentBlock::ToolResult { content, .. } => Some(content.as_str()),
                ContentBlock::ToolUse { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON-schema input contract, as returned by a `Tool`'s own schema.
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub system: Option<String>,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
    pub max_tokens: u32,
    #[serde(default)]
    pub enable_thinking: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Error,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub model: String,
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: Usage,
}

impl CompletionResponse {
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn tool_uses(&self) -> Vec<(&str, &str, &serde_json::Value)> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => Some((id.as_str(), name.as_str(), input)),
                _ => None,
            })
            .collect()
    }
}

/// Declared capability of a provider/model combination. Ordinal order lets
/// `selectProvider` answer "matches or exceeds" with a plain comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Fast,
    Standard,
    Capable,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("{provider} request failed: {message}")]
    Request { provider: String, message: String, status: Option<u16> },
    #[error("{provider} unavailable: missing credential")]
    Unavailable { provider: String },
    #[error("{provider} circuit breaker open")]
    CircuitOpen { provider: String },
}

const CONTEXT_OVERFLOW_PHRASES: &[&str] = &["context", "token", "too long", "maximum", "limit"];

impl ProviderError {
    /// Status 400/413, or a message whose lowercased form contains one of
    /// the canonical context-overflow phrases (§8 boundary behaviour).
    pub fn is_context_overflow(&self) -> bool {
        match self {
            ProviderError::Request { message, status, .. } => {
                matches!(status, Some(400) | Some(413))
                    || CONTEXT_OVERFLOW_PHRASES.iter().any(|p| message.to_lowercase().contains(p))
            }
            _ => false,
        }
    }

    pub fn provider_name(&self) -> &str {
        match self {
            ProviderError::Request { provider, .. } => provider,
            ProviderError::Unavailable { provider } => provider,
            ProviderError::CircuitOpen { provider } => provider,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_overflow_detected_by_status() {
        let err = ProviderError::Request { provider: "x".into(), message: "boom".into(), status: Some(413) };
        assert!(err.is_context_overflow());
    }

    #[test]
    fn context_overflow_detected_by_message_keyword() {
        let err = ProviderError::Request {
            provider: "x".into(),
            message: "Request exceeded the maximum context length".into(),
            status: None,
        };
        assert!(err.is_context_overflow());
    }

    #[test]
    fn unrelated_error_is_not_context_overflow() {
        let err = ProviderError::Request { provider: "x".into(), message: "connection reset".into(), status: Some(502) };
        assert!(!err.is_context_overflow());
    }

    #[test]
    fn message_as_text_flattens_blocks_and_skips_tool_use() {
        let msg = Message {
            role: Role::Assistant,
            content: vec![
                ContentBlock::Text { text: "hello".into() },
                ContentBlock::ToolUse { id: "1".into(), name: "x".into(), input: serde_json::json!({}) },
                ContentBlock::Thinking { text: "pondering".into() },
            ],
        };
        assert_eq!(msg.as_text(), "hello\npondering");
    }

    #[test]
    fn tier_ordinal_ordering_matches_capability() {
        assert!(Tier::Fast < Tier::Standard);
        assert!(Tier::Standard < Tier::Capable);
    }
}
