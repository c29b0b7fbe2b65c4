//! LLM request/response types
//!
//! Provider-agnostic shapes modeled on the Anthropic Messages API. Every
//! completion is stamped with a `request_id` so the log sink can fetch
//! the provider's usage record and enrich cost synchronously.

use serde::{Deserialize, Serialize};

/// A completion request - everything needed for one LLM call
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// System prompt (rendered instructions plus tool guidance)
    pub system_prompt: String,

    /// Conversation messages assembled by the context builder
    pub messages: Vec<Message>,

    /// Tools exposed for this call
    pub tools: Vec<ToolDefinition>,

    /// Max tokens for response
    pub max_tokens: u32,

    /// Model override for this call (None uses the client default)
    pub model: Option<String>,
}

/// A message in the conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    /// Create a user message with text content
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    /// Create an assistant message with text content
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    /// Create a system message with text content
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    /// Create a user message with multiple content blocks
    pub fn user_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Blocks(blocks),
        }
    }

    /// Create an assistant message with multiple content blocks
    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Blocks(blocks),
        }
    }

    /// Text of the message, flattening blocks
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// True when the message carries no usable content at all
    pub fn is_empty(&self) -> bool {
        match &self.content {
            MessageContent::Text(text) => text.trim().is_empty(),
            MessageContent::Blocks(blocks) => {
                blocks.is_empty()
                    || blocks.iter().all(|b| match b {
                        ContentBlock::Text { text } => text.trim().is_empty(),
                        _ => false,
                    })
            }
        }
    }

    /// True when any block carries image data
    pub fn has_images(&self) -> bool {
        match &self.content {
            MessageContent::Text(_) => false,
            MessageContent::Blocks(blocks) => blocks.iter().any(|b| matches!(b, ContentBlock::Image { .. })),
        }
    }
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

/// Message content - either plain text or structured blocks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// A content block in a message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },

    /// An image, stored on disk; `base64` is populated only while the
    /// image still needs to reach the provider and is culled afterwards.
    #[serde(rename = "image")]
    Image {
        path: String,
        media_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        base64: Option<String>,
    },
}

impl ContentBlock {
    /// Create a text content block
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    /// Create a tool result block
    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        ContentBlock::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error,
        }
    }
}

/// Response from a completion request
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    /// Text content (if any)
    pub content: Option<String>,

    /// Tool calls requested by the model
    pub tool_calls: Vec<ToolCall>,

    /// Why the model stopped
    pub stop_reason: StopReason,

    /// Token usage for cost tracking
    pub usage: TokenUsage,

    /// Provider request id, key into the usage record lookup
    pub request_id: String,

    /// Model that served the request
    pub model: String,
}

/// A tool call requested by the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// Why the model stopped generating
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
}

impl StopReason {
    /// Parse from a provider stop_reason string
    pub fn from_provider(s: &str) -> Self {
        match s {
            "end_turn" => StopReason::EndTurn,
            "tool_use" => StopReason::ToolUse,
            "max_tokens" => StopReason::MaxTokens,
            "stop_sequence" => StopReason::StopSequence,
            _ => StopReason::EndTurn,
        }
    }
}

/// Token usage for cost tracking
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    /// Calculate cost in USD based on model pricing
    pub fn cost_usd(&self, model: &str) -> f64 {
        let (input_price, output_price) = match model {
            m if m.contains("opus") => (15.0, 75.0),
            m if m.contains("sonnet") => (3.0, 15.0),
            m if m.contains("haiku") => (0.25, 1.25),
            _ => (3.0, 15.0), // Default to sonnet pricing
        };

        let input_cost = (self.input_tokens as f64 / 1_000_000.0) * input_price;
        let output_cost = (self.output_tokens as f64 / 1_000_000.0) * output_price;

        input_cost + output_cost
    }
}

/// Provider-side usage record for a completed request
///
/// The sink fetches this by `request_id` to enrich the agent row before
/// it is written; there is never a later cost-update row.
#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub request_id: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
}

/// Tool definition for the LLM
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

impl ToolDefinition {
    /// Create a new tool definition
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }

    /// Convert to provider wire format
    pub fn to_wire_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "input_schema": self.input_schema,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_text_flattening() {
        let msg = Message::assistant_blocks(vec![
            ContentBlock::text("first"),
            ContentBlock::ToolUse {
                id: "t1".into(),
                name: "query".into(),
                input: serde_json::json!({}),
            },
            ContentBlock::text("second"),
        ]);
        assert_eq!(msg.text(), "first\nsecond");
    }

    #[test]
    fn test_message_is_empty() {
        assert!(Message::assistant("").is_empty());
        assert!(Message::assistant("   ").is_empty());
        assert!(!Message::assistant("x").is_empty());
        assert!(Message::assistant_blocks(vec![]).is_empty());
        assert!(Message::assistant_blocks(vec![ContentBlock::text("  ")]).is_empty());
        // A tool-use block counts as content even with no text
        assert!(
            !Message::assistant_blocks(vec![ContentBlock::ToolUse {
                id: "t".into(),
                name: "n".into(),
                input: serde_json::json!({})
            }])
            .is_empty()
        );
    }

    #[test]
    fn test_has_images() {
        let msg = Message::user_blocks(vec![ContentBlock::Image {
            path: "/tmp/a.png".into(),
            media_type: "image/png".into(),
            base64: Some("aGk=".into()),
        }]);
        assert!(msg.has_images());
        assert!(!Message::user("plain").has_images());
    }

    #[test]
    fn test_stop_reason_from_provider() {
        assert_eq!(StopReason::from_provider("end_turn"), StopReason::EndTurn);
        assert_eq!(StopReason::from_provider("tool_use"), StopReason::ToolUse);
        assert_eq!(StopReason::from_provider("max_tokens"), StopReason::MaxTokens);
        assert_eq!(StopReason::from_provider("unknown"), StopReason::EndTurn);
    }

    #[test]
    fn test_token_usage_cost() {
        let usage = TokenUsage {
            input_tokens: 1_000_000,
            output_tokens: 100_000,
        };
        // Sonnet: $3/M input, $15/M output
        let cost = usage.cost_usd("claude-sonnet-4");
        assert!((cost - 4.5).abs() < 0.01);

        // Opus: $15/M input, $75/M output
        let cost = usage.cost_usd("claude-opus-4");
        assert!((cost - 22.5).abs() < 0.01);
    }

    #[test]
    fn test_tool_definition_wire_schema() {
        let tool = ToolDefinition::new(
            "run_query",
            "Run a SQL query",
            serde_json::json!({
                "type": "object",
                "properties": { "sql": { "type": "string" } },
                "required": ["sql"]
            }),
        );

        let schema = tool.to_wire_schema();
        assert_eq!(schema["name"], "run_query");
        assert!(schema["input_schema"].is_object());
    }
}
