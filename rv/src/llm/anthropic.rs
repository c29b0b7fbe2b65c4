//! Anthropic Claude API client implementation
//!
//! Implements the LlmClient trait for Anthropic's Messages API. Usage
//! records are retained per request id so the log sink can enrich cost
//! without a second provider round-trip.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::{
    CompletionRequest, CompletionResponse, ContentBlock, LlmClient, LlmError, Message, MessageContent, StopReason,
    TokenUsage, ToolCall, UsageRecord,
};
use crate::config::LlmConfig;

/// Anthropic Claude API client
pub struct AnthropicClient {
    model: String,
    api_key: String,
    base_url: String,
    http: Client,
    max_tokens: u32,
    usage: Mutex<HashMap<String, UsageRecord>>,
}

impl AnthropicClient {
    /// Create a new client from configuration
    ///
    /// Reads the API key from the environment variable specified in config.
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| LlmError::InvalidResponse(format!("Environment variable {} not set", config.api_key_env)))?;

        let timeout = Duration::from_millis(config.timeout_ms);
        let http = Client::builder().timeout(timeout).build().map_err(LlmError::Network)?;

        Ok(Self {
            model: config.model.clone(),
            api_key,
            base_url: config.base_url.clone(),
            http,
            max_tokens: config.max_tokens,
            usage: Mutex::new(HashMap::new()),
        })
    }

    /// Build the request body for the Anthropic API
    fn build_request_body(&self, request: &CompletionRequest) -> serde_json::Value {
        let model = request.model.as_deref().unwrap_or(&self.model);
        let mut body = serde_json::json!({
            "model": model,
            "max_tokens": request.max_tokens.min(self.max_tokens),
            "system": request.system_prompt,
            "messages": convert_messages(&request.messages),
        });

        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(
                request.tools.iter().map(|t| t.to_wire_schema()).collect::<Vec<_>>()
            );
        }

        body
    }

    /// Parse the Anthropic API response
    fn parse_response(&self, api_response: AnthropicResponse) -> CompletionResponse {
        let mut content = None;
        let mut tool_calls = Vec::new();

        for block in api_response.content {
            match block {
                AnthropicContentBlock::Text { text } => {
                    content = Some(text);
                }
                AnthropicContentBlock::ToolUse { id, name, input } => {
                    tool_calls.push(ToolCall { id, name, input });
                }
            }
        }

        let usage = TokenUsage {
            input_tokens: api_response.usage.input_tokens,
            output_tokens: api_response.usage.output_tokens,
        };

        CompletionResponse {
            content,
            tool_calls,
            stop_reason: StopReason::from_provider(&api_response.stop_reason),
            usage,
            request_id: api_response.id,
            model: api_response.model,
        }
    }
}

/// Convert internal Message types to Anthropic API format
fn convert_messages(messages: &[Message]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|msg| {
            let role = match msg.role {
                super::Role::Assistant => "assistant",
                // Tool results and system recaps travel as user turns on the wire
                _ => "user",
            };
            let content = match &msg.content {
                MessageContent::Text(text) => serde_json::json!(text),
                MessageContent::Blocks(blocks) => {
                    serde_json::json!(blocks.iter().map(convert_content_block).collect::<Vec<_>>())
                }
            };

            serde_json::json!({
                "role": role,
                "content": content,
            })
        })
        .collect()
}

/// Convert a ContentBlock to Anthropic API format
fn convert_content_block(block: &ContentBlock) -> serde_json::Value {
    match block {
        ContentBlock::Text { text } => {
            serde_json::json!({
                "type": "text",
                "text": text,
            })
        }
        ContentBlock::ToolUse { id, name, input } => {
            serde_json::json!({
                "type": "tool_use",
                "id": id,
                "name": name,
                "input": input,
            })
        }
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => {
            serde_json::json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content,
                "is_error": is_error,
            })
        }
        ContentBlock::Image {
            path,
            media_type,
            base64,
        } => match base64 {
            Some(data) => serde_json::json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": media_type,
                    "data": data,
                },
            }),
            // Culled image: keep a textual placeholder so the turn stays coherent
            None => serde_json::json!({
                "type": "text",
                "text": format!("[image saved to {}]", path),
            }),
        },
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_request_body(&request);
        debug!(model = %request.model.as_deref().unwrap_or(&self.model), "AnthropicClient::complete: sending request");

        let http_response = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(LlmError::Network)?;

        let status = http_response.status();
        if status.as_u16() == 429 {
            let retry_after = http_response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(60));
            return Err(LlmError::RateLimited { retry_after });
        }

        if !status.is_success() {
            let message = http_response.text().await.unwrap_or_default();
            return Err(LlmError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let api_response: AnthropicResponse = http_response.json().await.map_err(LlmError::Network)?;
        let response = self.parse_response(api_response);

        // Retain the usage record for the sink's synchronous enrichment
        let cost = response.usage.cost_usd(&response.model);
        self.usage.lock().unwrap_or_else(|p| p.into_inner()).insert(
            response.request_id.clone(),
            UsageRecord {
                request_id: response.request_id.clone(),
                tokens_in: response.usage.input_tokens,
                tokens_out: response.usage.output_tokens,
                cost,
            },
        );

        debug!(request_id = %response.request_id, stop_reason = ?response.stop_reason, "AnthropicClient::complete: response received");
        Ok(response)
    }

    async fn usage_record(&self, request_id: &str) -> Option<UsageRecord> {
        self.usage
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(request_id)
            .cloned()
    }

    fn provider(&self) -> &str {
        "anthropic"
    }

    fn default_model(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    id: String,
    model: String,
    content: Vec<AnthropicContentBlock>,
    stop_reason: String,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum AnthropicContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_messages_roles() {
        let messages = vec![Message::user("hi"), Message::assistant("hello")];
        let wire = convert_messages(&messages);
        assert_eq!(wire[0]["role"], "user");
        assert_eq!(wire[1]["role"], "assistant");
    }

    #[test]
    fn test_culled_image_becomes_placeholder() {
        let block = ContentBlock::Image {
            path: "/tmp/chart.png".into(),
            media_type: "image/png".into(),
            base64: None,
        };
        let wire = convert_content_block(&block);
        assert_eq!(wire["type"], "text");
        assert!(wire["text"].as_str().unwrap().contains("/tmp/chart.png"));
    }

    #[test]
    fn test_live_image_keeps_base64() {
        let block = ContentBlock::Image {
            path: "/tmp/chart.png".into(),
            media_type: "image/png".into(),
            base64: Some("aGk=".into()),
        };
        let wire = convert_content_block(&block);
        assert_eq!(wire["type"], "image");
        assert_eq!(wire["source"]["data"], "aGk=");
    }

    #[test]
    fn test_response_parsing() {
        let json = serde_json::json!({
            "id": "msg_123",
            "model": "claude-sonnet-4",
            "content": [
                {"type": "text", "text": "Answer"},
                {"type": "tool_use", "id": "tu_1", "name": "run_query", "input": {"sql": "SELECT 1"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 5}
        });
        let api: AnthropicResponse = serde_json::from_value(json).unwrap();
        assert_eq!(api.id, "msg_123");
        assert_eq!(api.content.len(), 2);
    }
}
