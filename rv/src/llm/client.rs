//! LlmClient trait definition

use async_trait::async_trait;

use super::{CompletionRequest, CompletionResponse, LlmError, UsageRecord};

/// Stateless LLM client - each call is independent
///
/// This is the core abstraction for invoking language models. No
/// conversation state is kept between calls; the context builder hands
/// each request the full message sequence it needs. Implementations
/// retain usage records per request id so the log sink can enrich cost
/// synchronously after the call.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a single completion request (blocking until complete)
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// Fetch the provider usage+cost record for a completed request
    ///
    /// Returns None if the request id is unknown or the record has not
    /// landed yet; the sink retries with a short bounded backoff.
    async fn usage_record(&self, request_id: &str) -> Option<UsageRecord>;

    /// Provider name written to log rows
    fn provider(&self) -> &str;

    /// Model used when a request does not override it
    fn default_model(&self) -> &str;
}

pub mod mock {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tracing::debug;

    use super::*;
    use crate::llm::{StopReason, TokenUsage, ToolCall};

    /// One scripted reply for the mock client
    #[derive(Debug, Clone)]
    pub struct MockReply {
        pub content: Option<String>,
        pub tool_calls: Vec<ToolCall>,
        pub stop_reason: StopReason,
        pub usage: TokenUsage,
        /// Artificial latency before the reply returns
        pub delay: Option<Duration>,
        /// Fail with this error instead of replying
        pub error: Option<String>,
    }

    impl MockReply {
        /// Plain text reply
        pub fn text(content: impl Into<String>) -> Self {
            Self {
                content: Some(content.into()),
                tool_calls: vec![],
                stop_reason: StopReason::EndTurn,
                usage: TokenUsage {
                    input_tokens: 100,
                    output_tokens: 20,
                },
                delay: None,
                error: None,
            }
        }

        /// Reply requesting a tool call
        pub fn tool_use(name: impl Into<String>, input: serde_json::Value) -> Self {
            let name = name.into();
            Self {
                content: None,
                tool_calls: vec![ToolCall {
                    id: format!("call_{}", name),
                    name,
                    input,
                }],
                stop_reason: StopReason::ToolUse,
                usage: TokenUsage {
                    input_tokens: 100,
                    output_tokens: 20,
                },
                delay: None,
                error: None,
            }
        }

        /// Reply that fails with a provider error
        pub fn failure(message: impl Into<String>) -> Self {
            Self {
                content: None,
                tool_calls: vec![],
                stop_reason: StopReason::EndTurn,
                usage: TokenUsage::default(),
                delay: None,
                error: Some(message.into()),
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
            self.usage = TokenUsage {
                input_tokens,
                output_tokens,
            };
            self
        }
    }

    /// Mock LLM client for unit tests
    ///
    /// Replies are consumed in order; requests beyond the script fail.
    /// Every completed call records a usage record keyed by the minted
    /// request id, mirroring a real provider's usage endpoint.
    pub struct MockLlmClient {
        replies: Mutex<Vec<MockReply>>,
        call_count: AtomicUsize,
        requests: Mutex<Vec<CompletionRequest>>,
        usage: Mutex<HashMap<String, UsageRecord>>,
        model: String,
    }

    impl MockLlmClient {
        pub fn new(replies: Vec<MockReply>) -> Self {
            debug!(reply_count = replies.len(), "MockLlmClient::new: called");
            Self {
                replies: Mutex::new(replies),
                call_count: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
                usage: Mutex::new(HashMap::new()),
                model: "mock-sonnet".to_string(),
            }
        }

        /// Script a single text reply
        pub fn single(content: impl Into<String>) -> Self {
            Self::new(vec![MockReply::text(content)])
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }

        /// Requests the client has seen, in order
        pub fn requests(&self) -> Vec<CompletionRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LlmClient for MockLlmClient {
        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
            debug!(idx, "MockLlmClient::complete: called");
            self.requests.lock().unwrap().push(request.clone());

            let reply = {
                let mut replies = self.replies.lock().unwrap();
                if replies.is_empty() {
                    return Err(LlmError::InvalidResponse("No more mock replies".to_string()));
                }
                replies.remove(0)
            };

            if let Some(delay) = reply.delay {
                tokio::time::sleep(delay).await;
            }

            if let Some(message) = reply.error {
                return Err(LlmError::ApiError { status: 500, message });
            }

            let model = request.model.unwrap_or_else(|| self.model.clone());
            let request_id = format!("mock-req-{}", idx);
            let cost = reply.usage.cost_usd(&model);
            self.usage.lock().unwrap().insert(
                request_id.clone(),
                UsageRecord {
                    request_id: request_id.clone(),
                    tokens_in: reply.usage.input_tokens,
                    tokens_out: reply.usage.output_tokens,
                    cost,
                },
            );

            Ok(CompletionResponse {
                content: reply.content,
                tool_calls: reply.tool_calls,
                stop_reason: reply.stop_reason,
                usage: reply.usage,
                request_id,
                model,
            })
        }

        async fn usage_record(&self, request_id: &str) -> Option<UsageRecord> {
            self.usage.lock().unwrap().get(request_id).cloned()
        }

        fn provider(&self) -> &str {
            "mock"
        }

        fn default_model(&self) -> &str {
            &self.model
        }
    }

}
