//! ContextBuilder - assembles the message sequence fed to the LLM
//!
//! Ordering is fixed: training exemplars, then the cell's input prompt
//! (with inherited context), then prior turns of the same cell. Three
//! hygiene rules are enforced here rather than downstream:
//!
//! - no assistant message with empty content is ever appended
//! - image bytes are culled from history before follow-up calls
//! - oversized text tool results spill to disk, leaving a stub
//!
//! A token budget drops the oldest non-essential messages; essential
//! are the cell input and the most recent turn's tool results.

use std::path::PathBuf;
use std::sync::Arc;

use echolog::LogStore;
use tracing::{debug, warn};

use crate::cascade::CellSpec;
use crate::llm::{CompletionResponse, ContentBlock, Message, MessageContent};
use crate::session::Echo;
use crate::tackle::ToolResult;

/// Rough chars-per-token for budget math
const CHARS_PER_TOKEN: usize = 4;

/// Builds message sequences for cell invocations
#[derive(Clone)]
pub struct ContextBuilder {
    log: Arc<dyn LogStore>,
    /// Message-history budget in (approximate) tokens
    budget_tokens: usize,
    /// Text tool results beyond this many chars spill to disk
    truncate_chars: usize,
    artifact_dir: PathBuf,
}

impl ContextBuilder {
    pub fn new(log: Arc<dyn LogStore>) -> Self {
        Self {
            log,
            budget_tokens: 100_000,
            truncate_chars: 8_000,
            artifact_dir: std::env::temp_dir().join("rvbbit-artifacts"),
        }
    }

    pub fn with_budget_tokens(mut self, budget_tokens: usize) -> Self {
        self.budget_tokens = budget_tokens;
        self
    }

    pub fn with_truncate_chars(mut self, truncate_chars: usize) -> Self {
        self.truncate_chars = truncate_chars;
        self
    }

    pub fn with_artifact_dir(mut self, dir: PathBuf) -> Self {
        self.artifact_dir = dir;
        self
    }

    /// Build the opening messages for a cell invocation
    ///
    /// `input_prompt` is the rendered instructions; `seed` carries the
    /// prior transcript for candidate/refinement re-entries.
    pub fn initial_messages(&self, cell: &CellSpec, echo: &Echo, input_prompt: &str, seed: &[Message]) -> Vec<Message> {
        let mut messages = Vec::new();

        // Few-shot exemplars from prior verified outputs
        if cell.use_training {
            for exemplar in self.fetch_exemplars(cell, echo) {
                messages.push(Message::user(format!("Produce output for cell '{}'.", cell.name)));
                messages.push(Message::assistant(exemplar));
            }
        }

        // Inherited context, as declared; the default is a clean slate
        let mut prompt = String::new();
        for reference in &cell.context {
            if let Some(state_key) = reference.strip_prefix("state.") {
                if let Some(value) = echo.state.get(state_key) {
                    prompt.push_str(&format!("State '{}': {}\n", state_key, value));
                }
            } else if let Some(output) = echo.cell_output(reference) {
                prompt.push_str(&format!("Output of cell '{}': {}\n", reference, render_value(output)));
            }
        }
        prompt.push_str(input_prompt);
        messages.push(Message::user(prompt));

        // Candidate/refinement re-entries continue the prior transcript
        messages.extend_from_slice(seed);

        self.enforce_budget(&mut messages);
        messages
    }

    fn fetch_exemplars(&self, cell: &CellSpec, echo: &Echo) -> Vec<String> {
        match self.log.training_exemplars(&echo.cascade_id, &cell.name, cell.training_limit) {
            Ok(exemplars) => exemplars
                .into_iter()
                .filter_map(|json| serde_json::from_str::<serde_json::Value>(&json).ok())
                .map(|v| render_value(&v))
                .collect(),
            Err(e) => {
                warn!(cell_name = %cell.name, error = %e, "ContextBuilder: exemplar fetch failed");
                Vec::new()
            }
        }
    }

    /// Append the assistant response; refuses empty content
    ///
    /// Returns false (and logs) when the response had nothing to say -
    /// the caller records the event but the message never enters history.
    pub fn append_assistant(&self, messages: &mut Vec<Message>, response: &CompletionResponse) -> bool {
        let mut blocks = Vec::new();
        if let Some(text) = &response.content {
            if !text.trim().is_empty() {
                blocks.push(ContentBlock::text(text));
            }
        }
        for call in &response.tool_calls {
            blocks.push(ContentBlock::ToolUse {
                id: call.id.clone(),
                name: call.name.clone(),
                input: call.input.clone(),
            });
        }

        if blocks.is_empty() {
            warn!("ContextBuilder: dropping empty assistant message from history");
            return false;
        }
        messages.push(Message::assistant_blocks(blocks));
        true
    }

    /// Build the user message carrying one turn's tool results
    ///
    /// Oversized text spills to disk; images ride along as blocks with
    /// their bytes still attached (culled later, after the follow-up).
    pub fn tool_result_message(&self, results: &[(String, ToolResult)]) -> Message {
        let mut blocks = Vec::new();
        for (id, result) in results {
            let content = self.spill_if_oversized(&result.content);
            blocks.push(ContentBlock::tool_result(id, content, result.is_error));
            for image in &result.images {
                blocks.push(ContentBlock::Image {
                    path: image.path.clone(),
                    media_type: image.media_type.clone(),
                    base64: image.base64.clone(),
                });
            }
        }
        Message::user_blocks(blocks)
    }

    fn spill_if_oversized(&self, content: &str) -> String {
        if content.len() <= self.truncate_chars {
            return content.to_string();
        }
        let name = format!("tool-result-{}.txt", uuid::Uuid::now_v7().simple());
        let path = self.artifact_dir.join(name);
        if let Err(e) = std::fs::create_dir_all(&self.artifact_dir) {
            warn!(error = %e, "ContextBuilder: artifact dir unavailable, truncating in place");
        } else if let Err(e) = std::fs::write(&path, content) {
            warn!(error = %e, "ContextBuilder: spill write failed, truncating in place");
        } else {
            debug!(path = %path.display(), original_len = content.len(), "ContextBuilder: spilled oversized tool result");
            return format!(
                "{}...\n[truncated; full {} chars at {}]",
                &content[..self.truncate_chars],
                content.len(),
                path.display()
            );
        }
        format!("{}...\n[truncated from {} chars]", &content[..self.truncate_chars], content.len())
    }

    /// Remove image bytes from history before a follow-up call
    ///
    /// Follow-ups produce short acknowledgements and don't need visual
    /// re-analysis; the on-disk path stays in the block.
    pub fn cull_images(&self, messages: &mut [Message]) {
        for message in messages.iter_mut() {
            if let MessageContent::Blocks(blocks) = &mut message.content {
                for block in blocks.iter_mut() {
                    if let ContentBlock::Image { base64, .. } = block {
                        *base64 = None;
                    }
                }
            }
        }
    }

    /// Drop oldest non-essential messages to fit the token budget
    ///
    /// Essential: the first user message (cell input) and everything
    /// from the most recent turn boundary onward.
    pub fn enforce_budget(&self, messages: &mut Vec<Message>) -> usize {
        let budget_chars = self.budget_tokens * CHARS_PER_TOKEN;
        let mut total: usize = messages.iter().map(message_chars).sum();
        if total <= budget_chars {
            return 0;
        }

        // Protect the tail: the last assistant turn and its tool results
        let protected_tail = messages.len().saturating_sub(2);
        let mut dropped = 0;
        let mut idx = 1; // index 0 is the cell input
        while total > budget_chars && idx < protected_tail.saturating_sub(dropped) {
            let removed = messages.remove(1);
            total -= message_chars(&removed);
            dropped += 1;
            idx += 1;
        }
        if dropped > 0 {
            debug!(dropped, "ContextBuilder: dropped messages to fit token budget");
        }
        dropped
    }
}

fn message_chars(message: &Message) -> usize {
    match &message.content {
        MessageContent::Text(text) => text.len(),
        MessageContent::Blocks(blocks) => blocks
            .iter()
            .map(|b| match b {
                ContentBlock::Text { text } => text.len(),
                ContentBlock::ToolUse { input, .. } => input.to_string().len(),
                ContentBlock::ToolResult { content, .. } => content.len(),
                ContentBlock::Image { base64, .. } => base64.as_ref().map(|b| b.len()).unwrap_or(0),
            })
            .sum(),
    }
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{StopReason, TokenUsage};
    use echolog::{LogRow, MemoryStore, NodeType};

    fn builder() -> (ContextBuilder, Arc<MemoryStore>) {
        let log = Arc::new(MemoryStore::new());
        (ContextBuilder::new(log.clone() as Arc<dyn LogStore>), log)
    }

    fn echo() -> Echo {
        Echo::new("s1", "c1", None, 0, "", serde_json::json!({}), serde_json::json!({}))
    }

    fn response(content: Option<&str>) -> CompletionResponse {
        CompletionResponse {
            content: content.map(|s| s.to_string()),
            tool_calls: vec![],
            stop_reason: StopReason::EndTurn,
            usage: TokenUsage::default(),
            request_id: "r".into(),
            model: "m".into(),
        }
    }

    #[test]
    fn test_initial_messages_carry_declared_context() {
        let (builder, _) = builder();
        let mut e = echo();
        e.outputs.insert("draft".into(), serde_json::json!("the draft text"));
        e.state.insert("tone".into(), serde_json::json!("dry"));

        let cell = CellSpec {
            name: "verify".into(),
            instructions: Some("Check it".into()),
            context: vec!["draft".into(), "state.tone".into()],
            ..Default::default()
        };
        let messages = builder.initial_messages(&cell, &e, "Check it", &[]);
        let first = messages[0].text();
        assert!(first.contains("the draft text"));
        assert!(first.contains("dry"));
        assert!(first.ends_with("Check it"));
    }

    #[test]
    fn test_clean_slate_without_context_declaration() {
        let (builder, _) = builder();
        let mut e = echo();
        e.outputs.insert("draft".into(), serde_json::json!("secret"));

        let cell = CellSpec {
            name: "other".into(),
            instructions: Some("Go".into()),
            ..Default::default()
        };
        let messages = builder.initial_messages(&cell, &e, "Go", &[]);
        assert!(!messages[0].text().contains("secret"));
    }

    #[test]
    fn test_training_exemplars_included() {
        let (builder, log) = builder();
        log.append(
            &LogRow::new("prior", "c1", NodeType::CellComplete)
                .with_cell("draft")
                .with_text_content("exemplar output"),
        )
        .unwrap();

        let cell = CellSpec {
            name: "draft".into(),
            instructions: Some("Go".into()),
            use_training: true,
            training_limit: 3,
            ..Default::default()
        };
        let messages = builder.initial_messages(&cell, &echo(), "Go", &[]);
        // exemplar pair + input
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].text(), "exemplar output");
    }

    #[test]
    fn test_empty_assistant_never_appended() {
        let (builder, _) = builder();
        let mut messages = vec![Message::user("hi")];
        assert!(!builder.append_assistant(&mut messages, &response(None)));
        assert!(!builder.append_assistant(&mut messages, &response(Some("   "))));
        assert_eq!(messages.len(), 1);

        assert!(builder.append_assistant(&mut messages, &response(Some("real"))));
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn test_image_culling() {
        let (builder, _) = builder();
        let mut messages = vec![Message::user_blocks(vec![ContentBlock::Image {
            path: "/tmp/a.png".into(),
            media_type: "image/png".into(),
            base64: Some("bytes".into()),
        }])];
        builder.cull_images(&mut messages);
        let MessageContent::Blocks(blocks) = &messages[0].content else {
            panic!()
        };
        let ContentBlock::Image { base64, path, .. } = &blocks[0] else {
            panic!()
        };
        assert!(base64.is_none());
        assert_eq!(path, "/tmp/a.png");
    }

    #[test]
    fn test_oversized_tool_result_spills_to_disk() {
        let temp = tempfile::tempdir().unwrap();
        let (builder, _) = builder();
        let builder = builder
            .with_truncate_chars(100)
            .with_artifact_dir(temp.path().to_path_buf());

        let big = "x".repeat(500);
        let message = builder.tool_result_message(&[("t1".into(), ToolResult::success(big))]);
        let MessageContent::Blocks(blocks) = &message.content else { panic!() };
        let ContentBlock::ToolResult { content, .. } = &blocks[0] else { panic!() };
        assert!(content.contains("[truncated"));
        assert!(content.len() < 500);
        // The spilled file holds the full content
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_budget_drops_oldest_non_essential() {
        let (builder, _) = builder();
        let builder = builder.with_budget_tokens(50); // 200 chars

        let mut messages = vec![Message::user("cell input")];
        for turn in 0..10 {
            messages.push(Message::assistant("a".repeat(40)));
            messages.push(Message::user(format!("turn {}", turn)));
        }
        let last_before = messages.last().unwrap().text();
        let dropped = builder.enforce_budget(&mut messages);
        assert!(dropped > 0);
        // Cell input and the latest turn survive
        assert_eq!(messages[0].text(), "cell input");
        assert_eq!(messages.last().unwrap().text(), last_before);
    }
}
