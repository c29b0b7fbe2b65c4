//! Prompt-based tool-call parsing
//!
//! Some models emit tool calls as JSON inside content rather than
//! structured blocks. The parser strips markdown fences, attempts a
//! standard parse, and on failure rebalances closing braces (a common
//! model error is a run of extra `}`s). A repair that succeeds is
//! surfaced with a warning flag; a parse that still fails raises a
//! recoverable parse error. Tool calls are never silently dropped.

use serde_json::Value;
use tracing::warn;

use crate::errors::RunError;

/// A tool call recovered from content, with a repair marker
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedToolCall {
    pub tool: String,
    pub arguments: Value,
    /// True when the JSON only parsed after brace rebalancing
    pub repaired: bool,
}

impl ParsedToolCall {
    /// Canonical JSON of the call (what lands in `tool_calls_json`)
    pub fn canonical_json(&self) -> Value {
        serde_json::json!({
            "tool": self.tool,
            "arguments": self.arguments,
        })
    }
}

/// Parse a tool call from model content
pub fn parse_tool_call(content: &str) -> Result<ParsedToolCall, RunError> {
    let stripped = strip_fences(content);

    if let Some(call) = try_parse(stripped) {
        return Ok(ParsedToolCall {
            tool: call.0,
            arguments: call.1,
            repaired: false,
        });
    }

    let rebalanced = rebalance_braces(stripped);
    if let Some(call) = try_parse(&rebalanced) {
        warn!("parse_tool_call: recovered tool call after brace rebalancing");
        return Ok(ParsedToolCall {
            tool: call.0,
            arguments: call.1,
            repaired: true,
        });
    }

    Err(RunError::Parse(format!(
        "Tool-call JSON unparseable after repair: {}",
        truncate(stripped, 200)
    )))
}

/// Remove a surrounding markdown code fence, if any
fn strip_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json", "JSON", ...) up to the first newline
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.strip_suffix("```").unwrap_or(body).trim()
}

/// Rebalance closing braces: if `}` outnumber `{`, trim trailing `}`s so
/// the counts match exactly
fn rebalance_braces(content: &str) -> String {
    let open = content.matches('{').count();
    let close = content.matches('}').count();
    if close <= open {
        return content.to_string();
    }

    let mut excess = close - open;
    let mut out = content.trim_end().to_string();
    while excess > 0 && out.ends_with('}') {
        out.pop();
        out.truncate(out.trim_end().len());
        excess -= 1;
    }
    out
}

fn try_parse(content: &str) -> Option<(String, Value)> {
    let value: Value = serde_json::from_str(content).ok()?;
    let obj = value.as_object()?;
    // Accept both {"tool": ..} and {"name": ..} envelopes
    let tool = obj
        .get("tool")
        .or_else(|| obj.get("name"))?
        .as_str()?
        .to_string();
    let arguments = obj
        .get("arguments")
        .or_else(|| obj.get("input"))
        .cloned()
        .unwrap_or(Value::Null);
    Some((tool, arguments))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// True when content looks like it may carry an inline tool call
pub fn looks_like_tool_call(content: &str) -> bool {
    let stripped = strip_fences(content);
    stripped.starts_with('{') && (stripped.contains("\"tool\"") || stripped.contains("\"name\""))
}
