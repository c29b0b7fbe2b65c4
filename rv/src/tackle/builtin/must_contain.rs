//! must_contain - a deterministic ward validator
//!
//! Returns the `{valid, reason}` envelope the ward engine expects.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::tackle::{Tool, ToolContext, ToolResult};

/// Check that text contains a required substring
pub struct MustContainTool;

#[async_trait]
impl Tool for MustContainTool {
    fn name(&self) -> &str {
        "must_contain"
    }

    fn description(&self) -> &str {
        "Validate that text contains a required substring. Returns {valid, reason}."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": "Text to check" },
                "needle": { "type": "string", "description": "Required substring" }
            },
            "required": ["text", "needle"]
        })
    }

    async fn execute(&self, input: Value, _ctx: &ToolContext) -> ToolResult {
        let text = input.get("text").and_then(|v| v.as_str()).unwrap_or_default();
        let Some(needle) = input.get("needle").and_then(|v| v.as_str()) else {
            return ToolResult::error("Missing required parameter: needle");
        };

        let valid = text.contains(needle);
        let verdict = json!({
            "valid": valid,
            "reason": if valid {
                format!("contains '{}'", needle)
            } else {
                format!("output does not contain '{}'", needle)
            },
        });
        ToolResult::success(verdict.to_string())
    }
}
