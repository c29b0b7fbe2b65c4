//! run_cascade - invoke a sub-cascade from inside a cell

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::tackle::{Tool, ToolContext, ToolResult};

/// Run another cascade and return its final artifact
///
/// The spawner re-enters the engine with depth+1 and the current session
/// as parent; identity is inherited automatically.
pub struct RunCascadeTool;

#[async_trait]
impl Tool for RunCascadeTool {
    fn name(&self) -> &str {
        "run_cascade"
    }

    fn description(&self) -> &str {
        "Run a cascade file with the given inputs and return its final output."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Cascade file path" },
                "inputs": { "type": "object", "description": "Inputs for the cascade" }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolResult {
        let Some(path) = input.get("path").and_then(|v| v.as_str()) else {
            return ToolResult::error("Missing required parameter: path");
        };
        let Some(spawner) = &ctx.spawner else {
            return ToolResult::error("Sub-cascades are not available in this execution context");
        };
        let inputs = input.get("inputs").cloned().unwrap_or(json!({}));

        match spawner.run_cascade(path, inputs).await {
            Ok(output) => ToolResult::success(output.to_string()).with_metadata(json!({"cascade": path})),
            Err(e) => ToolResult::error(format!("Sub-cascade '{}' failed: {}", path, e)),
        }
    }
}
