//! Read file tool - deterministic file access for cells

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::tackle::{Tool, ToolContext, ToolResult};

/// Read a text file from disk
pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file from disk and return its contents."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path of the file to read"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, input: Value, _ctx: &ToolContext) -> ToolResult {
        let Some(path) = input.get("path").and_then(|v| v.as_str()) else {
            return ToolResult::error("Missing required parameter: path");
        };

        match tokio::fs::read_to_string(path).await {
            Ok(content) => ToolResult::success(content).with_metadata(json!({"path": path})),
            Err(e) => ToolResult::error(format!("Failed to read {}: {}", path, e)),
        }
    }
}
