//! Cascade-as-tool
//!
//! A standalone cascade discovered from a tool directory becomes a
//! first-class tool: its inputs schema is the tool schema, and invoking
//! it spawns a sub-cascade through the context's spawner.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::cascade::Cascade;

use super::{Tool, ToolContext, ToolResult};

/// A tool backed by a cascade file
pub struct CascadeTool {
    name: String,
    description: String,
    path: String,
    input_schema: Value,
}

impl CascadeTool {
    /// Wrap a loaded cascade; `name` defaults to the file stem
    pub fn from_cascade(name: impl Into<String>, path: impl Into<String>, cascade: &Cascade) -> Self {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for (field, descriptor) in &cascade.doc.inputs_schema {
            let description = match descriptor {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            properties.insert(field.clone(), json!({"type": "string", "description": description}));
            required.push(Value::String(field.clone()));
        }

        Self {
            name: name.into(),
            description: format!("Cascade '{}' run as a tool", cascade.doc.cascade_id),
            path: path.into(),
            input_schema: json!({
                "type": "object",
                "properties": properties,
                "required": required,
            }),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

#[async_trait]
impl Tool for CascadeTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> Value {
        self.input_schema.clone()
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolResult {
        let Some(spawner) = &ctx.spawner else {
            return ToolResult::error("Sub-cascades are not available in this execution context");
        };
        match spawner.run_cascade(&self.path, input).await {
            Ok(output) => ToolResult::success(output.to_string()).with_metadata(json!({"cascade": self.path})),
            Err(e) => ToolResult::error(format!("Cascade tool '{}' failed: {}", self.name, e)),
        }
    }
}
