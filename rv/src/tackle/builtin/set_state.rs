//! set_state - write a session state key from inside a cell

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::tackle::{Tool, ToolContext, ToolResult};

/// Write a key/value into the session's durable state
pub struct SetStateTool;

#[async_trait]
impl Tool for SetStateTool {
    fn name(&self) -> &str {
        "set_state"
    }

    fn description(&self) -> &str {
        "Store a value in session state under a key. Later cells can read it via {{state.<key>}}."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "key": { "type": "string", "description": "State key" },
                "value": { "description": "Any JSON value to store" }
            },
            "required": ["key", "value"]
        })
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolResult {
        let Some(sessions) = &ctx.sessions else {
            return ToolResult::error("State is not available in this execution context");
        };
        let Some(key) = input.get("key").and_then(|v| v.as_str()) else {
            return ToolResult::error("Missing required parameter: key");
        };
        let Some(value) = input.get("value") else {
            return ToolResult::error("Missing required parameter: value");
        };

        match sessions.set_state(&ctx.session_id, key, value.clone(), Some(&ctx.cell_name)) {
            Ok(()) => ToolResult::success(format!("Stored '{}'", key)),
            Err(e) => ToolResult::error(format!("Failed to store '{}': {}", key, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cascade::Cascade;
    use crate::identity::Identity;
    use crate::session::SessionStore;
    use echolog::{LogStore, MemoryStore};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_set_state_writes_through() {
        let log = Arc::new(MemoryStore::new());
        let sessions = SessionStore::new(log.clone() as Arc<dyn LogStore>);
        let cascade = Cascade::from_yaml("cascade_id: d\ncells:\n  - name: c\n    instructions: x\n").unwrap();
        let id = sessions
            .create(&cascade, json!({}), None, None, 0, Identity::empty())
            .unwrap();

        let ctx = ToolContext::new(&id, "c").with_sessions(sessions.clone());
        let result = SetStateTool
            .execute(json!({"key": "tone", "value": "dry"}), &ctx)
            .await;
        assert!(!result.is_error);
        assert_eq!(sessions.get_state(&id, "tone"), Some(json!("dry")));
        assert!(log.latest_state(&id, "tone").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_set_state_without_store_errors() {
        let ctx = ToolContext::new("s", "c");
        let result = SetStateTool.execute(json!({"key": "k", "value": 1}), &ctx).await;
        assert!(result.is_error);
    }
}
