//! run_query - execute SQL through the session's engine

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::tackle::{Tool, ToolContext, ToolResult};

/// Run a SQL statement against the in-process engine
pub struct RunQueryTool;

#[async_trait]
impl Tool for RunQueryTool {
    fn name(&self) -> &str {
        "run_query"
    }

    fn description(&self) -> &str {
        "Execute a SQL statement and return the result rows as JSON."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "sql": { "type": "string", "description": "SQL statement to execute" }
            },
            "required": ["sql"]
        })
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolResult {
        let Some(sql) = input.get("sql").and_then(|v| v.as_str()) else {
            return ToolResult::error("Missing required parameter: sql");
        };
        let Some(engine) = &ctx.sql else {
            return ToolResult::error("SQL engine is not available in this execution context");
        };

        match engine.query(sql).await {
            Ok(rows) => {
                let count = rows.len();
                ToolResult::success(serde_json::to_string(&rows).unwrap_or_else(|_| "[]".into()))
                    .with_metadata(json!({"row_count": count}))
            }
            Err(e) => ToolResult::error(format!("Query failed: {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::engine::mock::MockSqlEngine;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_run_query_through_engine() {
        let engine = Arc::new(MockSqlEngine::new());
        engine.seed_table("t", vec![json!({"i": 1}), json!({"i": 2})]);

        let ctx = ToolContext::new("s", "c").with_sql(engine as Arc<dyn crate::sql::SqlEngine>);
        let result = RunQueryTool.execute(json!({"sql": "SELECT * FROM t"}), &ctx).await;
        assert!(!result.is_error);
        assert_eq!(result.metadata["row_count"], 2);
    }

    #[tokio::test]
    async fn test_run_query_without_engine_errors() {
        let ctx = ToolContext::new("s", "c");
        let result = RunQueryTool.execute(json!({"sql": "SELECT 1"}), &ctx).await;
        assert!(result.is_error);
    }
}
