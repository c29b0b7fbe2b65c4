//! Tool trait definition

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

/// A tool callable from a cell
///
/// Built-in deterministic ops and cascades-as-tools implement the same
/// interface; the cell loop cannot tell them apart.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (matches LLM tool_use name)
    fn name(&self) -> &str;

    /// Human-readable description (shown to the quartermaster too)
    fn description(&self) -> &str;

    /// JSON Schema for input parameters
    fn input_schema(&self) -> Value;

    /// Execute the tool
    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolResult;
}

/// An image produced by a tool, saved to disk
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ImageRef {
    pub path: String,
    pub media_type: String,
    /// Present until the context builder culls it after the follow-up
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base64: Option<String>,
}

/// Result of a tool execution
#[derive(Debug, Clone, Default)]
pub struct ToolResult {
    pub content: String,
    pub metadata: Value,
    pub images: Vec<ImageRef>,
    pub is_error: bool,
}

impl ToolResult {
    /// Create a successful result
    pub fn success(content: impl Into<String>) -> Self {
        debug!("ToolResult::success: called");
        Self {
            content: content.into(),
            metadata: Value::Null,
            images: Vec::new(),
            is_error: false,
        }
    }

    /// Create an error result
    ///
    /// The content is a structured error body the model can react to on
    /// its next turn; it does not terminate the cell by itself.
    pub fn error(content: impl Into<String>) -> Self {
        debug!("ToolResult::error: called");
        Self {
            content: content.into(),
            metadata: Value::Null,
            images: Vec::new(),
            is_error: true,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_images(mut self, images: Vec<ImageRef>) -> Self {
        self.images = images;
        self
    }
}

/// Spawns a sub-cascade on behalf of a tool
///
/// Tools cannot depend on the runner directly (the runner owns the tool
/// registry); this seam breaks the cycle. The engine installs an
/// implementation that re-enters itself with depth+1 and the current
/// session as parent.
#[async_trait]
pub trait CascadeSpawner: Send + Sync {
    /// Run the cascade at `path` with `inputs`; returns the final artifact
    async fn run_cascade(&self, path: &str, inputs: Value) -> Result<Value, String>;
}

pub type CascadeSpawnerRef = Arc<dyn CascadeSpawner>;

/// Per-invocation context handed to every tool
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub cell_name: String,

    /// Where tools save images and oversized text results
    pub artifact_dir: PathBuf,

    /// Sub-cascade spawner, when the engine is available
    pub spawner: Option<CascadeSpawnerRef>,

    /// Session store handle for state-writing tools
    pub sessions: Option<crate::session::SessionStore>,

    /// SQL engine handle for query tools
    pub sql: Option<Arc<dyn crate::sql::SqlEngine>>,
}

impl ToolContext {
    pub fn new(session_id: impl Into<String>, cell_name: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            cell_name: cell_name.into(),
            artifact_dir: std::env::temp_dir().join("rvbbit-artifacts"),
            spawner: None,
            sessions: None,
            sql: None,
        }
    }

    pub fn with_spawner(mut self, spawner: CascadeSpawnerRef) -> Self {
        self.spawner = Some(spawner);
        self
    }

    pub fn with_sessions(mut self, sessions: crate::session::SessionStore) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn with_sql(mut self, sql: Arc<dyn crate::sql::SqlEngine>) -> Self {
        self.sql = Some(sql);
        self
    }

    pub fn with_artifact_dir(mut self, dir: PathBuf) -> Self {
        self.artifact_dir = dir;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_result_success() {
        let result = ToolResult::success("done");
        assert!(!result.is_error);
        assert_eq!(result.content, "done");
        assert!(result.images.is_empty());
    }

    #[test]
    fn test_tool_result_error() {
        let result = ToolResult::error("missing arg");
        assert!(result.is_error);
        assert_eq!(result.content, "missing arg");
    }

    #[test]
    fn test_tool_result_builders() {
        let result = ToolResult::success("chart ready")
            .with_metadata(serde_json::json!({"format": "png"}))
            .with_images(vec![ImageRef {
                path: "/tmp/c.png".into(),
                media_type: "image/png".into(),
                base64: Some("aGk=".into()),
            }]);
        assert_eq!(result.metadata["format"], "png");
        assert_eq!(result.images.len(), 1);
    }
}
