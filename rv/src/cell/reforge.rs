//! RefinementLoop (reforge) - sequential polishing of the winner
//!
//! Each step feeds the current artifact (rendered if a renderer tool is
//! registered) plus the honing prompt back through the cell. Steps are
//! strictly sequential; the final artifact is the last step's output.

use echolog::{LogRow, NodeType};
use serde_json::Value;
use tracing::{debug, info};

use crate::cascade::{Cascade, CellSpec, ReforgeSpec};
use crate::errors::RunError;
use crate::llm::ToolCall;

use super::executor::{CellExecutor, CellOutcome};
use super::CellEnv;

/// Tool consulted to render artifacts between steps, when registered
const RENDERER_TOOL: &str = "render_artifact";

/// Runs the refinement loop for a cell
pub struct RefinementLoop;

impl RefinementLoop {
    /// Refine `winner` through `spec.steps` sequential passes
    pub async fn run(
        env: &CellEnv,
        cascade: &Cascade,
        cell: &CellSpec,
        session_id: &str,
        spec: &ReforgeSpec,
        winner: CellOutcome,
    ) -> Result<CellOutcome, RunError> {
        if spec.steps == 0 {
            // Zero steps returns the winner verbatim
            return Ok(winner);
        }
        debug!(cell_name = %cell.name, steps = spec.steps, "RefinementLoop::run: called");

        let cascade_id = &cascade.doc.cascade_id;
        let tool_ctx = env.tool_context(session_id, &cell.name);
        let mut current = winner;

        for step in 0..spec.steps {
            if env.is_canceled() {
                return Err(RunError::Canceled("cascade canceled".into()));
            }

            let rendered = Self::render_artifact(env, &current.content, &tool_ctx).await;

            // Named mutations cycle in declaration order
            let mutation = (!spec.mutations.is_empty())
                .then(|| spec.mutations[step as usize % spec.mutations.len()].clone());

            let mut prompt = String::new();
            if let Some(name) = &mutation {
                prompt.push_str(&format!("Apply the '{}' mutation.\n", name));
            }
            prompt.push_str(&spec.honing_prompt);
            prompt.push_str("\n\nCurrent artifact:\n");
            prompt.push_str(&rendered);

            let input_content = current.content.clone();
            current = CellExecutor::run(env, cascade, cell, session_id, &[], Some(&prompt)).await?;

            let row = LogRow::new(session_id, cascade_id, NodeType::RefinementStep)
                .with_cell(&cell.name)
                .with_reforge_step(step as i64)
                .with_content(&current.content)
                .with_metadata(&serde_json::json!({
                    "honing_prompt": spec.honing_prompt,
                    "mutation": mutation,
                    "input_content": input_content,
                }));
            env.sink.log(row).await.map_err(|e| RunError::Provider {
                message: format!("Log write failed: {}", e),
                retryable: false,
            })?;
        }

        info!(cell_name = %cell.name, steps = spec.steps, "Refinement complete");
        Ok(current)
    }

    /// Render the artifact for the next honing prompt
    ///
    /// When a `render_artifact` tool is registered (e.g. chart spec to
    /// PNG), its output stands in for the raw artifact text.
    async fn render_artifact(env: &CellEnv, content: &Value, tool_ctx: &crate::tackle::ToolContext) -> String {
        if env.tackle.has_tool(RENDERER_TOOL) {
            let call = ToolCall {
                id: "reforge_render".into(),
                name: RENDERER_TOOL.into(),
                input: serde_json::json!({"artifact": content}),
            };
            let result = env.tackle.execute(&call, tool_ctx).await;
            if !result.is_error {
                return result.content;
            }
        }
        match content {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}
