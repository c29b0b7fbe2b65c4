//! Quartermaster - manifest tool selection
//!
//! When a cell declares `traits: "manifest"`, a meta-cell runs first: it
//! receives a synopsis of every registered tool and picks the subset to
//! expose to the main cell. The selection and its rationale are logged
//! so tool availability is auditable per run.

use std::sync::Arc;

use echolog::{LogRow, NodeType};
use eyre::Result;
use tracing::{debug, warn};

use crate::cascade::CellSpec;
use crate::errors::RunError;
use crate::llm::{CompletionRequest, LlmClient, Message};
use crate::sink::LogSink;

use super::Tackle;

const QUARTERMASTER_SYSTEM: &str = "You are a quartermaster. Given a task description and a \
catalog of tools, choose the smallest set of tools the task needs. \
Respond with JSON only: {\"tools\": [\"name\", ...], \"rationale\": \"...\"}";

/// The quartermaster's decision
#[derive(Debug, Clone)]
pub struct ManifestSelection {
    pub tools: Vec<String>,
    pub rationale: String,
}

/// Runs the manifest meta-cell
pub struct Quartermaster {
    llm: Arc<dyn LlmClient>,
}

impl Quartermaster {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// Choose tools for a cell and log the decision
    pub async fn select(
        &self,
        cell: &CellSpec,
        tackle: &Tackle,
        sink: &LogSink,
        session_id: &str,
        cascade_id: &str,
    ) -> Result<ManifestSelection, RunError> {
        debug!(cell_name = %cell.name, "Quartermaster::select: called");

        let task = cell.instructions.as_deref().unwrap_or("(no instructions)");
        let prompt = format!(
            "Task for cell '{}':\n{}\n\nAvailable tools:\n{}",
            cell.name,
            task,
            tackle.synopsis()
        );

        let request = CompletionRequest {
            system_prompt: QUARTERMASTER_SYSTEM.to_string(),
            messages: vec![Message::user(prompt)],
            tools: vec![],
            max_tokens: 1024,
            model: cell.model.clone(),
        };

        let response = self.llm.complete(request).await.map_err(|e| RunError::Provider {
            message: format!("Quartermaster call failed: {}", e),
            retryable: e.is_retryable(),
        })?;

        let content = response.content.unwrap_or_default();
        let selection = parse_selection(&content, tackle);

        let row = LogRow::new(session_id, cascade_id, NodeType::System)
            .with_cell(&cell.name)
            .with_request_id(&response.request_id)
            .with_model(&response.model, self.llm.provider())
            .with_text_content(&content)
            .with_metadata(&serde_json::json!({
                "quartermaster": true,
                "selected_tools": selection.tools,
                "rationale": selection.rationale,
            }));
        sink.log(row).await.map_err(|e| RunError::Provider {
            message: format!("Failed to log quartermaster selection: {}", e),
            retryable: false,
        })?;

        Ok(selection)
    }
}

/// Parse the selection JSON, filtering to tools that actually exist
fn parse_selection(content: &str, tackle: &Tackle) -> ManifestSelection {
    let stripped = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let parsed: Option<serde_json::Value> = serde_json::from_str(stripped).ok();
    let Some(value) = parsed else {
        warn!("Quartermaster: selection unparseable, exposing no tools");
        return ManifestSelection {
            tools: vec![],
            rationale: "selection unparseable".to_string(),
        };
    };

    let mut tools: Vec<String> = value
        .get("tools")
        .and_then(|t| t.as_array())
        .map(|list| {
            list.iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default();

    let before = tools.len();
    tools.retain(|name| tackle.has_tool(name));
    if tools.len() < before {
        warn!(dropped = before - tools.len(), "Quartermaster: selection named unknown tools");
    }

    let rationale = value
        .get("rationale")
        .and_then(|r| r.as_str())
        .unwrap_or_default()
        .to_string();

    ManifestSelection { tools, rationale }
}
