//! Tackle - the tool registry
//!
//! Catalog of everything a cell can call: built-in deterministic ops and
//! cascades-as-tools discovered from `tool_dirs`. Tool execution within
//! one turn runs concurrently; result order follows call order.

use std::collections::HashMap;
use std::path::Path;

use eyre::Result;
use futures::future::join_all;
use tracing::{debug, warn};

use crate::cascade::Cascade;
use crate::llm::{ToolCall, ToolDefinition};

use super::builtin::{MustContainTool, ReadFileTool, RunCascadeTool, RunQueryTool, SetStateTool};
use super::cascade_tool::CascadeTool;
use super::{Tool, ToolContext, ToolResult};

/// The tool registry
pub struct Tackle {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl Tackle {
    /// Registry with the built-in tool set
    pub fn standard() -> Self {
        debug!("Tackle::standard: called");
        let mut tools: HashMap<String, Box<dyn Tool>> = HashMap::new();

        tools.insert("read_file".into(), Box::new(ReadFileTool));
        tools.insert("run_query".into(), Box::new(RunQueryTool));
        tools.insert("run_cascade".into(), Box::new(RunCascadeTool));
        tools.insert("set_state".into(), Box::new(SetStateTool));
        tools.insert("must_contain".into(), Box::new(MustContainTool));

        Self { tools }
    }

    /// Empty registry (tests)
    pub fn empty() -> Self {
        Self { tools: HashMap::new() }
    }

    /// Add a tool, replacing any prior registration of the same name
    pub fn add_tool(&mut self, tool: Box<dyn Tool>) {
        debug!(tool_name = %tool.name(), "Tackle::add_tool: called");
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Scan tool directories for standalone cascades and register them
    ///
    /// Each `.yaml`/`.yml`/`.json` file becomes a tool named after its
    /// file stem. Unparseable files are skipped with a warning.
    pub fn discover_tool_dirs(&mut self, dirs: &[String]) -> Result<usize> {
        let mut registered = 0;
        for dir in dirs {
            let root = Path::new(dir);
            if !root.is_dir() {
                warn!(%dir, "Tackle::discover_tool_dirs: not a directory, skipping");
                continue;
            }
            for entry in walkdir::WalkDir::new(root).max_depth(2).into_iter().flatten() {
                let path = entry.path();
                let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
                if !matches!(ext, "yaml" | "yml" | "json") {
                    continue;
                }
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                match Cascade::from_path(path) {
                    Ok(cascade) => {
                        let tool = CascadeTool::from_cascade(stem, path.display().to_string(), &cascade);
                        debug!(tool_name = %stem, path = %path.display(), "Tackle::discover_tool_dirs: registered");
                        self.add_tool(Box::new(tool));
                        registered += 1;
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Tackle::discover_tool_dirs: skipping unparseable cascade");
                    }
                }
            }
        }
        Ok(registered)
    }

    /// Get tool definitions for the LLM
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|t| ToolDefinition::new(t.name(), t.description(), t.input_schema()))
            .collect()
    }

    /// Get definitions for a subset of tools by name
    pub fn definitions_for(&self, tool_names: &[String]) -> Vec<ToolDefinition> {
        tool_names
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|t| ToolDefinition::new(t.name(), t.description(), t.input_schema()))
            .collect()
    }

    /// One-line-per-tool synopsis for the quartermaster
    pub fn synopsis(&self) -> String {
        let mut names: Vec<&String> = self.tools.keys().collect();
        names.sort();
        names
            .iter()
            .map(|name| {
                let tool = &self.tools[name.as_str()];
                format!("- {}: {}", tool.name(), tool.description())
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Execute a single tool call
    pub async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResult {
        debug!(tool_name = %call.name, tool_id = %call.id, "Tackle::execute: called");
        match self.tools.get(&call.name) {
            Some(tool) => tool.execute(call.input.clone(), ctx).await,
            None => ToolResult::error(format!("Unknown tool: {}", call.name)),
        }
    }

    /// Execute the calls of one turn concurrently
    ///
    /// Calls within a turn are mutually independent; results come back
    /// in call order regardless of completion order.
    pub async fn execute_all(&self, calls: &[ToolCall], ctx: &ToolContext) -> Vec<(String, ToolResult)> {
        debug!(count = calls.len(), "Tackle::execute_all: called");
        let futures = calls.iter().map(|call| async move {
            let result = self.execute(call, ctx).await;
            (call.id.clone(), result)
        });
        join_all(futures).await
    }

    /// Check if a tool exists
    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered tool names
    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }
}

impl Default for Tackle {
    fn default() -> Self {
        Self::standard()
    }
}
