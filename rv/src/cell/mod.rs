//! Cell execution: the turn loop, candidate exploration, and refinement

mod candidates;
mod executor;
mod reforge;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

pub use candidates::CandidateLoop;
pub use executor::{CellExecutor, CellOutcome};
pub use reforge::RefinementLoop;

use crate::context::ContextBuilder;
use crate::llm::LlmClient;
use crate::session::SessionStore;
use crate::sink::LogSink;
use crate::sql::SqlEngine;
use crate::tackle::{CascadeSpawnerRef, Tackle, ToolContext};
use crate::wards::WardEngine;

/// Everything a cell needs to run, shared across the engine
#[derive(Clone)]
pub struct CellEnv {
    pub llm: Arc<dyn LlmClient>,
    pub tackle: Arc<Tackle>,
    pub sessions: SessionStore,
    pub sink: LogSink,
    pub context: ContextBuilder,
    pub spawner: Option<CascadeSpawnerRef>,
    pub sql: Option<Arc<dyn SqlEngine>>,
    pub artifact_dir: PathBuf,
    /// Per suspending call (LLM, tool, sub-cascade)
    pub call_timeout: Duration,
    pub max_tokens: u32,
    /// Flips true on external cancellation; checked at suspension points
    pub cancel: watch::Receiver<bool>,
}

impl CellEnv {
    /// Construct with defaults; `cancel` starts un-canceled
    pub fn new(llm: Arc<dyn LlmClient>, sessions: SessionStore) -> Self {
        let sink = LogSink::new(sessions.clone(), Some(llm.clone()));
        let context = ContextBuilder::new(sessions.log_store());
        let (_tx, cancel) = watch::channel(false);
        Self {
            llm,
            tackle: Arc::new(Tackle::standard()),
            sessions,
            sink,
            context,
            spawner: None,
            sql: None,
            artifact_dir: std::env::temp_dir().join("rvbbit-artifacts"),
            call_timeout: Duration::from_secs(300),
            max_tokens: 8192,
            cancel,
        }
    }

    /// Ward engine over this environment's registry
    pub fn wards(&self) -> WardEngine {
        WardEngine::new(Arc::clone(&self.tackle))
    }

    /// Tool context for one cell invocation
    pub fn tool_context(&self, session_id: &str, cell_name: &str) -> ToolContext {
        let mut ctx = ToolContext::new(session_id, cell_name)
            .with_sessions(self.sessions.clone())
            .with_artifact_dir(self.artifact_dir.clone());
        if let Some(spawner) = &self.spawner {
            ctx = ctx.with_spawner(Arc::clone(spawner));
        }
        if let Some(sql) = &self.sql {
            ctx = ctx.with_sql(Arc::clone(sql));
        }
        ctx
    }

    /// True when external cancellation has been requested
    pub fn is_canceled(&self) -> bool {
        *self.cancel.borrow()
    }
}
