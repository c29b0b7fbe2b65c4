//! CascadeRunner - drives the cell sequence of a cascade run
//!
//! Creates the session (persisting the verbatim document), walks cells
//! in declaration order honoring explicit handoffs, fans each cell
//! through candidates/refinement when declared, and finalizes with
//! `cascade_complete`. Sub-cascades re-enter through the same runner
//! with depth+1 and inherited identity; cancellation propagates to all
//! descendants through a shared watch channel.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use echolog::{LogRow, NodeType};
use eyre::Result;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cascade::{Cascade, CellSpec};
use crate::cell::{CandidateLoop, CellEnv, CellExecutor, CellOutcome, RefinementLoop};
use crate::context::ContextBuilder;
use crate::errors::RunError;
use crate::identity::{Identity, IdentityContext};
use crate::llm::LlmClient;
use crate::session::{EchoError, SessionStatus, SessionStore};
use crate::sink::LogSink;
use crate::sql::SqlEngine;
use crate::tackle::{CascadeSpawner, Tackle};

/// Upper bound on handoff jumps, relative to cell count
const HANDOFF_FACTOR: usize = 4;

/// Options for one run
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub session_id: Option<String>,
    pub parent_session_id: Option<String>,
    pub depth: i64,
    /// None inherits the innermost ambient identity
    pub identity: Option<Identity>,
}

/// Outcome of a cascade run
#[derive(Debug, Clone)]
pub struct SessionResult {
    pub session_id: String,
    pub status: SessionStatus,
    /// Final artifact: the last completed cell's output
    pub output: Value,
    pub cost_total: f64,
    pub tokens_total: i64,
    pub errors: Vec<EchoError>,
}

impl SessionResult {
    pub fn succeeded(&self) -> bool {
        self.status == SessionStatus::Completed
    }
}

/// The cascade execution engine's entry point
#[derive(Clone)]
pub struct CascadeRunner {
    llm: Arc<dyn LlmClient>,
    sessions: SessionStore,
    tackle: Arc<Tackle>,
    sql: Option<Arc<dyn SqlEngine>>,
    artifact_dir: PathBuf,
    call_timeout: Duration,
    max_tokens: u32,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
}

impl CascadeRunner {
    pub fn new(llm: Arc<dyn LlmClient>, sessions: SessionStore) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            llm,
            sessions,
            tackle: Arc::new(Tackle::standard()),
            sql: None,
            artifact_dir: std::env::temp_dir().join("rvbbit-artifacts"),
            call_timeout: Duration::from_secs(300),
            max_tokens: 8192,
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
        }
    }

    pub fn with_tackle(mut self, tackle: Arc<Tackle>) -> Self {
        self.tackle = tackle;
        self
    }

    pub fn with_sql(mut self, sql: Arc<dyn SqlEngine>) -> Self {
        self.sql = Some(sql);
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn with_artifact_dir(mut self, dir: PathBuf) -> Self {
        self.artifact_dir = dir;
        self
    }

    /// The session store this runner writes through
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Default model name (part of UDF cache keys)
    pub fn model_name(&self) -> &str {
        self.llm.default_model()
    }

    /// Request cancellation; in-flight cells stop at their next suspension point
    pub fn cancel(&self) {
        info!("CascadeRunner::cancel: requested");
        let _ = self.cancel_tx.send(true);
    }

    /// Load and run a cascade file
    pub async fn run_path(&self, path: &str, inputs: Value, opts: RunOptions) -> Result<SessionResult> {
        let cascade = Cascade::from_path(path)?;
        self.run(&cascade, inputs, opts).await
    }

    /// Run a cascade to completion
    pub async fn run(&self, cascade: &Cascade, inputs: Value, opts: RunOptions) -> Result<SessionResult> {
        let identity = opts.identity.clone().unwrap_or_else(IdentityContext::get);
        let session_id = self.sessions.create(
            cascade,
            inputs,
            opts.session_id.clone(),
            opts.parent_session_id.clone(),
            opts.depth,
            identity.clone(),
        )?;
        debug!(%session_id, cascade_id = %cascade.doc.cascade_id, depth = opts.depth, "CascadeRunner::run: session created");

        let env = self.cell_env(&session_id, opts.depth, cascade);
        let result = IdentityContext::scope(identity, self.drive_cells(&env, cascade, &session_id, &opts)).await;

        // Finalize regardless of how the drive ended
        let status = self.sessions.finalize(&session_id)?;
        let echo = self.sessions.echo(&session_id).expect("session exists");

        let output = match &result {
            Ok(output) => output.clone(),
            Err(_) => Value::Null,
        };

        let complete_row = LogRow::new(&session_id, &cascade.doc.cascade_id, NodeType::CascadeComplete)
            .with_depth(opts.depth)
            .with_content(&output)
            .with_metadata(&serde_json::json!({
                "status": status,
                "cost_total": echo.cost_total,
                "tokens_total": echo.tokens_total,
            }));
        env.sink.log(complete_row).await?;

        if status == SessionStatus::Failed {
            // The cascade_error hook accompanies the terminal record
            let error_row = LogRow::new(&session_id, &cascade.doc.cascade_id, NodeType::Error)
                .with_depth(opts.depth)
                .with_metadata(&serde_json::json!({
                    "cascade_error": true,
                    "errors": echo.errors,
                }));
            env.sink.log(error_row).await?;
        }

        IdentityContext::unbind_session(&session_id);

        Ok(SessionResult {
            session_id,
            status,
            output,
            cost_total: echo.cost_total,
            tokens_total: echo.tokens_total,
            errors: echo.errors,
        })
    }

    /// Walk the cells, honoring handoffs; returns the final artifact
    async fn drive_cells(
        &self,
        env: &CellEnv,
        cascade: &Cascade,
        session_id: &str,
        opts: &RunOptions,
    ) -> Result<Value, RunError> {
        let start_row = LogRow::new(session_id, &cascade.doc.cascade_id, NodeType::CascadeStart)
            .with_depth(opts.depth)
            .with_cascade_json(cascade.raw.clone());
        if let Some(parent) = &opts.parent_session_id {
            let _ = env
                .sink
                .log(start_row.clone().with_parent_session(parent.clone()))
                .await
                .map_err(|e| warn!(error = %e, "cascade_start log failed"));
        } else {
            let _ = env
                .sink
                .log(start_row)
                .await
                .map_err(|e| warn!(error = %e, "cascade_start log failed"));
        }

        let mut output = Value::Null;
        let mut index = 0usize;
        let mut jumps = 0usize;
        let max_jumps = cascade.doc.cells.len() * HANDOFF_FACTOR;

        while index < cascade.doc.cells.len() {
            if env.is_canceled() {
                let error = RunError::Canceled("cascade canceled".into());
                self.sessions.record_error(
                    session_id,
                    EchoError {
                        cell_name: cascade.doc.cells[index].name.clone(),
                        error_kind: error.kind().to_string(),
                        message: error.to_string(),
                        metadata: error.metadata(),
                    },
                );
                return Err(error);
            }

            let cell = &cascade.doc.cells[index];
            let outcome = self.run_cell(env, cascade, cell, session_id).await?;
            output = outcome.content;

            match &cell.handoff {
                Some(target) => {
                    jumps += 1;
                    if jumps > max_jumps {
                        let error = RunError::Validation {
                            reason: format!("Handoff loop exceeded {} jumps", max_jumps),
                        };
                        self.sessions.record_error(
                            session_id,
                            EchoError {
                                cell_name: cell.name.clone(),
                                error_kind: error.kind().to_string(),
                                message: error.to_string(),
                                metadata: error.metadata(),
                            },
                        );
                        return Err(error);
                    }
                    index = cascade
                        .doc
                        .cells
                        .iter()
                        .position(|c| &c.name == target)
                        .expect("handoff target validated at load");
                }
                None => index += 1,
            }
        }

        Ok(output)
    }

    /// One cell: candidates when declared, then refinement when declared
    async fn run_cell(
        &self,
        env: &CellEnv,
        cascade: &Cascade,
        cell: &CellSpec,
        session_id: &str,
    ) -> Result<CellOutcome, RunError> {
        let candidate_spec = cell.candidates.as_ref().or(cascade.doc.candidates.as_ref());

        let outcome = match candidate_spec {
            Some(spec) => CandidateLoop::run(env, cascade, cell, session_id, spec).await?,
            None => CellExecutor::run(env, cascade, cell, session_id, &[], None).await?,
        };

        match &cell.reforge {
            Some(spec) => RefinementLoop::run(env, cascade, cell, session_id, spec, outcome).await,
            None => Ok(outcome),
        }
    }

    /// Build the per-run cell environment
    fn cell_env(&self, session_id: &str, depth: i64, cascade: &Cascade) -> CellEnv {
        // Cascades with tool_dirs get a registry extended with their tools
        let tackle = if cascade.doc.tool_dirs.is_empty() {
            Arc::clone(&self.tackle)
        } else {
            let mut tackle = Tackle::standard();
            if let Err(e) = tackle.discover_tool_dirs(&cascade.doc.tool_dirs) {
                warn!(error = %e, "cell_env: tool_dir discovery failed");
            }
            Arc::new(tackle)
        };

        let spawner = Arc::new(SessionSpawner {
            runner: self.clone(),
            parent_session_id: session_id.to_string(),
            depth,
        });

        CellEnv {
            llm: Arc::clone(&self.llm),
            tackle,
            sessions: self.sessions.clone(),
            sink: LogSink::new(self.sessions.clone(), Some(Arc::clone(&self.llm))),
            context: ContextBuilder::new(self.sessions.log_store()).with_artifact_dir(self.artifact_dir.clone()),
            spawner: Some(spawner),
            sql: self.sql.clone(),
            artifact_dir: self.artifact_dir.clone(),
            call_timeout: self.call_timeout,
            max_tokens: self.max_tokens,
            cancel: self.cancel_rx.clone(),
        }
    }
}

/// Spawns sub-cascades on behalf of tools and wards
struct SessionSpawner {
    runner: CascadeRunner,
    parent_session_id: String,
    depth: i64,
}

#[async_trait]
impl CascadeSpawner for SessionSpawner {
    async fn run_cascade(&self, path: &str, inputs: Value) -> Result<Value, String> {
        debug!(%path, parent = %self.parent_session_id, "SessionSpawner::run_cascade: called");
        let identity = self.runner.sessions.identity_for(&self.parent_session_id);
        let opts = RunOptions {
            session_id: None,
            parent_session_id: Some(self.parent_session_id.clone()),
            depth: self.depth + 1,
            identity: Some(identity),
        };
        // Recursion through the engine needs an explicit box
        let fut: std::pin::Pin<Box<dyn std::future::Future<Output = Result<SessionResult>> + Send>> =
            Box::pin(self.runner.run_path(path, inputs, opts));
        match fut.await {
            Ok(result) if result.succeeded() => Ok(result.output),
            Ok(result) => Err(format!(
                "sub-cascade failed: {}",
                result
                    .errors
                    .first()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "unknown error".into())
            )),
            Err(e) => Err(e.to_string()),
        }
    }
}
