//! CandidateLoop - parallel cell variants with evaluator selection
//!
//! Runs `factor` independent executions of a cell, each in an isolated
//! session branch (`<session>_cN`) seeded with a deep clone of the
//! parent's state. Branches run under a semaphore capped by
//! `max_parallel`; a completion barrier collects them in index order.
//! The evaluator is itself a cell, so selection decisions are logged
//! first-class and auditable.

use std::sync::Arc;

use echolog::{LogRow, NodeType};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::cascade::{CandidateMode, CandidateSpec, Cascade, CellSpec, FactorSpec};
use crate::errors::RunError;
use crate::identity::IdentityContext;
use crate::template::render;

use super::executor::{CellExecutor, CellOutcome};
use super::CellEnv;

/// One completed candidate branch
#[derive(Debug)]
struct Branch {
    index: usize,
    session_id: String,
    result: Result<CellOutcome, String>,
}

/// Runs candidate exploration for a cell
pub struct CandidateLoop;

impl CandidateLoop {
    /// Run candidates and return the winning (or aggregated) outcome
    pub async fn run(
        env: &CellEnv,
        cascade: &Cascade,
        cell: &CellSpec,
        session_id: &str,
        spec: &CandidateSpec,
    ) -> Result<CellOutcome, RunError> {
        let factor = Self::resolve_factor(env, spec, session_id)?;
        debug!(cell_name = %cell.name, factor, "CandidateLoop::run: called");

        // A factor of one is a plain run; the evaluator is skipped
        if factor <= 1 {
            return CellExecutor::run(env, cascade, cell, session_id, &[], None).await;
        }

        let branches = Self::run_branches(env, cascade, cell, session_id, factor, spec.max_parallel).await;

        let succeeded: Vec<(usize, &CellOutcome)> = branches
            .iter()
            .filter_map(|b| b.result.as_ref().ok().map(|o| (b.index, o)))
            .collect();
        let branch_errors: Vec<String> = branches
            .iter()
            .filter_map(|b| {
                b.result
                    .as_ref()
                    .err()
                    .map(|e| format!("candidate {}: {}", b.index, e))
            })
            .collect();

        if succeeded.is_empty() {
            return Err(RunError::CandidateExhaustion {
                attempted: factor,
                branch_errors,
            });
        }
        if spec.mode == CandidateMode::AllOrNothing && !branch_errors.is_empty() {
            return Err(RunError::CandidateExhaustion {
                attempted: factor,
                branch_errors,
            });
        }

        // Evaluate and select
        let selection = Self::evaluate(env, cascade, cell, session_id, spec, &succeeded).await?;

        // Log every candidate, losers included
        let cascade_id = &cascade.doc.cascade_id;
        for branch in &branches {
            let (content, error) = match &branch.result {
                Ok(outcome) => (Some(&outcome.content), None),
                Err(e) => (None, Some(e.clone())),
            };
            let is_winner = matches!(&selection, Selection::Winner { index, .. } if *index == branch.index);
            let mut row = LogRow::new(session_id, cascade_id, NodeType::CandidateEvaluated)
                .with_cell(&cell.name)
                .with_candidate(branch.index as i64, Some(is_winner))
                .with_metadata(&serde_json::json!({
                    "branch_session_id": branch.session_id,
                    "error": error,
                    "rationale": selection.rationale(),
                }));
            if let Some(content) = content {
                row = row.with_content(content);
            }
            env.sink.log(row).await.map_err(sink_err)?;
        }

        let outcome = match selection {
            Selection::Winner { index, rationale } => {
                let (_, winner) = succeeded
                    .iter()
                    .find(|(i, _)| *i == index)
                    .expect("winner index must be a succeeded branch");
                let row = LogRow::new(session_id, cascade_id, NodeType::WinnerSelected)
                    .with_cell(&cell.name)
                    .with_candidate(index as i64, Some(true))
                    .with_content(&winner.content)
                    .with_metadata(&serde_json::json!({"rationale": rationale, "mode": spec.mode}));
                env.sink.log(row).await.map_err(sink_err)?;
                info!(cell_name = %cell.name, winner = index, "Candidate winner selected");
                (*winner).clone()
            }
            Selection::Aggregated { content, rationale } => {
                // The merged artifact is itself a candidate row, indexed
                // past the branches, and it is the cell's one winner
                let aggregate_index = branches.len() as i64;
                let row = LogRow::new(session_id, cascade_id, NodeType::CandidateEvaluated)
                    .with_cell(&cell.name)
                    .with_candidate(aggregate_index, Some(true))
                    .with_content(&content)
                    .with_metadata(&serde_json::json!({
                        "synthesized": true,
                        "rationale": &rationale,
                    }));
                env.sink.log(row).await.map_err(sink_err)?;

                let row = LogRow::new(session_id, cascade_id, NodeType::WinnerSelected)
                    .with_cell(&cell.name)
                    .with_candidate(aggregate_index, Some(true))
                    .with_content(&content)
                    .with_metadata(&serde_json::json!({"rationale": rationale, "mode": spec.mode}));
                env.sink.log(row).await.map_err(sink_err)?;
                CellOutcome {
                    content,
                    transcript: vec![],
                }
            }
        };

        // Merge the winner into the main session
        env.sessions.record_output(session_id, &cell.name, outcome.content.clone());
        Ok(outcome)
    }

    /// Resolve the factor: a literal, or a template over inputs/state
    fn resolve_factor(env: &CellEnv, spec: &CandidateSpec, session_id: &str) -> Result<usize, RunError> {
        match &spec.factor {
            FactorSpec::Literal(n) => Ok(*n as usize),
            FactorSpec::Template(template) => {
                let echo = env.sessions.echo(session_id).ok_or_else(|| RunError::Validation {
                    reason: format!("Unknown session: {}", session_id),
                })?;
                let ctx = serde_json::json!({"input": echo.inputs, "state": echo.state});
                let rendered = render(template, &ctx);
                rendered.trim().parse().map_err(|_| RunError::Validation {
                    reason: format!("Candidate factor template '{}' rendered to non-integer '{}'", template, rendered),
                })
            }
        }
    }

    /// Spawn branches under the parallelism cap; barrier-collect in index order
    async fn run_branches(
        env: &CellEnv,
        cascade: &Cascade,
        cell: &CellSpec,
        session_id: &str,
        factor: usize,
        max_parallel: usize,
    ) -> Vec<Branch> {
        let semaphore = Arc::new(Semaphore::new(max_parallel.max(1)));
        let identity = env.sessions.identity_for(session_id);
        let parent_echo = env.sessions.echo(session_id);
        let depth = parent_echo.as_ref().map(|e| e.depth).unwrap_or(0);

        let mut handles = Vec::with_capacity(factor);
        for index in 0..factor {
            let branch_session = format!("{}_c{}", session_id, index);
            let env = env.clone();
            let cascade = cascade.clone();
            let cell = cell.clone();
            let identity = identity.clone();
            let parent = session_id.to_string();
            let semaphore = Arc::clone(&semaphore);

            let handle = tokio::spawn(IdentityContext::scope(identity.clone(), async move {
                let _permit = semaphore.acquire().await;

                if let Err(e) = env.sessions.create(
                    &cascade,
                    env.sessions.echo(&parent).map(|e| e.inputs).unwrap_or(Value::Null),
                    Some(branch_session.clone()),
                    Some(parent.clone()),
                    depth,
                    identity,
                ) {
                    return Branch {
                        index,
                        session_id: branch_session,
                        result: Err(format!("branch session create failed: {}", e)),
                    };
                }
                env.sessions.seed_from(&branch_session, &parent);

                let result = run_bracketed_cell(&env, &cascade, &cell, &branch_session, &parent, depth).await;
                Branch {
                    index,
                    session_id: branch_session,
                    result,
                }
            }));
            handles.push(handle);
        }

        let mut branches = Vec::with_capacity(factor);
        for (index, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(branch) => branches.push(branch),
                Err(e) => {
                    warn!(index, error = %e, "CandidateLoop: branch task panicked");
                    branches.push(Branch {
                        index,
                        session_id: format!("{}_c{}", session_id, index),
                        result: Err(format!("branch task failed: {}", e)),
                    });
                }
            }
        }
        branches.sort_by_key(|b| b.index);
        branches
    }

    /// Run the evaluator meta-cell and interpret its verdict
    async fn evaluate(
        env: &CellEnv,
        cascade: &Cascade,
        cell: &CellSpec,
        session_id: &str,
        spec: &CandidateSpec,
        succeeded: &[(usize, &CellOutcome)],
    ) -> Result<Selection, RunError> {
        let fallback = succeeded[0].0;

        match spec.mode {
            CandidateMode::FirstValid => {
                // Judge each candidate in index order; first pass wins
                for (offset, (index, outcome)) in succeeded.iter().enumerate() {
                    let prompt = format!(
                        "{}\n\nCandidate:\n{}\n\nRespond with JSON only: {{\"valid\": true|false, \"reason\": \"...\"}}",
                        spec.evaluator_instructions,
                        render_artifact(&outcome.content)
                    );
                    let verdict =
                        Self::run_evaluator_cell(env, cascade, cell, session_id, &prompt, offset).await?;
                    if verdict.get("valid").and_then(|v| v.as_bool()).unwrap_or(false) {
                        return Ok(Selection::Winner {
                            index: *index,
                            rationale: verdict
                                .get("reason")
                                .and_then(|r| r.as_str())
                                .unwrap_or_default()
                                .to_string(),
                        });
                    }
                }
                // None valid: lowest index wins by tie-break
                Ok(Selection::Winner {
                    index: fallback,
                    rationale: "no candidate passed the predicate; lowest index by tie-break".into(),
                })
            }
            CandidateMode::Aggregate => {
                let prompt = format!(
                    "{}\n\n{}\n\nProduce the aggregated artifact.",
                    spec.evaluator_instructions,
                    candidates_block(succeeded)
                );
                let outcome = Self::run_evaluator_outcome(env, cascade, cell, session_id, &prompt, 0).await?;
                Ok(Selection::Aggregated {
                    content: outcome.content,
                    rationale: "aggregated by evaluator".into(),
                })
            }
            CandidateMode::Select | CandidateMode::AllOrNothing => {
                let prompt = format!(
                    "{}\n\n{}\n\nRespond with JSON only: {{\"winner\": <index>, \"rationale\": \"...\"}}",
                    spec.evaluator_instructions,
                    candidates_block(succeeded)
                );
                let verdict = Self::run_evaluator_cell(env, cascade, cell, session_id, &prompt, 0).await?;
                let index = verdict
                    .get("winner")
                    .and_then(|w| w.as_u64())
                    .map(|w| w as usize)
                    .filter(|w| succeeded.iter().any(|(i, _)| i == w))
                    .unwrap_or_else(|| {
                        warn!("CandidateLoop: evaluator verdict missing/invalid winner, tie-breaking by lowest index");
                        fallback
                    });
                Ok(Selection::Winner {
                    index,
                    rationale: verdict
                        .get("rationale")
                        .and_then(|r| r.as_str())
                        .unwrap_or_default()
                        .to_string(),
                })
            }
        }
    }

    async fn run_evaluator_cell(
        env: &CellEnv,
        cascade: &Cascade,
        cell: &CellSpec,
        session_id: &str,
        prompt: &str,
        call_index: usize,
    ) -> Result<Value, RunError> {
        let outcome = Self::run_evaluator_outcome(env, cascade, cell, session_id, prompt, call_index).await?;
        match outcome.content {
            Value::Object(map) => Ok(Value::Object(map)),
            Value::String(text) => Ok(serde_json::from_str(&text).unwrap_or(Value::Null)),
            other => Ok(other),
        }
    }

    /// The evaluator runs through the same executor path as normal cells
    async fn run_evaluator_outcome(
        env: &CellEnv,
        cascade: &Cascade,
        cell: &CellSpec,
        session_id: &str,
        prompt: &str,
        call_index: usize,
    ) -> Result<CellOutcome, RunError> {
        let eval_session = format!("{}_eval{}", session_id, call_index);
        let identity = env.sessions.identity_for(session_id);
        let depth = env.sessions.echo(session_id).map(|e| e.depth).unwrap_or(0);

        env.sessions
            .create(
                cascade,
                Value::Null,
                Some(eval_session.clone()),
                Some(session_id.to_string()),
                depth,
                identity,
            )
            .map_err(|e| RunError::Validation {
                reason: format!("evaluator session create failed: {}", e),
            })?;

        let evaluator_cell = CellSpec {
            name: format!("{}_evaluator", cell.name),
            instructions: Some(prompt.to_string()),
            max_turns: 1,
            model: cell.model.clone(),
            ..Default::default()
        };
        run_bracketed_cell(env, cascade, &evaluator_cell, &eval_session, session_id, depth)
            .await
            .map_err(|message| RunError::Provider {
                message,
                retryable: false,
            })
    }
}

/// Run one cell as a branch session, bracketed like any other session
///
/// Branch sessions get the same cascade_start/cascade_complete pair a
/// top-level run gets, so per-session invariants hold for them too.
async fn run_bracketed_cell(
    env: &CellEnv,
    cascade: &Cascade,
    cell: &CellSpec,
    branch_session: &str,
    parent_session: &str,
    depth: i64,
) -> Result<CellOutcome, String> {
    let start = LogRow::new(branch_session, &cascade.doc.cascade_id, NodeType::CascadeStart)
        .with_depth(depth)
        .with_parent_session(parent_session)
        .with_cascade_json(cascade.raw.clone());
    if let Err(e) = env.sink.log(start).await {
        return Err(format!("branch start log failed: {}", e));
    }

    let result = CellExecutor::run(env, cascade, cell, branch_session, &[], None)
        .await
        .map_err(|e| e.to_string());

    let status = env.sessions.finalize(branch_session).ok();
    let mut complete = LogRow::new(branch_session, &cascade.doc.cascade_id, NodeType::CascadeComplete)
        .with_depth(depth)
        .with_parent_session(parent_session)
        .with_metadata(&serde_json::json!({"status": status}));
    if let Ok(outcome) = &result {
        complete = complete.with_content(&outcome.content);
    }
    if let Err(e) = env.sink.log(complete).await {
        warn!(error = %e, "run_bracketed_cell: branch complete log failed");
    }
    result
}

enum Selection {
    Winner { index: usize, rationale: String },
    Aggregated { content: Value, rationale: String },
}

impl Selection {
    fn rationale(&self) -> &str {
        match self {
            Selection::Winner { rationale, .. } => rationale,
            Selection::Aggregated { rationale, .. } => rationale,
        }
    }
}

fn candidates_block(succeeded: &[(usize, &CellOutcome)]) -> String {
    succeeded
        .iter()
        .map(|(index, outcome)| format!("Candidate {}:\n{}", index, render_artifact(&outcome.content)))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn render_artifact(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn sink_err(e: eyre::Report) -> RunError {
    RunError::Provider {
        message: format!("Log write failed: {}", e),
        retryable: false,
    }
}
