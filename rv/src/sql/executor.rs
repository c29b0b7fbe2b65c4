//! SqlExecutor - the statement front door
//!
//! Rewrites a statement, routes it through the engine (or the MAP
//! PARALLEL interceptor), hands `BACKGROUND` statements to the
//! scheduler, and runs the `ANALYZE` prompt over the result set when
//! requested.

use std::sync::Arc;

use eyre::{Result, eyre};
use serde_json::Value;
use tracing::{debug, info};

use crate::background::BackgroundScheduler;
use crate::identity::IdentityContext;

use super::engine::SqlEngine;
use super::parallel::execute_map_parallel;
use super::rewriter::{RewriteOutput, Rewriter};
use super::udf::UdfRuntime;

/// Result of executing one statement
#[derive(Debug, Clone)]
pub enum SqlOutcome {
    /// Rows, plus the ANALYZE digest when one was requested
    Rows { rows: Vec<Value>, analysis: Option<String> },
    /// BACKGROUND submission: look the job up later
    JobId(String),
}

/// Executes RVBBIT SQL statements end to end
#[derive(Clone)]
pub struct SqlExecutor {
    rewriter: Rewriter,
    engine: Arc<dyn SqlEngine>,
    udf: Arc<UdfRuntime>,
    background: Option<Arc<BackgroundScheduler>>,
}

impl SqlExecutor {
    pub fn new(engine: Arc<dyn SqlEngine>, udf: Arc<UdfRuntime>) -> Self {
        Self {
            rewriter: Rewriter::new(),
            engine,
            udf,
            background: None,
        }
    }

    pub fn with_background(mut self, background: Arc<BackgroundScheduler>) -> Self {
        self.background = Some(background);
        self
    }

    pub fn with_rewriter(mut self, rewriter: Rewriter) -> Self {
        self.rewriter = rewriter;
        self
    }

    /// Execute a statement; identity must already be set by the caller
    pub async fn execute(&self, sql: &str) -> Result<SqlOutcome> {
        debug!(sql_len = sql.len(), "SqlExecutor::execute: called");
        let rewritten = self.rewriter.rewrite(sql)?;

        if rewritten.flags.background {
            let Some(background) = &self.background else {
                return Err(eyre!("BACKGROUND requires a background scheduler"));
            };
            let this = self.clone();
            let identity = IdentityContext::get();
            let job_id = background
                .submit(
                    sql.to_string(),
                    Box::pin(IdentityContext::scope(identity, async move {
                        match this.execute_rewritten(&rewritten).await {
                            Ok(SqlOutcome::Rows { rows, analysis }) => {
                                Ok(serde_json::json!({"rows": rows, "analysis": analysis}))
                            }
                            Ok(SqlOutcome::JobId(id)) => Ok(serde_json::json!({"job_id": id})),
                            Err(e) => Err(e.to_string()),
                        }
                    })),
                )
                .await?;
            info!(%job_id, "SqlExecutor: statement dispatched to background");
            return Ok(SqlOutcome::JobId(job_id));
        }

        self.execute_rewritten(&rewritten).await
    }

    async fn execute_rewritten(&self, rewritten: &RewriteOutput) -> Result<SqlOutcome> {
        let sql = match (&rewritten.sql, &rewritten.map_plan) {
            // PARALLEL plan: the server drives the fan-out itself
            (None, Some(plan)) => {
                execute_map_parallel(plan, Arc::clone(&self.engine), Arc::clone(&self.udf)).await?
            }
            (Some(sql), _) => sql.clone(),
            (None, None) => return Err(eyre!("Rewriter produced neither SQL nor a plan")),
        };

        let rows = self.engine.query(&sql).await.map_err(|e| eyre!("Query failed: {}", e))?;

        let analysis = match &rewritten.flags.analyze {
            Some(prompt) => {
                let rows_json = serde_json::to_value(&rows)?;
                Some(self.udf.rvbbit(prompt, &rows_json).await)
            }
            None => None,
        };

        Ok(SqlOutcome::Rows { rows, analysis })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::client::mock::{MockLlmClient, MockReply};
    use crate::runner::CascadeRunner;
    use crate::session::SessionStore;
    use crate::sql::engine::mock::MockSqlEngine;
    use echolog::{LogStore, MemoryStore};
    use serde_json::json;

    fn fixture(replies: Vec<MockReply>) -> (SqlExecutor, Arc<MockSqlEngine>, Arc<MemoryStore>) {
        let log = Arc::new(MemoryStore::new());
        let sessions = SessionStore::new(log.clone() as Arc<dyn LogStore>);
        let llm = Arc::new(MockLlmClient::new(replies));
        let runner = CascadeRunner::new(llm, sessions);
        let udf = Arc::new(UdfRuntime::new(runner));
        let engine = Arc::new(MockSqlEngine::new());
        (
            SqlExecutor::new(engine.clone() as Arc<dyn SqlEngine>, udf),
            engine,
            log,
        )
    }

    #[tokio::test]
    async fn test_plain_statement_queries_engine() {
        let (executor, engine, _) = fixture(vec![]);
        engine.seed_table("t", vec![json!({"x": 1})]);
        let outcome = executor.execute("SELECT * FROM t").await.unwrap();
        let SqlOutcome::Rows { rows, analysis } = outcome else { panic!() };
        assert_eq!(rows.len(), 1);
        assert!(analysis.is_none());
    }

    #[tokio::test]
    async fn test_analyze_runs_prompt_over_results() {
        let (executor, engine, _) = fixture(vec![MockReply::text("two rows, both fine")]);
        engine.seed_table("t", vec![json!({"x": 1}), json!({"x": 2})]);
        let outcome = executor.execute("ANALYZE 'what stands out?' SELECT * FROM t").await.unwrap();
        let SqlOutcome::Rows { rows, analysis } = outcome else { panic!() };
        assert_eq!(rows.len(), 2);
        assert_eq!(analysis.as_deref(), Some("two rows, both fine"));
    }

    #[tokio::test]
    async fn test_background_returns_job_id_then_result() {
        let (executor, engine, _) = fixture(vec![]);
        engine.seed_table("t", vec![json!({"x": 7})]);
        let scheduler = BackgroundScheduler::new(1, 4);
        let executor = executor.with_background(Arc::clone(&scheduler));

        let outcome = executor.execute("BACKGROUND SELECT * FROM t").await.unwrap();
        let SqlOutcome::JobId(job_id) = outcome else { panic!() };

        let record = scheduler
            .wait_for(&job_id, std::time::Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(record.status, crate::background::JobStatus::Completed);
        assert_eq!(record.result.as_ref().unwrap()["rows"][0]["x"], 7);
    }

    #[tokio::test]
    async fn test_background_without_scheduler_errors() {
        let (executor, _, _) = fixture(vec![]);
        assert!(executor.execute("BACKGROUND SELECT 1").await.is_err());
    }

    #[tokio::test]
    async fn test_map_parallel_end_to_end() {
        let temp = tempfile::tempdir().unwrap();
        let cascade_path = temp.path().join("c.yaml");
        std::fs::write(
            &cascade_path,
            "cascade_id: c\ncells:\n  - name: apply\n    instructions: \"Go {{input.i}}\"\n    max_turns: 1\n",
        )
        .unwrap();

        let (executor, engine, _) = fixture(vec![MockReply::text("r0"), MockReply::text("r1")]);
        engine.seed_table("t", vec![json!({"i": 0}), json!({"i": 1})]);

        let sql = format!(
            "RVBBIT MAP PARALLEL 2 '{}' USING (SELECT * FROM t LIMIT 2)",
            cascade_path.display()
        );
        let outcome = executor.execute(&sql).await.unwrap();
        let SqlOutcome::Rows { rows, .. } = outcome else { panic!() };
        assert_eq!(rows.len(), 2);
        assert!(rows[0].get("result").is_some());
    }
}
