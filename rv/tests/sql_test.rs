//! End-to-end SQL surface tests
//!
//! The literal scenarios: semantic SQL with caller roll-up, and
//! identity surviving BACKGROUND execution on a foreign thread.

use std::sync::Arc;
use std::time::Duration;

use rvbbit::background::{BackgroundScheduler, JobStatus};
use rvbbit::identity::{Identity, IdentityContext};
use rvbbit::llm::client::mock::{MockLlmClient, MockReply};
use rvbbit::runner::CascadeRunner;
use rvbbit::session::SessionStore;
use rvbbit::sql::engine::mock::MockSqlEngine;
use rvbbit::sql::{Rewriter, SqlEngine, SqlExecutor, UdfRuntime};

use echolog::{LogStore, MemoryStore};
use serde_json::json;
use serial_test::serial;

fn fixture(replies: Vec<MockReply>) -> (Arc<UdfRuntime>, Arc<MockSqlEngine>, Arc<MemoryStore>) {
    let log = Arc::new(MemoryStore::new());
    let sessions = SessionStore::new(log.clone() as Arc<dyn LogStore>);
    let llm = Arc::new(MockLlmClient::new(replies));
    let runner = CascadeRunner::new(llm, sessions);
    let udf = Arc::new(UdfRuntime::new(runner).with_default_ttl(Some(Duration::ZERO)));
    (udf, Arc::new(MockSqlEngine::new()), log)
}

#[tokio::test]
#[serial]
async fn test_semantic_sql_with_cost_rollup() {
    // SELECT id, text MEANS 'positive' FROM tweets LIMIT 3 from an HTTP
    // caller: three UDF invocations, each a one-cell session with no
    // parent, all rolling up to the caller.
    let (udf, _, log) = fixture(vec![
        MockReply::text("true").with_usage(100, 10),
        MockReply::text("false").with_usage(120, 12),
        MockReply::text("true").with_usage(140, 14),
    ]);

    // The rewriter produces the canonical argument order first
    let rewritten = Rewriter::new()
        .rewrite("SELECT id, text MEANS 'positive' FROM tweets LIMIT 3")
        .unwrap();
    assert_eq!(
        rewritten.sql.as_deref(),
        Some("SELECT id, rvbbit_means(text, 'positive') FROM tweets LIMIT 3")
    );

    // The engine evaluates rvbbit_means per row by re-entering the UDF
    // runtime; emulate the three row invocations under the HTTP identity.
    let identity = Identity::new("http-abc-1", json!({"sql": "SELECT id, text MEANS 'positive' FROM tweets LIMIT 3"}));
    IdentityContext::scope(identity, async {
        for text in ["great stuff", "awful day", "love this"] {
            udf.rvbbit("Does the text mean: positive? Answer true or false.", &json!(text))
                .await;
        }
    })
    .await;

    // Three sessions, each parentless, each owned by the caller
    let sessions: Vec<_> = log.sessions().unwrap();
    assert_eq!(sessions.len(), 3);
    for session in &sessions {
        assert!(session.parent_session_id.is_none());
        assert_eq!(session.caller_id.as_deref(), Some("http-abc-1"));
    }

    // Roll-up: summing cost grouped by caller matches the per-session sum
    let per_session_total: f64 = sessions
        .iter()
        .map(|s| {
            log.rows_for_session(&s.session_id)
                .unwrap()
                .iter()
                .filter_map(|r| r.cost)
                .sum::<f64>()
        })
        .sum();
    let rollup = log.cost_for_caller("http-abc-1").unwrap();
    assert!(rollup > 0.0);
    assert!((rollup - per_session_total).abs() < 1e-9);

    let costs = log.caller_costs().unwrap();
    assert_eq!(costs[0].caller_id, "http-abc-1");
    assert_eq!(costs[0].session_count, 3);
}

#[tokio::test]
#[serial]
async fn test_identity_survives_background_thread_hop() {
    // BACKGROUND SELECT rvbbit('...', x) FROM t: the worker executes the
    // cascade after the submitting call returned; session rows still
    // carry the submitter's caller_id.
    let temp = tempfile::tempdir().unwrap();
    let cascade_path = temp.path().join("probe.yaml");
    std::fs::write(
        &cascade_path,
        "cascade_id: probe\ncells:\n  - name: apply\n    instructions: \"Inspect {{input.x}}\"\n    max_turns: 1\n",
    )
    .unwrap();

    let (udf, engine, log) = fixture(vec![MockReply::text("seen")]);
    engine.seed_table("t", vec![json!({"x": "payload"})]);

    let scheduler = BackgroundScheduler::new(1, 4);
    let executor = SqlExecutor::new(engine.clone() as Arc<dyn SqlEngine>, udf).with_background(Arc::clone(&scheduler));

    let sql = format!(
        "BACKGROUND RVBBIT MAP PARALLEL 1 '{}' USING (SELECT * FROM t LIMIT 1)",
        cascade_path.display()
    );
    let identity = Identity::new("http-bg-9", json!({"sql": sql}));
    let job_id = IdentityContext::scope(identity, async {
        match executor.execute(&sql).await.unwrap() {
            rvbbit::sql::SqlOutcome::JobId(id) => id,
            other => panic!("expected job id, got {:?}", other),
        }
    })
    .await;

    // The job completes on a worker, off the submitting task
    let record = scheduler.wait_for(&job_id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(record.status, JobStatus::Completed);

    // Every session row the background map produced rolls up
    let sessions = log.sessions().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].caller_id.as_deref(), Some("http-bg-9"));
    for row in log.rows_for_session(&sessions[0].session_id).unwrap() {
        assert_eq!(row.caller_id.as_deref(), Some("http-bg-9"));
    }
}

#[tokio::test]
async fn test_map_parallel_matches_serial_row_order() {
    // MAP PARALLEL over a deterministic (cached) cascade returns rows in
    // the same order as the sequential emission would.
    let temp = tempfile::tempdir().unwrap();
    let cascade_path = temp.path().join("id.yaml");
    std::fs::write(
        &cascade_path,
        "cascade_id: ident\ncells:\n  - name: apply\n    instructions: \"Echo {{input.i}}\"\n    max_turns: 1\n",
    )
    .unwrap();

    let (udf, engine, _) = fixture(vec![
        MockReply::text("r").with_delay(Duration::from_millis(50)),
        MockReply::text("r").with_delay(Duration::from_millis(30)),
        MockReply::text("r").with_delay(Duration::from_millis(10)),
    ]);
    engine.seed_table("t", vec![json!({"i": 0}), json!({"i": 1}), json!({"i": 2})]);

    let executor = SqlExecutor::new(engine.clone() as Arc<dyn SqlEngine>, udf);
    let sql = format!(
        "RVBBIT MAP PARALLEL 3 '{}' USING (SELECT * FROM t LIMIT 3)",
        cascade_path.display()
    );
    let outcome = executor.execute(&sql).await.unwrap();
    let rvbbit::sql::SqlOutcome::Rows { rows, .. } = outcome else {
        panic!()
    };
    let is: Vec<i64> = rows.iter().map(|r| r["i"].as_i64().unwrap()).collect();
    assert_eq!(is, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_rewriter_idempotence_over_the_full_surface() {
    let rewriter = Rewriter::new();
    for sql in [
        "SELECT id, text MEANS 'positive' FROM tweets LIMIT 3",
        "SELECT * FROM t WHERE body NOT ABOUT 'spam'",
        "SELECT * FROM VECTOR_SEARCH('churn', notes.body, 8, 0.4)",
        "SELECT region, SUMMARIZE(feedback) FROM surveys GROUP BY region",
        "SELECT * FROM t ORDER BY body RELEVANCE TO 'pricing'",
    ] {
        let once = rewriter.rewrite(sql).unwrap().sql.unwrap();
        let twice = rewriter.rewrite(&once).unwrap().sql.unwrap();
        assert_eq!(once, twice, "rewriter not idempotent for: {}", sql);
    }
}
