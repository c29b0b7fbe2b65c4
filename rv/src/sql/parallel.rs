//! MAP PARALLEL interception
//!
//! Hosted UDF calls in most engines are effectively serial, so
//! `RVBBIT MAP PARALLEL N` bypasses the engine for the map itself: the
//! USING query is materialized, rows are deduplicated when requested,
//! and a bounded pool of N workers runs the cascade per row. Input
//! order is preserved in the output regardless of completion order; the
//! result registers as a virtual table so joins and projection work
//! normally.

use std::collections::HashSet;
use std::sync::Arc;

use eyre::{Result, eyre};
use futures::stream::{FuturesOrdered, StreamExt};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::identity::IdentityContext;

use super::engine::SqlEngine;
use super::rewriter::MapPlan;
use super::udf::UdfRuntime;

/// Execute a PARALLEL plan; returns the `SELECT * FROM <virtual>` handoff
pub async fn execute_map_parallel(
    plan: &MapPlan,
    engine: Arc<dyn SqlEngine>,
    udf: Arc<UdfRuntime>,
) -> Result<String> {
    let workers = plan
        .parallelism
        .ok_or_else(|| eyre!("execute_map_parallel called without PARALLEL"))?;
    debug!(cascade = %plan.cascade_path, workers, "execute_map_parallel: called");

    // 1. Materialize the input rows
    let rows = engine
        .query(&plan.input_query)
        .await
        .map_err(|e| eyre!("Failed to materialize USING query: {}", e))?;

    // 2. Dedupe by key (or whole row) when DISTINCT was specified
    let rows = if plan.distinct {
        dedupe(rows, plan.distinct_key.as_deref())
    } else {
        rows
    };
    let row_count = rows.len();

    // 3. Bounded pool; results recorded at input-order indexes
    let semaphore = Arc::new(Semaphore::new(workers));
    let identity = IdentityContext::get();
    let mut futures = FuturesOrdered::new();
    for row in rows.iter().cloned() {
        let semaphore = Arc::clone(&semaphore);
        let udf = Arc::clone(&udf);
        let cascade_path = plan.cascade_path.clone();
        let cache_ttl = plan.cache_ttl;
        let identity = identity.clone();
        futures.push_back(tokio::spawn(IdentityContext::scope(identity, async move {
            let _permit = semaphore.acquire().await;
            udf.rvbbit_run(&cascade_path, &row, cache_ttl).await
        })));
    }

    // 4. Completion barrier, input order preserved by FuturesOrdered
    let mut results = Vec::with_capacity(row_count);
    while let Some(joined) = futures.next().await {
        results.push(joined.map_err(|e| eyre!("map worker failed: {}", e))?);
    }

    // 5. Shape output rows and register the virtual table
    let out_rows: Vec<Value> = rows
        .iter()
        .zip(results.iter())
        .map(|(row, result)| shape_row(row, result, plan))
        .collect();

    let table = format!("rvbbit_map_{}", uuid::Uuid::now_v7().simple());
    engine
        .register_table(&table, out_rows)
        .await
        .map_err(|e| eyre!("Failed to register result table: {}", e))?;

    info!(rows = row_count, workers, %table, "MAP PARALLEL complete");
    Ok(format!("SELECT * FROM {}", table))
}

/// Keep the first occurrence per key, preserving input order
fn dedupe(rows: Vec<Value>, key: Option<&str>) -> Vec<Value> {
    let mut seen = HashSet::new();
    rows.into_iter()
        .filter(|row| {
            let fingerprint = match key {
                Some(column) => row.get(column).map(|v| v.to_string()).unwrap_or_default(),
                None => row.to_string(),
            };
            seen.insert(fingerprint)
        })
        .collect()
}

/// Input row + result column, or the typed AS projection
fn shape_row(row: &Value, result: &str, plan: &MapPlan) -> Value {
    match &plan.output_schema {
        None => {
            let mut obj = row.as_object().cloned().unwrap_or_default();
            obj.insert(plan.result_alias.clone(), Value::String(result.to_string()));
            Value::Object(obj)
        }
        Some(cols) => {
            let parsed: Value = serde_json::from_str(result).unwrap_or(Value::Null);
            let mut obj = serde_json::Map::new();
            for (name, ty) in cols {
                let raw = parsed.get(name).cloned().unwrap_or(Value::Null);
                obj.insert(name.clone(), cast_value(raw, ty));
            }
            Value::Object(obj)
        }
    }
}

/// Best-effort cast into the declared column type
fn cast_value(value: Value, ty: &str) -> Value {
    let upper = ty.to_uppercase();
    if upper.contains("INT") {
        match &value {
            Value::Number(_) => value,
            Value::String(s) => s.trim().parse::<i64>().map(Value::from).unwrap_or(Value::Null),
            _ => Value::Null,
        }
    } else if upper.contains("DOUBLE") || upper.contains("FLOAT") || upper.contains("REAL") || upper.contains("DECIMAL")
    {
        match &value {
            Value::Number(_) => value,
            Value::String(s) => s.trim().parse::<f64>().map(Value::from).unwrap_or(Value::Null),
            _ => Value::Null,
        }
    } else if upper.contains("BOOL") {
        match &value {
            Value::Bool(_) => value,
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "t" | "1" => Value::Bool(true),
                "false" | "f" | "0" => Value::Bool(false),
                _ => Value::Null,
            },
            _ => Value::Null,
        }
    } else {
        match value {
            Value::String(_) => value,
            Value::Null => Value::Null,
            other => Value::String(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::client::mock::{MockLlmClient, MockReply};
    use crate::runner::CascadeRunner;
    use crate::session::SessionStore;
    use crate::sql::engine::mock::MockSqlEngine;
    use crate::sql::rewriter::Rewriter;
    use echolog::{LogStore, MemoryStore};
    use serde_json::json;
    use std::time::Duration;

    fn fixture(replies: Vec<MockReply>) -> (Arc<UdfRuntime>, Arc<MockSqlEngine>, Arc<MemoryStore>) {
        let log = Arc::new(MemoryStore::new());
        let sessions = SessionStore::new(log.clone() as Arc<dyn LogStore>);
        let llm = Arc::new(MockLlmClient::new(replies));
        let runner = CascadeRunner::new(llm, sessions);
        // Zero TTL: these tests reason about exact call assignment
        let udf = Arc::new(UdfRuntime::new(runner).with_default_ttl(Some(Duration::ZERO)));
        (udf, Arc::new(MockSqlEngine::new()), log)
    }

    fn plan_for(sql: &str) -> MapPlan {
        Rewriter::new().rewrite(sql).unwrap().map_plan.unwrap()
    }

    fn write_cascade(dir: &std::path::Path) -> String {
        let path = dir.join("times10.yaml");
        std::fs::write(
            &path,
            "cascade_id: times10\ncells:\n  - name: apply\n    instructions: \"Multiply {{input.i}} by 10\"\n    max_turns: 1\n",
        )
        .unwrap();
        path.display().to_string()
    }

    #[tokio::test]
    async fn test_order_preserved_despite_reversed_completion() {
        let temp = tempfile::tempdir().unwrap();
        let cascade_path = write_cascade(temp.path());

        // Delay inversely proportional to input: later rows finish first
        let (udf, engine, _) = fixture(vec![
            MockReply::text("0").with_delay(Duration::from_millis(80)),
            MockReply::text("10").with_delay(Duration::from_millis(60)),
            MockReply::text("20").with_delay(Duration::from_millis(40)),
            MockReply::text("30").with_delay(Duration::from_millis(5)),
        ]);
        engine.seed_table("t", vec![json!({"i": 0}), json!({"i": 1}), json!({"i": 2}), json!({"i": 3})]);

        let plan = plan_for(&format!(
            "RVBBIT MAP PARALLEL 4 '{}' USING (SELECT * FROM t LIMIT 4)",
            cascade_path
        ));
        let handoff = execute_map_parallel(&plan, engine.clone() as Arc<dyn SqlEngine>, udf)
            .await
            .unwrap();
        assert!(handoff.starts_with("SELECT * FROM rvbbit_map_"));

        let table = handoff.strip_prefix("SELECT * FROM ").unwrap();
        let rows = engine.table(table).unwrap();
        // Input order preserved: i ascends even though completion reversed
        let is: Vec<i64> = rows.iter().map(|r| r["i"].as_i64().unwrap()).collect();
        assert_eq!(is, vec![0, 1, 2, 3]);
        // Each row got a result; with parallel dispatch the text->row
        // assignment is scheduling-dependent, but all four appear
        let mut results: Vec<&str> = rows.iter().map(|r| r["result"].as_str().unwrap()).collect();
        results.sort_unstable();
        assert_eq!(results, vec!["0", "10", "20", "30"]);
    }

    #[tokio::test]
    async fn test_distinct_dedupes_before_dispatch() {
        let temp = tempfile::tempdir().unwrap();
        let cascade_path = write_cascade(temp.path());

        let (udf, engine, _) = fixture(vec![MockReply::text("a"), MockReply::text("b")]);
        engine.seed_table(
            "t",
            vec![json!({"body": "x"}), json!({"body": "x"}), json!({"body": "y"})],
        );

        let plan = plan_for(&format!(
            "RVBBIT MAP PARALLEL 2 DISTINCT '{}' USING (SELECT * FROM t LIMIT 10) WITH (dedupe_by='body')",
            cascade_path
        ));
        let handoff = execute_map_parallel(&plan, engine.clone() as Arc<dyn SqlEngine>, udf)
            .await
            .unwrap();

        let table = handoff.strip_prefix("SELECT * FROM ").unwrap();
        let rows = engine.table(table).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["body"], "x");
        assert_eq!(rows[1]["body"], "y");
    }

    #[tokio::test]
    async fn test_typed_projection() {
        let temp = tempfile::tempdir().unwrap();
        let cascade_path = write_cascade(temp.path());

        let (udf, engine, _) = fixture(vec![MockReply::text(r#"{"score": "0.9", "label": "good"}"#)]);
        engine.seed_table("t", vec![json!({"i": 1})]);

        let plan = plan_for(&format!(
            "RVBBIT MAP PARALLEL 1 '{}' AS (score DOUBLE, label VARCHAR) USING (SELECT * FROM t LIMIT 1)",
            cascade_path
        ));
        let handoff = execute_map_parallel(&plan, engine.clone() as Arc<dyn SqlEngine>, udf)
            .await
            .unwrap();

        let table = handoff.strip_prefix("SELECT * FROM ").unwrap();
        let rows = engine.table(table).unwrap();
        assert_eq!(rows[0]["score"], json!(0.9));
        assert_eq!(rows[0]["label"], "good");
    }

    #[tokio::test]
    async fn test_failed_rows_carry_error_scalar() {
        let temp = tempfile::tempdir().unwrap();
        let cascade_path = write_cascade(temp.path());

        // One worker: deterministic assignment. Row 0 fails (3 retry
        // attempts), row 1 succeeds.
        let (udf, engine, _) = fixture(vec![
            MockReply::failure("down"),
            MockReply::failure("down"),
            MockReply::failure("down"),
            MockReply::text("fine"),
        ]);
        engine.seed_table("t", vec![json!({"i": 0}), json!({"i": 1})]);

        let plan = plan_for(&format!(
            "RVBBIT MAP PARALLEL 1 '{}' USING (SELECT * FROM t LIMIT 2)",
            cascade_path
        ));
        let handoff = execute_map_parallel(&plan, engine.clone() as Arc<dyn SqlEngine>, udf)
            .await
            .unwrap();

        let table = handoff.strip_prefix("SELECT * FROM ").unwrap();
        let rows = engine.table(table).unwrap();
        assert_eq!(rows[0]["result"], "ERROR");
        assert_eq!(rows[1]["result"], "fine");
    }

    #[tokio::test]
    async fn test_identity_rolls_up_across_workers() {
        let temp = tempfile::tempdir().unwrap();
        let cascade_path = write_cascade(temp.path());

        let (udf, engine, log) = fixture(vec![MockReply::text("r1"), MockReply::text("r2"), MockReply::text("r3")]);
        engine.seed_table("t", vec![json!({"i": 1}), json!({"i": 2}), json!({"i": 3})]);

        let plan = plan_for(&format!(
            "RVBBIT MAP PARALLEL 3 '{}' USING (SELECT * FROM t LIMIT 3)",
            cascade_path
        ));
        let identity = crate::identity::Identity::new("http-abc-1", json!({"sql": "RVBBIT MAP ..."}));
        IdentityContext::scope(identity, async {
            execute_map_parallel(&plan, engine.clone() as Arc<dyn SqlEngine>, udf).await
        })
        .await
        .unwrap();

        // Every session the map produced rolls up to the submitting query
        let rows = log.rows_for_caller("http-abc-1").unwrap();
        assert!(!rows.is_empty());
        let session_count = log
            .sessions()
            .unwrap()
            .iter()
            .filter(|s| s.caller_id.as_deref() == Some("http-abc-1"))
            .count();
        assert_eq!(session_count, 3);
    }
}
