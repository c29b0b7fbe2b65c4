//! LogSink - blocking, per-message append to the unified log
//!
//! One write path for every event the engine emits. Two contracts matter:
//!
//! 1. Cost is enriched synchronously: when an event references an LLM
//!    call by `request_id`, the provider usage record is fetched (with a
//!    short bounded retry) and the complete row is written atomically.
//!    There is no later "cost update" row.
//! 2. Identity comes from the session registry, keyed by the event's
//!    `session_id` - never from ambient thread state, because background
//!    workers reuse threads across sessions.

use std::sync::Arc;
use std::time::Duration;

use echolog::{LogRow, LogStore};
use eyre::Result;
use tracing::{debug, warn};

use crate::llm::LlmClient;
use crate::session::SessionStore;

/// Attempts to fetch a usage record before giving up
const ENRICH_ATTEMPTS: u32 = 3;
/// Pause between enrichment attempts
const ENRICH_BACKOFF: Duration = Duration::from_millis(50);

/// The engine's single write path into the unified log
#[derive(Clone)]
pub struct LogSink {
    store: Arc<dyn LogStore>,
    sessions: SessionStore,
    llm: Option<Arc<dyn LlmClient>>,
}

impl LogSink {
    pub fn new(sessions: SessionStore, llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self {
            store: sessions.log_store(),
            sessions,
            llm,
        }
    }

    /// Append one event, enriched and identity-stamped, blocking until durable
    ///
    /// Returns the row as written so callers can chain `parent_id`s.
    pub async fn log(&self, mut row: LogRow) -> Result<LogRow> {
        debug!(session_id = %row.session_id, node_type = row.node_type.as_str(), "LogSink::log: called");

        // Identity: authoritative lookup by session id
        if row.caller_id.is_none() {
            let identity = self.sessions.identity_for(&row.session_id);
            if !identity.is_empty() {
                row.caller_id = Some(identity.caller_id);
                row.invocation_metadata_json = Some(identity.invocation_metadata.to_string());
            }
        }

        // Cost: synchronous enrichment keyed by request_id
        if row.cost.is_none() {
            if let Some(request_id) = row.request_id.clone() {
                match self.fetch_usage(&request_id).await {
                    Some(record) => {
                        row.tokens_in = Some(record.tokens_in as i64);
                        row.tokens_out = Some(record.tokens_out as i64);
                        row.total_tokens = Some((record.tokens_in + record.tokens_out) as i64);
                        row.cost = Some(record.cost);
                        self.sessions
                            .add_cost(&row.session_id, record.cost, (record.tokens_in + record.tokens_out) as i64);
                    }
                    None => {
                        warn!(%request_id, "LogSink::log: usage record unavailable, writing row without cost");
                    }
                }
            }
        }

        self.store.append(&row)?;
        Ok(row)
    }

    async fn fetch_usage(&self, request_id: &str) -> Option<crate::llm::UsageRecord> {
        let llm = self.llm.as_ref()?;
        for attempt in 0..ENRICH_ATTEMPTS {
            if let Some(record) = llm.usage_record(request_id).await {
                return Some(record);
            }
            debug!(%request_id, attempt, "LogSink::fetch_usage: record not yet available");
            tokio::time::sleep(ENRICH_BACKOFF).await;
        }
        None
    }

    /// Direct access to the backing store (roll-up queries in tests/CLI)
    pub fn store(&self) -> Arc<dyn LogStore> {
        Arc::clone(&self.store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cascade::Cascade;
    use crate::identity::Identity;
    use crate::llm::client::mock::{MockLlmClient, MockReply};
    use crate::llm::{CompletionRequest, LlmClient};
    use echolog::{MemoryStore, NodeType};

    fn fixture() -> (SessionStore, Arc<MemoryStore>) {
        let log = Arc::new(MemoryStore::new());
        (SessionStore::new(log.clone() as Arc<dyn LogStore>), log)
    }

    fn cascade() -> Cascade {
        Cascade::from_yaml("cascade_id: demo\ncells:\n  - name: only\n    instructions: hi\n").unwrap()
    }

    #[tokio::test]
    async fn test_identity_stamped_from_session_registry() {
        let (sessions, log) = fixture();
        let session_id = sessions
            .create(
                &cascade(),
                serde_json::json!({}),
                None,
                None,
                0,
                Identity::new("http-abc-1", serde_json::json!({"sql": "SELECT 1"})),
            )
            .unwrap();

        let sink = LogSink::new(sessions, None);
        sink.log(LogRow::new(&session_id, "demo", NodeType::CellStart))
            .await
            .unwrap();

        let rows = log.rows_for_session(&session_id).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].caller_id.as_deref(), Some("http-abc-1"));
        assert!(rows[0].invocation_metadata_json.as_deref().unwrap().contains("SELECT 1"));
    }

    #[tokio::test]
    async fn test_cost_enriched_before_row_is_queryable() {
        let (sessions, log) = fixture();
        let session_id = sessions
            .create(&cascade(), serde_json::json!({}), None, None, 0, Identity::empty())
            .unwrap();

        let client = Arc::new(MockLlmClient::new(vec![MockReply::text("hi").with_usage(1000, 100)]));
        let response = client
            .complete(CompletionRequest {
                system_prompt: "s".into(),
                messages: vec![],
                tools: vec![],
                max_tokens: 100,
                model: None,
            })
            .await
            .unwrap();

        let sink = LogSink::new(sessions.clone(), Some(client.clone() as Arc<dyn LlmClient>));
        sink.log(
            LogRow::new(&session_id, "demo", NodeType::Agent).with_request_id(&response.request_id),
        )
        .await
        .unwrap();

        // The row landed with tokens and cost already populated
        let rows = log.rows_for_session(&session_id).unwrap();
        assert_eq!(rows[0].tokens_in, Some(1000));
        assert_eq!(rows[0].tokens_out, Some(100));
        assert_eq!(rows[0].total_tokens, Some(1100));
        assert!(rows[0].cost.unwrap() > 0.0);

        // And the session totals moved in the same step
        let echo = sessions.echo(&session_id).unwrap();
        assert_eq!(echo.tokens_total, 1100);
    }

    #[tokio::test]
    async fn test_unknown_request_id_writes_row_without_cost() {
        let (sessions, log) = fixture();
        let session_id = sessions
            .create(&cascade(), serde_json::json!({}), None, None, 0, Identity::empty())
            .unwrap();

        let client = Arc::new(MockLlmClient::new(vec![]));
        let sink = LogSink::new(sessions, Some(client as Arc<dyn LlmClient>));
        sink.log(LogRow::new(&session_id, "demo", NodeType::Agent).with_request_id("ghost"))
            .await
            .unwrap();

        let rows = log.rows_for_session(&session_id).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].cost.is_none());
    }

    #[tokio::test]
    async fn test_append_order_is_preserved() {
        let (sessions, log) = fixture();
        let session_id = sessions
            .create(&cascade(), serde_json::json!({}), None, None, 0, Identity::empty())
            .unwrap();
        let sink = LogSink::new(sessions, None);

        for turn in 0..5 {
            sink.log(LogRow::new(&session_id, "demo", NodeType::Agent).with_turn(turn))
                .await
                .unwrap();
        }

        let turns: Vec<i64> = log
            .rows_for_session(&session_id)
            .unwrap()
            .iter()
            .filter_map(|r| r.turn_number)
            .collect();
        assert_eq!(turns, vec![0, 1, 2, 3, 4]);
    }
}
