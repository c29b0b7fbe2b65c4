//! LogStore - append-only persistence for the unified event log
//!
//! Three tables: `log_rows` (one per event), `state_snapshots` (one per
//! durable state write), `cascade_sessions` (one per run, holding the
//! verbatim cascade document). All writes are single-row inserts with no
//! cross-row locking; ordering within a session comes from the writer,
//! not the store.

use std::path::Path;
use std::sync::Mutex;

use eyre::{Context, Result};
use rusqlite::{Connection, named_params};
use tracing::debug;

use crate::row::{CascadeSessionRow, LogRow, NodeType, Role, StateRow};

/// Per-caller cost roll-up line
#[derive(Clone, Debug, PartialEq)]
pub struct CallerCost {
    pub caller_id: String,
    pub total_cost: f64,
    pub total_tokens: i64,
    pub session_count: i64,
}

/// Append-only event log store
///
/// Implementations must make `append` durable before returning; the
/// engine's ordering guarantees depend on it.
pub trait LogStore: Send + Sync {
    /// Persist one event row
    fn append(&self, row: &LogRow) -> Result<()>;

    /// Persist one durable state snapshot
    fn append_state(&self, row: &StateRow) -> Result<()>;

    /// Persist the cascade-session record for a run
    fn append_session(&self, row: &CascadeSessionRow) -> Result<()>;

    /// All rows for a session, in write order
    fn rows_for_session(&self, session_id: &str) -> Result<Vec<LogRow>>;

    /// All rows carrying the given caller id, in write order
    fn rows_for_caller(&self, caller_id: &str) -> Result<Vec<LogRow>>;

    /// Sum of `cost` over all rows for a caller
    fn cost_for_caller(&self, caller_id: &str) -> Result<f64>;

    /// Cost roll-up grouped by caller
    fn caller_costs(&self) -> Result<Vec<CallerCost>>;

    /// Most recent durable value for a state key in a session
    fn latest_state(&self, session_id: &str, key: &str) -> Result<Option<StateRow>>;

    /// Recent completed outputs for a cell across sessions
    ///
    /// Returns `content_json` of the newest `cell_complete` rows for the
    /// given cascade/cell, for use as few-shot exemplars.
    fn training_exemplars(&self, cascade_id: &str, cell_name: &str, limit: usize) -> Result<Vec<String>>;

    /// The cascade-session record for a run
    fn session(&self, session_id: &str) -> Result<Option<CascadeSessionRow>>;

    /// All cascade-session records, newest first
    fn sessions(&self) -> Result<Vec<CascadeSessionRow>>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS log_rows (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp REAL NOT NULL,
    timestamp_iso TEXT NOT NULL,
    session_id TEXT NOT NULL,
    trace_id TEXT NOT NULL,
    parent_id TEXT,
    parent_session_id TEXT,
    parent_message_id TEXT,
    node_type TEXT NOT NULL,
    role TEXT,
    depth INTEGER NOT NULL DEFAULT 0,
    candidate_index INTEGER,
    is_winner INTEGER,
    reforge_step INTEGER,
    attempt_number INTEGER,
    turn_number INTEGER,
    cascade_id TEXT NOT NULL,
    cell_name TEXT,
    cell_json TEXT,
    cascade_json TEXT,
    model TEXT,
    request_id TEXT,
    provider TEXT,
    duration_ms INTEGER,
    tokens_in INTEGER,
    tokens_out INTEGER,
    total_tokens INTEGER,
    cost REAL,
    content_json TEXT,
    full_request_json TEXT,
    full_response_json TEXT,
    tool_calls_json TEXT,
    images_json TEXT,
    has_images INTEGER NOT NULL DEFAULT 0,
    has_base64 INTEGER NOT NULL DEFAULT 0,
    metadata_json TEXT,
    caller_id TEXT,
    invocation_metadata_json TEXT
);
CREATE INDEX IF NOT EXISTS idx_log_rows_session ON log_rows(session_id);
CREATE INDEX IF NOT EXISTS idx_log_rows_caller ON log_rows(caller_id);

CREATE TABLE IF NOT EXISTS state_snapshots (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    cascade_id TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    value_type TEXT NOT NULL,
    cell_name TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_state_session_key ON state_snapshots(session_id, key);

CREATE TABLE IF NOT EXISTS cascade_sessions (
    session_id TEXT PRIMARY KEY,
    cascade_id TEXT NOT NULL,
    parent_session_id TEXT,
    depth INTEGER NOT NULL DEFAULT 0,
    cascade_raw TEXT NOT NULL,
    input_data TEXT NOT NULL,
    caller_id TEXT,
    invocation_metadata_json TEXT,
    created_at TEXT NOT NULL
);
";

/// SQLite-backed log store
///
/// A single connection behind a mutex: appends are short single-row
/// inserts and the engine serializes per-session writes anyway.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (and initialize) a store at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        debug!(path = %path.as_ref().display(), "SqliteStore::open: called");
        let conn = Connection::open(path.as_ref()).context("Failed to open log store")?;
        conn.execute_batch(SCHEMA).context("Failed to initialize log store schema")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open an in-memory store (tests, ephemeral runs)
    pub fn open_in_memory() -> Result<Self> {
        debug!("SqliteStore::open_in_memory: called");
        let conn = Connection::open_in_memory().context("Failed to open in-memory log store")?;
        conn.execute_batch(SCHEMA).context("Failed to initialize log store schema")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn row_from_sql(r: &rusqlite::Row<'_>) -> rusqlite::Result<LogRow> {
    let node_type: String = r.get("node_type")?;
    let role: Option<String> = r.get("role")?;
    Ok(LogRow {
        timestamp: r.get("timestamp")?,
        timestamp_iso: r.get("timestamp_iso")?,
        session_id: r.get("session_id")?,
        trace_id: r.get("trace_id")?,
        parent_id: r.get("parent_id")?,
        parent_session_id: r.get("parent_session_id")?,
        parent_message_id: r.get("parent_message_id")?,
        node_type: NodeType::parse(&node_type).unwrap_or(NodeType::System),
        role: role.as_deref().and_then(Role::parse),
        depth: r.get("depth")?,
        candidate_index: r.get("candidate_index")?,
        is_winner: r.get("is_winner")?,
        reforge_step: r.get("reforge_step")?,
        attempt_number: r.get("attempt_number")?,
        turn_number: r.get("turn_number")?,
        cascade_id: r.get("cascade_id")?,
        cell_name: r.get("cell_name")?,
        cell_json: r.get("cell_json")?,
        cascade_json: r.get("cascade_json")?,
        model: r.get("model")?,
        request_id: r.get("request_id")?,
        provider: r.get("provider")?,
        duration_ms: r.get("duration_ms")?,
        tokens_in: r.get("tokens_in")?,
        tokens_out: r.get("tokens_out")?,
        total_tokens: r.get("total_tokens")?,
        cost: r.get("cost")?,
        content_json: r.get("content_json")?,
        full_request_json: r.get("full_request_json")?,
        full_response_json: r.get("full_response_json")?,
        tool_calls_json: r.get("tool_calls_json")?,
        images_json: r.get("images_json")?,
        has_images: r.get("has_images")?,
        has_base64: r.get("has_base64")?,
        metadata_json: r.get("metadata_json")?,
        caller_id: r.get("caller_id")?,
        invocation_metadata_json: r.get("invocation_metadata_json")?,
    })
}

fn session_from_sql(r: &rusqlite::Row<'_>) -> rusqlite::Result<CascadeSessionRow> {
    let created_at: String = r.get("created_at")?;
    Ok(CascadeSessionRow {
        session_id: r.get("session_id")?,
        cascade_id: r.get("cascade_id")?,
        parent_session_id: r.get("parent_session_id")?,
        depth: r.get("depth")?,
        cascade_raw: r.get("cascade_raw")?,
        input_data: r.get("input_data")?,
        caller_id: r.get("caller_id")?,
        invocation_metadata_json: r.get("invocation_metadata_json")?,
        created_at: created_at.parse().unwrap_or_else(|_| chrono::Utc::now()),
    })
}

fn state_from_sql(r: &rusqlite::Row<'_>) -> rusqlite::Result<StateRow> {
    let created_at: String = r.get("created_at")?;
    Ok(StateRow {
        session_id: r.get("session_id")?,
        cascade_id: r.get("cascade_id")?,
        key: r.get("key")?,
        value: r.get("value")?,
        value_type: r.get("value_type")?,
        cell_name: r.get("cell_name")?,
        created_at: created_at.parse().unwrap_or_else(|_| chrono::Utc::now()),
    })
}

impl LogStore for SqliteStore {
    fn append(&self, row: &LogRow) -> Result<()> {
        debug!(session_id = %row.session_id, node_type = row.node_type.as_str(), "SqliteStore::append");
        let conn = self.lock();
        conn.execute(
            "INSERT INTO log_rows (
                timestamp, timestamp_iso, session_id, trace_id, parent_id,
                parent_session_id, parent_message_id, node_type, role, depth,
                candidate_index, is_winner, reforge_step, attempt_number, turn_number,
                cascade_id, cell_name, cell_json, cascade_json, model,
                request_id, provider, duration_ms, tokens_in, tokens_out,
                total_tokens, cost, content_json, full_request_json, full_response_json,
                tool_calls_json, images_json, has_images, has_base64, metadata_json,
                caller_id, invocation_metadata_json
            ) VALUES (
                :timestamp, :timestamp_iso, :session_id, :trace_id, :parent_id,
                :parent_session_id, :parent_message_id, :node_type, :role, :depth,
                :candidate_index, :is_winner, :reforge_step, :attempt_number, :turn_number,
                :cascade_id, :cell_name, :cell_json, :cascade_json, :model,
                :request_id, :provider, :duration_ms, :tokens_in, :tokens_out,
                :total_tokens, :cost, :content_json, :full_request_json, :full_response_json,
                :tool_calls_json, :images_json, :has_images, :has_base64, :metadata_json,
                :caller_id, :invocation_metadata_json
            )",
            named_params! {
                ":timestamp": row.timestamp,
                ":timestamp_iso": row.timestamp_iso,
                ":session_id": row.session_id,
                ":trace_id": row.trace_id,
                ":parent_id": row.parent_id,
                ":parent_session_id": row.parent_session_id,
                ":parent_message_id": row.parent_message_id,
                ":node_type": row.node_type.as_str(),
                ":role": row.role.map(|r| r.as_str()),
                ":depth": row.depth,
                ":candidate_index": row.candidate_index,
                ":is_winner": row.is_winner,
                ":reforge_step": row.reforge_step,
                ":attempt_number": row.attempt_number,
                ":turn_number": row.turn_number,
                ":cascade_id": row.cascade_id,
                ":cell_name": row.cell_name,
                ":cell_json": row.cell_json,
                ":cascade_json": row.cascade_json,
                ":model": row.model,
                ":request_id": row.request_id,
                ":provider": row.provider,
                ":duration_ms": row.duration_ms,
                ":tokens_in": row.tokens_in,
                ":tokens_out": row.tokens_out,
                ":total_tokens": row.total_tokens,
                ":cost": row.cost,
                ":content_json": row.content_json,
                ":full_request_json": row.full_request_json,
                ":full_response_json": row.full_response_json,
                ":tool_calls_json": row.tool_calls_json,
                ":images_json": row.images_json,
                ":has_images": row.has_images,
                ":has_base64": row.has_base64,
                ":metadata_json": row.metadata_json,
                ":caller_id": row.caller_id,
                ":invocation_metadata_json": row.invocation_metadata_json,
            },
        )
        .context("Failed to append log row")?;
        Ok(())
    }

    fn append_state(&self, row: &StateRow) -> Result<()> {
        debug!(session_id = %row.session_id, key = %row.key, "SqliteStore::append_state");
        let conn = self.lock();
        conn.execute(
            "INSERT INTO state_snapshots (session_id, cascade_id, key, value, value_type, cell_name, created_at)
             VALUES (:session_id, :cascade_id, :key, :value, :value_type, :cell_name, :created_at)",
            named_params! {
                ":session_id": row.session_id,
                ":cascade_id": row.cascade_id,
                ":key": row.key,
                ":value": row.value,
                ":value_type": row.value_type,
                ":cell_name": row.cell_name,
                ":created_at": row.created_at.to_rfc3339(),
            },
        )
        .context("Failed to append state snapshot")?;
        Ok(())
    }

    fn append_session(&self, row: &CascadeSessionRow) -> Result<()> {
        debug!(session_id = %row.session_id, cascade_id = %row.cascade_id, "SqliteStore::append_session");
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO cascade_sessions (
                session_id, cascade_id, parent_session_id, depth, cascade_raw,
                input_data, caller_id, invocation_metadata_json, created_at
            ) VALUES (
                :session_id, :cascade_id, :parent_session_id, :depth, :cascade_raw,
                :input_data, :caller_id, :invocation_metadata_json, :created_at
            )",
            named_params! {
                ":session_id": row.session_id,
                ":cascade_id": row.cascade_id,
                ":parent_session_id": row.parent_session_id,
                ":depth": row.depth,
                ":cascade_raw": row.cascade_raw,
                ":input_data": row.input_data,
                ":caller_id": row.caller_id,
                ":invocation_metadata_json": row.invocation_metadata_json,
                ":created_at": row.created_at.to_rfc3339(),
            },
        )
        .context("Failed to append cascade session")?;
        Ok(())
    }

    fn rows_for_session(&self, session_id: &str) -> Result<Vec<LogRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT * FROM log_rows WHERE session_id = ?1 ORDER BY seq")?;
        let rows = stmt
            .query_map([session_id], |r| row_from_sql(r))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn rows_for_caller(&self, caller_id: &str) -> Result<Vec<LogRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT * FROM log_rows WHERE caller_id = ?1 ORDER BY seq")?;
        let rows = stmt
            .query_map([caller_id], |r| row_from_sql(r))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn cost_for_caller(&self, caller_id: &str) -> Result<f64> {
        let conn = self.lock();
        let total: f64 = conn.query_row(
            "SELECT COALESCE(SUM(cost), 0.0) FROM log_rows WHERE caller_id = ?1",
            [caller_id],
            |r| r.get(0),
        )?;
        Ok(total)
    }

    fn caller_costs(&self) -> Result<Vec<CallerCost>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT caller_id, COALESCE(SUM(cost), 0.0), COALESCE(SUM(total_tokens), 0),
                    COUNT(DISTINCT session_id)
             FROM log_rows WHERE caller_id IS NOT NULL
             GROUP BY caller_id ORDER BY 2 DESC",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok(CallerCost {
                    caller_id: r.get(0)?,
                    total_cost: r.get(1)?,
                    total_tokens: r.get(2)?,
                    session_count: r.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn latest_state(&self, session_id: &str, key: &str) -> Result<Option<StateRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM state_snapshots WHERE session_id = ?1 AND key = ?2
             ORDER BY seq DESC LIMIT 1",
        )?;
        let mut rows = stmt.query_map([session_id, key], |r| state_from_sql(r))?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    fn training_exemplars(&self, cascade_id: &str, cell_name: &str, limit: usize) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT content_json FROM log_rows
             WHERE cascade_id = ?1 AND cell_name = ?2 AND node_type = 'cell_complete'
               AND content_json IS NOT NULL
             ORDER BY seq DESC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![cascade_id, cell_name, limit as i64], |r| {
                r.get::<_, String>(0)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn session(&self, session_id: &str) -> Result<Option<CascadeSessionRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT * FROM cascade_sessions WHERE session_id = ?1")?;
        let mut rows = stmt.query_map([session_id], |r| session_from_sql(r))?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    fn sessions(&self) -> Result<Vec<CascadeSessionRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT * FROM cascade_sessions ORDER BY created_at DESC")?;
        let rows = stmt
            .query_map([], |r| session_from_sql(r))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

/// In-memory log store for unit tests and ephemeral runs
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    rows: Vec<LogRow>,
    state: Vec<StateRow>,
    sessions: Vec<CascadeSessionRow>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total row count across all sessions
    pub fn row_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).rows.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl LogStore for MemoryStore {
    fn append(&self, row: &LogRow) -> Result<()> {
        self.lock().rows.push(row.clone());
        Ok(())
    }

    fn append_state(&self, row: &StateRow) -> Result<()> {
        self.lock().state.push(row.clone());
        Ok(())
    }

    fn append_session(&self, row: &CascadeSessionRow) -> Result<()> {
        let mut inner = self.lock();
        inner.sessions.retain(|s| s.session_id != row.session_id);
        inner.sessions.push(row.clone());
        Ok(())
    }

    fn rows_for_session(&self, session_id: &str) -> Result<Vec<LogRow>> {
        Ok(self
            .lock()
            .rows
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect())
    }

    fn rows_for_caller(&self, caller_id: &str) -> Result<Vec<LogRow>> {
        Ok(self
            .lock()
            .rows
            .iter()
            .filter(|r| r.caller_id.as_deref() == Some(caller_id))
            .cloned()
            .collect())
    }

    fn cost_for_caller(&self, caller_id: &str) -> Result<f64> {
        Ok(self
            .lock()
            .rows
            .iter()
            .filter(|r| r.caller_id.as_deref() == Some(caller_id))
            .filter_map(|r| r.cost)
            .sum())
    }

    fn caller_costs(&self) -> Result<Vec<CallerCost>> {
        use std::collections::BTreeMap;
        let inner = self.lock();
        let mut agg: BTreeMap<String, (f64, i64, std::collections::BTreeSet<String>)> = BTreeMap::new();
        for row in inner.rows.iter() {
            if let Some(caller) = &row.caller_id {
                let entry = agg.entry(caller.clone()).or_default();
                entry.0 += row.cost.unwrap_or(0.0);
                entry.1 += row.total_tokens.unwrap_or(0);
                entry.2.insert(row.session_id.clone());
            }
        }
        let mut out: Vec<CallerCost> = agg
            .into_iter()
            .map(|(caller_id, (total_cost, total_tokens, sessions))| CallerCost {
                caller_id,
                total_cost,
                total_tokens,
                session_count: sessions.len() as i64,
            })
            .collect();
        out.sort_by(|a, b| b.total_cost.partial_cmp(&a.total_cost).unwrap_or(std::cmp::Ordering::Equal));
        Ok(out)
    }

    fn latest_state(&self, session_id: &str, key: &str) -> Result<Option<StateRow>> {
        Ok(self
            .lock()
            .state
            .iter()
            .rev()
            .find(|s| s.session_id == session_id && s.key == key)
            .cloned())
    }

    fn training_exemplars(&self, cascade_id: &str, cell_name: &str, limit: usize) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .rows
            .iter()
            .rev()
            .filter(|r| {
                r.cascade_id == cascade_id
                    && r.cell_name.as_deref() == Some(cell_name)
                    && r.node_type == NodeType::CellComplete
                    && r.content_json.is_some()
            })
            .take(limit)
            .filter_map(|r| r.content_json.clone())
            .collect())
    }

    fn session(&self, session_id: &str) -> Result<Option<CascadeSessionRow>> {
        Ok(self.lock().sessions.iter().find(|s| s.session_id == session_id).cloned())
    }

    fn sessions(&self) -> Result<Vec<CascadeSessionRow>> {
        let mut sessions = self.lock().sessions.clone();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::NodeType;

    fn sample_row(session: &str, node_type: NodeType) -> LogRow {
        LogRow::new(session, "casc-1", node_type).with_identity("http-abc-1", &serde_json::json!({"sql": "SELECT 1"}))
    }

    #[test]
    fn test_sqlite_append_and_read_back() {
        let store = SqliteStore::open_in_memory().unwrap();

        store.append(&sample_row("s1", NodeType::CascadeStart)).unwrap();
        store
            .append(&sample_row("s1", NodeType::Agent).with_usage(100, 20, 0.003))
            .unwrap();
        store.append(&sample_row("s1", NodeType::CascadeComplete)).unwrap();
        store.append(&sample_row("s2", NodeType::CascadeStart)).unwrap();

        let rows = store.rows_for_session("s1").unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].node_type, NodeType::CascadeStart);
        assert_eq!(rows[1].node_type, NodeType::Agent);
        assert_eq!(rows[2].node_type, NodeType::CascadeComplete);
    }

    #[test]
    fn test_sqlite_preserves_write_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        for turn in 0..10 {
            store
                .append(&sample_row("s1", NodeType::Agent).with_turn(turn))
                .unwrap();
        }
        let rows = store.rows_for_session("s1").unwrap();
        let turns: Vec<i64> = rows.iter().filter_map(|r| r.turn_number).collect();
        assert_eq!(turns, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_cost_rollup_by_caller() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .append(&sample_row("s1", NodeType::Agent).with_usage(100, 10, 0.5))
            .unwrap();
        store
            .append(&sample_row("s2", NodeType::Agent).with_usage(100, 10, 0.25))
            .unwrap();

        let mut other = LogRow::new("s3", "casc-2", NodeType::Agent).with_usage(1, 1, 1.0);
        other.caller_id = Some("cli-xyz".to_string());
        store.append(&other).unwrap();

        let total = store.cost_for_caller("http-abc-1").unwrap();
        assert!((total - 0.75).abs() < 1e-9);

        let costs = store.caller_costs().unwrap();
        assert_eq!(costs.len(), 2);
        assert_eq!(costs[0].caller_id, "cli-xyz");
        assert_eq!(costs[1].session_count, 2);
    }

    #[test]
    fn test_state_snapshot_latest_wins() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .append_state(&StateRow::new("s1", "c1", "count", &serde_json::json!(1), None))
            .unwrap();
        store
            .append_state(&StateRow::new("s1", "c1", "count", &serde_json::json!(2), None))
            .unwrap();

        let latest = store.latest_state("s1", "count").unwrap().unwrap();
        assert_eq!(latest.value_json(), serde_json::json!(2));
        assert!(store.latest_state("s1", "missing").unwrap().is_none());
    }

    #[test]
    fn test_cascade_session_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let raw = "cascade_id: demo\ncells:\n  - name: only\n";
        store
            .append_session(&CascadeSessionRow {
                session_id: "s1".into(),
                cascade_id: "demo".into(),
                parent_session_id: None,
                depth: 0,
                cascade_raw: raw.into(),
                input_data: "{\"q\":\"hi\"}".into(),
                caller_id: Some("cli-1".into()),
                invocation_metadata_json: None,
                created_at: chrono::Utc::now(),
            })
            .unwrap();

        let session = store.session("s1").unwrap().unwrap();
        // Verbatim retention - byte-exact for replay
        assert_eq!(session.cascade_raw, raw);
        assert_eq!(session.cascade_id, "demo");
        assert!(store.session("nope").unwrap().is_none());
    }

    #[test]
    fn test_memory_store_matches_sqlite_behavior() {
        let store = MemoryStore::new();
        store.append(&sample_row("s1", NodeType::CascadeStart)).unwrap();
        store
            .append(&sample_row("s1", NodeType::Agent).with_usage(10, 5, 0.1))
            .unwrap();

        assert_eq!(store.rows_for_session("s1").unwrap().len(), 2);
        assert_eq!(store.rows_for_caller("http-abc-1").unwrap().len(), 2);
        assert!((store.cost_for_caller("http-abc-1").unwrap() - 0.1).abs() < 1e-9);
        assert_eq!(store.row_count(), 2);
    }
}
