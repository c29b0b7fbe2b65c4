//! SqlEngine - the in-process SQL engine boundary
//!
//! The engine that hosts UDFs and session tables is an external
//! collaborator; the runtime only needs query execution and virtual
//! table registration. Rows travel as JSON objects keyed by column name.

use async_trait::async_trait;
use serde_json::Value;

/// Boundary trait for the hosting SQL engine
#[async_trait]
pub trait SqlEngine: Send + Sync {
    /// Execute a query, returning rows as JSON objects
    async fn query(&self, sql: &str) -> Result<Vec<Value>, String>;

    /// Register (or replace) a session-scoped virtual table
    async fn register_table(&self, name: &str, rows: Vec<Value>) -> Result<(), String>;
}

pub mod mock {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// Table-backed mock engine for tests
    ///
    /// `query` understands exactly the shapes the runtime emits against
    /// materialization: `SELECT * FROM <table>` (with optional LIMIT n).
    /// Anything else echoes an empty result unless a canned response was
    /// seeded for the exact statement.
    #[derive(Default)]
    pub struct MockSqlEngine {
        tables: Mutex<HashMap<String, Vec<Value>>>,
        canned: Mutex<HashMap<String, Vec<Value>>>,
        queries: Mutex<Vec<String>>,
    }

    impl MockSqlEngine {
        pub fn new() -> Self {
            Self::default()
        }

        /// Seed a named table
        pub fn seed_table(&self, name: &str, rows: Vec<Value>) {
            self.tables.lock().unwrap().insert(name.to_string(), rows);
        }

        /// Seed an exact-statement response
        pub fn seed_query(&self, sql: &str, rows: Vec<Value>) {
            self.canned.lock().unwrap().insert(sql.to_string(), rows);
        }

        /// Statements the engine has seen, in order
        pub fn seen_queries(&self) -> Vec<String> {
            self.queries.lock().unwrap().clone()
        }

        /// Rows of a registered table
        pub fn table(&self, name: &str) -> Option<Vec<Value>> {
            self.tables.lock().unwrap().get(name).cloned()
        }

        fn parse_simple_select(sql: &str) -> Option<(String, Option<usize>)> {
            let trimmed = sql.trim().trim_end_matches(';');
            let lower = trimmed.to_lowercase();
            let rest = lower.strip_prefix("select * from ")?;
            let mut parts = rest.split_whitespace();
            let table = parts.next()?.to_string();
            match (parts.next(), parts.next()) {
                (None, _) => Some((table, None)),
                (Some("limit"), Some(n)) => Some((table, n.parse().ok())),
                _ => None,
            }
        }
    }

    #[async_trait]
    impl SqlEngine for MockSqlEngine {
        async fn query(&self, sql: &str) -> Result<Vec<Value>, String> {
            self.queries.lock().unwrap().push(sql.to_string());

            if let Some(rows) = self.canned.lock().unwrap().get(sql) {
                return Ok(rows.clone());
            }
            if let Some((table, limit)) = Self::parse_simple_select(sql) {
                let tables = self.tables.lock().unwrap();
                let Some(rows) = tables.get(&table) else {
                    return Err(format!("Unknown table: {}", table));
                };
                let rows = match limit {
                    Some(n) => rows.iter().take(n).cloned().collect(),
                    None => rows.clone(),
                };
                return Ok(rows);
            }
            Ok(Vec::new())
        }

        async fn register_table(&self, name: &str, rows: Vec<Value>) -> Result<(), String> {
            self.seed_table(name, rows);
            Ok(())
        }
    }

}
