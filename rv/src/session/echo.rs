//! Echo - the runtime state of one cascade invocation

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::llm::Message;

/// Terminal and in-flight session states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
}

/// One recorded cell error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoError {
    pub cell_name: String,
    pub error_kind: String,
    pub message: String,
    pub metadata: serde_json::Value,
}

/// Per-session in-memory state
///
/// Created when a cascade starts, mutated only by the cascade's own task
/// tree, finalized on the terminal transition. Durable state snapshots
/// mirror to the log store per write; the Echo itself stays in memory
/// for the life of the process.
#[derive(Debug, Clone)]
pub struct Echo {
    pub session_id: String,
    pub cascade_id: String,
    pub parent_session_id: Option<String>,
    pub depth: i64,
    pub created_at: DateTime<Utc>,

    pub caller_id: String,
    pub invocation_metadata: serde_json::Value,

    /// Key/value state written via set_state
    pub state: BTreeMap<String, serde_json::Value>,

    /// Per-cell role-tagged message history
    pub messages: BTreeMap<String, Vec<Message>>,

    /// Per-cell artifacts, for cross-cell references
    pub outputs: BTreeMap<String, serde_json::Value>,

    /// Inputs the run was started with
    pub inputs: serde_json::Value,

    pub errors: Vec<EchoError>,
    pub cost_total: f64,
    pub tokens_total: i64,
    pub status: SessionStatus,
}

impl Echo {
    pub fn new(
        session_id: impl Into<String>,
        cascade_id: impl Into<String>,
        parent_session_id: Option<String>,
        depth: i64,
        caller_id: impl Into<String>,
        invocation_metadata: serde_json::Value,
        inputs: serde_json::Value,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            cascade_id: cascade_id.into(),
            parent_session_id,
            depth,
            created_at: Utc::now(),
            caller_id: caller_id.into(),
            invocation_metadata,
            state: BTreeMap::new(),
            messages: BTreeMap::new(),
            outputs: BTreeMap::new(),
            inputs,
            errors: Vec::new(),
            cost_total: 0.0,
            tokens_total: 0,
            status: SessionStatus::Running,
        }
    }

    /// Finalize: failed iff any error was recorded
    pub fn finalize(&mut self) -> SessionStatus {
        self.status = if self.errors.is_empty() {
            SessionStatus::Completed
        } else {
            SessionStatus::Failed
        };
        self.status
    }

    /// Messages recorded for a cell, empty if none
    pub fn cell_messages(&self, cell_name: &str) -> &[Message] {
        self.messages.get(cell_name).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Output artifact of a prior cell
    pub fn cell_output(&self, cell_name: &str) -> Option<&serde_json::Value> {
        self.outputs.get(cell_name)
    }
}
