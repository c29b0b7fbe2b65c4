//! SessionStore - the in-memory session registry with durable mirroring
//!
//! Owns `session_id -> Echo`. Creation writes the cascade-session row
//! (verbatim document + inputs) so replay is byte-exact; every
//! `set_state` appends a durable snapshot row. State writes are
//! serialized per session by the store lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use echolog::{CascadeSessionRow, LogStore, StateRow};
use eyre::{Result, eyre};
use tracing::debug;

use crate::cascade::Cascade;
use crate::identity::{Identity, IdentityContext};
use crate::llm::Message;

use super::echo::{Echo, EchoError, SessionStatus};

/// Shared handle to the session registry
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<Mutex<HashMap<String, Echo>>>,
    log: Arc<dyn LogStore>,
}

impl SessionStore {
    pub fn new(log: Arc<dyn LogStore>) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            log,
        }
    }

    /// The log store this session store mirrors into
    pub fn log_store(&self) -> Arc<dyn LogStore> {
        Arc::clone(&self.log)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Echo>> {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Create a session for a cascade run
    ///
    /// Registers the identity as authoritative for the session, inserts
    /// the Echo, and persists the cascade-session record with the
    /// verbatim document.
    pub fn create(
        &self,
        cascade: &Cascade,
        inputs: serde_json::Value,
        session_id: Option<String>,
        parent_session_id: Option<String>,
        depth: i64,
        identity: Identity,
    ) -> Result<String> {
        let session_id = session_id.unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
        debug!(%session_id, cascade_id = %cascade.doc.cascade_id, depth, "SessionStore::create: called");

        IdentityContext::bind_identity_to_session(&session_id, identity.clone());

        let echo = Echo::new(
            session_id.clone(),
            cascade.doc.cascade_id.clone(),
            parent_session_id.clone(),
            depth,
            identity.caller_id.clone(),
            identity.invocation_metadata.clone(),
            inputs.clone(),
        );
        self.lock().insert(session_id.clone(), echo);

        self.log.append_session(&CascadeSessionRow {
            session_id: session_id.clone(),
            cascade_id: cascade.doc.cascade_id.clone(),
            parent_session_id,
            depth,
            cascade_raw: cascade.raw.clone(),
            input_data: inputs.to_string(),
            caller_id: if identity.is_empty() {
                None
            } else {
                Some(identity.caller_id.clone())
            },
            invocation_metadata_json: Some(identity.invocation_metadata.to_string()),
            created_at: chrono::Utc::now(),
        })?;

        Ok(session_id)
    }

    /// Write a state value: Echo first, then the durable snapshot row
    pub fn set_state(&self, session_id: &str, key: &str, value: serde_json::Value, cell_name: Option<&str>) -> Result<()> {
        debug!(%session_id, %key, "SessionStore::set_state: called");
        let cascade_id = {
            let mut sessions = self.lock();
            let echo = sessions
                .get_mut(session_id)
                .ok_or_else(|| eyre!("Unknown session: {}", session_id))?;
            echo.state.insert(key.to_string(), value.clone());
            echo.cascade_id.clone()
        };

        self.log.append_state(&StateRow::new(
            session_id,
            cascade_id,
            key,
            &value,
            cell_name.map(|s| s.to_string()),
        ))?;
        Ok(())
    }

    /// Read a state value from the in-memory Echo
    pub fn get_state(&self, session_id: &str, key: &str) -> Option<serde_json::Value> {
        self.lock().get(session_id).and_then(|e| e.state.get(key).cloned())
    }

    /// Seed a branch session with a parent's state and outputs
    ///
    /// In-memory only: branch seeding is engine plumbing, not a user
    /// state write, so no durable snapshot rows are produced.
    pub fn seed_from(&self, session_id: &str, parent_session_id: &str) {
        let mut sessions = self.lock();
        let Some(parent) = sessions.get(parent_session_id).cloned() else {
            return;
        };
        if let Some(echo) = sessions.get_mut(session_id) {
            echo.state = parent.state;
            echo.outputs = parent.outputs;
        }
    }

    /// Append a message to a cell's history
    pub fn record_message(&self, session_id: &str, cell_name: &str, message: Message) {
        if let Some(echo) = self.lock().get_mut(session_id) {
            echo.messages.entry(cell_name.to_string()).or_default().push(message);
        }
    }

    /// Record the artifact a cell produced
    pub fn record_output(&self, session_id: &str, cell_name: &str, output: serde_json::Value) {
        if let Some(echo) = self.lock().get_mut(session_id) {
            echo.outputs.insert(cell_name.to_string(), output);
        }
    }

    /// Record a cell error
    pub fn record_error(&self, session_id: &str, error: EchoError) {
        if let Some(echo) = self.lock().get_mut(session_id) {
            echo.errors.push(error);
        }
    }

    /// Accumulate cost and token totals
    pub fn add_cost(&self, session_id: &str, cost: f64, tokens: i64) {
        if let Some(echo) = self.lock().get_mut(session_id) {
            echo.cost_total += cost;
            echo.tokens_total += tokens;
        }
    }

    /// Snapshot a session's Echo
    pub fn echo(&self, session_id: &str) -> Option<Echo> {
        self.lock().get(session_id).cloned()
    }

    /// Authoritative identity for a session (used by the log sink)
    pub fn identity_for(&self, session_id: &str) -> Identity {
        if let Some(echo) = self.lock().get(session_id) {
            if !echo.caller_id.is_empty() {
                return Identity::new(echo.caller_id.clone(), echo.invocation_metadata.clone());
            }
        }
        IdentityContext::lookup_by_session(session_id)
    }

    /// Finalize a session; returns the terminal status
    pub fn finalize(&self, session_id: &str) -> Result<SessionStatus> {
        let mut sessions = self.lock();
        let echo = sessions
            .get_mut(session_id)
            .ok_or_else(|| eyre!("Unknown session: {}", session_id))?;
        Ok(echo.finalize())
    }

    /// Number of live sessions (tests and metrics)
    pub fn session_count(&self) -> usize {
        self.lock().len()
    }
}
