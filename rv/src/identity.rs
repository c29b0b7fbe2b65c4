//! Caller-identity propagation
//!
//! One logical identity - `(caller_id, invocation_metadata)` - threads
//! through nested cascades, background threads, and SQL UDF fan-out. It
//! lives in three tiers that must agree for any call chain:
//!
//! 1. task-local: ambient through synchronous calls within one cascade
//!    task, entered via [`IdentityContext::scope`]
//! 2. thread-local: transport for background jobs that outlive the
//!    originating task, written via [`IdentityContext::set`]
//! 3. session registry: authoritative, keyed by `session_id`
//!
//! The registry is truth. Log writes consult it by session id rather
//! than the ambient thread state, because worker threads are reused
//! across sessions.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// A caller identity: the top-level origin of a call tree
///
/// `caller_id` is minted once at the entry point (SQL query, CLI
/// command, UI action) and inherited unchanged by every descendant
/// session so cost and causality roll up.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub caller_id: String,
    pub invocation_metadata: serde_json::Value,
}

impl Identity {
    /// Mint a top-level identity for an entry surface
    ///
    /// Produces `<source>-<unique-token>` caller ids, e.g. `http-a1b2c3`.
    pub fn mint(source: &str, invocation_metadata: serde_json::Value) -> Self {
        let token = uuid::Uuid::now_v7().simple().to_string();
        Self {
            caller_id: format!("{}-{}", source, &token[..12]),
            invocation_metadata,
        }
    }

    pub fn new(caller_id: impl Into<String>, invocation_metadata: serde_json::Value) -> Self {
        Self {
            caller_id: caller_id.into(),
            invocation_metadata,
        }
    }

    /// The empty identity returned when nothing is set
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.caller_id.is_empty()
    }
}

tokio::task_local! {
    static TASK_IDENTITY: Identity;
}

thread_local! {
    static THREAD_IDENTITY: RefCell<Option<Identity>> = const { RefCell::new(None) };
}

static SESSION_REGISTRY: LazyLock<Mutex<HashMap<String, Identity>>> = LazyLock::new(|| Mutex::new(HashMap::new()));

/// Process-wide identity context
///
/// All methods are associated functions; the state is the three tiers
/// described at module level.
pub struct IdentityContext;

impl IdentityContext {
    /// Set the ambient identity for the current thread
    ///
    /// Entry points (HTTP handler, CLI, background worker picking up a
    /// job) call this before entering the engine.
    pub fn set(identity: Identity) {
        debug!(caller_id = %identity.caller_id, "IdentityContext::set: called");
        THREAD_IDENTITY.with(|cell| {
            *cell.borrow_mut() = Some(identity);
        });
    }

    /// Clear the thread tier (worker loops call this between jobs)
    pub fn clear() {
        THREAD_IDENTITY.with(|cell| {
            *cell.borrow_mut() = None;
        });
    }

    /// Innermost ambient identity: task tier, then thread tier, else empty
    ///
    /// Never fails; an unset context yields the empty identity.
    pub fn get() -> Identity {
        if let Ok(identity) = TASK_IDENTITY.try_with(|identity| identity.clone()) {
            return identity;
        }
        THREAD_IDENTITY
            .with(|cell| cell.borrow().clone())
            .unwrap_or_else(Identity::empty)
    }

    /// Run a future with the given identity in the task tier
    ///
    /// Every spawn point that creates a new execution context (task,
    /// sub-cascade, UDF call) wraps the child future with the innermost
    /// existing identity.
    pub async fn scope<F, T>(identity: Identity, fut: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        TASK_IDENTITY.scope(identity, fut).await
    }

    /// Record the ambient identity as authoritative for a session
    pub fn bind_to_session(session_id: &str) {
        let identity = Self::get();
        Self::bind_identity_to_session(session_id, identity);
    }

    /// Record a specific identity as authoritative for a session
    pub fn bind_identity_to_session(session_id: &str, identity: Identity) {
        debug!(%session_id, caller_id = %identity.caller_id, "IdentityContext::bind_identity_to_session: called");
        SESSION_REGISTRY
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(session_id.to_string(), identity);
    }

    /// Authoritative lookup by session id; empty identity if unknown
    pub fn lookup_by_session(session_id: &str) -> Identity {
        SESSION_REGISTRY
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(session_id)
            .cloned()
            .unwrap_or_else(Identity::empty)
    }

    /// Drop the registry entry once a session is finalized and flushed
    pub fn unbind_session(session_id: &str) {
        SESSION_REGISTRY
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(session_id);
    }
}
