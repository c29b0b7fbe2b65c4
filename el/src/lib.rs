//! echolog - unified event log store for RVBBIT cascade sessions
//!
//! Every log row, cost datum, and intermediate artifact a cascade produces
//! lands here, tied to the originating caller across process and thread
//! boundaries. The store is append-only: rows are durable before the
//! writer proceeds, and ordering within a session is the writer's.
//!
//! # Modules
//!
//! - [`row`] - the unified log row schema plus state and session rows
//! - [`store`] - the `LogStore` trait with SQLite and in-memory backends

pub mod cli;
pub mod row;
pub mod store;

pub use row::{CascadeSessionRow, LogRow, NodeType, Role, StateRow};
pub use store::{CallerCost, LogStore, MemoryStore, SqliteStore};

/// Default store filename under the data directory
pub const DEFAULT_DB_NAME: &str = "echolog.db";

/// Resolve the default store path (~/.local/share/rvbbit/echolog.db)
pub fn default_store_path() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("rvbbit")
        .join(DEFAULT_DB_NAME)
}
