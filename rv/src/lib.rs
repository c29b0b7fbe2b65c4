//! RVBBIT - declarative orchestration runtime for LLM-driven workflows
//!
//! A cascade is a directed sequence of cells; each cell produces an
//! artifact by invoking models, tools, or sub-cascades. Three things
//! distinguish the runtime from a naive prompt loop:
//!
//! - **Candidate exploration**: run N variants of a cell in parallel,
//!   have an evaluator pick a winner, optionally refine it (reforge)
//! - **Hybrid data flow**: cascades are callable as SQL UDFs over
//!   tabular inputs, with server-side `MAP PARALLEL` fan-out
//! - **Causation**: every log row, cost datum, and artifact ties back to
//!   the originating caller across process and thread boundaries
//!
//! # Modules
//!
//! - [`cascade`] - workflow documents and loading
//! - [`runner`] - the cascade execution engine entry point
//! - [`cell`] - the turn loop, candidates, refinement
//! - [`wards`] - pre/post validation
//! - [`tackle`] - the tool system
//! - [`session`] - per-run Echo state
//! - [`identity`] - caller-identity propagation
//! - [`sink`] - the unified log write path
//! - [`sql`] - the SQL-as-orchestrator surface
//! - [`background`] - fire-and-forget jobs
//! - [`vector`] - the vector backend boundary
//! - [`llm`] - LLM client trait and the Anthropic implementation

pub mod background;
pub mod cascade;
pub mod cell;
pub mod cli;
pub mod config;
pub mod context;
pub mod errors;
pub mod identity;
pub mod llm;
pub mod runner;
pub mod session;
pub mod sink;
pub mod sql;
pub mod tackle;
pub mod template;
pub mod vector;
pub mod wards;

// Re-export commonly used types
pub use background::{BackgroundScheduler, JobRecord, JobStatus};
pub use cascade::{Cascade, CascadeDoc, CellSpec};
pub use cell::{CandidateLoop, CellEnv, CellExecutor, CellOutcome, RefinementLoop};
pub use config::{Config, LlmConfig};
pub use context::ContextBuilder;
pub use errors::RunError;
pub use identity::{Identity, IdentityContext};
pub use llm::{AnthropicClient, CompletionRequest, CompletionResponse, LlmClient, LlmError};
pub use runner::{CascadeRunner, RunOptions, SessionResult};
pub use session::{Echo, EchoError, SessionStatus, SessionStore};
pub use sink::LogSink;
pub use sql::{Rewriter, SqlEngine, SqlExecutor, UdfRuntime, execute_map_parallel};
pub use tackle::{Tackle, Tool, ToolContext, ToolResult};
pub use wards::{WardEngine, WardOutcome};
