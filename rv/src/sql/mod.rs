//! SQL-as-orchestrator surface
//!
//! The rewriter turns RVBBIT-specific syntax into UDF/plumbing calls;
//! the UDF runtime re-enters the cascade engine per row with caching and
//! deduplication; MAP PARALLEL intercepts fan-out server-side. The
//! hosting engine itself stays behind the [`SqlEngine`] trait.

pub mod engine;
mod executor;
mod parallel;
pub mod rewriter;
pub mod token;
mod udf;

pub use engine::SqlEngine;
pub use executor::{SqlExecutor, SqlOutcome};
pub use parallel::execute_map_parallel;
pub use rewriter::{
    AggregateRegistry, BlockRewrite, ExecutionFlags, MapPlan, MapVerb, RewriteError, RewriteOutput, Rewriter,
};
pub use udf::{ERROR_SCALAR, UdfRuntime};
