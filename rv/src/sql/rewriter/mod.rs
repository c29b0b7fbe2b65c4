//! SQL rewriter
//!
//! Pre-processes a statement into one the hosting engine understands.
//! Phases run in a fixed order: directive strip, block operators
//! (EMBED / MAP / RUN), then expression rewrites (vector search,
//! dimension functions, infix semantic operators, aggregate aliases).
//! The pipeline is idempotent on its own output and never rewrites
//! tokens inside string literals or comments - both properties are
//! guaranteed by the span tokenizer underneath.

mod aggregates;
mod dims;
mod directives;
mod infix;
mod map_run;
mod util;
mod vector;

use thiserror::Error;
use tracing::debug;

pub use aggregates::{AggregateOp, AggregateRegistry};
pub use directives::ExecutionFlags;
pub use map_run::{BlockRewrite, DEFAULT_AUTO_LIMIT, MapPlan, MapVerb, emit_map_sql, parse_duration};

/// Rewrite-time failures (malformed RVBBIT surface syntax)
#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("Malformed statement: {0}")]
    Malformed(String),
}

/// Output of the rewrite pipeline
#[derive(Debug, Clone)]
pub struct RewriteOutput {
    /// Statement for the engine; None when a PARALLEL plan intercepts
    pub sql: Option<String>,
    pub flags: ExecutionFlags,
    /// Present for MAP/RUN statements
    pub map_plan: Option<MapPlan>,
}

/// The statement rewriter
#[derive(Debug, Clone)]
pub struct Rewriter {
    aggregates: AggregateRegistry,
}

impl Rewriter {
    pub fn new() -> Self {
        Self {
            aggregates: AggregateRegistry::standard(),
        }
    }

    pub fn with_aggregates(aggregates: AggregateRegistry) -> Self {
        Self { aggregates }
    }

    /// Register a cascade-declared aggregate alias
    pub fn register_aggregate(&mut self, alias: &str, udf: &str, min_args: usize, max_args: usize) {
        self.aggregates.register(alias, udf, min_args, max_args);
    }

    /// Run the full pipeline over one statement
    pub fn rewrite(&self, sql: &str) -> Result<RewriteOutput, RewriteError> {
        debug!(sql_len = sql.len(), "Rewriter::rewrite: called");

        // Phase 1: directives
        let (inner, flags) = directives::strip_directives(sql);

        // Phases 3-4: block operators claim the whole statement
        if let Some(block) = map_run::parse_block_statement(&inner)? {
            return Ok(match block {
                BlockRewrite::Embed(sql) => RewriteOutput {
                    sql: Some(sql),
                    flags,
                    map_plan: None,
                },
                BlockRewrite::Plan(plan) => {
                    let sql = if plan.parallelism.is_some() {
                        // Server-side interception takes over
                        None
                    } else {
                        Some(emit_map_sql(&plan))
                    };
                    RewriteOutput {
                        sql,
                        flags,
                        map_plan: Some(plan),
                    }
                }
            });
        }

        // Phases 2, 5, 6, 7: expression rewrites
        let rewritten = vector::rewrite_vector_calls(&inner)?;
        let rewritten = dims::rewrite_dimension_calls(&rewritten)?;
        let rewritten = infix::rewrite_infix_operators(&rewritten)?;
        let rewritten = aggregates::rewrite_aggregates(&rewritten, &self.aggregates)?;

        Ok(RewriteOutput {
            sql: Some(rewritten),
            flags,
            map_plan: None,
        })
    }
}

impl Default for Rewriter {
    fn default() -> Self {
        Self::new()
    }
}
