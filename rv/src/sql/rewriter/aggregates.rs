//! Cascade-declared aggregate operators
//!
//! Cascades can register aggregate aliases (SUMMARIZE, CONSENSUS, ...)
//! that read naturally in SQL and rewrite to the backing UDF with the
//! declared arity. Matching is by alias word followed by a call paren;
//! arity mismatches are rewrite-time errors, not runtime surprises.

use std::collections::BTreeMap;

use crate::sql::token::{next_significant, tokenize};

use super::RewriteError;
use super::util::{Splice, apply_splices, find_matching_paren, split_top_level_args};

/// A registered aggregate operator
#[derive(Debug, Clone)]
pub struct AggregateOp {
    pub udf: String,
    pub min_args: usize,
    pub max_args: usize,
}

/// Alias registry for aggregate operators
#[derive(Debug, Clone)]
pub struct AggregateRegistry {
    ops: BTreeMap<String, AggregateOp>,
}

impl AggregateRegistry {
    /// Registry with the standard aggregate vocabulary
    pub fn standard() -> Self {
        let mut registry = Self { ops: BTreeMap::new() };
        registry.register("summarize", "rvbbit_agg_summarize", 1, 2);
        registry.register("consensus", "rvbbit_agg_consensus", 1, 1);
        registry.register("synthesize", "rvbbit_agg_synthesize", 1, 2);
        registry
    }

    pub fn empty() -> Self {
        Self { ops: BTreeMap::new() }
    }

    /// Register an alias (cascade-declared operators land here)
    pub fn register(&mut self, alias: &str, udf: &str, min_args: usize, max_args: usize) {
        self.ops.insert(
            alias.to_lowercase(),
            AggregateOp {
                udf: udf.to_string(),
                min_args,
                max_args,
            },
        );
    }

    fn get(&self, alias: &str) -> Option<&AggregateOp> {
        self.ops.get(&alias.to_lowercase())
    }
}

/// Rewrite aggregate aliases to their backing UDF calls
pub fn rewrite_aggregates(sql: &str, registry: &AggregateRegistry) -> Result<String, RewriteError> {
    let tokens = tokenize(sql);
    let mut splices = Vec::new();

    for (idx, token) in tokens.iter().enumerate() {
        if token.kind != crate::sql::token::TokenKind::Word {
            continue;
        }
        let Some(op) = registry.get(token.text(sql)) else { continue };
        let Some(open) = next_significant(&tokens, idx + 1) else { continue };
        if !tokens[open].is_symbol(sql, '(') {
            continue;
        }
        let close = find_matching_paren(&tokens, sql, open)
            .ok_or_else(|| RewriteError::Malformed("unbalanced parens in aggregate call".into()))?;
        let arg_count = split_top_level_args(&tokens, sql, open, close).len();
        if arg_count < op.min_args || arg_count > op.max_args {
            return Err(RewriteError::Malformed(format!(
                "{} takes {}..{} arguments, got {}",
                token.text(sql),
                op.min_args,
                op.max_args,
                arg_count
            )));
        }

        splices.push(Splice {
            start: token.start,
            end: token.end,
            replacement: op.udf.clone(),
        });
    }

    Ok(apply_splices(sql, splices))
}
