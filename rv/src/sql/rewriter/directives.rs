//! Directive stripping
//!
//! `BACKGROUND` and `ANALYZE '<prompt>'` are statement-preamble
//! directives, peeled off before any other phase and kept as execution
//! flags. Matching is tokenizer-based, so newlines and comments between
//! directives are tolerated.

use crate::sql::token::{Token, TokenKind, next_significant, tokenize};

/// Execution flags carried out of the preamble
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionFlags {
    /// Fire-and-forget: run on the background scheduler, return a job id
    pub background: bool,
    /// Post-query LLM analysis prompt
    pub analyze: Option<String>,
}

/// Strip preamble directives, returning the inner statement and flags
pub fn strip_directives(sql: &str) -> (String, ExecutionFlags) {
    let tokens = tokenize(sql);
    let mut flags = ExecutionFlags::default();
    let mut cursor = 0usize;

    loop {
        let Some(idx) = next_significant(&tokens, cursor) else {
            return (String::new(), flags);
        };
        let token = tokens[idx];

        if token.is_word(sql, "background") && !flags.background {
            flags.background = true;
            cursor = idx + 1;
            continue;
        }

        if token.is_word(sql, "analyze") && flags.analyze.is_none() {
            if let Some(lit_idx) = next_significant(&tokens, idx + 1) {
                let lit: Token = tokens[lit_idx];
                if lit.kind == TokenKind::Str {
                    flags.analyze = Some(lit.str_value(sql));
                    cursor = lit_idx + 1;
                    continue;
                }
            }
            // ANALYZE without a string is the engine's own ANALYZE; leave it
        }

        return (sql[token.start..].to_string(), flags);
    }
}
