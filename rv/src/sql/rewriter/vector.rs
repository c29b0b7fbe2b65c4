//! Vector search rewrites
//!
//! `VECTOR_SEARCH('q', table.column, k[, min_score])` becomes a
//! `vector_search_json_N(...)` call wrapped in `read_json_auto`, with the
//! `column_name` predicate auto-added so multiple embedded columns of the
//! same table stay disambiguated. `HYBRID_SEARCH` additionally carries
//! vector/keyword weights.

use crate::sql::token::{TokenKind, next_significant, tokenize};

use super::RewriteError;
use super::util::{Splice, apply_splices, find_matching_paren, range_text, split_top_level_args};

const DEFAULT_MIN_SCORE: &str = "0.0";
const DEFAULT_VECTOR_WEIGHT: &str = "0.7";
const DEFAULT_KEYWORD_WEIGHT: &str = "0.3";

/// Rewrite all VECTOR_SEARCH / HYBRID_SEARCH calls in the statement
pub fn rewrite_vector_calls(sql: &str) -> Result<String, RewriteError> {
    let tokens = tokenize(sql);
    let mut splices = Vec::new();

    for (idx, token) in tokens.iter().enumerate() {
        let hybrid = token.is_word(sql, "hybrid_search");
        if !hybrid && !token.is_word(sql, "vector_search") {
            continue;
        }
        let Some(open) = next_significant(&tokens, idx + 1) else { continue };
        if !tokens[open].is_symbol(sql, '(') {
            continue;
        }
        let close = find_matching_paren(&tokens, sql, open)
            .ok_or_else(|| RewriteError::Malformed("unbalanced parens in vector search call".into()))?;
        let args = split_top_level_args(&tokens, sql, open, close);
        if args.len() < 3 {
            return Err(RewriteError::Malformed(format!(
                "{} requires (query, table.column, k)",
                token.text(sql)
            )));
        }

        // arg 0: query string literal (kept verbatim, escaping intact)
        let query_tok = tokens[args[0].0];
        if query_tok.kind != TokenKind::Str {
            return Err(RewriteError::Malformed("vector search query must be a string literal".into()));
        }
        let query = query_tok.text(sql);

        // arg 1: table.column
        let target = range_text(&tokens, sql, args[1]);
        let (table, column) = target
            .split_once('.')
            .map(|(t, c)| (t.trim().trim_matches('"'), c.trim().trim_matches('"')))
            .ok_or_else(|| RewriteError::Malformed(format!("vector search target '{}' is not table.column", target)))?;

        // arg 2: k
        let k_text = range_text(&tokens, sql, args[2]).trim().to_string();
        let k: usize = k_text
            .parse()
            .map_err(|_| RewriteError::Malformed(format!("vector search k '{}' is not an integer", k_text)))?;

        let min_score = args
            .get(3)
            .map(|r| range_text(&tokens, sql, *r).trim().to_string())
            .unwrap_or_else(|| DEFAULT_MIN_SCORE.to_string());

        let replacement = if hybrid {
            let w_vector = args
                .get(4)
                .map(|r| range_text(&tokens, sql, *r).trim().to_string())
                .unwrap_or_else(|| DEFAULT_VECTOR_WEIGHT.to_string());
            let w_keyword = args
                .get(5)
                .map(|r| range_text(&tokens, sql, *r).trim().to_string())
                .unwrap_or_else(|| DEFAULT_KEYWORD_WEIGHT.to_string());
            format!(
                "read_json_auto(hybrid_search_json_{k}({query}, '{table}.{column}', {k}, {min_score}, {w_vector}, {w_keyword}, 'column_name={column}'))",
            )
        } else {
            format!(
                "read_json_auto(vector_search_json_{k}({query}, '{table}.{column}', {k}, {min_score}, 'column_name={column}'))",
            )
        };

        splices.push(Splice {
            start: token.start,
            end: tokens[close].end,
            replacement,
        });
    }

    Ok(apply_splices(sql, splices))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_search_rewrite() {
        let sql = "SELECT * FROM VECTOR_SEARCH('quarterly revenue', docs.body, 5)";
        let out = rewrite_vector_calls(sql).unwrap();
        assert_eq!(
            out,
            "SELECT * FROM read_json_auto(vector_search_json_5('quarterly revenue', 'docs.body', 5, 0.0, 'column_name=body'))"
        );
    }

    #[test]
    fn test_vector_search_with_min_score() {
        let sql = "SELECT * FROM vector_search('q', t.c, 10, 0.6)";
        let out = rewrite_vector_calls(sql).unwrap();
        assert!(out.contains("vector_search_json_10('q', 't.c', 10, 0.6, 'column_name=c')"));
    }

    #[test]
    fn test_hybrid_search_weights() {
        let sql = "SELECT * FROM HYBRID_SEARCH('q', t.c, 3, 0.5, 0.8, 0.2)";
        let out = rewrite_vector_calls(sql).unwrap();
        assert!(out.contains("hybrid_search_json_3('q', 't.c', 3, 0.5, 0.8, 0.2, 'column_name=c')"));
    }

    #[test]
    fn test_hybrid_search_default_weights() {
        let sql = "SELECT * FROM HYBRID_SEARCH('q', t.c, 3)";
        let out = rewrite_vector_calls(sql).unwrap();
        assert!(out.contains("0.0, 0.7, 0.3,"));
    }

    #[test]
    fn test_literal_query_escaping_preserved() {
        let sql = "SELECT * FROM VECTOR_SEARCH('it''s here', docs.body, 2)";
        let out = rewrite_vector_calls(sql).unwrap();
        assert!(out.contains("'it''s here'"));
    }

    #[test]
    fn test_vector_search_inside_string_untouched() {
        let sql = "SELECT 'VECTOR_SEARCH(''q'', t.c, 1)' FROM t";
        let out = rewrite_vector_calls(sql).unwrap();
        assert_eq!(out, sql);
    }

    #[test]
    fn test_bad_target_errors() {
        let sql = "SELECT * FROM VECTOR_SEARCH('q', justcolumn, 5)";
        assert!(rewrite_vector_calls(sql).is_err());
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let sql = "SELECT * FROM VECTOR_SEARCH('q', docs.body, 5)";
        let once = rewrite_vector_calls(sql).unwrap();
        let twice = rewrite_vector_calls(&once).unwrap();
        assert_eq!(once, twice);
    }
}
