//! Infix semantic operators
//!
//! `col MEANS 'criterion'` and friends rewrite to cascade-backed UDF
//! calls. Two invariants hold for every two-operand operator:
//!
//! 1. Argument order is canonical: the column expression first, the
//!    literal criterion second, matching the backing cascade's
//!    `inputs_schema`.
//! 2. Tokenization is word-boundary aware, so `MEANS` inside `COMMENTS`
//!    (or inside a string literal) never matches.

use crate::sql::token::{Token, TokenKind, next_significant, prev_significant, tokenize};

use super::RewriteError;
use super::util::{Splice, apply_splices, column_expr_back};

/// Two-operand operators and their backing UDFs
const OPERATORS: &[(&str, &str)] = &[
    ("means", "rvbbit_means"),
    ("about", "rvbbit_about"),
    ("implies", "rvbbit_implies"),
    ("contradicts", "rvbbit_contradicts"),
    ("aligns", "rvbbit_aligns"),
    ("extracts", "rvbbit_extracts"),
];

/// Rewrite all infix semantic operators in the statement
pub fn rewrite_infix_operators(sql: &str) -> Result<String, RewriteError> {
    let tokens = tokenize(sql);
    let mut splices: Vec<Splice> = Vec::new();

    for (idx, token) in tokens.iter().enumerate() {
        if token.kind != TokenKind::Word {
            continue;
        }

        if token.is_word(sql, "relevance") {
            if let Some(splice) = match_relevance(sql, &tokens, idx)? {
                push_non_overlapping(&mut splices, splice);
            }
            continue;
        }

        let Some(udf) = OPERATORS
            .iter()
            .find(|(op, _)| token.is_word(sql, op))
            .map(|(_, udf)| *udf)
        else {
            continue;
        };

        // Right operand: the literal criterion
        let Some(lit_idx) = next_significant(&tokens, idx + 1) else { continue };
        if tokens[lit_idx].kind != TokenKind::Str {
            // Not the semantic operator shape (e.g. a column named ABOUT)
            continue;
        }

        // Optional NOT between column and operator
        let mut negated = false;
        let mut operand_boundary = idx;
        if let Some(prev) = prev_significant(&tokens, idx) {
            if tokens[prev].is_word(sql, "not") {
                negated = true;
                operand_boundary = prev;
            }
        }

        // Left operand: dotted column chain or parenthesized expression
        let Some(col_start) = column_expr_back(&tokens, sql, operand_boundary) else {
            continue;
        };
        let col_end = prev_significant(&tokens, operand_boundary)
            .map(|i| tokens[i].end)
            .unwrap_or(tokens[col_start].end);
        let column = &sql[tokens[col_start].start..col_end];
        let literal = tokens[lit_idx].text(sql);

        let call = format!("{}({}, {})", udf, column.trim(), literal);
        let replacement = if negated { format!("NOT {}", call) } else { call };

        push_non_overlapping(
            &mut splices,
            Splice {
                start: tokens[col_start].start,
                end: tokens[lit_idx].end,
                replacement,
            },
        );
    }

    Ok(apply_splices(sql, splices))
}

/// `ORDER BY col RELEVANCE TO 'q'` → `ORDER BY rvbbit_relevance(col, 'q') DESC`
fn match_relevance(sql: &str, tokens: &[Token], idx: usize) -> Result<Option<Splice>, RewriteError> {
    let Some(to_idx) = next_significant(tokens, idx + 1) else {
        return Ok(None);
    };
    if !tokens[to_idx].is_word(sql, "to") {
        return Ok(None);
    }
    let Some(lit_idx) = next_significant(tokens, to_idx + 1) else {
        return Ok(None);
    };
    if tokens[lit_idx].kind != TokenKind::Str {
        return Ok(None);
    }
    let Some(col_start) = column_expr_back(tokens, sql, idx) else {
        return Ok(None);
    };
    let col_end = prev_significant(tokens, idx).map(|i| tokens[i].end).unwrap_or(0);
    let column = sql[tokens[col_start].start..col_end].trim();
    let literal = tokens[lit_idx].text(sql);

    // Respect an explicit ASC/DESC; otherwise most-relevant-first
    let direction = match next_significant(tokens, lit_idx + 1) {
        Some(next) if tokens[next].is_word(sql, "asc") || tokens[next].is_word(sql, "desc") => "",
        _ => " DESC",
    };

    Ok(Some(Splice {
        start: tokens[col_start].start,
        end: tokens[lit_idx].end,
        replacement: format!("rvbbit_relevance({}, {}){}", column, literal, direction),
    }))
}

fn push_non_overlapping(splices: &mut Vec<Splice>, splice: Splice) {
    let overlaps = splices.iter().any(|s| splice.start < s.end && s.start < splice.end);
    if !overlaps {
        splices.push(splice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_means_rewrite_column_first() {
        let out = rewrite_infix_operators("SELECT id, text MEANS 'positive' FROM tweets").unwrap();
        assert_eq!(out, "SELECT id, rvbbit_means(text, 'positive') FROM tweets");
    }

    #[test]
    fn test_dotted_column_operand() {
        let out = rewrite_infix_operators("SELECT * FROM t WHERE t.body ALIGNS 'policy'").unwrap();
        assert_eq!(out, "SELECT * FROM t WHERE rvbbit_aligns(t.body, 'policy')");
    }

    #[test]
    fn test_about_with_threshold_comparison() {
        let out = rewrite_infix_operators("SELECT * FROM t WHERE body ABOUT 'pricing' > 0.7").unwrap();
        assert_eq!(out, "SELECT * FROM t WHERE rvbbit_about(body, 'pricing') > 0.7");
    }

    #[test]
    fn test_not_means() {
        let out = rewrite_infix_operators("SELECT * FROM t WHERE body NOT MEANS 'spam'").unwrap();
        assert_eq!(out, "SELECT * FROM t WHERE NOT rvbbit_means(body, 'spam')");
    }

    #[test]
    fn test_embedded_substring_does_not_match() {
        // MEANS inside COMMENTS must not rewrite
        let sql = "SELECT COMMENTS FROM t";
        assert_eq!(rewrite_infix_operators(sql).unwrap(), sql);
    }

    #[test]
    fn test_operator_inside_string_untouched() {
        let sql = "SELECT 'body MEANS ''positive''' FROM t";
        assert_eq!(rewrite_infix_operators(sql).unwrap(), sql);
    }

    #[test]
    fn test_operator_word_without_literal_untouched() {
        // A column actually named ABOUT, compared to another column
        let sql = "SELECT * FROM t WHERE about = other";
        assert_eq!(rewrite_infix_operators(sql).unwrap(), sql);
    }

    #[test]
    fn test_relevance_to_adds_desc() {
        let out = rewrite_infix_operators("SELECT * FROM t ORDER BY body RELEVANCE TO 'churn risk'").unwrap();
        assert_eq!(out, "SELECT * FROM t ORDER BY rvbbit_relevance(body, 'churn risk') DESC");
    }

    #[test]
    fn test_relevance_to_respects_explicit_direction() {
        let out = rewrite_infix_operators("SELECT * FROM t ORDER BY body RELEVANCE TO 'q' ASC").unwrap();
        assert_eq!(out, "SELECT * FROM t ORDER BY rvbbit_relevance(body, 'q') ASC");
    }

    #[test]
    fn test_parenthesized_expression_operand() {
        let out = rewrite_infix_operators("SELECT * FROM t WHERE (title || body) IMPLIES 'refund'").unwrap();
        assert_eq!(out, "SELECT * FROM t WHERE rvbbit_implies((title || body), 'refund')");
    }

    #[test]
    fn test_function_call_operand_keeps_name() {
        let out = rewrite_infix_operators("SELECT * FROM t WHERE lower(body) MEANS 'calm'").unwrap();
        assert_eq!(out, "SELECT * FROM t WHERE rvbbit_means(lower(body), 'calm')");
    }

    #[test]
    fn test_multiple_operators_one_statement() {
        let out =
            rewrite_infix_operators("SELECT * FROM t WHERE a MEANS 'x' AND b CONTRADICTS 'y'").unwrap();
        assert!(out.contains("rvbbit_means(a, 'x')"));
        assert!(out.contains("rvbbit_contradicts(b, 'y')"));
    }

    #[test]
    fn test_idempotent_on_own_output() {
        let once = rewrite_infix_operators("SELECT id, text MEANS 'positive' FROM tweets").unwrap();
        let twice = rewrite_infix_operators(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_extracts_operator() {
        let out = rewrite_infix_operators("SELECT body EXTRACTS 'email address' FROM t").unwrap();
        assert_eq!(out, "SELECT rvbbit_extracts(body, 'email address') FROM t");
    }
}
