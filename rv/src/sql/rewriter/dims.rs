//! Dimension functions
//!
//! `GROUP BY topics(col)` (and `themes(col, k)`, `sentiments(col)`)
//! classifies row values into discovered buckets. The rewrite computes
//! the classification once per distinct value in a CTE, then refers each
//! call site to that CTE, so a thousand-row group-by costs one cascade
//! call per distinct value rather than per row.

use crate::sql::token::{Token, next_significant, tokenize};

use super::RewriteError;
use super::util::{Splice, apply_splices, find_matching_paren, range_text, split_top_level_args};

/// Recognized dimension functions
const DIMENSIONS: &[&str] = &["topics", "themes", "sentiments"];

/// Rewrite dimension function calls into CTE-backed lookups
pub fn rewrite_dimension_calls(sql: &str) -> Result<String, RewriteError> {
    let tokens = tokenize(sql);

    if !has_group_by(&tokens, sql) {
        return Ok(sql.to_string());
    }

    let mut splices = Vec::new();
    let mut ctes: Vec<(String, String)> = Vec::new(); // (name, body)

    for (idx, token) in tokens.iter().enumerate() {
        let Some(dim) = DIMENSIONS.iter().find(|d| token.is_word(sql, d)) else {
            continue;
        };
        let Some(open) = next_significant(&tokens, idx + 1) else { continue };
        if !tokens[open].is_symbol(sql, '(') {
            continue;
        }
        let close = find_matching_paren(&tokens, sql, open)
            .ok_or_else(|| RewriteError::Malformed("unbalanced parens in dimension call".into()))?;
        let args = split_top_level_args(&tokens, sql, open, close);
        if args.is_empty() {
            return Err(RewriteError::Malformed(format!("{}() requires a column", dim)));
        }

        let column = range_text(&tokens, sql, args[0]).trim().to_string();
        let extra: Vec<String> = args[1..]
            .iter()
            .map(|r| range_text(&tokens, sql, *r).trim().to_string())
            .collect();

        let table = from_table(&tokens, sql)
            .ok_or_else(|| RewriteError::Malformed("dimension functions require a FROM table".into()))?;

        let cte_name = format!("__rv_dim_{}", dim);
        if !ctes.iter().any(|(name, _)| name == &cte_name) {
            // Bare column name inside the CTE - outer aliases don't reach it
            let bare_column = column.rsplit('.').next().unwrap_or(&column).to_string();
            let mut dim_args = format!("'{}', {}", dim, bare_column);
            for arg in &extra {
                dim_args.push_str(", ");
                dim_args.push_str(arg);
            }
            let body = format!(
                "SELECT {col} AS member, rvbbit_dimension({args}) AS bucket FROM (SELECT DISTINCT {col} FROM {table}) __rv_src",
                col = bare_column,
                args = dim_args,
                table = table,
            );
            ctes.push((cte_name.clone(), body));
        }

        splices.push(Splice {
            start: token.start,
            end: tokens[close].end,
            replacement: format!("(SELECT bucket FROM {} WHERE member = {})", cte_name, column),
        });
    }

    if splices.is_empty() {
        return Ok(sql.to_string());
    }

    let rewritten = apply_splices(sql, splices);
    Ok(prepend_ctes(&rewritten, &ctes))
}

fn has_group_by(tokens: &[Token], sql: &str) -> bool {
    for (idx, token) in tokens.iter().enumerate() {
        if token.is_word(sql, "group") {
            if let Some(by) = next_significant(tokens, idx + 1) {
                if tokens[by].is_word(sql, "by") {
                    return true;
                }
            }
        }
    }
    false
}

/// First table name after a top-level FROM
fn from_table(tokens: &[Token], sql: &str) -> Option<String> {
    let mut depth = 0i32;
    for (idx, token) in tokens.iter().enumerate() {
        if token.is_symbol(sql, '(') {
            depth += 1;
        } else if token.is_symbol(sql, ')') {
            depth -= 1;
        } else if depth == 0 && token.is_word(sql, "from") {
            let next = next_significant(tokens, idx + 1)?;
            if tokens[next].is_symbol(sql, '(') {
                return None; // subquery source: not supported for dimensions
            }
            return Some(tokens[next].text(sql).trim_matches('"').to_string());
        }
    }
    None
}

/// Attach CTEs, merging into an existing WITH clause when present
///
/// Merged CTEs go at the end of the existing list so they may reference
/// the user's CTEs.
fn prepend_ctes(sql: &str, ctes: &[(String, String)]) -> String {
    let cte_list = ctes
        .iter()
        .map(|(name, body)| format!("{} AS ({})", name, body))
        .collect::<Vec<_>>()
        .join(", ");

    let tokens = tokenize(sql);
    if let Some(first) = next_significant(&tokens, 0) {
        if tokens[first].is_word(sql, "with") {
            if let Some(insert_at) = end_of_cte_list(&tokens, sql, first) {
                return format!("{}, {}{}", &sql[..insert_at], cte_list, &sql[insert_at..]);
            }
        }
    }
    format!("WITH {} {}", cte_list, sql)
}

/// Byte offset just past the last CTE's closing paren
fn end_of_cte_list(tokens: &[Token], sql: &str, with_idx: usize) -> Option<usize> {
    let mut cursor = with_idx + 1;
    loop {
        // name AS ( ... )
        let open = (cursor..tokens.len()).find(|&i| tokens[i].is_symbol(sql, '('))?;
        let close = find_matching_paren(tokens, sql, open)?;
        let after = next_significant(tokens, close + 1);
        match after {
            Some(idx) if tokens[idx].is_symbol(sql, ',') => cursor = idx + 1,
            _ => return Some(tokens[close].end),
        }
    }
}
