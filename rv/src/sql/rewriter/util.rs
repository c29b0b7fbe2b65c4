//! Shared helpers for rewrite phases

use crate::sql::token::{Token, TokenKind, next_significant, prev_significant};

/// A pending text replacement over the original statement
#[derive(Debug, Clone)]
pub struct Splice {
    pub start: usize,
    pub end: usize,
    pub replacement: String,
}

/// Apply splices to the statement; ranges must not overlap
pub fn apply_splices(sql: &str, mut splices: Vec<Splice>) -> String {
    splices.sort_by_key(|s| s.start);
    let mut out = String::with_capacity(sql.len());
    let mut cursor = 0usize;
    for splice in splices {
        out.push_str(&sql[cursor..splice.start]);
        out.push_str(&splice.replacement);
        cursor = splice.end;
    }
    out.push_str(&sql[cursor..]);
    out
}

/// Index of the `)` matching the `(` at `open_idx`
pub fn find_matching_paren(tokens: &[Token], sql: &str, open_idx: usize) -> Option<usize> {
    let mut depth = 0i32;
    for (idx, token) in tokens.iter().enumerate().skip(open_idx) {
        if token.is_symbol(sql, '(') {
            depth += 1;
        } else if token.is_symbol(sql, ')') {
            depth -= 1;
            if depth == 0 {
                return Some(idx);
            }
        }
    }
    None
}

/// Split the tokens between `(`/`)` into top-level comma-separated args
///
/// Returns (first_token_idx, last_token_idx_exclusive) per argument,
/// trivia trimmed.
pub fn split_top_level_args(tokens: &[Token], sql: &str, open_idx: usize, close_idx: usize) -> Vec<(usize, usize)> {
    let mut args = Vec::new();
    let mut depth = 0i32;
    let mut arg_start = open_idx + 1;

    for idx in open_idx + 1..close_idx {
        let token = tokens[idx];
        if token.is_symbol(sql, '(') {
            depth += 1;
        } else if token.is_symbol(sql, ')') {
            depth -= 1;
        } else if depth == 0 && token.is_symbol(sql, ',') {
            if let Some(range) = trim_range(tokens, arg_start, idx) {
                args.push(range);
            }
            arg_start = idx + 1;
        }
    }
    if let Some(range) = trim_range(tokens, arg_start, close_idx) {
        args.push(range);
    }
    args
}

fn trim_range(tokens: &[Token], start: usize, end: usize) -> Option<(usize, usize)> {
    let first = next_significant(tokens, start).filter(|&i| i < end)?;
    let last = prev_significant(tokens, end)?;
    if last < first {
        return None;
    }
    Some((first, last + 1))
}

/// Text of a token range within the original statement
pub fn range_text<'a>(tokens: &[Token], sql: &'a str, range: (usize, usize)) -> &'a str {
    &sql[tokens[range.0].start..tokens[range.1 - 1].end]
}

/// Parse `table.column` starting at `idx`; returns (table, column, last_idx)
pub fn parse_dotted_pair(tokens: &[Token], sql: &str, idx: usize) -> Option<(String, String, usize)> {
    let table_tok = tokens.get(idx)?;
    if !matches!(table_tok.kind, TokenKind::Word | TokenKind::QuotedIdent) {
        return None;
    }
    let dot_idx = next_significant(tokens, idx + 1)?;
    if !tokens[dot_idx].is_symbol(sql, '.') {
        return None;
    }
    let col_idx = next_significant(tokens, dot_idx + 1)?;
    let col_tok = tokens[col_idx];
    if !matches!(col_tok.kind, TokenKind::Word | TokenKind::QuotedIdent) {
        return None;
    }
    Some((
        table_tok.text(sql).trim_matches('"').to_string(),
        col_tok.text(sql).trim_matches('"').to_string(),
        col_idx,
    ))
}

/// Walk backwards from `before_idx` over a column expression
///
/// Accepts a dotted identifier chain (`a.b.c`) or a parenthesized group.
/// Returns the index of the expression's first token.
pub fn column_expr_back(tokens: &[Token], sql: &str, before_idx: usize) -> Option<usize> {
    let last = prev_significant(tokens, before_idx)?;
    let last_tok = tokens[last];

    if last_tok.is_symbol(sql, ')') {
        // Parenthesized expression: walk to the matching open paren
        let mut depth = 0i32;
        for idx in (0..=last).rev() {
            if tokens[idx].is_symbol(sql, ')') {
                depth += 1;
            } else if tokens[idx].is_symbol(sql, '(') {
                depth -= 1;
                if depth == 0 {
                    // A function call keeps its name: lower(a) is one
                    // operand, but (a || b) after a keyword is not a call
                    if let Some(prev) = prev_significant(tokens, idx) {
                        let prev_tok = tokens[prev];
                        if prev_tok.kind == TokenKind::Word && !is_keyword(prev_tok.text(sql)) {
                            return Some(prev);
                        }
                    }
                    return Some(idx);
                }
            }
        }
        return None;
    }

    if !matches!(last_tok.kind, TokenKind::Word | TokenKind::QuotedIdent) {
        return None;
    }

    // Dotted chain: ident (. ident)*
    let mut first = last;
    let mut cursor = last;
    loop {
        let Some(dot) = prev_significant(tokens, cursor) else { break };
        if !tokens[dot].is_symbol(sql, '.') {
            break;
        }
        let Some(prev) = prev_significant(tokens, dot) else { break };
        if !matches!(tokens[prev].kind, TokenKind::Word | TokenKind::QuotedIdent) {
            break;
        }
        first = prev;
        cursor = prev;
    }
    Some(first)
}

/// SQL words that can precede a parenthesized expression without being
/// function names
fn is_keyword(word: &str) -> bool {
    const KEYWORDS: &[&str] = &[
        "select", "from", "where", "and", "or", "not", "on", "by", "group", "order", "having", "when", "then",
        "else", "case", "in", "as", "join", "limit", "offset", "union", "all", "distinct", "between", "like", "is",
        "exists", "with", "set", "values", "using",
    ];
    KEYWORDS.contains(&word.to_lowercase().as_str())
}
