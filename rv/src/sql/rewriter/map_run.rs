//! Block operators: RVBBIT MAP / RUN / EMBED
//!
//! Statement-level operators recognized in preamble position. MAP and
//! RUN parse into a [`MapPlan`]; without `PARALLEL` the plan is emitted
//! back as plain UDF SQL, with `PARALLEL N` the server intercepts the
//! plan and drives the fan-out itself. EMBED becomes an `embed_batch`
//! call over the USING query.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::sql::token::{Token, TokenKind, next_significant, tokenize};

use super::RewriteError;
use super::util::{find_matching_paren, parse_dotted_pair, split_top_level_args};

/// Default auto-limit applied to MAP/RUN input queries
pub const DEFAULT_AUTO_LIMIT: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapVerb {
    Map,
    Run,
}

/// Parsed plan for a MAP/RUN statement
#[derive(Debug, Clone)]
pub struct MapPlan {
    pub verb: MapVerb,
    pub cascade_path: String,
    /// The USING query with the auto-limit already applied
    pub input_query: String,
    /// Some(N) requests server-side interception with N workers
    pub parallelism: Option<usize>,
    /// DISTINCT flag: dedupe input rows before dispatch
    pub distinct: bool,
    /// Column to dedupe by (`dedupe_by` option); None means whole row
    pub distinct_key: Option<String>,
    /// Result cache TTL from `cache='1d'`; Duration::ZERO disables caching
    pub cache_ttl: Option<Duration>,
    /// `AS (col TYPE, ...)` typed projection of the result JSON
    pub output_schema: Option<Vec<(String, String)>>,
    /// `AS alias` for the result column
    pub result_alias: String,
    pub limit: usize,
    /// Raw WITH (...) options
    pub options: BTreeMap<String, String>,
}

/// Result of recognizing a block statement
#[derive(Debug, Clone)]
pub enum BlockRewrite {
    /// EMBED rewritten to plain SQL
    Embed(String),
    /// MAP/RUN plan (emission is the pipeline's decision)
    Plan(MapPlan),
}

/// Recognize `RVBBIT MAP|RUN|EMBED ...`; None when not a block statement
pub fn parse_block_statement(sql: &str) -> Result<Option<BlockRewrite>, RewriteError> {
    let tokens = tokenize(sql);
    let Some(first) = next_significant(&tokens, 0) else {
        return Ok(None);
    };
    if !tokens[first].is_word(sql, "rvbbit") {
        return Ok(None);
    }
    let verb_idx =
        next_significant(&tokens, first + 1).ok_or_else(|| RewriteError::Malformed("RVBBIT with no verb".into()))?;
    let verb_tok = tokens[verb_idx];

    if verb_tok.is_word(sql, "embed") {
        return parse_embed(sql, &tokens, verb_idx).map(|s| Some(BlockRewrite::Embed(s)));
    }
    let verb = if verb_tok.is_word(sql, "map") {
        MapVerb::Map
    } else if verb_tok.is_word(sql, "run") {
        MapVerb::Run
    } else {
        return Err(RewriteError::Malformed(format!(
            "Unknown RVBBIT verb '{}'",
            verb_tok.text(sql)
        )));
    };

    parse_map_run(sql, &tokens, verb_idx, verb).map(|p| Some(BlockRewrite::Plan(p)))
}

fn parse_map_run(sql: &str, tokens: &[Token], verb_idx: usize, verb: MapVerb) -> Result<MapPlan, RewriteError> {
    let mut cursor = verb_idx + 1;
    let mut parallelism = None;
    let mut distinct = false;

    // [PARALLEL N]
    if let Some(idx) = next_significant(tokens, cursor) {
        if tokens[idx].is_word(sql, "parallel") {
            let n_idx = next_significant(tokens, idx + 1)
                .ok_or_else(|| RewriteError::Malformed("PARALLEL requires a worker count".into()))?;
            let n: usize = tokens[n_idx]
                .text(sql)
                .parse()
                .map_err(|_| RewriteError::Malformed("PARALLEL requires an integer".into()))?;
            if n == 0 {
                return Err(RewriteError::Malformed("PARALLEL requires at least one worker".into()));
            }
            parallelism = Some(n);
            cursor = n_idx + 1;
        }
    }

    // [DISTINCT]
    if let Some(idx) = next_significant(tokens, cursor) {
        if tokens[idx].is_word(sql, "distinct") {
            distinct = true;
            cursor = idx + 1;
        }
    }

    // <string-path>
    let path_idx = next_significant(tokens, cursor)
        .ok_or_else(|| RewriteError::Malformed("RVBBIT MAP/RUN requires a cascade path".into()))?;
    if tokens[path_idx].kind != TokenKind::Str {
        return Err(RewriteError::Malformed("cascade path must be a string literal".into()));
    }
    let cascade_path = tokens[path_idx].str_value(sql);
    cursor = path_idx + 1;

    // [AS (cols) | AS alias]
    let mut output_schema = None;
    let mut result_alias = "result".to_string();
    if let Some(idx) = next_significant(tokens, cursor) {
        if tokens[idx].is_word(sql, "as") {
            let next = next_significant(tokens, idx + 1)
                .ok_or_else(|| RewriteError::Malformed("AS requires columns or an alias".into()))?;
            if tokens[next].is_symbol(sql, '(') {
                let close = find_matching_paren(tokens, sql, next)
                    .ok_or_else(|| RewriteError::Malformed("unbalanced parens in AS clause".into()))?;
                output_schema = Some(parse_col_decls(sql, tokens, next, close)?);
                cursor = close + 1;
            } else if tokens[next].kind == TokenKind::Word {
                result_alias = tokens[next].text(sql).to_string();
                cursor = next + 1;
            } else {
                return Err(RewriteError::Malformed("AS requires columns or an alias".into()));
            }
        }
    }

    // USING (query)
    let using_idx = next_significant(tokens, cursor)
        .filter(|&i| tokens[i].is_word(sql, "using"))
        .ok_or_else(|| RewriteError::Malformed("RVBBIT MAP/RUN requires USING (query)".into()))?;
    let open = next_significant(tokens, using_idx + 1)
        .filter(|&i| tokens[i].is_symbol(sql, '('))
        .ok_or_else(|| RewriteError::Malformed("USING requires a parenthesized query".into()))?;
    let close = find_matching_paren(tokens, sql, open)
        .ok_or_else(|| RewriteError::Malformed("unbalanced parens in USING clause".into()))?;
    let raw_input = sql[tokens[open].end..tokens[close].start].trim().to_string();
    cursor = close + 1;

    // [WITH (options)]
    let mut options = BTreeMap::new();
    if let Some(idx) = next_significant(tokens, cursor) {
        if tokens[idx].is_word(sql, "with") {
            let w_open = next_significant(tokens, idx + 1)
                .filter(|&i| tokens[i].is_symbol(sql, '('))
                .ok_or_else(|| RewriteError::Malformed("WITH requires parenthesized options".into()))?;
            let w_close = find_matching_paren(tokens, sql, w_open)
                .ok_or_else(|| RewriteError::Malformed("unbalanced parens in WITH clause".into()))?;
            options = parse_options(sql, tokens, w_open, w_close)?;
        }
    }

    let limit = options
        .get("limit")
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_AUTO_LIMIT);
    let input_query = apply_auto_limit(&raw_input, limit);

    let cache_ttl = options.get("cache").map(|spec| parse_duration(spec)).transpose()?;
    let distinct_key = options.get("dedupe_by").cloned();
    let distinct = distinct || distinct_key.is_some();

    Ok(MapPlan {
        verb,
        cascade_path,
        input_query,
        parallelism,
        distinct,
        distinct_key,
        cache_ttl,
        output_schema,
        result_alias,
        limit,
        options,
    })
}

/// `AS (col TYPE, ...)` - types may be multi-word (`DOUBLE PRECISION`)
fn parse_col_decls(
    sql: &str,
    tokens: &[Token],
    open: usize,
    close: usize,
) -> Result<Vec<(String, String)>, RewriteError> {
    let mut decls = Vec::new();
    for (start, end) in split_top_level_args(tokens, sql, open, close) {
        let words: Vec<&str> = (start..end)
            .filter(|&i| matches!(tokens[i].kind, TokenKind::Word | TokenKind::QuotedIdent | TokenKind::Number))
            .map(|i| tokens[i].text(sql))
            .collect();
        if words.len() < 2 {
            return Err(RewriteError::Malformed("AS column declaration requires name and type".into()));
        }
        let name = words[0].trim_matches('"').to_string();
        let ty = words[1..].join(" ").to_uppercase();
        decls.push((name, ty));
    }
    if decls.is_empty() {
        return Err(RewriteError::Malformed("AS () declares no columns".into()));
    }
    Ok(decls)
}

/// WITH (key=value, ...) options
fn parse_options(
    sql: &str,
    tokens: &[Token],
    open: usize,
    close: usize,
) -> Result<BTreeMap<String, String>, RewriteError> {
    let mut options = BTreeMap::new();
    for (start, end) in split_top_level_args(tokens, sql, open, close) {
        let key_tok = tokens[start];
        if key_tok.kind != TokenKind::Word {
            return Err(RewriteError::Malformed("option key must be a bare word".into()));
        }
        let eq = next_significant(tokens, start + 1)
            .filter(|&i| i < end && tokens[i].is_symbol(sql, '='))
            .ok_or_else(|| RewriteError::Malformed(format!("option '{}' missing '='", key_tok.text(sql))))?;
        let value_idx = next_significant(tokens, eq + 1)
            .filter(|&i| i < end)
            .ok_or_else(|| RewriteError::Malformed(format!("option '{}' missing value", key_tok.text(sql))))?;
        let value_tok = tokens[value_idx];
        let value = match value_tok.kind {
            TokenKind::Str => value_tok.str_value(sql),
            _ => value_tok.text(sql).to_string(),
        };
        options.insert(key_tok.text(sql).to_lowercase(), value);
    }
    Ok(options)
}

/// Append `LIMIT n` unless the query already has a top-level LIMIT
fn apply_auto_limit(query: &str, limit: usize) -> String {
    let tokens = tokenize(query);
    let mut depth = 0i32;
    for token in &tokens {
        if token.is_symbol(query, '(') {
            depth += 1;
        } else if token.is_symbol(query, ')') {
            depth -= 1;
        } else if depth == 0 && token.is_word(query, "limit") {
            return query.to_string();
        }
    }
    format!("{} LIMIT {}", query, limit)
}

/// Parse `1d` / `12h` / `30m` / `45s` / `0` duration specs
pub fn parse_duration(spec: &str) -> Result<Duration, RewriteError> {
    let spec = spec.trim();
    if spec == "0" {
        return Ok(Duration::ZERO);
    }
    let (digits, unit) = spec.split_at(spec.len().saturating_sub(1));
    let n: u64 = digits
        .parse()
        .map_err(|_| RewriteError::Malformed(format!("bad duration '{}'", spec)))?;
    let seconds = match unit {
        "s" => n,
        "m" => n * 60,
        "h" => n * 3600,
        "d" => n * 86400,
        _ => return Err(RewriteError::Malformed(format!("bad duration unit in '{}'", spec))),
    };
    Ok(Duration::from_secs(seconds))
}

/// Emit plain UDF SQL for a plan without PARALLEL
pub fn emit_map_sql(plan: &MapPlan) -> String {
    let cache_arg = plan
        .options
        .get("cache")
        .map(|spec| format!(", '{}'", spec))
        .unwrap_or_default();

    match plan.verb {
        MapVerb::Run => format!(
            "SELECT rvbbit_run('{}', (SELECT json_group_array(to_json(q)) FROM ({}) q){}) AS {}",
            plan.cascade_path, plan.input_query, cache_arg, plan.result_alias
        ),
        MapVerb::Map => {
            // Dedupe before the UDF runs, not after
            let source = if plan.distinct {
                format!("SELECT DISTINCT * FROM ({}) d", plan.input_query)
            } else {
                plan.input_query.clone()
            };
            let inner = format!(
                "SELECT t.*, rvbbit_run('{}', to_json(t){}) AS __rv_result FROM ({}) t",
                plan.cascade_path, cache_arg, source
            );
            match &plan.output_schema {
                None => inner.replace("__rv_result", &plan.result_alias),
                Some(cols) => {
                    let casts = cols
                        .iter()
                        .map(|(name, ty)| {
                            format!("CAST(json_extract(s.__rv_result, '$.{}') AS {}) AS {}", name, ty, name)
                        })
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("SELECT {} FROM ({}) s", casts, inner)
                }
            }
        }
    }
}

fn parse_embed(sql: &str, tokens: &[Token], verb_idx: usize) -> Result<String, RewriteError> {
    // table.column
    let target_idx = next_significant(tokens, verb_idx + 1)
        .ok_or_else(|| RewriteError::Malformed("RVBBIT EMBED requires table.column".into()))?;
    let (table, column, last) = parse_dotted_pair(tokens, sql, target_idx)
        .ok_or_else(|| RewriteError::Malformed("RVBBIT EMBED target must be table.column".into()))?;

    // USING (query)
    let using_idx = next_significant(tokens, last + 1)
        .filter(|&i| tokens[i].is_word(sql, "using"))
        .ok_or_else(|| RewriteError::Malformed("RVBBIT EMBED requires USING (query)".into()))?;
    let open = next_significant(tokens, using_idx + 1)
        .filter(|&i| tokens[i].is_symbol(sql, '('))
        .ok_or_else(|| RewriteError::Malformed("USING requires a parenthesized query".into()))?;
    let close = find_matching_paren(tokens, sql, open)
        .ok_or_else(|| RewriteError::Malformed("unbalanced parens in USING clause".into()))?;
    let inner = sql[tokens[open].end..tokens[close].start].trim().to_string();

    // The USING query must project id and text
    let inner_tokens = tokenize(&inner);
    let has_id = inner_tokens.iter().any(|t| t.is_word(&inner, "id"));
    let has_text = inner_tokens.iter().any(|t| t.is_word(&inner, "text"));
    if !has_id || !has_text {
        return Err(RewriteError::Malformed(
            "RVBBIT EMBED USING query must project id::VARCHAR and text".into(),
        ));
    }

    // [WITH (options)]
    let mut options = BTreeMap::new();
    if let Some(idx) = next_significant(tokens, close + 1) {
        if tokens[idx].is_word(sql, "with") {
            let w_open = next_significant(tokens, idx + 1)
                .filter(|&i| tokens[i].is_symbol(sql, '('))
                .ok_or_else(|| RewriteError::Malformed("WITH requires parenthesized options".into()))?;
            let w_close = find_matching_paren(tokens, sql, w_open)
                .ok_or_else(|| RewriteError::Malformed("unbalanced parens in WITH clause".into()))?;
            options = parse_options(sql, tokens, w_open, w_close)?;
        }
    }
    let options_json = serde_json::to_string(&options).unwrap_or_else(|_| "{}".into());

    Ok(format!(
        "SELECT embed_batch('{}', '{}', ({}), '{}')",
        table,
        column,
        inner,
        options_json.replace('\'', "''"),
    ))
}
