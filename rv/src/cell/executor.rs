//! CellExecutor - runs one cell to produce its artifact
//!
//! The executor renders instructions, applies pre wards, drives the
//! bounded turn loop (model calls, tool execution, follow-ups), applies
//! post wards, and writes the cell's log rows in order: `cell_start`
//! precedes every agent/tool row, which precede `cell_complete`.

use echolog::{LogRow, NodeType, Role};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cascade::{Cascade, CellMode, CellSpec, RowMapperOnError, WardMode, WardSpec};
use crate::errors::RunError;
use crate::llm::{CompletionRequest, CompletionResponse, Message, StopReason, ToolCall};
use crate::session::EchoError;
use crate::tackle::{Quartermaster, ToolContext, looks_like_tool_call, parse_tool_call};
use crate::template::render;
use crate::wards::render_retry;

use super::CellEnv;

/// Retries for transient provider errors within one turn
const PROVIDER_RETRIES: u32 = 2;

/// A completed cell's artifact and transcript
#[derive(Debug, Clone)]
pub struct CellOutcome {
    pub content: Value,
    pub transcript: Vec<Message>,
}

/// Runs single cells
pub struct CellExecutor;

impl CellExecutor {
    /// Run a cell within a session
    ///
    /// `seed` carries a prior transcript for candidate/refinement
    /// re-entries; `extra_prompt` injects retry or honing instructions.
    pub async fn run(
        env: &CellEnv,
        cascade: &Cascade,
        cell: &CellSpec,
        session_id: &str,
        seed: &[Message],
        extra_prompt: Option<&str>,
    ) -> Result<CellOutcome, RunError> {
        debug!(cell_name = %cell.name, %session_id, "CellExecutor::run: called");
        let result = Self::run_inner(env, cascade, cell, session_id, seed, extra_prompt).await;

        if let Err(error) = &result {
            env.sessions.record_error(
                session_id,
                EchoError {
                    cell_name: cell.name.clone(),
                    error_kind: error.kind().to_string(),
                    message: error.to_string(),
                    metadata: error.metadata(),
                },
            );
            let row = LogRow::new(session_id, &cascade.doc.cascade_id, NodeType::Error)
                .with_cell(&cell.name)
                .with_text_content(&error.to_string())
                .with_metadata(&serde_json::json!({"error_kind": error.kind()}));
            if let Err(e) = env.sink.log(row).await {
                warn!(error = %e, "CellExecutor: failed to log error row");
            }
        }
        result
    }

    async fn run_inner(
        env: &CellEnv,
        cascade: &Cascade,
        cell: &CellSpec,
        session_id: &str,
        seed: &[Message],
        extra_prompt: Option<&str>,
    ) -> Result<CellOutcome, RunError> {
        let echo = env
            .sessions
            .echo(session_id)
            .ok_or_else(|| RunError::Validation {
                reason: format!("Unknown session: {}", session_id),
            })?;
        let cascade_id = cascade.doc.cascade_id.clone();
        let depth = echo.depth;

        let start_row = LogRow::new(session_id, &cascade_id, NodeType::CellStart)
            .with_cell(&cell.name)
            .with_cell_json(serde_json::to_string(cell).unwrap_or_default())
            .with_depth(depth);
        env.sink.log(start_row).await.map_err(sink_err)?;

        // Rendered instructions see inputs, state, and prior cell outputs
        let template_ctx = serde_json::json!({
            "input": echo.inputs,
            "state": echo.state,
            "cells": echo.outputs,
        });
        let base_prompt = cell
            .instructions
            .as_deref()
            .map(|instructions| render(instructions, &template_ctx))
            .unwrap_or_default();

        let started = std::time::Instant::now();
        let mut retry_prompt: Option<String> = extra_prompt.map(|s| s.to_string());

        let tool_ctx = env.tool_context(session_id, &cell.name);
        let wards = env.wards();

        let mut attempt: u32 = 0;
        let outcome = loop {
            attempt += 1;
            if env.is_canceled() {
                return Err(RunError::Canceled("cascade canceled".into()));
            }

            // Pre wards gate the input
            if let Some(fail) = Self::apply_wards(
                env, &wards, &cell.wards.pre, "pre", &echo.inputs, cell, session_id, &cascade_id, attempt, &tool_ctx,
            )
            .await?
            {
                match Self::resolve_ward_failure(fail, attempt) {
                    WardResolution::Retry(prompt) => {
                        retry_prompt = Some(prompt);
                        continue;
                    }
                    WardResolution::Fail(reason) => return Err(RunError::Validation { reason }),
                }
            }

            let prompt = match &retry_prompt {
                Some(extra) => format!("{}\n\n{}", base_prompt, extra),
                None => base_prompt.clone(),
            };

            // Execute per the cell's mode
            let outcome = match cell.mode() {
                CellMode::Model => {
                    Self::run_turn_loop(env, cascade, cell, session_id, &echo, &prompt, seed, &tool_ctx).await?
                }
                CellMode::Tool => Self::run_tool_cell(env, cell, session_id, &cascade_id, &tool_ctx).await?,
                CellMode::RowMapper => Self::run_row_mapper(env, cell, session_id, &cascade_id).await?,
            };

            // Post wards gate the output
            if let Some(fail) = Self::apply_wards(
                env, &wards, &cell.wards.post, "post", &outcome.content, cell, session_id, &cascade_id, attempt,
                &tool_ctx,
            )
            .await?
            {
                match Self::resolve_ward_failure(fail, attempt) {
                    WardResolution::Retry(prompt) => {
                        retry_prompt = Some(prompt);
                        continue;
                    }
                    WardResolution::Fail(reason) => return Err(RunError::Validation { reason }),
                }
            }

            break outcome;
        };

        env.sessions.record_output(session_id, &cell.name, outcome.content.clone());

        let complete_row = LogRow::new(session_id, &cascade_id, NodeType::CellComplete)
            .with_cell(&cell.name)
            .with_depth(depth)
            .with_content(&outcome.content)
            .with_attempt(attempt as i64)
            .with_duration_ms(started.elapsed().as_millis() as i64);
        env.sink.log(complete_row).await.map_err(sink_err)?;

        info!(cell_name = %cell.name, %session_id, attempt, "Cell complete");
        Ok(outcome)
    }

    /// Run all wards of one phase; Some(failure) when an enforced ward failed
    #[allow(clippy::too_many_arguments)]
    async fn apply_wards(
        env: &CellEnv,
        wards: &crate::wards::WardEngine,
        specs: &[WardSpec],
        phase: &str,
        subject: &Value,
        cell: &CellSpec,
        session_id: &str,
        cascade_id: &str,
        attempt: u32,
        tool_ctx: &ToolContext,
    ) -> Result<Option<WardFailure>, RunError> {
        for ward in specs {
            let outcome = wards.check(ward, subject, tool_ctx).await?;
            let row = LogRow::new(session_id, cascade_id, NodeType::WardCheck)
                .with_cell(&cell.name)
                .with_attempt(attempt as i64)
                .with_metadata(&serde_json::json!({
                    "validator": ward.validator,
                    "mode": ward.mode,
                    "phase": phase,
                    "valid": outcome.valid,
                    "reason": outcome.reason,
                }));
            env.sink.log(row).await.map_err(sink_err)?;

            if outcome.valid {
                continue;
            }
            match ward.mode {
                WardMode::Advisory => {
                    warn!(validator = %ward.validator, reason = %outcome.reason, "Advisory ward failed, continuing");
                }
                WardMode::Blocking => {
                    return Ok(Some(WardFailure {
                        ward: ward.clone(),
                        reason: outcome.reason,
                        blocking: true,
                    }));
                }
                WardMode::Retry => {
                    return Ok(Some(WardFailure {
                        ward: ward.clone(),
                        reason: outcome.reason,
                        blocking: false,
                    }));
                }
            }
        }
        Ok(None)
    }

    fn resolve_ward_failure(fail: WardFailure, attempt: u32) -> WardResolution {
        if fail.blocking {
            return WardResolution::Fail(fail.reason);
        }
        if attempt < fail.ward.max_attempts {
            WardResolution::Retry(render_retry(&fail.ward, &fail.reason, attempt + 1))
        } else {
            WardResolution::Fail(format!(
                "{} (after {} attempts)",
                fail.reason, fail.ward.max_attempts
            ))
        }
    }

    /// The bounded model/tool turn loop
    #[allow(clippy::too_many_arguments)]
    async fn run_turn_loop(
        env: &CellEnv,
        cascade: &Cascade,
        cell: &CellSpec,
        session_id: &str,
        echo: &crate::session::Echo,
        prompt: &str,
        seed: &[Message],
        tool_ctx: &ToolContext,
    ) -> Result<CellOutcome, RunError> {
        let cascade_id = &cascade.doc.cascade_id;

        // Resolve the cell's tools, consulting the quartermaster if asked
        let tool_names: Vec<String> = if cell.traits.is_manifest() {
            let quartermaster = Quartermaster::new(env.llm.clone());
            quartermaster
                .select(cell, &env.tackle, &env.sink, session_id, cascade_id)
                .await?
                .tools
        } else {
            cell.traits.names().to_vec()
        };
        let tool_defs = env.tackle.definitions_for(&tool_names);

        let system_prompt = format!(
            "You are executing cell '{}' of cascade '{}'. Produce the cell's artifact.",
            cell.name, cascade_id
        );

        let mut messages = env.context.initial_messages(cell, echo, prompt, seed);
        let mut final_content: Option<String> = None;
        let mut after_tools = false;
        let mut parent_trace: Option<String> = None;

        let mut turn: u32 = 0;
        loop {
            turn += 1;
            if turn > cell.max_turns {
                debug!(cell_name = %cell.name, "run_turn_loop: max turns reached");
                break;
            }
            if env.is_canceled() {
                return Err(RunError::Canceled("cascade canceled".into()));
            }

            // Follow-ups don't need visual re-analysis; cull image bytes
            if after_tools {
                env.context.cull_images(&mut messages);
            }

            let request = CompletionRequest {
                system_prompt: system_prompt.clone(),
                messages: messages.clone(),
                tools: tool_defs.clone(),
                max_tokens: env.max_tokens,
                model: cell.model.clone(),
            };
            let response = Self::complete_with_retry(env, request.clone()).await?;

            let node_type = if after_tools { NodeType::FollowUp } else { NodeType::Agent };
            let row = LogRow::new(session_id, cascade_id, node_type)
                .with_cell(&cell.name)
                .with_role(Role::Assistant)
                .with_turn(turn as i64)
                .with_depth(echo.depth)
                .with_request_id(&response.request_id)
                .with_model(&response.model, env.llm.provider())
                .with_full_request(&serde_json::json!({
                    "system": request.system_prompt,
                    "messages": request.messages,
                    "tools": request.tools.iter().map(|t| t.name.clone()).collect::<Vec<_>>(),
                    "max_tokens": request.max_tokens,
                }))
                .with_full_response(&serde_json::json!({
                    "content": response.content,
                    "tool_calls": response.tool_calls,
                    "stop_reason": format!("{:?}", response.stop_reason),
                }))
                .with_text_content(response.content.as_deref().unwrap_or(""));
            let row = match &parent_trace {
                Some(parent) => row.with_parent_id(parent),
                None => row,
            };
            let written = env.sink.log(row).await.map_err(sink_err)?;
            parent_trace = Some(written.trace_id.clone());

            // Prompt-based tool calls arrive as JSON in content
            let mut response = response;
            let inline_call = match &response.content {
                Some(content) if response.tool_calls.is_empty() && looks_like_tool_call(content) => {
                    Some(parse_tool_call(content)?)
                }
                _ => None,
            };
            let mut repaired = false;
            if let Some(parsed) = inline_call {
                repaired = parsed.repaired;
                response.tool_calls = vec![ToolCall {
                    id: format!("inline_{}", turn),
                    name: parsed.tool,
                    input: parsed.arguments,
                }];
                response.content = None;
                response.stop_reason = StopReason::ToolUse;
            }

            let appended = env.context.append_assistant(&mut messages, &response);
            if !appended && response.tool_calls.is_empty() {
                if after_tools {
                    // Empty follow-up: logged above, excluded from history
                    warn!(cell_name = %cell.name, "run_turn_loop: empty follow-up content, not appended");
                    break;
                }
                return Err(RunError::Provider {
                    message: "Model returned empty content".into(),
                    retryable: false,
                });
            }

            if response.tool_calls.is_empty() {
                final_content = response.content.clone();
                match response.stop_reason {
                    StopReason::MaxTokens => {
                        messages.push(Message::user(
                            "Continue from where you left off. Your previous response was truncated.",
                        ));
                        continue;
                    }
                    _ => break,
                }
            }

            // Execute the turn's tool calls (concurrently; results in call order)
            for call in &response.tool_calls {
                let row = LogRow::new(session_id, cascade_id, NodeType::ToolCall)
                    .with_cell(&cell.name)
                    .with_role(Role::Assistant)
                    .with_turn(turn as i64)
                    .with_depth(echo.depth)
                    .with_tool_calls_json(serde_json::to_string(call).unwrap_or_default())
                    .with_metadata(&serde_json::json!({"tool": call.name, "json_repair": repaired}));
                env.sink.log(row).await.map_err(sink_err)?;
            }

            let results = env.tackle.execute_all(&response.tool_calls, tool_ctx).await;

            for (call, (id, result)) in response.tool_calls.iter().zip(results.iter()) {
                let images_json = (!result.images.is_empty())
                    .then(|| serde_json::to_string(&result.images).unwrap_or_default());
                let has_base64 = result.images.iter().any(|i| i.base64.is_some());
                let mut row = LogRow::new(session_id, cascade_id, NodeType::ToolResult)
                    .with_cell(&cell.name)
                    .with_role(Role::Tool)
                    .with_turn(turn as i64)
                    .with_depth(echo.depth)
                    .with_text_content(&result.content)
                    .with_metadata(&serde_json::json!({
                        "tool": call.name,
                        "tool_use_id": id,
                        "is_error": result.is_error,
                    }));
                if let Some(images) = images_json {
                    row = row.with_images(images, has_base64);
                }
                env.sink.log(row).await.map_err(sink_err)?;
            }

            messages.push(env.context.tool_result_message(&results));
            env.context.enforce_budget(&mut messages);
            after_tools = true;
        }

        // Persist the cell transcript on the Echo
        for message in &messages {
            env.sessions.record_message(session_id, &cell.name, message.clone());
        }

        let content = match final_content {
            Some(text) => parse_output(&text),
            None => Value::Null,
        };
        Ok(CellOutcome {
            content,
            transcript: messages,
        })
    }

    /// Provider call with timeout and bounded retry on transient errors
    async fn complete_with_retry(env: &CellEnv, request: CompletionRequest) -> Result<CompletionResponse, RunError> {
        let mut last_error = String::new();
        for attempt in 0..=PROVIDER_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(200 * attempt as u64)).await;
            }
            let call = env.llm.complete(request.clone());
            match tokio::time::timeout(env.call_timeout, call).await {
                Err(_) => return Err(RunError::Timeout(env.call_timeout)),
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(e)) if e.is_retryable() => {
                    warn!(attempt, error = %e, "complete_with_retry: transient provider error");
                    last_error = e.to_string();
                }
                Ok(Err(e)) => {
                    return Err(RunError::Provider {
                        message: e.to_string(),
                        retryable: false,
                    });
                }
            }
        }
        Err(RunError::Provider {
            message: format!("Provider failed after retries: {}", last_error),
            retryable: true,
        })
    }

    /// A tool cell: one deterministic call, no model involvement
    async fn run_tool_cell(
        env: &CellEnv,
        cell: &CellSpec,
        session_id: &str,
        cascade_id: &str,
        tool_ctx: &ToolContext,
    ) -> Result<CellOutcome, RunError> {
        let spec = cell.tool.as_ref().expect("tool cell without tool spec");
        let echo = env.sessions.echo(session_id);
        let template_ctx = serde_json::json!({
            "input": echo.as_ref().map(|e| e.inputs.clone()).unwrap_or(Value::Null),
            "state": echo.as_ref().map(|e| serde_json::to_value(&e.state).unwrap_or(Value::Null)).unwrap_or(Value::Null),
        });
        let args = render_args(&spec.args, &template_ctx);

        let call = ToolCall {
            id: format!("cell_{}", cell.name),
            name: spec.name.clone(),
            input: args,
        };
        let row = LogRow::new(session_id, cascade_id, NodeType::ToolCall)
            .with_cell(&cell.name)
            .with_tool_calls_json(serde_json::to_string(&call).unwrap_or_default())
            .with_metadata(&serde_json::json!({"tool": call.name}));
        env.sink.log(row).await.map_err(sink_err)?;

        let call_future = env.tackle.execute(&call, tool_ctx);
        let result = tokio::time::timeout(env.call_timeout, call_future)
            .await
            .map_err(|_| RunError::Timeout(env.call_timeout))?;

        let row = LogRow::new(session_id, cascade_id, NodeType::ToolResult)
            .with_cell(&cell.name)
            .with_role(Role::Tool)
            .with_text_content(&result.content)
            .with_metadata(&serde_json::json!({"tool": call.name, "is_error": result.is_error}));
        env.sink.log(row).await.map_err(sink_err)?;

        if result.is_error {
            return Err(RunError::Tool {
                tool: spec.name.clone(),
                message: result.content,
            });
        }
        Ok(CellOutcome {
            content: parse_output(&result.content),
            transcript: vec![],
        })
    }

    /// A row-mapper cell: run a cascade over the rows of a temp table
    async fn run_row_mapper(
        env: &CellEnv,
        cell: &CellSpec,
        session_id: &str,
        cascade_id: &str,
    ) -> Result<CellOutcome, RunError> {
        use futures::stream::{FuturesOrdered, StreamExt};

        let mapper = cell.for_each_row.as_ref().expect("row-mapper cell without spec");
        let Some(engine) = &env.sql else {
            return Err(RunError::Tool {
                tool: "for_each_row".into(),
                message: "No SQL engine configured".into(),
            });
        };
        let Some(spawner) = &env.spawner else {
            return Err(RunError::Tool {
                tool: "for_each_row".into(),
                message: "No cascade spawner configured".into(),
            });
        };

        let rows = engine
            .query(&format!("SELECT * FROM {}", mapper.table))
            .await
            .map_err(|e| RunError::Tool {
                tool: "for_each_row".into(),
                message: format!("Failed to materialize table '{}': {}", mapper.table, e),
            })?;
        debug!(cell_name = %cell.name, row_count = rows.len(), "run_row_mapper: materialized rows");

        let semaphore = std::sync::Arc::new(tokio::sync::Semaphore::new(mapper.max_parallel.max(1)));
        let mut futures = FuturesOrdered::new();
        for row in rows.iter().cloned() {
            let semaphore = std::sync::Arc::clone(&semaphore);
            let spawner = std::sync::Arc::clone(spawner);
            let cascade_path = mapper.cascade.clone();
            let input_templates = mapper.inputs.clone();
            futures.push_back(async move {
                let _permit = semaphore.acquire().await;
                let ctx = serde_json::json!({"row": row});
                let mut inputs = serde_json::Map::new();
                for (key, template) in &input_templates {
                    inputs.insert(key.clone(), Value::String(render(template, &ctx)));
                }
                spawner.run_cascade(&cascade_path, Value::Object(inputs)).await
            });
        }

        let mut results = Vec::with_capacity(rows.len());
        let mut errors = Vec::new();
        while let Some(result) = futures.next().await {
            match result {
                Ok(output) => results.push(output),
                Err(message) => match mapper.on_error {
                    RowMapperOnError::FailFast => {
                        return Err(RunError::Tool {
                            tool: "for_each_row".into(),
                            message,
                        });
                    }
                    RowMapperOnError::Continue => {
                        results.push(Value::Null);
                    }
                    RowMapperOnError::CollectErrors => {
                        results.push(Value::Null);
                        errors.push(message);
                    }
                },
            }
        }

        if let Some(result_table) = &mapper.result_table {
            let table_rows: Vec<Value> = rows
                .iter()
                .zip(results.iter())
                .map(|(row, result)| {
                    let mut obj = row.as_object().cloned().unwrap_or_default();
                    obj.insert("result".into(), result.clone());
                    Value::Object(obj)
                })
                .collect();
            engine
                .register_table(result_table, table_rows)
                .await
                .map_err(|e| RunError::Tool {
                    tool: "for_each_row".into(),
                    message: format!("Failed to register result table: {}", e),
                })?;
        }

        let content = serde_json::json!({
            "results": results,
            "errors": errors,
        });
        let row = LogRow::new(session_id, cascade_id, NodeType::System)
            .with_cell(&cell.name)
            .with_metadata(&serde_json::json!({
                "row_mapper": true,
                "rows": rows.len(),
                "errors": errors.len(),
            }));
        env.sink.log(row).await.map_err(sink_err)?;

        Ok(CellOutcome {
            content,
            transcript: vec![],
        })
    }
}

struct WardFailure {
    ward: WardSpec,
    reason: String,
    blocking: bool,
}

enum WardResolution {
    Retry(String),
    Fail(String),
}

/// Parse cell output as JSON when it is JSON, else keep it as a string
fn parse_output(text: &str) -> Value {
    let trimmed = text.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(value) = serde_json::from_str(trimmed) {
            return value;
        }
    }
    Value::String(text.to_string())
}

fn sink_err(e: eyre::Report) -> RunError {
    RunError::Provider {
        message: format!("Log write failed: {}", e),
        retryable: false,
    }
}

/// Render templated values inside a tool cell's args
fn render_args(args: &Value, ctx: &Value) -> Value {
    match args {
        Value::String(s) => Value::String(render(s, ctx)),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_args(v, ctx)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_args(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cascade::WardsSpec;
    use crate::identity::Identity;
    use crate::llm::client::mock::{MockLlmClient, MockReply};
    use crate::session::SessionStore;
    use echolog::{LogStore, MemoryStore};
    use std::sync::Arc;

    fn fixture(replies: Vec<MockReply>) -> (CellEnv, Arc<MemoryStore>, Cascade, String) {
        let log = Arc::new(MemoryStore::new());
        let sessions = SessionStore::new(log.clone() as Arc<dyn LogStore>);
        let llm = Arc::new(MockLlmClient::new(replies));
        let env = CellEnv::new(llm, sessions.clone());
        let cascade = Cascade::from_yaml(
            "cascade_id: demo\ncells:\n  - name: draft\n    instructions: \"Say something about {{input.topic}}\"\n",
        )
        .unwrap();
        let session_id = sessions
            .create(
                &cascade,
                serde_json::json!({"topic": "rust"}),
                None,
                None,
                0,
                Identity::new("test-1", serde_json::json!({})),
            )
            .unwrap();
        (env, log, cascade, session_id)
    }

    #[tokio::test]
    async fn test_single_turn_model_cell() {
        let (env, log, cascade, session_id) = fixture(vec![MockReply::text("rust is fine")]);
        let cell = cascade.doc.cells[0].clone();

        let outcome = CellExecutor::run(&env, &cascade, &cell, &session_id, &[], None)
            .await
            .unwrap();
        assert_eq!(outcome.content, serde_json::json!("rust is fine"));

        // Row order: cell_start, agent, cell_complete
        let types: Vec<NodeType> = log
            .rows_for_session(&session_id)
            .unwrap()
            .iter()
            .map(|r| r.node_type)
            .collect();
        assert_eq!(types, vec![NodeType::CellStart, NodeType::Agent, NodeType::CellComplete]);
    }

    #[tokio::test]
    async fn test_instructions_rendered_with_inputs() {
        let (env, _, cascade, session_id) = fixture(vec![MockReply::text("ok")]);
        let cell = cascade.doc.cells[0].clone();
        CellExecutor::run(&env, &cascade, &cell, &session_id, &[], None)
            .await
            .unwrap();

        // The rendered prompt is visible through the echo transcript
        let echo = env.sessions.echo(&session_id).unwrap();
        let first = &echo.cell_messages("draft")[0];
        assert!(first.text().contains("Say something about rust"));
    }

    #[tokio::test]
    async fn test_tool_loop_with_follow_up() {
        let (env, log, cascade, session_id) = fixture(vec![
            MockReply::tool_use("must_contain", serde_json::json!({"text": "has OK", "needle": "OK"})),
            MockReply::text("validated, done"),
        ]);
        let mut cell = cascade.doc.cells[0].clone();
        cell.traits = crate::cascade::TraitSelection::List(vec!["must_contain".into()]);
        cell.max_turns = 3;

        let outcome = CellExecutor::run(&env, &cascade, &cell, &session_id, &[], None)
            .await
            .unwrap();
        assert_eq!(outcome.content, serde_json::json!("validated, done"));

        let types: Vec<NodeType> = log
            .rows_for_session(&session_id)
            .unwrap()
            .iter()
            .map(|r| r.node_type)
            .collect();
        assert_eq!(
            types,
            vec![
                NodeType::CellStart,
                NodeType::Agent,
                NodeType::ToolCall,
                NodeType::ToolResult,
                NodeType::FollowUp,
                NodeType::CellComplete,
            ]
        );
    }

    #[tokio::test]
    async fn test_max_turns_one_permits_one_assistant_turn() {
        let (env, log, cascade, session_id) = fixture(vec![
            MockReply::tool_use("must_contain", serde_json::json!({"text": "x OK", "needle": "OK"})),
            MockReply::text("never requested"),
        ]);
        let mut cell = cascade.doc.cells[0].clone();
        cell.traits = crate::cascade::TraitSelection::List(vec!["must_contain".into()]);
        cell.max_turns = 1;

        CellExecutor::run(&env, &cascade, &cell, &session_id, &[], None)
            .await
            .unwrap();
        let rows = log.rows_for_session(&session_id).unwrap();
        let agent_rows = rows
            .iter()
            .filter(|r| matches!(r.node_type, NodeType::Agent | NodeType::FollowUp))
            .count();
        assert_eq!(agent_rows, 1);
    }

    #[tokio::test]
    async fn test_ward_retry_then_success() {
        // Scenario: post ward must_contain("OK"), model fails then passes
        let (env, log, cascade, session_id) = fixture(vec![MockReply::text("fail"), MockReply::text("all OK")]);
        let mut cell = cascade.doc.cells[0].clone();
        cell.wards = WardsSpec {
            pre: vec![],
            post: vec![WardSpec {
                validator: "must_contain(\"OK\")".into(),
                mode: WardMode::Retry,
                max_attempts: 2,
                retry_instructions: Some("Include 'OK'. Previous error: {{validation_error}}".into()),
                output_schema: None,
            }],
        };

        let outcome = CellExecutor::run(&env, &cascade, &cell, &session_id, &[], None)
            .await
            .unwrap();
        assert_eq!(outcome.content, serde_json::json!("all OK"));

        let rows = log.rows_for_session(&session_id).unwrap();
        let agent_count = rows.iter().filter(|r| r.node_type == NodeType::Agent).count();
        assert_eq!(agent_count, 2);

        let ward_rows: Vec<_> = rows.iter().filter(|r| r.node_type == NodeType::WardCheck).collect();
        assert_eq!(ward_rows.len(), 2);
        let first_meta: Value = serde_json::from_str(ward_rows[0].metadata_json.as_deref().unwrap()).unwrap();
        let second_meta: Value = serde_json::from_str(ward_rows[1].metadata_json.as_deref().unwrap()).unwrap();
        assert_eq!(first_meta["valid"], false);
        assert_eq!(second_meta["valid"], true);

        assert!(rows.iter().any(|r| r.node_type == NodeType::CellComplete));
    }

    #[tokio::test]
    async fn test_ward_retry_exhaustion_fails_cell() {
        let (env, _, cascade, session_id) = fixture(vec![MockReply::text("fail"), MockReply::text("fail again")]);
        let mut cell = cascade.doc.cells[0].clone();
        cell.wards.post = vec![WardSpec {
            validator: "must_contain(\"OK\")".into(),
            mode: WardMode::Retry,
            max_attempts: 2,
            retry_instructions: None,
            output_schema: None,
        }];

        let err = CellExecutor::run(&env, &cascade, &cell, &session_id, &[], None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ValidationError");

        // The failure is recorded on the Echo
        let echo = env.sessions.echo(&session_id).unwrap();
        assert_eq!(echo.errors.len(), 1);
        assert_eq!(echo.errors[0].error_kind, "ValidationError");
    }

    #[tokio::test]
    async fn test_blocking_ward_fails_immediately() {
        let (env, _, cascade, session_id) = fixture(vec![MockReply::text("fail")]);
        let mut cell = cascade.doc.cells[0].clone();
        cell.wards.post = vec![WardSpec {
            validator: "must_contain(\"OK\")".into(),
            mode: WardMode::Blocking,
            max_attempts: 5,
            retry_instructions: None,
            output_schema: None,
        }];

        let err = CellExecutor::run(&env, &cascade, &cell, &session_id, &[], None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
    }

    #[tokio::test]
    async fn test_advisory_ward_logs_and_continues() {
        let (env, log, cascade, session_id) = fixture(vec![MockReply::text("fail")]);
        let mut cell = cascade.doc.cells[0].clone();
        cell.wards.post = vec![WardSpec {
            validator: "must_contain(\"OK\")".into(),
            mode: WardMode::Advisory,
            max_attempts: 1,
            retry_instructions: None,
            output_schema: None,
        }];

        let outcome = CellExecutor::run(&env, &cascade, &cell, &session_id, &[], None)
            .await
            .unwrap();
        assert_eq!(outcome.content, serde_json::json!("fail"));
        let rows = log.rows_for_session(&session_id).unwrap();
        assert!(rows.iter().any(|r| r.node_type == NodeType::WardCheck));
    }

    #[tokio::test]
    async fn test_inline_tool_call_with_brace_repair() {
        // Model emits the tool call as JSON content with two extra braces
        let (env, log, cascade, session_id) = fixture(vec![
            MockReply::text(r#"{"tool":"must_contain","arguments":{"text":"x OK","needle":"OK"}}}}"#),
            MockReply::text("done"),
        ]);
        let mut cell = cascade.doc.cells[0].clone();
        cell.traits = crate::cascade::TraitSelection::List(vec!["must_contain".into()]);
        cell.max_turns = 3;

        let outcome = CellExecutor::run(&env, &cascade, &cell, &session_id, &[], None)
            .await
            .unwrap();
        assert_eq!(outcome.content, serde_json::json!("done"));

        let rows = log.rows_for_session(&session_id).unwrap();
        let tool_call_row = rows.iter().find(|r| r.node_type == NodeType::ToolCall).unwrap();
        let meta: Value = serde_json::from_str(tool_call_row.metadata_json.as_deref().unwrap()).unwrap();
        assert_eq!(meta["json_repair"], true);
        assert!(tool_call_row.tool_calls_json.as_deref().unwrap().contains("must_contain"));
    }

    #[tokio::test]
    async fn test_provider_error_classified() {
        let (env, _, cascade, session_id) = fixture(vec![
            MockReply::failure("boom"),
            MockReply::failure("boom"),
            MockReply::failure("boom"),
        ]);
        let cell = cascade.doc.cells[0].clone();
        let err = CellExecutor::run(&env, &cascade, &cell, &session_id, &[], None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ProviderError");
    }

    #[tokio::test]
    async fn test_tool_cell_runs_deterministically() {
        let (env, log, _, session_id) = fixture(vec![]);
        let cascade = Cascade::from_yaml(
            "cascade_id: demo2\ncells:\n  - name: check\n    tool:\n      name: must_contain\n      args:\n        text: \"{{input.topic}} OK\"\n        needle: OK\n",
        )
        .unwrap();
        let cell = cascade.doc.cells[0].clone();

        let outcome = CellExecutor::run(&env, &cascade, &cell, &session_id, &[], None)
            .await
            .unwrap();
        assert_eq!(outcome.content["valid"], true);

        let rows = log.rows_for_session(&session_id).unwrap();
        assert!(rows.iter().any(|r| r.node_type == NodeType::ToolCall));
        assert!(rows.iter().any(|r| r.node_type == NodeType::ToolResult));
    }

    #[tokio::test]
    async fn test_json_output_parsed() {
        let (env, _, cascade, session_id) = fixture(vec![MockReply::text(r#"{"score": 0.9}"#)]);
        let cell = cascade.doc.cells[0].clone();
        let outcome = CellExecutor::run(&env, &cascade, &cell, &session_id, &[], None)
            .await
            .unwrap();
        assert_eq!(outcome.content["score"], 0.9);
    }
}
