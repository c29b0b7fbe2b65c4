//! WardEngine - pre/post cell validation
//!
//! A ward names a validator (a registry tool, or a cascade path) and an
//! enforcement mode. `blocking` fails the cell on first invalid,
//! `retry` re-runs the cell with the validator's reason rendered into
//! the prompt, `advisory` logs and continues. Wards may also declare an
//! `output_schema`; schema errors feed the same machinery.

mod schema;

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

pub use schema::validate_schema;

use crate::cascade::WardSpec;
use crate::errors::RunError;
use crate::tackle::{Tackle, ToolContext};
use crate::template::render;

/// Result of one ward check
#[derive(Debug, Clone)]
pub struct WardOutcome {
    pub valid: bool,
    pub reason: String,
}

impl WardOutcome {
    pub fn valid() -> Self {
        Self {
            valid: true,
            reason: String::new(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: reason.into(),
        }
    }
}

/// Runs ward validators against cell inputs and outputs
pub struct WardEngine {
    tackle: Arc<Tackle>,
}

impl WardEngine {
    pub fn new(tackle: Arc<Tackle>) -> Self {
        Self { tackle }
    }

    /// Check one ward against a subject value
    pub async fn check(&self, ward: &WardSpec, subject: &Value, ctx: &ToolContext) -> Result<WardOutcome, RunError> {
        debug!(validator = %ward.validator, "WardEngine::check: called");

        // Schema check first; its errors read well in retry prompts
        if let Some(output_schema) = &ward.output_schema {
            let errors = validate_schema(output_schema, subject);
            if !errors.is_empty() {
                return Ok(WardOutcome::invalid(errors.join("; ")));
            }
        }

        if ward.validator.is_empty() {
            return Ok(WardOutcome::valid());
        }

        let (name, args) = parse_validator_call(&ward.validator);
        if self.tackle.has_tool(&name) {
            return self.check_via_tool(&name, &args, subject, ctx).await;
        }
        self.check_via_cascade(ward, subject, ctx).await
    }

    async fn check_via_tool(
        &self,
        name: &str,
        args: &[Value],
        subject: &Value,
        ctx: &ToolContext,
    ) -> Result<WardOutcome, RunError> {
        let subject_text = match subject {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        // Validator tools receive the subject as both `text` and `value`;
        // the first declared argument doubles as `needle` for matchers.
        let mut input = serde_json::json!({"text": subject_text, "value": subject, "args": args});
        if let Some(first) = args.first() {
            input["needle"] = first.clone();
        }
        let call = crate::llm::ToolCall {
            id: format!("ward_{}", name),
            name: name.to_string(),
            input,
        };
        let result = self.tackle.execute(&call, ctx).await;
        if result.is_error {
            return Err(RunError::Tool {
                tool: name.to_string(),
                message: result.content,
            });
        }
        Ok(parse_verdict(&result.content))
    }

    async fn check_via_cascade(&self, ward: &WardSpec, subject: &Value, ctx: &ToolContext) -> Result<WardOutcome, RunError> {
        let Some(spawner) = &ctx.spawner else {
            return Err(RunError::Validation {
                reason: format!("Validator '{}' is neither a tool nor reachable as a cascade", ward.validator),
            });
        };
        match spawner
            .run_cascade(&ward.validator, serde_json::json!({"value": subject}))
            .await
        {
            Ok(output) => Ok(parse_verdict(&match output {
                Value::String(s) => s,
                other => other.to_string(),
            })),
            Err(e) => Err(RunError::Validation {
                reason: format!("Validator cascade '{}' failed: {}", ward.validator, e),
            }),
        }
    }
}

/// Split `must_contain("OK")` into a tool name and literal arguments
///
/// Bare names pass through with no args; cascade paths never carry
/// parens, so they are unaffected.
fn parse_validator_call(validator: &str) -> (String, Vec<Value>) {
    let trimmed = validator.trim();
    let Some(open) = trimmed.find('(') else {
        return (trimmed.to_string(), Vec::new());
    };
    if !trimmed.ends_with(')') {
        return (trimmed.to_string(), Vec::new());
    }
    let name = trimmed[..open].trim().to_string();
    let inner = &trimmed[open + 1..trimmed.len() - 1];
    let args = inner
        .split(',')
        .map(|arg| arg.trim())
        .filter(|arg| !arg.is_empty())
        .map(|arg| {
            let unquoted = arg.trim_matches('"').trim_matches('\'');
            if unquoted.len() != arg.len() {
                Value::String(unquoted.to_string())
            } else {
                serde_json::from_str(arg).unwrap_or_else(|_| Value::String(arg.to_string()))
            }
        })
        .collect();
    (name, args)
}

/// Interpret validator output as a `{valid, reason}` envelope
///
/// Non-JSON output counts as valid only when it literally says so.
fn parse_verdict(content: &str) -> WardOutcome {
    if let Ok(value) = serde_json::from_str::<Value>(content) {
        let valid = value.get("valid").and_then(|v| v.as_bool()).unwrap_or(false);
        let reason = value
            .get("reason")
            .and_then(|r| r.as_str())
            .unwrap_or_default()
            .to_string();
        return WardOutcome { valid, reason };
    }
    let lowered = content.trim().to_lowercase();
    if lowered == "valid" || lowered == "true" || lowered == "ok" {
        WardOutcome::valid()
    } else {
        WardOutcome::invalid(content.trim().to_string())
    }
}

/// Render a ward's retry instructions for the next attempt
pub fn render_retry(ward: &WardSpec, validation_error: &str, attempt: u32) -> String {
    let template = ward
        .retry_instructions
        .as_deref()
        .unwrap_or("The previous output failed validation: {{validation_error}} (attempt {{attempt}} of {{max_attempts}}). Fix it.");
    render(
        template,
        &serde_json::json!({
            "validation_error": validation_error,
            "attempt": attempt,
            "max_attempts": ward.max_attempts,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cascade::WardMode;

    fn ward(validator: &str) -> WardSpec {
        WardSpec {
            validator: validator.into(),
            mode: WardMode::Retry,
            max_attempts: 2,
            retry_instructions: None,
            output_schema: None,
        }
    }

    #[tokio::test]
    async fn test_tool_validator_valid() {
        let engine = WardEngine::new(Arc::new(Tackle::standard()));
        let ctx = ToolContext::new("s", "c");
        let outcome = engine
            .check(&ward("must_contain(\"OK\")"), &serde_json::json!("all OK"), &ctx)
            .await
            .unwrap();
        assert!(outcome.valid);
    }

    #[tokio::test]
    async fn test_tool_validator_invalid_with_reason() {
        let engine = WardEngine::new(Arc::new(Tackle::standard()));
        let ctx = ToolContext::new("s", "c");
        let outcome = engine
            .check(&ward("must_contain(\"OK\")"), &serde_json::json!("nope"), &ctx)
            .await
            .unwrap();
        assert!(!outcome.valid);
        assert!(outcome.reason.contains("OK"));
    }

    #[test]
    fn test_parse_validator_call_shapes() {
        assert_eq!(parse_validator_call("must_contain"), ("must_contain".to_string(), vec![]));
        let (name, args) = parse_validator_call("must_contain(\"OK\")");
        assert_eq!(name, "must_contain");
        assert_eq!(args, vec![Value::String("OK".into())]);
        let (name, args) = parse_validator_call("in_range(0, 10)");
        assert_eq!(name, "in_range");
        assert_eq!(args, vec![serde_json::json!(0), serde_json::json!(10)]);
        // Cascade paths pass through untouched
        let (name, args) = parse_validator_call("cascades/check.yaml");
        assert_eq!(name, "cascades/check.yaml");
        assert!(args.is_empty());
    }

    #[tokio::test]
    async fn test_schema_check_precedes_validator() {
        let engine = WardEngine::new(Arc::new(Tackle::standard()));
        let ctx = ToolContext::new("s", "c");
        let mut w = ward("");
        w.output_schema = Some(serde_json::json!({"type": "object", "required": ["score"]}));

        let outcome = engine.check(&w, &serde_json::json!({"other": 1}), &ctx).await.unwrap();
        assert!(!outcome.valid);
        assert!(outcome.reason.contains("score"));

        let outcome = engine.check(&w, &serde_json::json!({"score": 2}), &ctx).await.unwrap();
        assert!(outcome.valid);
    }

    #[tokio::test]
    async fn test_unknown_validator_without_spawner() {
        let engine = WardEngine::new(Arc::new(Tackle::standard()));
        let ctx = ToolContext::new("s", "c");
        let err = engine
            .check(&ward("cascades/validator.yaml"), &serde_json::json!("x"), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
    }

    #[test]
    fn test_parse_verdict_shapes() {
        assert!(parse_verdict(r#"{"valid": true, "reason": ""}"#).valid);
        assert!(!parse_verdict(r#"{"valid": false, "reason": "too short"}"#).valid);
        assert!(parse_verdict("OK").valid);
        assert!(!parse_verdict("output was wrong").valid);
    }

    #[test]
    fn test_render_retry_variables() {
        let mut w = ward("must_contain");
        w.retry_instructions = Some("Include 'OK'. Previous error: {{validation_error}} ({{attempt}}/{{max_attempts}})".into());
        let prompt = render_retry(&w, "output does not contain 'OK'", 2);
        assert_eq!(prompt, "Include 'OK'. Previous error: output does not contain 'OK' (2/2)");
    }

    #[test]
    fn test_render_retry_default_template() {
        let prompt = render_retry(&ward("v"), "bad", 1);
        assert!(prompt.contains("bad"));
        assert!(prompt.contains("attempt 1"));
    }
}
