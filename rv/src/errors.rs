//! Engine error taxonomy
//!
//! Every error that can terminate a cell is classified into one of these
//! kinds; the kind string is what lands in `Echo.errors` and the log.

use thiserror::Error;

/// Errors raised while running a cascade
#[derive(Debug, Error)]
pub enum RunError {
    /// LLM/API failure, including empty-content responses that can't be ignored
    #[error("Provider error: {message}")]
    Provider { message: String, retryable: bool },

    /// Tool invocation failed in a way the model cannot recover from
    #[error("Tool error in '{tool}': {message}")]
    Tool { tool: String, message: String },

    /// A ward or schema validator returned invalid
    #[error("Validation failed: {reason}")]
    Validation { reason: String },

    /// Tool-call JSON malformed beyond the rebalancing repair heuristic
    #[error("Tool-call parse error: {0}")]
    Parse(String),

    /// A suspending call exceeded its budget
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// External cancellation
    #[error("Canceled: {0}")]
    Canceled(String),

    /// All candidate branches failed
    #[error("All {attempted} candidate branches failed")]
    CandidateExhaustion { attempted: usize, branch_errors: Vec<String> },

    /// Quota/rate-limit/security denial surfaced to the cell loop
    #[error("Policy denial: {0}")]
    Policy(String),
}

impl RunError {
    /// Stable kind string recorded in `Echo.errors` and error rows
    pub fn kind(&self) -> &'static str {
        match self {
            RunError::Provider { .. } => "ProviderError",
            RunError::Tool { .. } => "ToolError",
            RunError::Validation { .. } => "ValidationError",
            RunError::Parse(_) => "ParseError",
            RunError::Timeout(_) => "TimeoutError",
            RunError::Canceled(_) => "CanceledError",
            RunError::CandidateExhaustion { .. } => "CandidateExhaustionError",
            RunError::Policy(_) => "PolicyError",
        }
    }

    /// Whether the cell loop may retry or continue after this error
    pub fn is_recoverable(&self) -> bool {
        match self {
            RunError::Provider { retryable, .. } => *retryable,
            RunError::Tool { .. } => true,
            RunError::Validation { .. } => true,
            RunError::Parse(_) => false,
            RunError::Timeout(_) => true,
            RunError::Canceled(_) => false,
            RunError::CandidateExhaustion { .. } => false,
            RunError::Policy(_) => false,
        }
    }

    /// Structured metadata attached to the error record
    pub fn metadata(&self) -> serde_json::Value {
        match self {
            RunError::Provider { retryable, .. } => serde_json::json!({"retryable": retryable}),
            RunError::Tool { tool, .. } => serde_json::json!({"tool": tool}),
            RunError::CandidateExhaustion { attempted, branch_errors } => {
                serde_json::json!({"attempted": attempted, "branch_errors": branch_errors})
            }
            RunError::Timeout(duration) => serde_json::json!({"timeout_ms": duration.as_millis() as u64}),
            _ => serde_json::json!({}),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings() {
        assert_eq!(
            RunError::Provider {
                message: "boom".into(),
                retryable: true
            }
            .kind(),
            "ProviderError"
        );
        assert_eq!(RunError::Parse("bad".into()).kind(), "ParseError");
        assert_eq!(
            RunError::CandidateExhaustion {
                attempted: 3,
                branch_errors: vec![]
            }
            .kind(),
            "CandidateExhaustionError"
        );
    }

    #[test]
    fn test_recoverability() {
        assert!(
            RunError::Tool {
                tool: "t".into(),
                message: "m".into()
            }
            .is_recoverable()
        );
        assert!(!RunError::Parse("bad".into()).is_recoverable());
        assert!(!RunError::Canceled("stop".into()).is_recoverable());
        assert!(!RunError::Policy("quota".into()).is_recoverable());
    }

    #[test]
    fn test_metadata_shape() {
        let err = RunError::CandidateExhaustion {
            attempted: 2,
            branch_errors: vec!["a".into(), "b".into()],
        };
        let meta = err.metadata();
        assert_eq!(meta["attempted"], 2);
        assert_eq!(meta["branch_errors"].as_array().unwrap().len(), 2);
    }
}
