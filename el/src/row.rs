//! Unified log row types for cascade sessions
//!
//! Every observable event in a cascade run becomes one `LogRow`:
//! cascade lifecycle, cell lifecycle, agent calls, tool calls, follow-ups,
//! candidate evaluation, refinement steps, ward checks, state writes, and
//! errors. Rows are flat and reference parents by id strings, never by
//! pointers, so the log can be reassembled across processes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of event a log row captures
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    CascadeStart,
    CascadeComplete,
    CellStart,
    CellComplete,
    Agent,
    ToolCall,
    ToolResult,
    FollowUp,
    CandidateEvaluated,
    WinnerSelected,
    RefinementStep,
    WardCheck,
    StateWrite,
    Error,
    User,
    System,
}

impl NodeType {
    /// Stable string form used in the `node_type` column
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::CascadeStart => "cascade_start",
            NodeType::CascadeComplete => "cascade_complete",
            NodeType::CellStart => "cell_start",
            NodeType::CellComplete => "cell_complete",
            NodeType::Agent => "agent",
            NodeType::ToolCall => "tool_call",
            NodeType::ToolResult => "tool_result",
            NodeType::FollowUp => "follow_up",
            NodeType::CandidateEvaluated => "candidate_evaluated",
            NodeType::WinnerSelected => "winner_selected",
            NodeType::RefinementStep => "refinement_step",
            NodeType::WardCheck => "ward_check",
            NodeType::StateWrite => "state_write",
            NodeType::Error => "error",
            NodeType::User => "user",
            NodeType::System => "system",
        }
    }

    /// Parse from the stored column value
    pub fn parse(s: &str) -> Option<Self> {
        let node_type = match s {
            "cascade_start" => NodeType::CascadeStart,
            "cascade_complete" => NodeType::CascadeComplete,
            "cell_start" => NodeType::CellStart,
            "cell_complete" => NodeType::CellComplete,
            "agent" => NodeType::Agent,
            "tool_call" => NodeType::ToolCall,
            "tool_result" => NodeType::ToolResult,
            "follow_up" => NodeType::FollowUp,
            "candidate_evaluated" => NodeType::CandidateEvaluated,
            "winner_selected" => NodeType::WinnerSelected,
            "refinement_step" => NodeType::RefinementStep,
            "ward_check" => NodeType::WardCheck,
            "state_write" => NodeType::StateWrite,
            "error" => NodeType::Error,
            "user" => NodeType::User,
            "system" => NodeType::System,
            _ => return None,
        };
        Some(node_type)
    }
}

/// Conversation role attached to message-bearing rows
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
            Role::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

/// One row of the unified event log
///
/// Field names match the durable schema one-to-one. Optional columns are
/// `None` when the event kind does not carry them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRow {
    /// Unix seconds with sub-second precision
    pub timestamp: f64,
    /// Same instant, ISO-8601
    pub timestamp_iso: String,

    pub session_id: String,
    /// Unique id of this row
    pub trace_id: String,
    /// Id of the logical parent row (e.g. the agent row a tool result answers)
    pub parent_id: Option<String>,
    pub parent_session_id: Option<String>,
    pub parent_message_id: Option<String>,

    pub node_type: NodeType,
    pub role: Option<Role>,

    pub depth: i64,
    pub candidate_index: Option<i64>,
    pub is_winner: Option<bool>,
    pub reforge_step: Option<i64>,
    pub attempt_number: Option<i64>,
    pub turn_number: Option<i64>,

    pub cascade_id: String,
    pub cell_name: Option<String>,
    /// Serialized cell config for cell-scoped rows
    pub cell_json: Option<String>,
    /// Serialized cascade config, present on cascade_start rows
    pub cascade_json: Option<String>,

    pub model: Option<String>,
    pub request_id: Option<String>,
    pub provider: Option<String>,

    pub duration_ms: Option<i64>,
    pub tokens_in: Option<i64>,
    pub tokens_out: Option<i64>,
    pub total_tokens: Option<i64>,
    pub cost: Option<f64>,

    pub content_json: Option<String>,
    pub full_request_json: Option<String>,
    pub full_response_json: Option<String>,
    pub tool_calls_json: Option<String>,
    pub images_json: Option<String>,

    pub has_images: bool,
    pub has_base64: bool,

    pub metadata_json: Option<String>,

    pub caller_id: Option<String>,
    pub invocation_metadata_json: Option<String>,
}

impl LogRow {
    /// Create a row for the given session and event kind, stamped now
    pub fn new(session_id: impl Into<String>, cascade_id: impl Into<String>, node_type: NodeType) -> Self {
        let now: DateTime<Utc> = Utc::now();
        Self {
            timestamp: now.timestamp_micros() as f64 / 1_000_000.0,
            timestamp_iso: now.to_rfc3339(),
            session_id: session_id.into(),
            trace_id: uuid::Uuid::now_v7().to_string(),
            parent_id: None,
            parent_session_id: None,
            parent_message_id: None,
            node_type,
            role: None,
            depth: 0,
            candidate_index: None,
            is_winner: None,
            reforge_step: None,
            attempt_number: None,
            turn_number: None,
            cascade_id: cascade_id.into(),
            cell_name: None,
            cell_json: None,
            cascade_json: None,
            model: None,
            request_id: None,
            provider: None,
            duration_ms: None,
            tokens_in: None,
            tokens_out: None,
            total_tokens: None,
            cost: None,
            content_json: None,
            full_request_json: None,
            full_response_json: None,
            tool_calls_json: None,
            images_json: None,
            has_images: false,
            has_base64: false,
            metadata_json: None,
            caller_id: None,
            invocation_metadata_json: None,
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    pub fn with_cell(mut self, cell_name: impl Into<String>) -> Self {
        self.cell_name = Some(cell_name.into());
        self
    }

    pub fn with_cell_json(mut self, cell_json: impl Into<String>) -> Self {
        self.cell_json = Some(cell_json.into());
        self
    }

    pub fn with_cascade_json(mut self, cascade_json: impl Into<String>) -> Self {
        self.cascade_json = Some(cascade_json.into());
        self
    }

    pub fn with_depth(mut self, depth: i64) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_parent_session(mut self, parent_session_id: impl Into<String>) -> Self {
        self.parent_session_id = Some(parent_session_id.into());
        self
    }

    pub fn with_parent_id(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_content(mut self, content: &serde_json::Value) -> Self {
        self.content_json = Some(content.to_string());
        self
    }

    pub fn with_text_content(mut self, text: &str) -> Self {
        self.content_json = Some(serde_json::json!(text).to_string());
        self
    }

    pub fn with_candidate(mut self, index: i64, is_winner: Option<bool>) -> Self {
        self.candidate_index = Some(index);
        self.is_winner = is_winner;
        self
    }

    pub fn with_reforge_step(mut self, step: i64) -> Self {
        self.reforge_step = Some(step);
        self
    }

    pub fn with_attempt(mut self, attempt: i64) -> Self {
        self.attempt_number = Some(attempt);
        self
    }

    pub fn with_turn(mut self, turn: i64) -> Self {
        self.turn_number = Some(turn);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>, provider: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self.provider = Some(provider.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_usage(mut self, tokens_in: i64, tokens_out: i64, cost: f64) -> Self {
        self.tokens_in = Some(tokens_in);
        self.tokens_out = Some(tokens_out);
        self.total_tokens = Some(tokens_in + tokens_out);
        self.cost = Some(cost);
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: i64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_tool_calls_json(mut self, tool_calls_json: impl Into<String>) -> Self {
        self.tool_calls_json = Some(tool_calls_json.into());
        self
    }

    pub fn with_full_request(mut self, full_request: &serde_json::Value) -> Self {
        self.full_request_json = Some(full_request.to_string());
        self
    }

    pub fn with_full_response(mut self, full_response: &serde_json::Value) -> Self {
        self.full_response_json = Some(full_response.to_string());
        self
    }

    pub fn with_metadata(mut self, metadata: &serde_json::Value) -> Self {
        self.metadata_json = Some(metadata.to_string());
        self
    }

    pub fn with_identity(mut self, caller_id: impl Into<String>, invocation_metadata: &serde_json::Value) -> Self {
        self.caller_id = Some(caller_id.into());
        self.invocation_metadata_json = Some(invocation_metadata.to_string());
        self
    }

    pub fn with_images(mut self, images_json: impl Into<String>, has_base64: bool) -> Self {
        self.images_json = Some(images_json.into());
        self.has_images = true;
        self.has_base64 = has_base64;
        self
    }
}

/// Durable state snapshot row, one per `set_state` write
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateRow {
    pub session_id: String,
    pub cascade_id: String,
    pub key: String,
    /// JSON-encoded value
    pub value: String,
    /// JSON type tag: "string", "number", "bool", "array", "object", "null"
    pub value_type: String,
    pub cell_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl StateRow {
    /// Build a snapshot row from a live state write
    pub fn new(
        session_id: impl Into<String>,
        cascade_id: impl Into<String>,
        key: impl Into<String>,
        value: &serde_json::Value,
        cell_name: Option<String>,
    ) -> Self {
        let value_type = match value {
            serde_json::Value::Null => "null",
            serde_json::Value::Bool(_) => "bool",
            serde_json::Value::Number(_) => "number",
            serde_json::Value::String(_) => "string",
            serde_json::Value::Array(_) => "array",
            serde_json::Value::Object(_) => "object",
        };
        Self {
            session_id: session_id.into(),
            cascade_id: cascade_id.into(),
            key: key.into(),
            value: value.to_string(),
            value_type: value_type.to_string(),
            cell_name,
            created_at: Utc::now(),
        }
    }

    /// Decode the stored JSON value
    pub fn value_json(&self) -> serde_json::Value {
        serde_json::from_str(&self.value).unwrap_or(serde_json::Value::Null)
    }
}

/// Cascade-session row written once per run, holding the verbatim document
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CascadeSessionRow {
    pub session_id: String,
    pub cascade_id: String,
    pub parent_session_id: Option<String>,
    pub depth: i64,
    /// The cascade document exactly as loaded, byte-for-byte
    pub cascade_raw: String,
    /// JSON-encoded inputs the run was started with
    pub input_data: String,
    pub caller_id: Option<String>,
    pub invocation_metadata_json: Option<String>,
    pub created_at: DateTime<Utc>,
}
