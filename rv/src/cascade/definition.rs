//! Cascade document types
//!
//! A cascade is a declarative workflow: an ordered list of cells, each
//! producing an artifact. Documents are immutable once loaded and are
//! persisted verbatim with every run so historical replay is byte-exact.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A cascade document as declared in YAML or JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeDoc {
    pub cascade_id: String,

    /// Typed input field definitions: name -> type-or-description
    pub inputs_schema: BTreeMap<String, serde_json::Value>,

    /// Ordered cells; names are unique within the cascade
    pub cells: Vec<CellSpec>,

    /// Cascade-level candidate default applied to cells without their own
    pub candidates: Option<CandidateSpec>,

    /// Directories of standalone cascades usable as tools
    pub tool_dirs: Vec<String>,

    /// Cross-cell context default ("clean_slate" unless stated)
    pub context_policy: Option<String>,
}

impl Default for CascadeDoc {
    fn default() -> Self {
        Self {
            cascade_id: String::new(),
            inputs_schema: BTreeMap::new(),
            cells: Vec::new(),
            candidates: None,
            tool_dirs: Vec::new(),
            context_policy: None,
        }
    }
}

/// One step of a cascade
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CellSpec {
    pub name: String,

    /// Templated instructions (model cell)
    pub instructions: Option<String>,

    /// Single deterministic tool call (tool cell)
    pub tool: Option<ToolCellSpec>,

    /// Row iteration over a named temp table (row-mapper cell)
    pub for_each_row: Option<RowMapperSpec>,

    /// Declared input fields for this cell
    pub inputs: Option<serde_json::Value>,

    /// Declared output shape
    pub outputs: Option<serde_json::Value>,

    /// Tools available during the cell, or "manifest" for quartermaster selection
    pub traits: TraitSelection,

    pub candidates: Option<CandidateSpec>,
    pub reforge: Option<ReforgeSpec>,
    pub wards: WardsSpec,

    /// Retrieve prior verified outputs as few-shot exemplars
    pub use_training: bool,
    pub training_limit: usize,

    /// Prior cell names / state keys to propagate; default is clean slate
    pub context: Vec<String>,

    pub max_turns: u32,

    /// Model override for this cell
    pub model: Option<String>,

    /// Explicit next cell for non-linear flow
    pub handoff: Option<String>,
}

impl Default for CellSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            instructions: None,
            tool: None,
            for_each_row: None,
            inputs: None,
            outputs: None,
            traits: TraitSelection::default(),
            candidates: None,
            reforge: None,
            wards: WardsSpec::default(),
            use_training: false,
            training_limit: 3,
            context: Vec::new(),
            max_turns: 5,
            model: None,
            handoff: None,
        }
    }
}

/// The mutually exclusive execution mode of a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellMode {
    Model,
    Tool,
    RowMapper,
}

impl CellSpec {
    /// Resolve the cell's execution mode
    pub fn mode(&self) -> CellMode {
        if self.tool.is_some() {
            CellMode::Tool
        } else if self.for_each_row.is_some() {
            CellMode::RowMapper
        } else {
            CellMode::Model
        }
    }

    /// True when exactly one execution mode is declared
    pub fn mode_is_unambiguous(&self) -> bool {
        let declared = [self.instructions.is_some(), self.tool.is_some(), self.for_each_row.is_some()]
            .iter()
            .filter(|b| **b)
            .count();
        declared == 1
    }
}

/// A deterministic tool invocation for a tool cell
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolCellSpec {
    pub name: String,
    pub args: serde_json::Value,
}

/// Tools exposed to a cell
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TraitSelection {
    /// The sentinel "manifest": a quartermaster meta-cell picks the subset
    Sentinel(String),
    /// Explicit tool names
    List(Vec<String>),
}

impl TraitSelection {
    pub fn is_manifest(&self) -> bool {
        matches!(self, TraitSelection::Sentinel(s) if s == "manifest")
    }

    /// Tool names when explicitly listed
    pub fn names(&self) -> &[String] {
        match self {
            TraitSelection::List(names) => names,
            TraitSelection::Sentinel(_) => &[],
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            TraitSelection::List(names) => names.is_empty(),
            TraitSelection::Sentinel(_) => false,
        }
    }
}

impl Default for TraitSelection {
    fn default() -> Self {
        TraitSelection::List(Vec::new())
    }
}

/// Candidate exploration: run N variants, let an evaluator pick
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CandidateSpec {
    /// Literal count or a template rendered over inputs/state
    pub factor: FactorSpec,
    pub evaluator_instructions: String,
    pub mode: CandidateMode,
    pub max_parallel: usize,
}

impl Default for CandidateSpec {
    fn default() -> Self {
        Self {
            factor: FactorSpec::Literal(1),
            evaluator_instructions: String::new(),
            mode: CandidateMode::Select,
            max_parallel: 4,
        }
    }
}

/// Candidate factor: a literal or a template over inputs/state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FactorSpec {
    Literal(u32),
    Template(String),
}

/// How the evaluator resolves the branches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateMode {
    /// Evaluator names the winning index
    Select,
    /// Evaluator produces an aggregated artifact
    Aggregate,
    /// First candidate passing the evaluator's predicate wins
    FirstValid,
    /// Any branch error fails the cell
    AllOrNothing,
}

/// Sequential refinement of the winning artifact
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReforgeSpec {
    pub steps: u32,
    pub honing_prompt: String,
    /// Named prompt mutations applied per step, cycled in order
    pub mutations: Vec<String>,
}

/// Pre/post ward lists for a cell
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WardsSpec {
    pub pre: Vec<WardSpec>,
    pub post: Vec<WardSpec>,
}

impl WardsSpec {
    pub fn is_empty(&self) -> bool {
        self.pre.is_empty() && self.post.is_empty()
    }
}

/// One validator attached to a cell
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WardSpec {
    /// Tool name in the registry, or a cascade path
    pub validator: String,
    pub mode: WardMode,
    pub max_attempts: u32,
    /// Rendered into the retry prompt with {{validation_error}}, {{attempt}}, {{max_attempts}}
    pub retry_instructions: Option<String>,
    /// JSON schema the cell output must validate against
    pub output_schema: Option<serde_json::Value>,
}

impl Default for WardSpec {
    fn default() -> Self {
        Self {
            validator: String::new(),
            mode: WardMode::Advisory,
            max_attempts: 2,
            retry_instructions: None,
            output_schema: None,
        }
    }
}

/// Ward enforcement mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WardMode {
    Blocking,
    Retry,
    Advisory,
}

/// Row-mapper cell: iterate rows of a named temp table through a cascade
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RowMapperSpec {
    pub table: String,
    pub cascade: String,
    /// Input templates rendered per row
    pub inputs: BTreeMap<String, String>,
    pub max_parallel: usize,
    pub result_table: Option<String>,
    pub on_error: RowMapperOnError,
}

impl Default for RowMapperSpec {
    fn default() -> Self {
        Self {
            table: String::new(),
            cascade: String::new(),
            inputs: BTreeMap::new(),
            max_parallel: 4,
            result_table: None,
            on_error: RowMapperOnError::FailFast,
        }
    }
}

/// Per-row error policy for a row-mapper cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowMapperOnError {
    Continue,
    FailFast,
    CollectErrors,
}
