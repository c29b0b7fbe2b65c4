//! Tackle - the tool system
//!
//! Tools give cells deterministic capabilities: file access, SQL,
//! state writes, and sub-cascade spawning. Cascades placed in
//! `tool_dirs` register as tools through the same interface.

mod cascade_tool;
mod parse;
mod quartermaster;
mod registry;
mod traits;

pub mod builtin;

pub use cascade_tool::CascadeTool;
pub use parse::{ParsedToolCall, looks_like_tool_call, parse_tool_call};
pub use quartermaster::{ManifestSelection, Quartermaster};
pub use registry::Tackle;
pub use traits::{CascadeSpawner, CascadeSpawnerRef, ImageRef, Tool, ToolContext, ToolResult};
