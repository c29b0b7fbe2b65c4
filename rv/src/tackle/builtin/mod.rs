//! Built-in deterministic tools

mod must_contain;
mod read_file;
mod run_cascade;
mod run_query;
mod set_state;

pub use must_contain::MustContainTool;
pub use read_file::ReadFileTool;
pub use run_cascade::RunCascadeTool;
pub use run_query::RunQueryTool;
pub use set_state::SetStateTool;
