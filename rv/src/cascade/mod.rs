//! Cascade documents: definition types and loading

mod definition;
mod loader;

pub use definition::{
    CandidateMode, CandidateSpec, CascadeDoc, CellMode, CellSpec, FactorSpec, ReforgeSpec, RowMapperOnError,
    RowMapperSpec, ToolCellSpec, TraitSelection, WardMode, WardSpec, WardsSpec,
};
pub use loader::Cascade;
