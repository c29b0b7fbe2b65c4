//! Cascade loading and validation
//!
//! The loader keeps the raw document text alongside the parsed form; the
//! raw text is what gets persisted with each run, never a re-serialization.

use std::path::Path;

use eyre::{Context, Result, bail};
use tracing::debug;

use super::definition::{CascadeDoc, TraitSelection};

/// A loaded cascade: parsed document plus the verbatim source text
#[derive(Debug, Clone)]
pub struct Cascade {
    pub doc: CascadeDoc,
    /// The document exactly as read, byte-for-byte
    pub raw: String,
}

impl Cascade {
    /// Load from a file; YAML unless the extension says `.json`
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Cascade::from_path: called");
        let raw = std::fs::read_to_string(path).context(format!("Failed to read cascade {}", path.display()))?;

        let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
        if is_json {
            Self::from_json(&raw)
        } else {
            Self::from_yaml(&raw)
        }
    }

    /// Parse a YAML document
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let doc: CascadeDoc = serde_yaml::from_str(raw).context("Failed to parse cascade YAML")?;
        let cascade = Self {
            doc,
            raw: raw.to_string(),
        };
        cascade.validate()?;
        Ok(cascade)
    }

    /// Parse a JSON document
    pub fn from_json(raw: &str) -> Result<Self> {
        let doc: CascadeDoc = serde_json::from_str(raw).context("Failed to parse cascade JSON")?;
        let cascade = Self {
            doc,
            raw: raw.to_string(),
        };
        cascade.validate()?;
        Ok(cascade)
    }

    /// Build an in-memory single-cell cascade (SQL UDF path)
    ///
    /// The raw text is the canonical JSON of the generated document so
    /// replay still works for UDF-minted sessions.
    pub fn single_cell(cascade_id: &str, instructions: &str) -> Self {
        let doc = CascadeDoc {
            cascade_id: cascade_id.to_string(),
            cells: vec![super::definition::CellSpec {
                name: "apply".to_string(),
                instructions: Some(instructions.to_string()),
                max_turns: 1,
                ..Default::default()
            }],
            ..Default::default()
        };
        let raw = serde_json::to_string_pretty(&doc).unwrap_or_default();
        Self { doc, raw }
    }

    /// Structural validation applied after parse
    fn validate(&self) -> Result<()> {
        if self.doc.cascade_id.is_empty() {
            bail!("Cascade is missing cascade_id");
        }
        if self.doc.cells.is_empty() {
            bail!("Cascade '{}' declares no cells", self.doc.cascade_id);
        }

        let mut seen = std::collections::HashSet::new();
        for cell in &self.doc.cells {
            if cell.name.is_empty() {
                bail!("Cascade '{}' has a cell with no name", self.doc.cascade_id);
            }
            if !seen.insert(cell.name.as_str()) {
                bail!("Cascade '{}' has duplicate cell name '{}'", self.doc.cascade_id, cell.name);
            }
            if !cell.mode_is_unambiguous() {
                bail!(
                    "Cell '{}' must declare exactly one of instructions, tool, for_each_row",
                    cell.name
                );
            }
            if let TraitSelection::Sentinel(s) = &cell.traits {
                if s != "manifest" {
                    bail!("Cell '{}' traits must be a list or the string \"manifest\"", cell.name);
                }
            }
            if let Some(handoff) = &cell.handoff {
                if !self.doc.cells.iter().any(|c| &c.name == handoff) {
                    bail!("Cell '{}' hands off to unknown cell '{}'", cell.name, handoff);
                }
            }
        }
        Ok(())
    }

    /// Find a cell by name
    pub fn cell(&self, name: &str) -> Option<&super::definition::CellSpec> {
        self.doc.cells.iter().find(|c| c.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_is_verbatim() {
        let raw = "cascade_id: demo\ncells:\n  - name: only\n    instructions: \"hi\"\n";
        let cascade = Cascade::from_yaml(raw).unwrap();
        assert_eq!(cascade.raw, raw);
        assert_eq!(cascade.doc.cascade_id, "demo");
    }

    #[test]
    fn test_duplicate_cell_names_rejected() {
        let raw = "cascade_id: demo\ncells:\n  - name: a\n    instructions: x\n  - name: a\n    instructions: y\n";
        assert!(Cascade::from_yaml(raw).is_err());
    }

    #[test]
    fn test_empty_cells_rejected() {
        assert!(Cascade::from_yaml("cascade_id: demo\ncells: []\n").is_err());
    }

    #[test]
    fn test_bad_trait_sentinel_rejected() {
        let raw = "cascade_id: demo\ncells:\n  - name: a\n    instructions: x\n    traits: \"everything\"\n";
        assert!(Cascade::from_yaml(raw).is_err());
    }

    #[test]
    fn test_unknown_handoff_rejected() {
        let raw = "cascade_id: demo\ncells:\n  - name: a\n    instructions: x\n    handoff: nowhere\n";
        assert!(Cascade::from_yaml(raw).is_err());
    }

    #[test]
    fn test_json_load() {
        let raw = r#"{"cascade_id": "j", "cells": [{"name": "one", "instructions": "go"}]}"#;
        let cascade = Cascade::from_json(raw).unwrap();
        assert_eq!(cascade.doc.cascade_id, "j");
        assert_eq!(cascade.raw, raw);
    }

    #[test]
    fn test_single_cell_replayable() {
        let cascade = Cascade::single_cell("udf-inline", "Classify: {{input.value}}");
        assert_eq!(cascade.doc.cells.len(), 1);
        assert_eq!(cascade.doc.cells[0].max_turns, 1);
        // The raw form parses back to the same structure
        let replayed = Cascade::from_json(&cascade.raw).unwrap();
        assert_eq!(replayed.doc.cascade_id, "udf-inline");
    }
}
