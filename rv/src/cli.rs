//! CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "rv")]
#[command(author, version, about = "Declarative cascade orchestration runtime", long_about = None)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level override (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a cascade file to completion
    Run {
        /// Cascade file (YAML or JSON)
        #[arg(required = true)]
        cascade: PathBuf,

        /// Input values as key=value pairs
        #[arg(short, long)]
        input: Vec<String>,

        /// Explicit session id (generated when omitted)
        #[arg(long)]
        session_id: Option<String>,

        /// Print the full session result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Rewrite an RVBBIT SQL statement and print the result
    Rewrite {
        /// The statement
        #[arg(required = true)]
        statement: String,
    },

    /// Load and validate a cascade file
    Validate {
        /// Cascade file (YAML or JSON)
        #[arg(required = true)]
        cascade: PathBuf,
    },
}

/// Parse `key=value` input pairs into a JSON object
pub fn parse_inputs(pairs: &[String]) -> eyre::Result<serde_json::Value> {
    let mut map = serde_json::Map::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            eyre::bail!("Input '{}' is not key=value", pair);
        };
        // Values that parse as JSON keep their type; the rest are strings
        let parsed = serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        map.insert(key.to_string(), parsed);
    }
    Ok(serde_json::Value::Object(map))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inputs_types() {
        let inputs = parse_inputs(&[
            "text=hello world".to_string(),
            "count=3".to_string(),
            "flag=true".to_string(),
        ])
        .unwrap();
        assert_eq!(inputs["text"], "hello world");
        assert_eq!(inputs["count"], 3);
        assert_eq!(inputs["flag"], true);
    }

    #[test]
    fn test_parse_inputs_rejects_bare_words() {
        assert!(parse_inputs(&["novalue".to_string()]).is_err());
    }

    #[test]
    fn test_parse_inputs_empty() {
        assert_eq!(parse_inputs(&[]).unwrap(), serde_json::json!({}));
    }
}
