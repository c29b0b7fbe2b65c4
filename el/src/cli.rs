//! CLI argument parsing for echolog

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "el")]
#[command(author, version, about = "Unified event log store for RVBBIT", long_about = None)]
pub struct Cli {
    /// Path to the log store database
    #[arg(short, long)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List cascade sessions, newest first
    Sessions {
        /// Maximum sessions to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Print all log rows for a session in write order
    Tail {
        /// Session ID
        #[arg(required = true)]
        session_id: String,

        /// Emit full rows as JSON lines instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// Cost roll-up grouped by caller identity
    Costs,

    /// Show the latest durable value for a state key
    State {
        /// Session ID
        #[arg(required = true)]
        session_id: String,

        /// State key
        #[arg(required = true)]
        key: String,
    },
}
