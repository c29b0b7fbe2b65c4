use clap::Parser;
use colored::*;
use eyre::{Context, Result};

use echolog::cli::{Cli, Command};
use echolog::{LogStore, SqliteStore};

fn setup_logging() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Warn)
        .init();
    Ok(())
}

fn main() -> Result<()> {
    setup_logging().context("Failed to setup logging")?;

    let cli = Cli::parse();
    let db_path = cli.db.unwrap_or_else(echolog::default_store_path);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create store directory")?;
    }
    let store = SqliteStore::open(&db_path).context("Failed to open log store")?;

    match cli.command {
        Command::Sessions { limit } => {
            let sessions = store.sessions()?;
            for session in sessions.iter().take(limit) {
                let parent = session.parent_session_id.as_deref().unwrap_or("-");
                println!(
                    "{}  {}  depth={} parent={} caller={}",
                    session.session_id.cyan(),
                    session.cascade_id.yellow(),
                    session.depth,
                    parent.dimmed(),
                    session.caller_id.as_deref().unwrap_or("-"),
                );
            }
        }
        Command::Tail { session_id, json } => {
            let rows = store.rows_for_session(&session_id)?;
            if rows.is_empty() {
                eprintln!("{} no rows for session {}", "!".yellow(), session_id);
            }
            for row in rows {
                if json {
                    println!("{}", serde_json::to_string(&row)?);
                } else {
                    let cell = row.cell_name.as_deref().unwrap_or("-");
                    let cost = row.cost.map(|c| format!("${:.4}", c)).unwrap_or_default();
                    println!(
                        "{}  {:<20} {:<16} {}",
                        row.timestamp_iso.dimmed(),
                        row.node_type.as_str().green(),
                        cell,
                        cost
                    );
                }
            }
        }
        Command::Costs => {
            let costs = store.caller_costs()?;
            for line in costs {
                println!(
                    "{:<32} ${:<10.4} {:>10} tokens  {:>4} sessions",
                    line.caller_id.cyan(),
                    line.total_cost,
                    line.total_tokens,
                    line.session_count
                );
            }
        }
        Command::State { session_id, key } => match store.latest_state(&session_id, &key)? {
            Some(row) => {
                println!("{} ({})", row.value, row.value_type.dimmed());
            }
            None => {
                eprintln!("{} no state for key '{}' in session {}", "!".yellow(), key, session_id);
                std::process::exit(1);
            }
        },
    }

    Ok(())
}
