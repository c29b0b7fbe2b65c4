//! RVBBIT - cascade orchestration runtime
//!
//! CLI entry point: run cascades, dry-run the SQL rewriter, validate
//! documents.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use tracing::info;

use rvbbit::cascade::Cascade;
use rvbbit::cli::{Cli, Command, parse_inputs};
use rvbbit::config::Config;
use rvbbit::identity::{Identity, IdentityContext};
use rvbbit::llm::create_client;
use rvbbit::runner::{CascadeRunner, RunOptions};
use rvbbit::session::SessionStore;
use rvbbit::sql::Rewriter;

use echolog::{LogStore, SqliteStore};

fn setup_logging(cli_log_level: Option<&str>) -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rvbbit")
        .join("logs");
    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let level = match cli_log_level.map(|s| s.to_uppercase()) {
        Some(s) => match s.as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            other => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", other);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(log_dir.join("rvbbit.log")).context("Failed to create log file")?;
    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.log_level.as_deref())?;
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Run {
            cascade,
            input,
            session_id,
            json,
        } => {
            let inputs = parse_inputs(&input)?;
            let cascade = Cascade::from_path(&cascade)?;

            let db_path = if config.storage.log_db.is_empty() {
                echolog::default_store_path()
            } else {
                PathBuf::from(&config.storage.log_db)
            };
            if let Some(parent) = db_path.parent() {
                fs::create_dir_all(parent).context("Failed to create store directory")?;
            }
            let log = Arc::new(SqliteStore::open(&db_path)?) as Arc<dyn LogStore>;
            let sessions = SessionStore::new(log);

            let llm = create_client(&config.llm).map_err(|e| eyre::eyre!("LLM client: {}", e))?;
            let runner = CascadeRunner::new(llm, sessions)
                .with_artifact_dir(config.storage.artifact_dir.clone())
                .with_call_timeout(std::time::Duration::from_millis(config.llm.timeout_ms));

            // The CLI is a top-level entry point: mint and set identity
            let identity = Identity::mint(
                "cli",
                serde_json::json!({
                    "cascade": cascade.doc.cascade_id,
                    "inputs": inputs,
                }),
            );
            IdentityContext::set(identity.clone());
            info!(caller_id = %identity.caller_id, cascade_id = %cascade.doc.cascade_id, "rv run starting");

            let result = runner
                .run(
                    &cascade,
                    inputs,
                    RunOptions {
                        session_id,
                        identity: Some(identity),
                        ..Default::default()
                    },
                )
                .await?;

            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "session_id": result.session_id,
                        "status": result.status,
                        "output": result.output,
                        "cost_total": result.cost_total,
                        "tokens_total": result.tokens_total,
                        "errors": result.errors,
                    })
                );
            } else {
                match &result.output {
                    serde_json::Value::String(s) => println!("{}", s),
                    other => println!("{}", other),
                }
            }

            if !result.succeeded() {
                eprintln!(
                    "{} cascade failed ({} error{})",
                    "✗".red(),
                    result.errors.len(),
                    if result.errors.len() == 1 { "" } else { "s" }
                );
                for error in &result.errors {
                    eprintln!("  {} [{}] {}", error.cell_name.yellow(), error.error_kind, error.message);
                }
                std::process::exit(1);
            }
            eprintln!(
                "{} session {} (${:.4}, {} tokens)",
                "✓".green(),
                result.session_id.cyan(),
                result.cost_total,
                result.tokens_total
            );
        }

        Command::Rewrite { statement } => {
            let rewriter = Rewriter::new();
            let output = rewriter.rewrite(&statement)?;
            if output.flags.background {
                println!("{} BACKGROUND", "flag:".dimmed());
            }
            if let Some(prompt) = &output.flags.analyze {
                println!("{} ANALYZE {:?}", "flag:".dimmed(), prompt);
            }
            match (&output.sql, &output.map_plan) {
                (Some(sql), _) => println!("{}", sql),
                (None, Some(plan)) => {
                    println!("{} MAP PARALLEL interception", "plan:".dimmed());
                    println!("  cascade:     {}", plan.cascade_path);
                    println!("  workers:     {}", plan.parallelism.unwrap_or(1));
                    println!("  distinct:    {}", plan.distinct);
                    println!("  input query: {}", plan.input_query);
                }
                (None, None) => {}
            }
        }

        Command::Validate { cascade } => {
            let cascade = Cascade::from_path(&cascade)?;
            println!(
                "{} cascade '{}' with {} cell{}",
                "✓".green(),
                cascade.doc.cascade_id.cyan(),
                cascade.doc.cells.len(),
                if cascade.doc.cells.len() == 1 { "" } else { "s" }
            );
            for cell in &cascade.doc.cells {
                let mode = match cell.mode() {
                    rvbbit::cascade::CellMode::Model => "model",
                    rvbbit::cascade::CellMode::Tool => "tool",
                    rvbbit::cascade::CellMode::RowMapper => "row-mapper",
                };
                println!("  {} ({})", cell.name, mode.dimmed());
            }
        }
    }

    Ok(())
}
