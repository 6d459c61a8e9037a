mod cli;
mod demo;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use weft_core::app::{ExecutorBuilder, WeftConfig};
use weft_core::domain::{TaskId, generate_idempotency_key};
use weft_core::impls::SqliteRecordStore;
use weft_core::ports::SystemClock;

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Key {
            task_id,
            action_type,
            attempt,
        } => {
            let key = generate_idempotency_key(&task_id, &action_type, attempt)?;
            println!("{key}");
        }
        Commands::Demo { workers, config } => {
            let config = match config {
                Some(path) => WeftConfig::load(&path)
                    .with_context(|| format!("loading config {}", path.display()))?,
                None => WeftConfig::default(),
            };
            let executor = ExecutorBuilder::from_config(&config, Arc::new(SystemClock))?;
            let summary = demo::run(Arc::new(executor), workers.max(1)).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Inspect { db, task } => {
            let store = SqliteRecordStore::open(&db)
                .with_context(|| format!("opening {}", db.display()))?;
            let executor = ExecutorBuilder::new(Arc::new(store)).build()?;
            let records = executor.records(&TaskId::new(task)).await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        Commands::Clear { db, task } => {
            let store = SqliteRecordStore::open(&db)
                .with_context(|| format!("opening {}", db.display()))?;
            let executor = ExecutorBuilder::new(Arc::new(store)).build()?;
            let removed = executor.clear_cache(&TaskId::new(task)).await?;
            println!("removed {removed} record(s)");
        }
    }
    Ok(())
}

/// Initialize tracing subscriber with environment filter.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
