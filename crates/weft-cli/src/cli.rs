//! CLI command definitions using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// weft - at-most-once execution of side-effecting actions
#[derive(Parser, Debug)]
#[command(name = "weft")]
#[command(version)]
#[command(about = "Idempotent execution of side-effecting task actions")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the idempotency key of an action
    Key {
        /// Task id
        task_id: String,

        /// Action type (e.g. send_email)
        action_type: String,

        /// Attempt number; a new number is a deliberately new instance
        #[arg(short, long, default_value_t = 0)]
        attempt: u32,
    },

    /// Race concurrent workers on one email, then run a batch twice
    Demo {
        /// Number of concurrent workers
        #[arg(short, long, default_value_t = 8)]
        workers: usize,

        /// TOML config file (defaults are used when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// List the execution records of a task as JSON
    Inspect {
        /// SQLite database path
        #[arg(long)]
        db: PathBuf,

        /// Task id
        #[arg(short, long)]
        task: String,
    },

    /// Remove the execution records of a task
    Clear {
        /// SQLite database path
        #[arg(long)]
        db: PathBuf,

        /// Task id
        #[arg(short, long)]
        task: String,
    },
}
