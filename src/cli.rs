use clap::{Parser, Subcommand};

use crate::review::Category;

/// review-pool: parallel code review with analysis agents
#[derive(Parser, Debug, Clone)]
#[command(name = "review-pool", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,

    /// Path to config file (default: .review-pool.toml if present)
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Analysis executable to invoke (default: claude)
    #[arg(long, global = true)]
    pub agent_binary: Option<String>,

    /// Model for the analysis executable to use
    #[arg(long, global = true)]
    pub agent_model: Option<String>,

    /// Maximum number of reviews running at once
    #[arg(long, global = true)]
    pub max_concurrent: Option<usize>,

    /// Turn budget passed to the analysis executable
    #[arg(long, global = true)]
    pub max_turns: Option<u32>,

    /// Seconds to wait for the process to confirm it started
    #[arg(long, global = true)]
    pub spawn_timeout: Option<u64>,

    /// Seconds to wait for the first output
    #[arg(long, global = true)]
    pub silence_timeout: Option<u64>,

    /// Seconds without new output before a review is considered stalled
    #[arg(long, global = true)]
    pub stall_timeout: Option<u64>,

    /// Review record file
    #[arg(long, global = true)]
    pub store_path: Option<String>,

    /// Directory with instruction template overrides
    #[arg(long, global = true)]
    pub prompt_dir: Option<String>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum CliCommand {
    /// Review a task's changes and wait for the result
    Run {
        /// Task identifier the reviews are recorded under
        #[arg(long)]
        task_id: String,

        /// What the change is supposed to do
        #[arg(long)]
        description: String,

        /// Working directory to review (default: current directory)
        #[arg(long)]
        dir: Option<String>,

        /// Changed file to focus on (repeatable)
        #[arg(long = "changed-file")]
        changed_files: Vec<String>,

        /// Review category (repeatable, default: all)
        #[arg(long = "category", value_enum)]
        categories: Vec<Category>,
    },

    /// Print the stored review records of a task
    Status {
        /// Task identifier
        #[arg(long)]
        task_id: String,
    },
}
