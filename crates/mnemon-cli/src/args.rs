use clap::{Parser, Subcommand, ValueEnum};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lowercase")]
pub enum JobStatusArg {
    Pending,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for JobStatusArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatusArg::Pending => write!(f, "pending"),
            JobStatusArg::Running => write!(f, "running"),
            JobStatusArg::Completed => write!(f, "completed"),
            JobStatusArg::Failed => write!(f, "failed"),
        }
    }
}

impl From<JobStatusArg> for mnemon_types::JobStatus {
    fn from(arg: JobStatusArg) -> Self {
        match arg {
            JobStatusArg::Pending => mnemon_types::JobStatus::Pending,
            JobStatusArg::Running => mnemon_types::JobStatus::Running,
            JobStatusArg::Completed => mnemon_types::JobStatus::Completed,
            JobStatusArg::Failed => mnemon_types::JobStatus::Failed,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "mnemon", version, about = "Knowledge graphs distilled from agent session logs")]
pub struct Cli {
    /// Config file path (default: MNEMON_CONFIG or <data-dir>/config.toml)
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the ingestion daemon in the foreground
    Start,

    /// Signal a running daemon to shut down
    Stop,

    /// Show watcher, queue and store counters
    Status,

    /// List jobs in the queue
    Queue {
        #[arg(long, default_value_t = JobStatusArg::Pending)]
        status: JobStatusArg,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Clear node rows and replay every document back into the index
    RebuildIndex,

    /// Regenerate missing or outdated embeddings
    RebuildEmbeddings,

    /// Check environment and report failure counts by category
    Health,
}
