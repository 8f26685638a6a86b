mod clustering;
mod config;
mod daemon;
mod discovery;
mod error;
mod processor;
mod scheduler;
mod watcher;
mod worker;

pub use clustering::kmeans;
pub use config::{
    AgentSection, Config, QueueConfig, ScheduleEntry, ScheduledKind, SegmenterSection,
    WatcherConfig, WorkerConfig, expand_tilde, resolve_config_path, resolve_data_dir,
};
pub use daemon::{Daemon, DaemonStatus};
pub use discovery::run_connection_discovery;
pub use error::{Error, Result};
pub use processor::{
    ANALYSIS_PROMPT_TEMPLATE, AgentRequest, AgentResult, SkillSet, build_analysis_prompt,
    current_prompt_version, invoke_agent,
};
pub use scheduler::{
    ScheduleStatus, Scheduler, backfill_embeddings_once, run_scheduled_kind, validate_schedules,
};
pub use watcher::{SessionWatcher, WatchEvent, WatcherSettings, WatcherStatus};
pub use worker::{WorkerContext, WorkerPool, run_one_job};
