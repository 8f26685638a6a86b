use crate::config::Config;
use crate::processor::{SkillSet, current_prompt_version};
use crate::scheduler::{ScheduleStatus, Scheduler};
use crate::watcher::{SessionWatcher, WatchEvent, WatcherStatus};
use crate::worker::{WorkerContext, WorkerPool};
use crate::{Error, Result};
use chrono::Utc;
use mnemon_store::{QueueStats, Store, StoreStats};
use mnemon_types::{Job, JobKind};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DaemonStatus {
    pub watcher: WatcherStatus,
    pub queue: QueueStats,
    pub store: StoreStats,
    pub schedules: Vec<ScheduleStatus>,
}

/// Top-level assembly of the ingestion pipeline. Owns every collaborator
/// (store, watcher, worker pool, scheduler) explicitly; constructing one is
/// the only way state is shared.
pub struct Daemon {
    ctx: Arc<WorkerContext>,
    watcher: SessionWatcher,
    workers: Option<WorkerPool>,
    scheduler: Scheduler,
}

impl Daemon {
    /// Bring the pipeline up: skill discovery (fatal if a required skill is
    /// missing), store open, stale-claim recovery, then watcher, workers and
    /// scheduler.
    pub fn start(config: Config) -> Result<Self> {
        let skills = SkillSet::discover(&config.agent)?;

        let data_dir = config.resolve_data_dir()?;
        std::fs::create_dir_all(&data_dir)?;
        let store = Arc::new(Store::open(&config.db_path()?, &data_dir)?);

        let reclaimed = store.reclaim_stale(
            Duration::from_secs(config.queue.stale_claim_secs),
            Utc::now(),
        )?;
        if reclaimed > 0 {
            tracing::info!(count = reclaimed, "reclaimed stale running jobs");
        }

        let embedder: Arc<dyn mnemon_embed::EmbeddingProvider> =
            Arc::from(mnemon_embed::build_provider(&config.embedding));

        let watch_dirs: Vec<PathBuf> = config
            .watch_dirs
            .iter()
            .map(|dir| crate::config::expand_tilde(&dir.to_string_lossy()))
            .collect();
        if watch_dirs.is_empty() {
            return Err(Error::Config(
                "no watch_dirs configured; nothing to ingest".to_string(),
            ));
        }

        let ctx = Arc::new(WorkerContext {
            store: Arc::clone(&store),
            config: config.clone(),
            embedder,
            skills,
            prompt_version: current_prompt_version(),
        });

        let watcher = SessionWatcher::start(watch_dirs, (&config.watcher).into())?;
        let workers = WorkerPool::start(Arc::clone(&ctx), config.worker.effective_count())?;
        let scheduler = Scheduler::start(Arc::clone(&ctx), &config.schedules)?;

        tracing::info!(
            workers = config.worker.effective_count(),
            prompt_version = %ctx.prompt_version,
            "daemon started"
        );

        Ok(Self {
            ctx,
            watcher,
            workers: Some(workers),
            scheduler,
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.ctx.store
    }

    /// Drain watcher events for up to `budget`, wiring `ready` files into
    /// `initial` jobs. Duplicate deliveries are cheap: the queue is
    /// deduplicated here and node IDs deduplicate downstream.
    pub fn pump_events(&self, budget: Duration) -> Result<()> {
        let deadline = std::time::Instant::now() + budget;

        while let Some(event) = self
            .watcher
            .next_event(deadline.saturating_duration_since(std::time::Instant::now()))
        {
            match event {
                WatchEvent::SessionReady(path) => {
                    let session_path = path.to_string_lossy().to_string();
                    if self
                        .ctx
                        .store
                        .has_existing_job(&session_path, JobKind::Initial)?
                    {
                        tracing::debug!(session = %session_path, "initial job already queued");
                        continue;
                    }
                    let job = Job::initial(&session_path, Utc::now());
                    self.ctx.store.enqueue(&job)?;
                    tracing::info!(session = %session_path, job = %job.id, "session ready, initial job enqueued");
                }
                WatchEvent::SessionIdle(path) => {
                    tracing::debug!(session = %path.display(), "session idle");
                }
                WatchEvent::Error(message) => {
                    tracing::warn!(error = %message, "watcher error");
                }
            }

            if std::time::Instant::now() >= deadline {
                break;
            }
        }

        Ok(())
    }

    /// Foreground loop until the shutdown flag flips.
    pub fn run(mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        while !shutdown.load(Ordering::Relaxed) {
            self.pump_events(Duration::from_millis(500))?;
        }
        tracing::info!("shutdown requested, draining");
        self.shutdown();
        Ok(())
    }

    pub fn status(&self) -> Result<DaemonStatus> {
        Ok(DaemonStatus {
            watcher: self.watcher.status(),
            queue: self.ctx.store.queue_stats()?,
            store: self.ctx.store.stats()?,
            schedules: self.scheduler.statuses(),
        })
    }

    /// Orderly stop: scheduler first (no new recurring work), then the
    /// watcher, then workers (finish or time out on their own deadlines).
    pub fn shutdown(&mut self) {
        self.scheduler.stop();
        self.watcher.stop();
        if let Some(workers) = self.workers.take() {
            workers.stop();
        }
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}
