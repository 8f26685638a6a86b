use crate::clustering::kmeans;
use crate::config::{ScheduleEntry, ScheduledKind};
use crate::worker::{WorkerContext, write_embedding};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;
use mnemon_engine::EMBED_FORMAT_MARKER;
use mnemon_types::{Job, JobKind};
use serde_json::json;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const BACKFILL_BATCH: usize = 50;
const DISCOVERY_BATCH: usize = 50;
const CLUSTERING_POPULATION: usize = 500;

#[derive(Debug, Clone)]
pub struct ScheduleStatus {
    pub kind: ScheduledKind,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_result: Option<String>,
}

/// Validate cron expressions up front; a bad expression is a configuration
/// error at load time, not a silent dead schedule.
pub fn validate_schedules(entries: &[ScheduleEntry]) -> Result<Vec<(ScheduledKind, Schedule)>> {
    let mut validated = Vec::new();
    for entry in entries {
        if !entry.enabled {
            continue;
        }
        let schedule = Schedule::from_str(&entry.cron).map_err(|err| {
            Error::Config(format!(
                "invalid cron '{}' for {}: {}",
                entry.cron,
                entry.kind.as_str(),
                err
            ))
        })?;
        validated.push((entry.kind, schedule));
    }
    Ok(validated)
}

/// Cron-driven generator of recurring work. Ticks run serially on the
/// scheduler thread, so a kind can never overlap itself; fires missed while
/// a tick runs are skipped, not queued up.
pub struct Scheduler {
    shutdown: Arc<AtomicBool>,
    statuses: Arc<Mutex<HashMap<ScheduledKind, ScheduleStatus>>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl Scheduler {
    pub fn start(ctx: Arc<WorkerContext>, entries: &[ScheduleEntry]) -> Result<Self> {
        let schedules = validate_schedules(entries)?;
        let shutdown = Arc::new(AtomicBool::new(false));

        let now = Utc::now();
        let mut next_fires: Vec<(ScheduledKind, Schedule, Option<DateTime<Utc>>)> = schedules
            .into_iter()
            .map(|(kind, schedule)| {
                let next = schedule.after(&now).next();
                (kind, schedule, next)
            })
            .collect();

        let statuses: Arc<Mutex<HashMap<ScheduledKind, ScheduleStatus>>> = Arc::new(Mutex::new(
            next_fires
                .iter()
                .map(|(kind, _, next)| {
                    (
                        *kind,
                        ScheduleStatus {
                            kind: *kind,
                            next_run: *next,
                            last_run: None,
                            last_result: None,
                        },
                    )
                })
                .collect(),
        ));

        let thread_shutdown = Arc::clone(&shutdown);
        let thread_statuses = Arc::clone(&statuses);
        let handle = std::thread::Builder::new()
            .name("scheduler".to_string())
            .spawn(move || {
                while !thread_shutdown.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_millis(500));
                    let now = Utc::now();

                    for (kind, schedule, next_fire) in next_fires.iter_mut() {
                        let due = next_fire.map(|next| next <= now).unwrap_or(false);
                        if !due {
                            continue;
                        }
                        if thread_shutdown.load(Ordering::Relaxed) {
                            break;
                        }

                        let result = run_scheduled_kind(&ctx, *kind);
                        let after = Utc::now();
                        *next_fire = schedule.after(&after).next();

                        let mut statuses =
                            thread_statuses.lock().unwrap_or_else(|p| p.into_inner());
                        if let Some(status) = statuses.get_mut(kind) {
                            status.last_run = Some(after);
                            status.next_run = *next_fire;
                            status.last_result = Some(match &result {
                                Ok(summary) => summary.clone(),
                                Err(err) => format!("error: {}", err),
                            });
                        }
                        if let Err(err) = result {
                            tracing::warn!(kind = kind.as_str(), error = %err, "scheduled run failed");
                        }
                    }
                }
            })?;

        Ok(Self {
            shutdown,
            statuses,
            handle: Some(handle),
        })
    }

    pub fn statuses(&self) -> Vec<ScheduleStatus> {
        let statuses = self.statuses.lock().unwrap_or_else(|p| p.into_inner());
        let mut list: Vec<ScheduleStatus> = statuses.values().cloned().collect();
        list.sort_by_key(|s| s.kind.as_str());
        list
    }

    /// Cancel pending fires; in-flight tick finishes on its own.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Execute one scheduled kind immediately. Also used by the CLI for manual
/// runs (`rebuild-embeddings`).
pub fn run_scheduled_kind(ctx: &WorkerContext, kind: ScheduledKind) -> Result<String> {
    match kind {
        ScheduledKind::Reanalysis => run_reanalysis(ctx),
        ScheduledKind::ConnectionDiscovery => run_discovery_enqueue(ctx),
        ScheduledKind::PatternAggregation => {
            ctx.store.aggregate_patterns(Utc::now())?;
            Ok("aggregates recomputed".to_string())
        }
        ScheduledKind::Clustering => run_clustering(ctx),
        ScheduledKind::BackfillEmbeddings => run_backfill(ctx),
    }
}

/// Enqueue one reanalysis job per node whose prompt hash is stale.
fn run_reanalysis(ctx: &WorkerContext) -> Result<String> {
    let stale = ctx.store.nodes_with_stale_prompt(&ctx.prompt_version)?;
    let now = Utc::now();
    let mut enqueued = 0usize;

    for node_id in stale {
        if ctx
            .store
            .has_existing_node_job(&node_id, JobKind::Reanalysis)?
        {
            continue;
        }
        let Some(row) = ctx.store.get_node(&node_id)? else {
            continue;
        };

        let mut job = Job::reanalysis(
            &node_id,
            json!({
                "segmentStart": row.segment_start,
                "segmentEnd": row.segment_end,
            }),
            now,
        );
        job.session_path = Some(row.session_file);
        ctx.store.enqueue(&job)?;
        enqueued += 1;
    }

    Ok(format!("{} reanalysis jobs enqueued", enqueued))
}

fn run_discovery_enqueue(ctx: &WorkerContext) -> Result<String> {
    let candidates = ctx.store.nodes_without_semantic_edges(DISCOVERY_BATCH)?;
    let now = Utc::now();
    let mut enqueued = 0usize;

    for node_id in candidates {
        if ctx
            .store
            .has_existing_node_job(&node_id, JobKind::ConnectionDiscovery)?
        {
            continue;
        }
        ctx.store
            .enqueue(&Job::connection_discovery(&node_id, now))?;
        enqueued += 1;
    }

    Ok(format!("{} discovery jobs enqueued", enqueued))
}

fn run_clustering(ctx: &WorkerContext) -> Result<String> {
    let records: Vec<(String, Vec<f32>)> = ctx
        .store
        .recent_embeddings(CLUSTERING_POPULATION)?
        .into_iter()
        .map(|record| (record.node_id, record.vector))
        .collect();

    if records.len() < 4 {
        return Ok("too few embeddings to cluster".to_string());
    }

    let k = ((records.len() as f64 / 2.0).sqrt() as usize).clamp(2, 16);
    let clusters = kmeans(&records, k, 10);
    ctx.store.replace_clusters(&clusters, Utc::now())?;

    Ok(format!("{} clusters over {} nodes", clusters.len(), records.len()))
}

fn run_backfill(ctx: &WorkerContext) -> Result<String> {
    let (succeeded, failed) = backfill_embeddings_once(ctx)?;
    Ok(format!("embeddings backfilled: {} ok, {} failed", succeeded, failed))
}

/// Generate missing/outdated embeddings for one batch, isolating per-node
/// failures so one bad node cannot stall the backfill. Returns
/// `(succeeded, failed)` counts; both zero means nothing is pending.
pub fn backfill_embeddings_once(ctx: &WorkerContext) -> Result<(usize, usize)> {
    let model = ctx.embedder.model_name().to_string();
    let pending = ctx
        .store
        .nodes_needing_embeddings(&model, EMBED_FORMAT_MARKER, BACKFILL_BATCH)?;

    let mut succeeded = 0usize;
    let mut failed = 0usize;
    for node_id in pending {
        let result = ctx
            .store
            .get_node_document(&node_id)
            .map_err(Error::from)
            .and_then(|node| {
                node.ok_or_else(|| {
                    Error::InvalidOperation(format!("node {} has a row but no document", node_id))
                })
            })
            .and_then(|node| write_embedding(ctx, &node));

        match result {
            Ok(()) => succeeded += 1,
            Err(err) => {
                failed += 1;
                tracing::warn!(node = %node_id, error = %err, "embedding backfill failed for node");
            }
        }
    }

    Ok((succeeded, failed))
}
