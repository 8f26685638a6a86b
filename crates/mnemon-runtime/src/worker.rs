use crate::config::Config;
use crate::discovery::run_connection_discovery;
use crate::processor::{AgentRequest, SkillSet, build_analysis_prompt, invoke_agent};
use crate::{Error, Result};
use chrono::Utc;
use mnemon_embed::EmbeddingProvider;
use mnemon_engine::{
    AnalysisPayload, BoundaryKind, Segmentation, extract_delight, extract_friction,
    extract_segments,
};
use mnemon_store::{EmbeddingRecord, Store, retry_delay};
use mnemon_types::{
    Classification, Edge, EdgeCreator, EdgeKind, Job, JobKind, Node, NodeContent, NodeMetadata,
    NodeSource, ParsedSession, UNRESOLVED_TARGET, classify_error, deterministic_node_id,
    read_session_file,
};
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Shared collaborators every worker thread uses. Owned by the daemon and
/// passed in explicitly; there is no global state.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<Store>,
    pub config: Config,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub skills: SkillSet,
    pub prompt_version: String,
}

pub struct WorkerPool {
    shutdown: Arc<AtomicBool>,
    handles: Vec<std::thread::JoinHandle<()>>,
}

const CLAIM_POLL: Duration = Duration::from_millis(500);

impl WorkerPool {
    pub fn start(ctx: Arc<WorkerContext>, count: usize) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(count);

        for index in 0..count {
            let worker_ctx = Arc::clone(&ctx);
            let worker_shutdown = Arc::clone(&shutdown);
            let worker_id = format!("worker-{}", index + 1);
            let handle = std::thread::Builder::new()
                .name(worker_id.clone())
                .spawn(move || {
                    while !worker_shutdown.load(Ordering::Relaxed) {
                        match run_one_job(&worker_ctx, &worker_id) {
                            Ok(true) => {}
                            Ok(false) => std::thread::sleep(CLAIM_POLL),
                            Err(err) => {
                                tracing::error!(worker = %worker_id, error = %err, "job loop error");
                                std::thread::sleep(CLAIM_POLL);
                            }
                        }
                    }
                })?;
            handles.push(handle);
        }

        Ok(Self { shutdown, handles })
    }

    /// Stop claiming and wait for in-flight jobs to finish (or hit their own
    /// deadlines).
    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Claim and fully process at most one job. Returns whether a job was
/// claimed. Failures are classified here: transient errors go back to
/// pending with backoff, permanent ones mark the job failed.
pub fn run_one_job(ctx: &WorkerContext, worker_id: &str) -> Result<bool> {
    let now = Utc::now();
    let Some(job) = ctx.store.claim(worker_id, now)? else {
        return Ok(false);
    };

    tracing::info!(job = %job.id, kind = job.kind.as_str(), "processing job");

    match execute(ctx, &job) {
        Ok(()) => {
            ctx.store.complete(&job.id, Utc::now())?;
            tracing::info!(job = %job.id, "job completed");
        }
        Err(err) => {
            let classified = classify_error(&error_chain(&err));
            let should_retry = job.retry_count < classified.recommended_retries();
            let delay = retry_delay(
                job.retry_count,
                Duration::from_secs(ctx.config.queue.base_delay_secs),
                Duration::from_secs(ctx.config.queue.max_delay_secs),
                &job.id,
            );
            let status = ctx
                .store
                .fail(&job.id, &classified, should_retry, delay, Utc::now())?;
            tracing::warn!(
                job = %job.id,
                category = classified.category.as_str(),
                reason = %classified.reason,
                status = status.as_str(),
                "job failed"
            );
        }
    }

    Ok(true)
}

/// Flatten an error and its source chain into one classifiable string.
fn error_chain(err: &Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

fn execute(ctx: &WorkerContext, job: &Job) -> Result<()> {
    match job.kind {
        JobKind::Initial | JobKind::Reanalysis => analyze_session(ctx, job),
        JobKind::ConnectionDiscovery => {
            let target = job
                .target_node_id
                .as_deref()
                .ok_or_else(|| Error::InvalidOperation("discovery job without target".into()))?;
            run_connection_discovery(ctx, target)
        }
    }
}

fn analyze_session(ctx: &WorkerContext, job: &Job) -> Result<()> {
    let session_path = job
        .session_path
        .clone()
        .ok_or_else(|| Error::InvalidOperation("analysis job without session path".into()))?;
    let path = Path::new(&session_path);

    let parsed = read_session_file(path)?;
    if parsed.entries.is_empty() {
        tracing::debug!(session = %session_path, "empty session, nothing to analyze");
        return Ok(());
    }

    let segmentation = extract_segments(&parsed.entries, &ctx.config.segmenter_config());

    let segment_index = match job.kind {
        JobKind::Initial => {
            let Some(index) = pick_initial_segment(ctx, &session_path, &segmentation, &parsed)
            else {
                tracing::debug!(session = %session_path, "no unanalyzed complete segment");
                return Ok(());
            };
            index
        }
        JobKind::Reanalysis => find_context_segment(job, &segmentation)?,
        JobKind::ConnectionDiscovery => unreachable!("routed in execute"),
    };
    let segment = &segmentation.segments[segment_index];
    let entries = segment.entries(&parsed.entries);

    let file_size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    let request = AgentRequest {
        prompt: build_analysis_prompt(&session_path, entries),
        skills_csv: ctx.skills.csv_for(&ctx.config.agent, file_size),
        workdir: PathBuf::from(&parsed.header.cwd),
    };

    let result = invoke_agent(&ctx.config.agent.bin, &request, ctx.config.worker.job_timeout())?;

    let Some(payload) = result.payload else {
        let stderr_tail: String = result.raw_stderr.chars().take(512).collect();
        return Err(Error::Agent(format!(
            "no node payload in agent output (exit code {:?}): {}",
            result.exit_code, stderr_tail
        )));
    };

    let relationships = payload.relationships.clone();
    let node = build_node(ctx, &session_path, &parsed, &segmentation, segment_index, payload);
    let committed = ctx.store.upsert(&node)?;
    tracing::info!(
        node = %committed.node.node_id,
        version = committed.node.version,
        created = committed.created,
        "node committed"
    );

    link_structural(ctx, &session_path, &parsed, &segmentation, segment_index, &committed.node)?;
    apply_relationships(ctx, &committed.node, &relationships)?;
    write_embedding(ctx, &committed.node)?;

    if ctx.config.worker.enqueue_discovery
        && !ctx
            .store
            .has_existing_node_job(&committed.node.node_id, JobKind::ConnectionDiscovery)?
    {
        let follow_on = Job::connection_discovery(&committed.node.node_id, Utc::now());
        ctx.store.enqueue(&follow_on)?;
    }

    Ok(())
}

/// Latest complete segment not yet in the store. A segment is complete when
/// a later segment exists after it, or when its last entry is older than the
/// configured minimum age.
fn pick_initial_segment(
    ctx: &WorkerContext,
    session_path: &str,
    segmentation: &Segmentation,
    parsed: &ParsedSession,
) -> Option<usize> {
    let now = Utc::now();
    let min_age = chrono::Duration::seconds(ctx.config.worker.min_segment_age_secs as i64);
    let last_index = segmentation.segments.len().checked_sub(1)?;

    for (index, segment) in segmentation.segments.iter().enumerate().rev() {
        if index == last_index {
            let last_entry = &parsed.entries[segment.end_index];
            if now.signed_duration_since(last_entry.timestamp) < min_age {
                continue;
            }
        }

        let node_id = deterministic_node_id(session_path, &segment.start_id, &segment.end_id);
        match ctx.store.node_exists(&node_id) {
            Ok(false) => return Some(index),
            Ok(true) => continue,
            Err(_) => return None,
        }
    }

    None
}

fn find_context_segment(job: &Job, segmentation: &Segmentation) -> Result<usize> {
    let context = job
        .context
        .as_ref()
        .ok_or_else(|| Error::Agent("validation: reanalysis job without segment context".into()))?;
    let start = context.get("segmentStart").and_then(Value::as_str);
    let end = context.get("segmentEnd").and_then(Value::as_str);
    let (Some(start), Some(end)) = (start, end) else {
        return Err(Error::Agent(
            "validation: reanalysis context missing segment span".into(),
        ));
    };

    segmentation
        .segments
        .iter()
        .position(|s| s.start_id == start && s.end_id == end)
        .ok_or_else(|| {
            Error::Agent(format!(
                "validation: segment {}..{} no longer present in session",
                start, end
            ))
        })
}

fn build_node(
    ctx: &WorkerContext,
    session_path: &str,
    parsed: &ParsedSession,
    segmentation: &Segmentation,
    segment_index: usize,
    payload: AnalysisPayload,
) -> Node {
    let segment = &segmentation.segments[segment_index];
    let entries = segment.entries(&parsed.entries);
    let is_tail = segment_index == segmentation.segments.len() - 1;

    let friction = extract_friction(entries, is_tail);
    let delight = extract_delight(entries);

    let mut extra: Map<String, Value> = payload.extra.clone();
    extra.insert(
        "signals".to_string(),
        json!({
            "friction": friction,
            "frictionScore": friction.score(),
            "delight": delight,
            "delightScore": delight.score(),
        }),
    );

    Node {
        node_id: deterministic_node_id(session_path, &segment.start_id, &segment.end_id),
        version: 1,
        source: NodeSource {
            session_file: session_path.to_string(),
            segment_start: segment.start_id.clone(),
            segment_end: segment.end_id.clone(),
            project_path: parsed.header.cwd.clone(),
            computer: parsed.computer().map(String::from),
            timestamp: entries[0].timestamp,
        },
        classification: Classification {
            node_type: payload.node_type,
            outcome: payload.outcome,
            had_clear_goal: payload.had_clear_goal,
            is_new_project: payload.is_new_project,
        },
        content: NodeContent {
            summary: payload.summary,
            decisions: payload.decisions,
            lessons: payload.lessons,
            quirks: payload.quirks,
            tool_errors: payload.tool_errors,
            tags: payload.tags,
            topics: payload.topics,
            files_touched: payload.files_touched,
            tokens_used: payload.tokens_used,
            cost: payload.cost,
            duration_minutes: payload.duration_minutes,
            model: payload.model,
            extra: Value::Object(extra),
        },
        metadata: NodeMetadata {
            prompt_version: ctx.prompt_version.clone(),
            analyzed_at: Utc::now(),
            previous_versions: Vec::new(),
        },
    }
}

fn boundary_edge_kind(opened_by: Option<BoundaryKind>) -> EdgeKind {
    match opened_by {
        Some(BoundaryKind::Resume) => EdgeKind::Resume,
        Some(BoundaryKind::Branch) => EdgeKind::Branch,
        Some(BoundaryKind::TreeJump) => EdgeKind::TreeJump,
        Some(BoundaryKind::Compaction) => EdgeKind::Compaction,
        Some(BoundaryKind::Handoff) => EdgeKind::Handoff,
        None => EdgeKind::Continuation,
    }
}

/// Link the committed node into the graph from session topology: previous
/// segment, abandoned restarts, and fork parents.
fn link_structural(
    ctx: &WorkerContext,
    session_path: &str,
    parsed: &ParsedSession,
    segmentation: &Segmentation,
    segment_index: usize,
    node: &Node,
) -> Result<()> {
    let now = Utc::now();
    let segment = &segmentation.segments[segment_index];

    if segment_index > 0 {
        let prev = &segmentation.segments[segment_index - 1];
        let prev_id = deterministic_node_id(session_path, &prev.start_id, &prev.end_id);

        if let Some(prev_row) = ctx.store.get_node(&prev_id)? {
            let kind = boundary_edge_kind(segment.opened_by);
            ctx.store
                .add_edge(&Edge::structural(&prev_id, &node.node_id, kind, now))?;

            if prev_row.outcome == mnemon_types::Outcome::Abandoned {
                let prior_files = ctx.store.files_touched(&prev_id)?;
                let prior_end = parsed.entries[prev.end_index].timestamp;
                let candidate = mnemon_engine::RestartCandidate {
                    prior_outcome: prev_row.outcome,
                    prior_end,
                    new_start: node.source.timestamp,
                    prior_files: &prior_files,
                    new_files: &node.content.files_touched,
                };
                if mnemon_engine::is_abandoned_restart(&candidate) {
                    ctx.store.add_edge(&Edge::structural(
                        &node.node_id,
                        &prev_id,
                        EdgeKind::AbandonedRestart,
                        now,
                    ))?;
                }
            }
        }
    }

    // Segments are analyzed latest-first, so the successor's node may
    // already exist; link forward too, and let the edge uniqueness
    // constraint absorb the overlap.
    if segment_index + 1 < segmentation.segments.len() {
        let next = &segmentation.segments[segment_index + 1];
        let next_id = deterministic_node_id(session_path, &next.start_id, &next.end_id);
        if ctx.store.node_exists(&next_id)? {
            let kind = boundary_edge_kind(next.opened_by);
            ctx.store
                .add_edge(&Edge::structural(&node.node_id, &next_id, kind, now))?;
        }
    }

    // A forked session links its first node back into the parent session.
    if segment_index == 0 {
        if let Some(parent_ref) = &parsed.header.parent_session {
            if let Some(parent_node_id) =
                resolve_fork_target(ctx, session_path, &parent_ref.file, &parent_ref.entry_id)?
            {
                if parent_node_id != node.node_id {
                    ctx.store.add_edge(&Edge::structural(
                        &node.node_id,
                        &parent_node_id,
                        EdgeKind::Fork,
                        now,
                    ))?;
                }
            }
        }
    }

    Ok(())
}

/// Locate the parent-session node containing the forked-from entry: segment
/// the parent file and look the span up by deterministic ID. Falls back to
/// the parent session's most recent node when the file is unreadable.
fn resolve_fork_target(
    ctx: &WorkerContext,
    session_path: &str,
    parent_file: &str,
    parent_entry: &str,
) -> Result<Option<String>> {
    let parent_path = if Path::new(parent_file).is_absolute() {
        PathBuf::from(parent_file)
    } else {
        Path::new(session_path)
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(parent_file)
    };
    let parent_path_str = parent_path.to_string_lossy().to_string();

    match read_session_file(&parent_path) {
        Ok(parent_session) => {
            let segmentation =
                extract_segments(&parent_session.entries, &ctx.config.segmenter_config());
            for segment in &segmentation.segments {
                let contains = parent_session.entries
                    [segment.start_index..=segment.end_index]
                    .iter()
                    .any(|e| e.id == parent_entry);
                if contains {
                    let node_id = deterministic_node_id(
                        &parent_path_str,
                        &segment.start_id,
                        &segment.end_id,
                    );
                    if ctx.store.node_exists(&node_id)? {
                        return Ok(Some(node_id));
                    }
                }
            }
            Ok(ctx
                .store
                .last_node_for_session(&parent_path_str)?
                .map(|row| row.node_id))
        }
        Err(err) => {
            tracing::debug!(parent = %parent_path.display(), error = %err, "parent session unreadable, using last known node");
            Ok(ctx
                .store
                .last_node_for_session(&parent_path_str)?
                .map(|row| row.node_id))
        }
    }
}

/// Turn analyzer-declared relationships into edges. Resolved targets link
/// immediately; the rest park on the unresolved sentinel for the discovery
/// pass.
fn apply_relationships(
    ctx: &WorkerContext,
    node: &Node,
    relationships: &[mnemon_engine::AnalysisRelationship],
) -> Result<()> {
    let now = Utc::now();
    for rel in relationships {
        let confidence = rel.confidence.unwrap_or(0.5);
        match rel.target.as_deref() {
            Some(target) if ctx.store.node_exists(target)? && target != node.node_id => {
                ctx.store.add_edge(&Edge {
                    source: node.node_id.clone(),
                    target: target.to_string(),
                    kind: rel.kind,
                    created_by: EdgeCreator::Daemon,
                    confidence,
                    similarity: None,
                    unresolved_target: None,
                    created_at: now,
                })?;
            }
            other => {
                let hint = rel
                    .description
                    .clone()
                    .or_else(|| other.map(String::from));
                let Some(hint) = hint else { continue };
                ctx.store.add_edge(&Edge {
                    source: node.node_id.clone(),
                    target: UNRESOLVED_TARGET.to_string(),
                    kind: rel.kind,
                    created_by: EdgeCreator::Daemon,
                    confidence,
                    similarity: None,
                    unresolved_target: Some(hint),
                    created_at: now,
                })?;
            }
        }
    }

    Ok(())
}

pub(crate) fn write_embedding(ctx: &WorkerContext, node: &Node) -> Result<()> {
    let text = mnemon_engine::build_embedding_text(node);
    let mut vectors = ctx.embedder.embed(std::slice::from_ref(&text))?;
    let Some(vector) = vectors.pop() else {
        return Err(Error::Embed(mnemon_embed::Error::Response(
            "backend returned no vectors".into(),
        )));
    };

    let record = EmbeddingRecord {
        node_id: node.node_id.clone(),
        model: ctx.embedder.model_name().to_string(),
        dimension: vector.len(),
        input_text: text,
        vector,
    };
    ctx.store.upsert_embedding(&record)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundary_edge_kinds() {
        assert_eq!(boundary_edge_kind(None), EdgeKind::Continuation);
        assert_eq!(
            boundary_edge_kind(Some(BoundaryKind::Resume)),
            EdgeKind::Resume
        );
        assert_eq!(
            boundary_edge_kind(Some(BoundaryKind::TreeJump)),
            EdgeKind::TreeJump
        );
        assert_eq!(
            boundary_edge_kind(Some(BoundaryKind::Compaction)),
            EdgeKind::Compaction
        );
    }

    #[test]
    fn test_error_chain_includes_sources() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "No such file or directory");
        let err = Error::Io(io);
        let chain = error_chain(&err);
        assert!(chain.to_lowercase().contains("no such file"));

        let classified = classify_error(&chain);
        assert_eq!(classified.reason, "file_not_found");
    }
}
