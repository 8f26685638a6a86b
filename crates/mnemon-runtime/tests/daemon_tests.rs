//! Daemon assembly tests: watcher -> queue -> worker wiring, scheduler
//! firing, graceful shutdown.

use mnemon_embed::MockEmbeddingProvider;
use mnemon_runtime::{
    Config, Daemon, ScheduleEntry, ScheduledKind, Scheduler, SkillSet, WorkerContext,
    current_prompt_version,
};
use mnemon_store::Store;
use mnemon_testing::{fake_agent, linear_session, payload_json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn daemon_config(dir: &std::path::Path, agent_bin: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.watch_dirs = vec![dir.join("logs")];
    config.data_dir = Some(dir.join("data"));
    config.agent.bin = agent_bin.to_string_lossy().to_string();
    config.agent.required_skills = Vec::new();
    config.watcher.poll_interval_secs = 1;
    config.watcher.stability_window_secs = 0;
    config.worker.count = 1;
    config.worker.min_segment_age_secs = 0;
    config.worker.enqueue_discovery = false;
    config
}

#[test]
fn daemon_ingests_a_ready_session() {
    let dir = TempDir::new().unwrap();
    let agent = fake_agent(dir.path(), &payload_json("daemon ingest", "coding", "success")).unwrap();

    std::fs::create_dir_all(dir.path().join("logs")).unwrap();
    linear_session("/p")
        .write_to(&dir.path().join("logs/s1.jsonl"))
        .unwrap();

    let mut daemon = Daemon::start(daemon_config(dir.path(), &agent)).unwrap();

    let deadline = Instant::now() + Duration::from_secs(30);
    let mut node_count = 0;
    while Instant::now() < deadline {
        daemon.pump_events(Duration::from_millis(250)).unwrap();
        node_count = daemon.store().stats().unwrap().nodes;
        if node_count > 0 {
            break;
        }
    }
    assert_eq!(node_count, 1, "daemon should ingest the session");

    let status = daemon.status().unwrap();
    assert_eq!(status.store.nodes, 1);
    assert!(status.watcher.tracked_files >= 1);

    daemon.shutdown();
}

#[test]
fn daemon_requires_watch_dirs() {
    let dir = TempDir::new().unwrap();
    let agent = fake_agent(dir.path(), &payload_json("x", "coding", "success")).unwrap();
    let mut config = daemon_config(dir.path(), &agent);
    config.watch_dirs = Vec::new();

    assert!(Daemon::start(config).is_err());
}

#[test]
fn daemon_fails_fast_on_missing_required_skill() {
    let dir = TempDir::new().unwrap();
    let agent = fake_agent(dir.path(), &payload_json("x", "coding", "success")).unwrap();
    let mut config = daemon_config(dir.path(), &agent);
    config.agent.skills_dir = dir.path().join("empty-skills");
    config.agent.required_skills = vec!["session-analysis".to_string()];

    assert!(Daemon::start(config).is_err());
}

#[test]
fn scheduler_fires_and_reports_status() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(Store::open(&dir.path().join("mnemon.db"), dir.path()).unwrap());

    let mut config = Config::default();
    config.data_dir = Some(dir.path().to_path_buf());
    let ctx = Arc::new(WorkerContext {
        store,
        config,
        embedder: Arc::new(MockEmbeddingProvider::new(8)),
        skills: SkillSet::from_names(Vec::new()),
        prompt_version: current_prompt_version(),
    });

    let entries = vec![ScheduleEntry {
        kind: ScheduledKind::PatternAggregation,
        cron: "* * * * * *".to_string(),
        enabled: true,
    }];
    let mut scheduler = Scheduler::start(Arc::clone(&ctx), &entries).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut fired = false;
    while Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(200));
        let statuses = scheduler.statuses();
        if statuses.iter().any(|s| s.last_run.is_some()) {
            fired = true;
            break;
        }
    }
    assert!(fired, "scheduled kind should have fired");

    let statuses = scheduler.statuses();
    assert!(statuses[0].next_run.is_some());
    assert_eq!(statuses[0].kind, ScheduledKind::PatternAggregation);

    scheduler.stop();
}
