use crate::args::{Cli, Command};
use anyhow::{Context, Result, bail};
use mnemon_runtime::{Config, Daemon, SkillSet, WorkerContext, current_prompt_version};
use mnemon_store::Store;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub fn run(cli: Cli) -> Result<()> {
    let config_path = mnemon_runtime::resolve_config_path(cli.config.as_deref())?;
    let config = Config::load_from(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    match cli.command {
        Command::Start => start(config),
        Command::Stop => stop(config),
        Command::Status => status(config),
        Command::Queue { status, limit } => queue(config, status.into(), limit),
        Command::RebuildIndex => rebuild_index(config),
        Command::RebuildEmbeddings => rebuild_embeddings(config),
        Command::Health => health(config),
    }
}

fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env("MNEMON_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn open_store(config: &Config) -> Result<Arc<Store>> {
    let data_dir = config.resolve_data_dir()?;
    std::fs::create_dir_all(&data_dir)?;
    Ok(Arc::new(Store::open(&config.db_path()?, &data_dir)?))
}

/// Offline context for commands that touch the store and embedder but never
/// spawn the analyzer.
fn offline_context(config: &Config) -> Result<Arc<WorkerContext>> {
    let store = open_store(config)?;
    let embedder = Arc::from(mnemon_embed::build_provider(&config.embedding));
    Ok(Arc::new(WorkerContext {
        store,
        config: config.clone(),
        embedder,
        skills: SkillSet::from_names(Vec::new()),
        prompt_version: current_prompt_version(),
    }))
}

fn start(config: Config) -> Result<()> {
    init_logging();

    let pid_path = config.pid_path()?;
    if let Some(parent) = pid_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&pid_path, std::process::id().to_string())?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .context("installing shutdown handler")?;

    let daemon = Daemon::start(config)?;
    let result = daemon.run(shutdown);

    std::fs::remove_file(&pid_path).ok();
    result?;
    Ok(())
}

fn stop(config: Config) -> Result<()> {
    let pid_path = config.pid_path()?;
    let pid: i32 = std::fs::read_to_string(&pid_path)
        .with_context(|| format!("no pidfile at {}; is the daemon running?", pid_path.display()))?
        .trim()
        .parse()
        .context("pidfile does not contain a pid")?;

    #[cfg(unix)]
    {
        let result = unsafe { libc::kill(pid, libc::SIGINT) };
        if result != 0 {
            std::fs::remove_file(&pid_path).ok();
            bail!("process {} is not running (stale pidfile removed)", pid);
        }
        println!("sent shutdown signal to {}", pid);
        Ok(())
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        bail!("stop is only supported on unix; terminate the process manually")
    }
}

fn status(config: Config) -> Result<()> {
    let store = open_store(&config)?;
    let queue = store.queue_stats()?;
    let stats = store.stats()?;

    println!("store:");
    println!("  nodes       {}", stats.nodes);
    println!("  edges       {}", stats.edges);
    println!("  embeddings  {}", stats.embeddings);
    println!("queue:");
    println!("  pending     {}", queue.pending);
    println!("  running     {}", queue.running);
    println!("  completed   {}", queue.completed);
    println!("  failed      {}", queue.failed);

    let pid_path = config.pid_path()?;
    match std::fs::read_to_string(&pid_path) {
        Ok(pid) => println!("daemon: running (pid {})", pid.trim()),
        Err(_) => println!("daemon: not running"),
    }

    Ok(())
}

fn queue(config: Config, status: mnemon_types::JobStatus, limit: usize) -> Result<()> {
    let store = open_store(&config)?;
    let jobs = store.list_jobs_by_status(status, limit)?;

    if jobs.is_empty() {
        println!("no {} jobs", status.as_str());
        return Ok(());
    }

    for job in jobs {
        let target = job
            .session_path
            .or(job.target_node_id)
            .unwrap_or_else(|| "-".to_string());
        let error = job
            .last_error
            .map(|e| format!("  [{}: {}]", e.category.as_str(), e.reason))
            .unwrap_or_default();
        println!(
            "{}  {:<20}  retries {}/{}  {}{}",
            job.id,
            job.kind.as_str(),
            job.retry_count,
            job.max_retries,
            target,
            error
        );
    }

    Ok(())
}

fn rebuild_index(config: Config) -> Result<()> {
    let store = open_store(&config)?;
    store.clear_rows()?;
    let count = store.rebuild_from_documents()?;
    println!("rebuilt {} node rows from documents", count);
    Ok(())
}

fn rebuild_embeddings(config: Config) -> Result<()> {
    let ctx = offline_context(&config)?;

    let mut total = 0usize;
    let mut failures = 0usize;
    loop {
        let (succeeded, failed) = mnemon_runtime::backfill_embeddings_once(&ctx)?;
        total += succeeded;
        failures += failed;
        if succeeded == 0 {
            break;
        }
    }

    println!("regenerated {} embeddings ({} failures)", total, failures);
    if failures > 0 {
        bail!("{} nodes could not be embedded", failures);
    }
    Ok(())
}

fn health(config: Config) -> Result<()> {
    let mut healthy = true;

    match SkillSet::discover(&config.agent) {
        Ok(_) => println!("skills: ok"),
        Err(err) => {
            healthy = false;
            println!("skills: {}", err);
        }
    }

    match open_store(&config) {
        Ok(store) => {
            let queue = store.queue_stats()?;
            println!("store: ok");
            println!("failed jobs by category:");
            println!("  transient  {}", queue.failed_transient);
            println!("  permanent  {}", queue.failed_permanent);
            println!("  unknown    {}", queue.failed_unknown);
        }
        Err(err) => {
            healthy = false;
            println!("store: {}", err);
        }
    }

    if !healthy {
        bail!("unhealthy environment");
    }
    Ok(())
}
