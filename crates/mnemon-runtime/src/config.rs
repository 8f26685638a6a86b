use crate::{Error, Result};
use mnemon_embed::EmbeddingBackend;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Resolve the daemon data directory based on priority:
/// 1. Explicit path (with tilde expansion)
/// 2. MNEMON_DATA_DIR environment variable (with tilde expansion)
/// 3. XDG data directory
/// 4. ~/.mnemon (fallback for systems without XDG)
pub fn resolve_data_dir(explicit_path: Option<&str>) -> Result<PathBuf> {
    if let Some(path) = explicit_path {
        return Ok(expand_tilde(path));
    }

    if let Ok(env_path) = std::env::var("MNEMON_DATA_DIR") {
        return Ok(expand_tilde(&env_path));
    }

    if let Some(data_dir) = dirs::data_dir() {
        return Ok(data_dir.join("mnemon"));
    }

    if let Some(home) = std::env::var_os("HOME") {
        return Ok(PathBuf::from(home).join(".mnemon"));
    }

    Err(Error::Config(
        "Could not determine data directory: no HOME directory or XDG data directory found"
            .to_string(),
    ))
}

/// Resolve the config file path: explicit flag, then MNEMON_CONFIG, then
/// `<data_dir>/config.toml`.
pub fn resolve_config_path(explicit_path: Option<&str>) -> Result<PathBuf> {
    if let Some(path) = explicit_path {
        return Ok(expand_tilde(path));
    }
    if let Ok(env_path) = std::env::var("MNEMON_CONFIG") {
        return Ok(expand_tilde(&env_path));
    }
    Ok(resolve_data_dir(None)?.join("config.toml"))
}

/// Expand tilde (~) in paths to the user's home directory
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return PathBuf::from(home).join(stripped);
    }
    PathBuf::from(path)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub poll_interval_secs: u64,
    pub stability_window_secs: u64,
    pub idle_window_secs: u64,
    pub event_buffer: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 2,
            stability_window_secs: 30,
            idle_window_secs: 300,
            event_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterSection {
    pub resume_gap_minutes: i64,
}

impl Default for SegmenterSection {
    fn default() -> Self {
        Self {
            resume_gap_minutes: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    /// Running jobs older than this without a finish are reclaimable.
    pub stale_claim_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: 5,
            max_delay_secs: 600,
            stale_claim_secs: 1800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// 0 means auto: available cores clamped to 1..=8.
    pub count: usize,
    pub job_timeout_secs: u64,
    /// A segment only counts as complete once its last entry is at least
    /// this old.
    pub min_segment_age_secs: u64,
    pub enqueue_discovery: bool,
    /// Cosine similarity floor for semantic edges.
    pub similarity_threshold: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 0,
            job_timeout_secs: 600,
            min_segment_age_secs: 30,
            enqueue_discovery: true,
            similarity_threshold: 0.75,
        }
    }
}

impl WorkerConfig {
    pub fn effective_count(&self) -> usize {
        if self.count > 0 {
            return self.count;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2)
            .clamp(1, 8)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// Analyzer binary, resolved via PATH when not absolute.
    pub bin: String,
    pub skills_dir: PathBuf,
    pub required_skills: Vec<String>,
    /// Session files larger than this also get the large-session skill.
    pub large_session_bytes: u64,
    pub large_session_skill: String,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            bin: "mnemon-agent".to_string(),
            skills_dir: PathBuf::from("~/.mnemon/skills"),
            required_skills: vec!["session-analysis".to_string()],
            large_session_bytes: 2_000_000,
            large_session_skill: "chunked-analysis".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ScheduleEntry {
    pub kind: ScheduledKind,
    pub cron: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledKind {
    Reanalysis,
    ConnectionDiscovery,
    PatternAggregation,
    Clustering,
    BackfillEmbeddings,
}

impl ScheduledKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduledKind::Reanalysis => "reanalysis",
            ScheduledKind::ConnectionDiscovery => "connection_discovery",
            ScheduledKind::PatternAggregation => "pattern_aggregation",
            ScheduledKind::Clustering => "clustering",
            ScheduledKind::BackfillEmbeddings => "backfill_embeddings",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directories scanned for `*.jsonl` session logs.
    pub watch_dirs: Vec<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub watcher: WatcherConfig,
    pub segmenter: SegmenterSection,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub agent: AgentSection,
    pub embedding: EmbeddingBackend,
    #[serde(rename = "schedule")]
    pub schedules: Vec<ScheduleEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            watch_dirs: Vec::new(),
            data_dir: None,
            watcher: WatcherConfig::default(),
            segmenter: SegmenterSection::default(),
            queue: QueueConfig::default(),
            worker: WorkerConfig::default(),
            agent: AgentSection::default(),
            embedding: EmbeddingBackend::Mock { dimension: 64 },
            schedules: vec![
                ScheduleEntry {
                    kind: ScheduledKind::Reanalysis,
                    cron: "0 0 3 * * *".to_string(),
                    enabled: true,
                },
                ScheduleEntry {
                    kind: ScheduledKind::ConnectionDiscovery,
                    cron: "0 30 * * * *".to_string(),
                    enabled: true,
                },
                ScheduleEntry {
                    kind: ScheduledKind::PatternAggregation,
                    cron: "0 15 4 * * *".to_string(),
                    enabled: true,
                },
                ScheduleEntry {
                    kind: ScheduledKind::Clustering,
                    cron: "0 45 4 * * *".to_string(),
                    enabled: true,
                },
                ScheduleEntry {
                    kind: ScheduledKind::BackfillEmbeddings,
                    cron: "0 0 * * * *".to_string(),
                    enabled: true,
                },
            ],
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path(None)?;
        Self::load_from(&config_path)
    }

    pub fn load_from(path: &PathBuf) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn resolve_data_dir(&self) -> Result<PathBuf> {
        let explicit = self
            .data_dir
            .as_ref()
            .map(|p| p.to_string_lossy().to_string());
        resolve_data_dir(explicit.as_deref())
    }

    pub fn db_path(&self) -> Result<PathBuf> {
        Ok(self.resolve_data_dir()?.join("mnemon.db"))
    }

    pub fn pid_path(&self) -> Result<PathBuf> {
        Ok(self.resolve_data_dir()?.join("mnemon.pid"))
    }

    pub fn segmenter_config(&self) -> mnemon_engine::SegmenterConfig {
        mnemon_engine::SegmenterConfig {
            resume_gap_minutes: self.segmenter.resume_gap_minutes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.watcher.stability_window_secs, 30);
        assert_eq!(config.segmenter.resume_gap_minutes, 10);
        assert_eq!(config.schedules.len(), 5);
        assert!(config.worker.effective_count() >= 1);
        assert!(config.worker.effective_count() <= 8);
    }

    #[test]
    fn test_save_and_load_round_trip() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join("config.toml");

        let mut config = Config::default();
        config.watch_dirs = vec![PathBuf::from("/logs/agent")];
        config.worker.count = 3;
        config.embedding = EmbeddingBackend::Http {
            endpoint: "http://localhost:11434/v1/embeddings".to_string(),
            model: "nomic-embed-text".to_string(),
            api_key: None,
        };

        config.save_to(&config_path)?;
        let loaded = Config::load_from(&config_path)?;
        assert_eq!(loaded.watch_dirs, vec![PathBuf::from("/logs/agent")]);
        assert_eq!(loaded.worker.count, 3);
        assert!(matches!(loaded.embedding, EmbeddingBackend::Http { .. }));

        Ok(())
    }

    #[test]
    fn test_load_nonexistent_returns_default() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join("nonexistent.toml");

        let config = Config::load_from(&config_path)?;
        assert!(config.watch_dirs.is_empty());

        Ok(())
    }

    #[test]
    fn test_expand_tilde() {
        if let Some(home) = std::env::var_os("HOME") {
            let expanded = expand_tilde("~/sessions");
            assert_eq!(expanded, PathBuf::from(home).join("sessions"));
        }
        assert_eq!(expand_tilde("/abs/path"), PathBuf::from("/abs/path"));
    }
}
