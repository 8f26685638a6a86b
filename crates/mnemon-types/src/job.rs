use crate::classify::ClassifiedError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Initial,
    Reanalysis,
    ConnectionDiscovery,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Initial => "initial",
            JobKind::Reanalysis => "reanalysis",
            JobKind::ConnectionDiscovery => "connection_discovery",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(Value::String(s.to_string())).ok()
    }

    pub fn default_priority(&self) -> i64 {
        match self {
            JobKind::Initial => PRIORITY_INITIAL,
            JobKind::Reanalysis => PRIORITY_REANALYSIS,
            JobKind::ConnectionDiscovery => PRIORITY_CONNECTION_DISCOVERY,
        }
    }

    pub fn default_max_retries(&self) -> u32 {
        match self {
            JobKind::Initial => 3,
            JobKind::Reanalysis => 2,
            JobKind::ConnectionDiscovery => 2,
        }
    }
}

// Fixed priority levels, lower wins.
pub const PRIORITY_INITIAL: i64 = 0;
pub const PRIORITY_REANALYSIS: i64 = 10;
pub const PRIORITY_CONNECTION_DISCOVERY: i64 = 20;
pub const PRIORITY_BACKFILL: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(Value::String(s.to_string())).ok()
    }
}

/// A unit of work in the durable queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node_id: Option<String>,
    pub priority: i64,
    pub queued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ClassifiedError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

impl Job {
    pub fn initial(session_path: &str, now: DateTime<Utc>) -> Self {
        Self::new(JobKind::Initial, Some(session_path.to_string()), None, now)
    }

    pub fn reanalysis(node_id: &str, context: Value, now: DateTime<Utc>) -> Self {
        let mut job = Self::new(JobKind::Reanalysis, None, Some(node_id.to_string()), now);
        job.context = Some(context);
        job
    }

    pub fn connection_discovery(node_id: &str, now: DateTime<Utc>) -> Self {
        Self::new(
            JobKind::ConnectionDiscovery,
            None,
            Some(node_id.to_string()),
            now,
        )
    }

    fn new(
        kind: JobKind,
        session_path: Option<String>,
        target_node_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: crate::new_job_id(),
            kind,
            status: JobStatus::Pending,
            session_path,
            target_node_id,
            priority: kind.default_priority(),
            queued_at: now,
            started_at: None,
            finished_at: None,
            retry_count: 0,
            max_retries: kind.default_max_retries(),
            next_retry_at: None,
            last_error: None,
            context: None,
            worker_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(PRIORITY_INITIAL < PRIORITY_REANALYSIS);
        assert!(PRIORITY_REANALYSIS < PRIORITY_CONNECTION_DISCOVERY);
        assert!(PRIORITY_CONNECTION_DISCOVERY < PRIORITY_BACKFILL);
    }

    #[test]
    fn test_initial_job_defaults() {
        let now = Utc::now();
        let job = Job::initial("/logs/s1.jsonl", now);
        assert_eq!(job.kind, JobKind::Initial);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, PRIORITY_INITIAL);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.id.len(), 16);
    }

    #[test]
    fn test_kind_string_round_trip() {
        for kind in [
            JobKind::Initial,
            JobKind::Reanalysis,
            JobKind::ConnectionDiscovery,
        ] {
            assert_eq!(JobKind::parse(kind.as_str()), Some(kind));
        }
    }
}
