use crate::store::{Store, ts_from_sql, ts_to_sql};
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use mnemon_types::{
    ClassifiedError, ErrorCategory, Job, JobKind, JobStatus, MAX_STORED_ERROR_BYTES,
};
use rusqlite::{OptionalExtension, params};
use sha2::{Digest, Sha256};
use std::time::Duration as StdDuration;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub failed_transient: usize,
    pub failed_permanent: usize,
    pub failed_unknown: usize,
}

/// Exponential backoff with a deterministic jitter derived from the job id,
/// capped at `max_delay`. Monotonically non-decreasing in `retry_count`.
pub fn retry_delay(
    retry_count: u32,
    base_delay: StdDuration,
    max_delay: StdDuration,
    job_id: &str,
) -> StdDuration {
    let exp = base_delay.saturating_mul(2u32.saturating_pow(retry_count));

    let mut hasher = Sha256::new();
    hasher.update(job_id.as_bytes());
    let digest = hasher.finalize();
    let jitter_ms = u64::from_be_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ]) % 1000;

    let delayed = exp.saturating_add(StdDuration::from_millis(jitter_ms));
    delayed.min(max_delay)
}

impl Store {
    pub fn enqueue(&self, job: &Job) -> Result<String> {
        let conn = self.lock();
        insert_job(&conn, job)?;
        Ok(job.id.clone())
    }

    pub fn enqueue_many(&self, jobs: &[Job]) -> Result<Vec<String>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut ids = Vec::with_capacity(jobs.len());
        for job in jobs {
            insert_job(&tx, job)?;
            ids.push(job.id.clone());
        }
        tx.commit()?;
        Ok(ids)
    }

    /// Atomically move the most eligible pending job to running: lowest
    /// priority value first, then oldest `queued_at`, skipping jobs whose
    /// retry is still in the future. The status check in the UPDATE keeps the
    /// transition optimistic even if callers race.
    pub fn claim(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Job>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let now_sql = ts_to_sql(&now);

        loop {
            let candidate: Option<String> = tx
                .query_row(
                    r#"
                    SELECT id FROM jobs
                    WHERE status = 'pending'
                      AND (next_retry_at IS NULL OR next_retry_at <= ?1)
                    ORDER BY priority ASC, queued_at ASC
                    LIMIT 1
                    "#,
                    [&now_sql],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(id) = candidate else {
                return Ok(None);
            };

            let changed = tx.execute(
                r#"
                UPDATE jobs
                SET status = 'running', started_at = ?1, worker_id = ?2
                WHERE id = ?3 AND status = 'pending'
                "#,
                params![&now_sql, worker_id, &id],
            )?;

            if changed == 1 {
                let job = read_job(&tx, &id)?
                    .ok_or_else(|| Error::Query(format!("claimed job {} vanished", id)))?;
                tx.commit()?;
                return Ok(Some(job));
            }
            // Lost the race on this id; try the next candidate.
        }
    }

    pub fn complete(&self, job_id: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE jobs SET status = 'completed', finished_at = ?1 WHERE id = ?2 AND status = 'running'",
            params![ts_to_sql(&now), job_id],
        )?;
        if changed != 1 {
            return Err(Error::Query(format!("job {} is not running", job_id)));
        }
        Ok(())
    }

    /// Record a failure. Below `max_retries` with `should_retry`, the job
    /// returns to pending with `next_retry_at = now + delay`; otherwise it is
    /// terminally failed.
    pub fn fail(
        &self,
        job_id: &str,
        error: &ClassifiedError,
        should_retry: bool,
        delay: StdDuration,
        now: DateTime<Utc>,
    ) -> Result<JobStatus> {
        let conn = self.lock();

        let (retry_count, max_retries): (u32, u32) = conn
            .query_row(
                "SELECT retry_count, max_retries FROM jobs WHERE id = ?1 AND status = 'running'",
                [job_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| Error::Query(format!("job {} is not running", job_id)))?;

        let message = truncate(&error.message, MAX_STORED_ERROR_BYTES);
        let retrying = should_retry && retry_count < max_retries;

        if retrying {
            let next_retry = now
                + Duration::from_std(delay).unwrap_or_else(|_| Duration::seconds(i64::MAX / 1000));
            conn.execute(
                r#"
                UPDATE jobs
                SET status = 'pending', retry_count = retry_count + 1,
                    next_retry_at = ?1, worker_id = NULL,
                    last_error_category = ?2, last_error_reason = ?3, last_error_message = ?4
                WHERE id = ?5 AND status = 'running'
                "#,
                params![
                    ts_to_sql(&next_retry),
                    error.category.as_str(),
                    &error.reason,
                    message,
                    job_id
                ],
            )?;
            Ok(JobStatus::Pending)
        } else {
            conn.execute(
                r#"
                UPDATE jobs
                SET status = 'failed', finished_at = ?1, worker_id = NULL,
                    last_error_category = ?2, last_error_reason = ?3, last_error_message = ?4
                WHERE id = ?5 AND status = 'running'
                "#,
                params![
                    ts_to_sql(&now),
                    error.category.as_str(),
                    &error.reason,
                    message,
                    job_id
                ],
            )?;
            Ok(JobStatus::Failed)
        }
    }

    /// A pending or running job already covering this work unit.
    pub fn has_existing_job(&self, session_path: &str, kind: JobKind) -> Result<bool> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            r#"
            SELECT COUNT(*) FROM jobs
            WHERE session_path = ?1 AND kind = ?2 AND status IN ('pending', 'running')
            "#,
            params![session_path, kind.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn has_existing_node_job(&self, target_node_id: &str, kind: JobKind) -> Result<bool> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            r#"
            SELECT COUNT(*) FROM jobs
            WHERE target_node_id = ?1 AND kind = ?2 AND status IN ('pending', 'running')
            "#,
            params![target_node_id, kind.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let conn = self.lock();
        read_job(&conn, job_id)
    }

    pub fn list_jobs_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE status = ?1 ORDER BY priority ASC, queued_at ASC LIMIT ?2",
            SELECT_JOB
        ))?;
        let mut rows = stmt.query(params![status.as_str(), limit as i64])?;

        let mut jobs = Vec::new();
        while let Some(row) = rows.next()? {
            jobs.push(map_job(row)?);
        }
        Ok(jobs)
    }

    pub fn queue_stats(&self) -> Result<QueueStats> {
        let conn = self.lock();
        let mut stats = QueueStats::default();

        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            match status.as_str() {
                "pending" => stats.pending = count as usize,
                "running" => stats.running = count as usize,
                "completed" => stats.completed = count as usize,
                "failed" => stats.failed = count as usize,
                _ => {}
            }
        }

        let mut stmt = conn.prepare(
            "SELECT last_error_category, COUNT(*) FROM jobs WHERE status = 'failed' GROUP BY last_error_category",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let category: Option<String> = row.get(0)?;
            let count: i64 = row.get(1)?;
            match category.as_deref() {
                Some("transient") => stats.failed_transient = count as usize,
                Some("permanent") => stats.failed_permanent = count as usize,
                _ => stats.failed_unknown += count as usize,
            }
        }

        Ok(stats)
    }

    /// Return running jobs whose worker disappeared (started before the
    /// staleness window) to pending so a live worker can reclaim them.
    pub fn reclaim_stale(&self, staleness: StdDuration, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now
            - Duration::from_std(staleness).unwrap_or_else(|_| Duration::seconds(i64::MAX / 1000));
        let conn = self.lock();
        let changed = conn.execute(
            r#"
            UPDATE jobs
            SET status = 'pending', worker_id = NULL
            WHERE status = 'running' AND started_at < ?1
            "#,
            [ts_to_sql(&cutoff)],
        )?;
        Ok(changed)
    }
}

const SELECT_JOB: &str = r#"
    SELECT id, kind, status, session_path, target_node_id, priority,
           queued_at, started_at, finished_at, retry_count, max_retries,
           next_retry_at, last_error_category, last_error_reason,
           last_error_message, context, worker_id
    FROM jobs
"#;

fn insert_job(conn: &rusqlite::Connection, job: &Job) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO jobs (
            id, kind, status, session_path, target_node_id, priority,
            queued_at, started_at, finished_at, retry_count, max_retries,
            next_retry_at, last_error_category, last_error_reason,
            last_error_message, context, worker_id
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
        "#,
        params![
            &job.id,
            job.kind.as_str(),
            job.status.as_str(),
            &job.session_path,
            &job.target_node_id,
            job.priority,
            ts_to_sql(&job.queued_at),
            job.started_at.as_ref().map(ts_to_sql),
            job.finished_at.as_ref().map(ts_to_sql),
            job.retry_count,
            job.max_retries,
            job.next_retry_at.as_ref().map(ts_to_sql),
            job.last_error.as_ref().map(|e| e.category.as_str()),
            job.last_error.as_ref().map(|e| e.reason.clone()),
            job.last_error.as_ref().map(|e| e.message.clone()),
            job.context.as_ref().map(|c| c.to_string()),
            &job.worker_id,
        ],
    )?;
    Ok(())
}

fn read_job(conn: &rusqlite::Connection, job_id: &str) -> Result<Option<Job>> {
    let job = conn
        .query_row(
            &format!("{} WHERE id = ?1", SELECT_JOB),
            [job_id],
            map_job,
        )
        .optional()?;
    Ok(job)
}

fn map_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let kind: String = row.get(1)?;
    let status: String = row.get(2)?;
    let queued_at: String = row.get(6)?;
    let started_at: Option<String> = row.get(7)?;
    let finished_at: Option<String> = row.get(8)?;
    let next_retry_at: Option<String> = row.get(11)?;
    let error_category: Option<String> = row.get(12)?;
    let error_reason: Option<String> = row.get(13)?;
    let error_message: Option<String> = row.get(14)?;
    let context: Option<String> = row.get(15)?;

    let last_error = error_category.map(|category| ClassifiedError {
        category: ErrorCategory::parse(&category).unwrap_or(ErrorCategory::Unknown),
        reason: error_reason.unwrap_or_default(),
        message: error_message.unwrap_or_default(),
    });

    Ok(Job {
        id: row.get(0)?,
        kind: JobKind::parse(&kind).unwrap_or(JobKind::Initial),
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Pending),
        session_path: row.get(3)?,
        target_node_id: row.get(4)?,
        priority: row.get(5)?,
        queued_at: ts_from_sql(&queued_at).unwrap_or_default(),
        started_at: started_at.and_then(|s| ts_from_sql(&s).ok()),
        finished_at: finished_at.and_then(|s| ts_from_sql(&s).ok()),
        retry_count: row.get(9)?,
        max_retries: row.get(10)?,
        next_retry_at: next_retry_at.and_then(|s| ts_from_sql(&s).ok()),
        last_error,
        context: context.and_then(|c| serde_json::from_str(&c).ok()),
        worker_id: row.get(16)?,
    })
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnemon_types::classify_error;
    use tempfile::TempDir;

    fn store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open_in_memory(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_claim_order_priority_then_age() {
        let (_dir, store) = store();
        let t0 = Utc::now();

        let mut discovery = Job::connection_discovery("aabbccddeeff0011", t0);
        discovery.priority = mnemon_types::PRIORITY_CONNECTION_DISCOVERY;
        let older_initial = Job::initial("/logs/a.jsonl", t0 - Duration::seconds(60));
        let newer_initial = Job::initial("/logs/b.jsonl", t0);

        store.enqueue(&discovery).unwrap();
        store.enqueue(&newer_initial).unwrap();
        store.enqueue(&older_initial).unwrap();

        let first = store.claim("w1", t0).unwrap().unwrap();
        assert_eq!(first.session_path.as_deref(), Some("/logs/a.jsonl"));

        let second = store.claim("w1", t0).unwrap().unwrap();
        assert_eq!(second.session_path.as_deref(), Some("/logs/b.jsonl"));

        let third = store.claim("w1", t0).unwrap().unwrap();
        assert_eq!(third.kind, JobKind::ConnectionDiscovery);

        assert!(store.claim("w1", t0).unwrap().is_none());
    }

    #[test]
    fn test_claim_skips_future_retries() {
        let (_dir, store) = store();
        let now = Utc::now();

        let mut job = Job::initial("/logs/a.jsonl", now);
        job.next_retry_at = Some(now + Duration::seconds(300));
        store.enqueue(&job).unwrap();

        assert!(store.claim("w1", now).unwrap().is_none());
        assert!(
            store
                .claim("w1", now + Duration::seconds(301))
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn test_no_duplicate_claim() {
        let (_dir, store) = store();
        let now = Utc::now();
        store.enqueue(&Job::initial("/logs/a.jsonl", now)).unwrap();

        let first = store.claim("w1", now).unwrap();
        let second = store.claim("w2", now).unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[test]
    fn test_fail_retries_then_terminal() {
        let (_dir, store) = store();
        let now = Utc::now();

        let mut job = Job::initial("/logs/a.jsonl", now);
        job.max_retries = 1;
        store.enqueue(&job).unwrap();

        let claimed = store.claim("w1", now).unwrap().unwrap();
        let error = classify_error("operation timed out");
        let status = store
            .fail(&claimed.id, &error, true, StdDuration::from_secs(1), now)
            .unwrap();
        assert_eq!(status, JobStatus::Pending);

        let stored = store.get_job(&claimed.id).unwrap().unwrap();
        assert_eq!(stored.retry_count, 1);
        assert!(stored.next_retry_at.is_some());

        // Second failure exhausts max_retries.
        let reclaimed = store
            .claim("w1", now + Duration::seconds(10))
            .unwrap()
            .unwrap();
        let status = store
            .fail(&reclaimed.id, &error, true, StdDuration::from_secs(1), now)
            .unwrap();
        assert_eq!(status, JobStatus::Failed);

        let stored = store.get_job(&claimed.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.last_error.unwrap().reason, "timeout");
    }

    #[test]
    fn test_permanent_failure_keeps_retry_count_zero() {
        let (_dir, store) = store();
        let now = Utc::now();
        store.enqueue(&Job::initial("/logs/gone.jsonl", now)).unwrap();

        let claimed = store.claim("w1", now).unwrap().unwrap();
        let error = classify_error("ENOENT: no such file or directory");
        let status = store
            .fail(&claimed.id, &error, false, StdDuration::ZERO, now)
            .unwrap();
        assert_eq!(status, JobStatus::Failed);

        let stored = store.get_job(&claimed.id).unwrap().unwrap();
        assert_eq!(stored.retry_count, 0);
        assert_eq!(stored.last_error.unwrap().reason, "file_not_found");
    }

    #[test]
    fn test_has_existing_job() {
        let (_dir, store) = store();
        let now = Utc::now();
        store.enqueue(&Job::initial("/logs/a.jsonl", now)).unwrap();

        assert!(store.has_existing_job("/logs/a.jsonl", JobKind::Initial).unwrap());
        assert!(!store.has_existing_job("/logs/b.jsonl", JobKind::Initial).unwrap());

        let claimed = store.claim("w1", now).unwrap().unwrap();
        assert!(store.has_existing_job("/logs/a.jsonl", JobKind::Initial).unwrap());

        store.complete(&claimed.id, now).unwrap();
        assert!(!store.has_existing_job("/logs/a.jsonl", JobKind::Initial).unwrap());
    }

    #[test]
    fn test_reclaim_stale() {
        let (_dir, store) = store();
        let start = Utc::now() - Duration::minutes(60);
        store.enqueue(&Job::initial("/logs/a.jsonl", start)).unwrap();
        store.claim("w1", start).unwrap().unwrap();

        let now = Utc::now();
        let reclaimed = store.reclaim_stale(StdDuration::from_secs(1800), now).unwrap();
        assert_eq!(reclaimed, 1);
        assert!(store.claim("w2", now).unwrap().is_some());
    }

    #[test]
    fn test_retry_delay_monotone_and_capped() {
        let base = StdDuration::from_secs(5);
        let max = StdDuration::from_secs(600);

        let mut previous = StdDuration::ZERO;
        for n in 0..12 {
            let delay = retry_delay(n, base, max, "aabbccddeeff0011");
            assert!(delay >= previous, "delay must not decrease");
            assert!(delay <= max, "delay must respect the cap");
            previous = delay;
        }
        assert_eq!(retry_delay(20, base, max, "aabbccddeeff0011"), max);
    }

    #[test]
    fn test_queue_stats_by_category() {
        let (_dir, store) = store();
        let now = Utc::now();

        store.enqueue(&Job::initial("/logs/a.jsonl", now)).unwrap();
        store.enqueue(&Job::initial("/logs/b.jsonl", now)).unwrap();

        let claimed = store.claim("w1", now).unwrap().unwrap();
        let error = classify_error("ENOENT");
        store.fail(&claimed.id, &error, false, StdDuration::ZERO, now).unwrap();

        let stats = store.queue_stats().unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.failed_permanent, 1);
    }
}
