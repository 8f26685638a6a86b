use crate::docs::DocumentStore;
use crate::schema;
use crate::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use mnemon_types::{Node, NodeType, Outcome};
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Mutex;

/// Dual-backed knowledge store. One writer connection guarded by a mutex;
/// documents are written before rows so the row store is always rebuildable.
pub struct Store {
    pub(crate) conn: Mutex<Connection>,
    docs: DocumentStore,
}

/// Indexed projection of a node's current version.
#[derive(Debug, Clone)]
pub struct NodeRow {
    pub node_id: String,
    pub version: i64,
    pub session_file: String,
    pub segment_start: String,
    pub segment_end: String,
    pub project_path: String,
    pub computer: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub node_type: NodeType,
    pub outcome: Outcome,
    pub had_clear_goal: bool,
    pub is_new_project: bool,
    pub summary: String,
    pub tokens_used: u64,
    pub cost: f64,
    pub duration_minutes: f64,
    pub model: Option<String>,
    pub prompt_version: String,
    pub analyzed_at: DateTime<Utc>,
    pub previous_versions: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub node: Node,
    pub created: bool,
}

#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub nodes: usize,
    pub edges: usize,
    pub embeddings: usize,
}

pub(crate) fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn ts_from_sql(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Query(format!("bad timestamp '{}': {}", s, e)))
}

impl Store {
    pub fn open(db_path: &Path, docs_root: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        Self::from_connection(conn, docs_root)
    }

    pub fn open_in_memory(docs_root: &Path) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, docs_root)
    }

    fn from_connection(conn: Connection, docs_root: &Path) -> Result<Self> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            "#,
        )?;
        schema::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            docs: DocumentStore::new(docs_root),
        })
    }

    pub fn docs(&self) -> &DocumentStore {
        &self.docs
    }

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create or update a node. Identical content is a no-op (`created:
    /// false`, same version); changed content bumps the version, appends to
    /// `previous_versions`, writes a new document, and replaces the row and
    /// its child tables in one transaction.
    pub fn upsert(&self, node: &Node) -> Result<UpsertOutcome> {
        let content_hash = content_hash(node);

        let mut conn = self.lock();

        let existing: Option<(i64, String, String)> = conn
            .query_row(
                "SELECT version, content_hash, previous_versions FROM nodes WHERE node_id = ?1",
                [&node.node_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let (version, previous_versions, created) = match &existing {
            Some((version, existing_hash, previous_json)) => {
                if existing_hash == &content_hash {
                    let mut unchanged = node.clone();
                    unchanged.version = *version;
                    unchanged.metadata.previous_versions =
                        serde_json::from_str(previous_json).unwrap_or_default();
                    return Ok(UpsertOutcome {
                        node: unchanged,
                        created: false,
                    });
                }
                let mut previous: Vec<i64> =
                    serde_json::from_str(previous_json).unwrap_or_default();
                previous.push(*version);
                (*version + 1, previous, false)
            }
            None => (1, Vec::new(), true),
        };

        let mut committed = node.clone();
        committed.version = version;
        committed.metadata.previous_versions = previous_versions;

        // Document first: a crash before the row commit is healed on replay
        // because this whole operation is idempotent.
        self.docs.write(&committed)?;

        let tx = conn.transaction()?;
        write_row(&tx, &committed, &content_hash)?;
        tx.commit()?;

        Ok(UpsertOutcome {
            node: committed,
            created,
        })
    }

    pub fn get_node(&self, node_id: &str) -> Result<Option<NodeRow>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                &format!("{} WHERE node_id = ?1", SELECT_NODE_ROW),
                [node_id],
                map_node_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Full node content: row for the current version, document for the body.
    pub fn get_node_document(&self, node_id: &str) -> Result<Option<Node>> {
        let Some(row) = self.get_node(node_id)? else {
            return Ok(None);
        };
        self.docs.find(node_id, row.version)
    }

    pub fn node_exists(&self, node_id: &str) -> Result<bool> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM nodes WHERE node_id = ?1",
            [node_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Most recent node of a session file, by segment timestamp.
    pub fn last_node_for_session(&self, session_file: &str) -> Result<Option<NodeRow>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                &format!(
                    "{} WHERE session_file = ?1 ORDER BY ts DESC LIMIT 1",
                    SELECT_NODE_ROW
                ),
                [session_file],
                map_node_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn files_touched(&self, node_id: &str) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT path FROM node_files WHERE node_id = ?1 ORDER BY path")?;
        let files = stmt
            .query_map([node_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(files)
    }

    /// Nodes whose stored prompt hash differs from the current one.
    pub fn nodes_with_stale_prompt(&self, current_prompt_version: &str) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT node_id FROM nodes WHERE prompt_version != ?1 ORDER BY ts")?;
        let ids = stmt
            .query_map([current_prompt_version], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Recent nodes with no outgoing semantic edge, newest first.
    pub fn nodes_without_semantic_edges(&self, limit: usize) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT n.node_id FROM nodes n
            WHERE NOT EXISTS (
                SELECT 1 FROM edges e
                WHERE e.source = n.node_id
                  AND e.kind IN ('semantic', 'reference', 'lesson_application')
            )
            ORDER BY n.ts DESC
            LIMIT ?1
            "#,
        )?;
        let ids = stmt
            .query_map([limit as i64], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Clear all node rows and the full-text index (documents untouched).
    pub fn clear_rows(&self) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute_batch(
            r#"
            DELETE FROM nodes;
            DELETE FROM node_decisions;
            DELETE FROM node_lessons;
            DELETE FROM node_quirks;
            DELETE FROM node_tool_errors;
            DELETE FROM node_tags;
            DELETE FROM node_topics;
            DELETE FROM node_files;
            DELETE FROM nodes_fts;
            "#,
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Replay the latest document of every node back into rows. Used by
    /// `rebuild-index` after `clear_rows`.
    pub fn rebuild_from_documents(&self) -> Result<usize> {
        let latest = self.docs.latest_versions()?;
        let mut count = 0usize;

        let mut conn = self.lock();
        for (_, _, path) in latest {
            let node = match self.docs.read(&path) {
                Ok(node) => node,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping unreadable document");
                    continue;
                }
            };
            let hash = content_hash(&node);
            let tx = conn.transaction()?;
            write_row(&tx, &node, &hash)?;
            tx.commit()?;
            count += 1;
        }

        Ok(count)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.lock();
        let nodes: i64 = conn.query_row("SELECT COUNT(*) FROM nodes", [], |r| r.get(0))?;
        let edges: i64 = conn.query_row("SELECT COUNT(*) FROM edges", [], |r| r.get(0))?;
        let embeddings: i64 =
            conn.query_row("SELECT COUNT(*) FROM embeddings", [], |r| r.get(0))?;
        Ok(StoreStats {
            nodes: nodes as usize,
            edges: edges as usize,
            embeddings: embeddings as usize,
        })
    }

    /// Recompute the aggregate pattern tables from node child tables.
    pub fn aggregate_patterns(&self, now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let ts = ts_to_sql(&now);

        tx.execute("DELETE FROM failure_patterns", [])?;
        tx.execute(
            r#"
            INSERT INTO failure_patterns (tool, error_kind, occurrences, node_count, updated_at)
            SELECT tool, error_kind, SUM(count), COUNT(DISTINCT node_id), ?1
            FROM node_tool_errors
            GROUP BY tool, error_kind
            "#,
            [&ts],
        )?;

        tx.execute("DELETE FROM quirk_patterns", [])?;
        tx.execute(
            r#"
            INSERT INTO quirk_patterns (observation, total_frequency, node_count, updated_at)
            SELECT observation, SUM(frequency), COUNT(DISTINCT node_id), ?1
            FROM node_quirks
            GROUP BY observation
            "#,
            [&ts],
        )?;

        tx.execute("DELETE FROM lesson_patterns", [])?;
        tx.execute(
            r#"
            INSERT INTO lesson_patterns (level, lesson, node_count, updated_at)
            SELECT level, lesson, COUNT(DISTINCT node_id), ?1
            FROM node_lessons
            GROUP BY level, lesson
            "#,
            [&ts],
        )?;

        tx.commit()?;
        Ok(())
    }
}

const SELECT_NODE_ROW: &str = r#"
    SELECT node_id, version, session_file, segment_start, segment_end,
           project_path, computer, ts, node_type, outcome, had_clear_goal,
           is_new_project, summary, tokens_used, cost, duration_minutes,
           model, prompt_version, analyzed_at, previous_versions
    FROM nodes
"#;

fn map_node_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<NodeRow> {
    let ts: String = row.get(7)?;
    let analyzed_at: String = row.get(18)?;
    let node_type: String = row.get(8)?;
    let outcome: String = row.get(9)?;
    let previous: String = row.get(19)?;

    Ok(NodeRow {
        node_id: row.get(0)?,
        version: row.get(1)?,
        session_file: row.get(2)?,
        segment_start: row.get(3)?,
        segment_end: row.get(4)?,
        project_path: row.get(5)?,
        computer: row.get(6)?,
        timestamp: ts_from_sql(&ts).unwrap_or_default(),
        node_type: NodeType::parse(&node_type).unwrap_or(NodeType::Other),
        outcome: Outcome::parse(&outcome).unwrap_or(Outcome::Partial),
        had_clear_goal: row.get::<_, i64>(10)? != 0,
        is_new_project: row.get::<_, i64>(11)? != 0,
        summary: row.get(12)?,
        tokens_used: row.get::<_, i64>(13)? as u64,
        cost: row.get(14)?,
        duration_minutes: row.get(15)?,
        model: row.get(16)?,
        prompt_version: row.get(17)?,
        analyzed_at: ts_from_sql(&analyzed_at).unwrap_or_default(),
        previous_versions: serde_json::from_str(&previous).unwrap_or_default(),
    })
}

fn content_hash(node: &Node) -> String {
    let canonical = serde_json::to_string(&(
        &node.classification,
        &node.content,
        &node.metadata.prompt_version,
    ))
    .unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    digest[..16].iter().map(|b| format!("{:02x}", b)).collect()
}

/// Write the row projection and replace child tables + the FTS entry.
/// Caller owns the transaction.
pub(crate) fn write_row(tx: &rusqlite::Transaction<'_>, node: &Node, content_hash: &str) -> Result<()> {
    tx.execute(
        r#"
        INSERT INTO nodes (
            node_id, version, content_hash, session_file, segment_start,
            segment_end, project_path, computer, ts, node_type, outcome,
            had_clear_goal, is_new_project, summary, tokens_used, cost,
            duration_minutes, model, prompt_version, analyzed_at, previous_versions
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                ?15, ?16, ?17, ?18, ?19, ?20, ?21)
        ON CONFLICT(node_id) DO UPDATE SET
            version = ?2,
            content_hash = ?3,
            session_file = ?4,
            segment_start = ?5,
            segment_end = ?6,
            project_path = ?7,
            computer = ?8,
            ts = ?9,
            node_type = ?10,
            outcome = ?11,
            had_clear_goal = ?12,
            is_new_project = ?13,
            summary = ?14,
            tokens_used = ?15,
            cost = ?16,
            duration_minutes = ?17,
            model = ?18,
            prompt_version = ?19,
            analyzed_at = ?20,
            previous_versions = ?21
        "#,
        params![
            &node.node_id,
            node.version,
            content_hash,
            &node.source.session_file,
            &node.source.segment_start,
            &node.source.segment_end,
            &node.source.project_path,
            &node.source.computer,
            ts_to_sql(&node.source.timestamp),
            node.classification.node_type.as_str(),
            node.classification.outcome.as_str(),
            node.classification.had_clear_goal as i64,
            node.classification.is_new_project as i64,
            &node.content.summary,
            node.content.tokens_used as i64,
            node.content.cost,
            node.content.duration_minutes,
            &node.content.model,
            &node.metadata.prompt_version,
            ts_to_sql(&node.metadata.analyzed_at),
            serde_json::to_string(&node.metadata.previous_versions)?,
        ],
    )?;

    for table in [
        "node_decisions",
        "node_lessons",
        "node_quirks",
        "node_tool_errors",
        "node_tags",
        "node_topics",
        "node_files",
    ] {
        tx.execute(
            &format!("DELETE FROM {} WHERE node_id = ?1", table),
            [&node.node_id],
        )?;
    }

    for (seq, decision) in node.content.decisions.iter().enumerate() {
        tx.execute(
            "INSERT INTO node_decisions (node_id, seq, what, why, alternatives) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                &node.node_id,
                seq as i64,
                &decision.what,
                &decision.why,
                serde_json::to_string(&decision.alternatives)?,
            ],
        )?;
    }
    for lesson in &node.content.lessons {
        tx.execute(
            "INSERT INTO node_lessons (node_id, level, lesson) VALUES (?1, ?2, ?3)",
            params![&node.node_id, lesson.level.as_str(), &lesson.text],
        )?;
    }
    for quirk in &node.content.quirks {
        tx.execute(
            "INSERT INTO node_quirks (node_id, observation, frequency, severity) VALUES (?1, ?2, ?3, ?4)",
            params![
                &node.node_id,
                &quirk.observation,
                quirk.frequency as i64,
                quirk.severity.as_str(),
            ],
        )?;
    }
    for tool_error in &node.content.tool_errors {
        tx.execute(
            "INSERT INTO node_tool_errors (node_id, tool, error_kind, count) VALUES (?1, ?2, ?3, ?4)",
            params![
                &node.node_id,
                &tool_error.tool,
                &tool_error.error_kind,
                tool_error.count as i64,
            ],
        )?;
    }
    for tag in &node.content.tags {
        tx.execute(
            "INSERT OR IGNORE INTO node_tags (node_id, tag) VALUES (?1, ?2)",
            params![&node.node_id, tag],
        )?;
    }
    for topic in &node.content.topics {
        tx.execute(
            "INSERT OR IGNORE INTO node_topics (node_id, topic) VALUES (?1, ?2)",
            params![&node.node_id, topic],
        )?;
    }
    for path in &node.content.files_touched {
        tx.execute(
            "INSERT OR IGNORE INTO node_files (node_id, path) VALUES (?1, ?2)",
            params![&node.node_id, path],
        )?;
    }

    tx.execute("DELETE FROM nodes_fts WHERE node_id = ?1", [&node.node_id])?;
    let decisions_text = node
        .content
        .decisions
        .iter()
        .map(|d| format!("{} {} {}", d.what, d.why, d.alternatives.join(" ")))
        .collect::<Vec<_>>()
        .join("\n");
    let lessons_text = node
        .content
        .lessons
        .iter()
        .map(|l| l.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    tx.execute(
        "INSERT INTO nodes_fts (node_id, summary, decisions, lessons, tags, topics) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            &node.node_id,
            &node.content.summary,
            decisions_text,
            lessons_text,
            node.content.tags.join(" "),
            node.content.topics.join(" "),
        ],
    )?;

    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use mnemon_types::*;
    use serde_json::Value;

    pub fn node(node_id: &str, summary: &str) -> Node {
        Node {
            node_id: node_id.into(),
            version: 1,
            source: NodeSource {
                session_file: "s1.jsonl".into(),
                segment_start: "e1".into(),
                segment_end: "e10".into(),
                project_path: "/p".into(),
                computer: Some("box".into()),
                timestamp: "2026-03-05T10:00:00Z".parse().unwrap(),
            },
            classification: Classification {
                node_type: NodeType::Coding,
                outcome: Outcome::Success,
                had_clear_goal: true,
                is_new_project: false,
            },
            content: NodeContent {
                summary: summary.into(),
                decisions: vec![Decision {
                    what: "use a queue".into(),
                    why: "bursty input".into(),
                    alternatives: vec!["inline processing".into()],
                }],
                lessons: vec![Lesson {
                    level: LessonLevel::Project,
                    text: "ingest is bursty".into(),
                }],
                quirks: vec![],
                tool_errors: vec![ToolErrorStat {
                    tool: "bash".into(),
                    error_kind: "exit_1".into(),
                    count: 2,
                }],
                tags: vec!["queue".into()],
                topics: vec!["ingestion".into()],
                files_touched: vec!["src/lib.rs".into()],
                tokens_used: 100,
                cost: 0.01,
                duration_minutes: 3.0,
                model: Some("mx-1".into()),
                extra: Value::Null,
            },
            metadata: NodeMetadata {
                prompt_version: "promptv1".into(),
                analyzed_at: "2026-03-05T10:05:00Z".parse().unwrap(),
                previous_versions: vec![],
            },
        }
    }
}
