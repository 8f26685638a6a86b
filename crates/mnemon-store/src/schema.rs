use crate::Result;
use rusqlite::Connection;

// Schema version (increment when changing table definitions)
pub const SCHEMA_VERSION: i32 = 3;

// NOTE: Database Design Rationale
//
// Why document-first writes?
// - JSON documents under nodes/YYYY/MM/ are the source of truth for rich
//   content and version history; rows only index the current version
// - A crash between document write and row commit is healed by replaying
//   the document through the idempotent upsert
//
// Why drop-and-recreate on schema version mismatch?
// - Rows are always rebuildable from documents (`rebuild-index`), so
//   migrations stay trivial while the schema evolves
//
// Why the queue in the same database?
// - Job transitions ride the same single-writer connection as node commits,
//   which is what makes claim/complete/fail serializable for free

pub fn init_schema(conn: &Connection) -> Result<()> {
    let current_version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if current_version != SCHEMA_VERSION {
        drop_all_tables(conn)?;
    }

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS nodes (
            node_id TEXT PRIMARY KEY,
            version INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            session_file TEXT NOT NULL,
            segment_start TEXT NOT NULL,
            segment_end TEXT NOT NULL,
            project_path TEXT NOT NULL,
            computer TEXT,
            ts TEXT NOT NULL,
            node_type TEXT NOT NULL,
            outcome TEXT NOT NULL,
            had_clear_goal INTEGER NOT NULL,
            is_new_project INTEGER NOT NULL,
            summary TEXT NOT NULL,
            tokens_used INTEGER NOT NULL DEFAULT 0,
            cost REAL NOT NULL DEFAULT 0,
            duration_minutes REAL NOT NULL DEFAULT 0,
            model TEXT,
            prompt_version TEXT NOT NULL,
            analyzed_at TEXT NOT NULL,
            previous_versions TEXT NOT NULL DEFAULT '[]'
        );

        CREATE TABLE IF NOT EXISTS node_decisions (
            node_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            what TEXT NOT NULL,
            why TEXT NOT NULL,
            alternatives TEXT NOT NULL DEFAULT '[]',
            PRIMARY KEY (node_id, seq)
        );

        CREATE TABLE IF NOT EXISTS node_lessons (
            node_id TEXT NOT NULL,
            level TEXT NOT NULL,
            lesson TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS node_quirks (
            node_id TEXT NOT NULL,
            observation TEXT NOT NULL,
            frequency INTEGER NOT NULL,
            severity TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS node_tool_errors (
            node_id TEXT NOT NULL,
            tool TEXT NOT NULL,
            error_kind TEXT NOT NULL,
            count INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS node_tags (
            node_id TEXT NOT NULL,
            tag TEXT NOT NULL,
            PRIMARY KEY (node_id, tag)
        );

        CREATE TABLE IF NOT EXISTS node_topics (
            node_id TEXT NOT NULL,
            topic TEXT NOT NULL,
            PRIMARY KEY (node_id, topic)
        );

        CREATE TABLE IF NOT EXISTS node_files (
            node_id TEXT NOT NULL,
            path TEXT NOT NULL,
            PRIMARY KEY (node_id, path)
        );

        CREATE TABLE IF NOT EXISTS edges (
            source TEXT NOT NULL,
            target TEXT NOT NULL,
            kind TEXT NOT NULL,
            created_by TEXT NOT NULL,
            confidence REAL NOT NULL DEFAULT 1.0,
            similarity REAL,
            unresolved_target TEXT,
            created_at TEXT NOT NULL,
            PRIMARY KEY (source, target, kind)
        );

        CREATE TABLE IF NOT EXISTS embeddings (
            node_id TEXT PRIMARY KEY,
            model TEXT NOT NULL,
            dimension INTEGER NOT NULL,
            input_text TEXT NOT NULL,
            vector BLOB NOT NULL
        );

        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            status TEXT NOT NULL,
            session_path TEXT,
            target_node_id TEXT,
            priority INTEGER NOT NULL,
            queued_at TEXT NOT NULL,
            started_at TEXT,
            finished_at TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL,
            next_retry_at TEXT,
            last_error_category TEXT,
            last_error_reason TEXT,
            last_error_message TEXT,
            context TEXT,
            worker_id TEXT
        );

        CREATE TABLE IF NOT EXISTS failure_patterns (
            tool TEXT NOT NULL,
            error_kind TEXT NOT NULL,
            occurrences INTEGER NOT NULL,
            node_count INTEGER NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (tool, error_kind)
        );

        CREATE TABLE IF NOT EXISTS quirk_patterns (
            observation TEXT PRIMARY KEY,
            total_frequency INTEGER NOT NULL,
            node_count INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS lesson_patterns (
            level TEXT NOT NULL,
            lesson TEXT NOT NULL,
            node_count INTEGER NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (level, lesson)
        );

        CREATE TABLE IF NOT EXISTS clusters (
            cluster_id INTEGER PRIMARY KEY,
            created_at TEXT NOT NULL,
            centroid BLOB NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cluster_members (
            cluster_id INTEGER NOT NULL,
            node_id TEXT NOT NULL,
            PRIMARY KEY (cluster_id, node_id)
        );

        CREATE VIRTUAL TABLE IF NOT EXISTS nodes_fts USING fts5(
            node_id UNINDEXED,
            summary,
            decisions,
            lessons,
            tags,
            topics
        );

        CREATE INDEX IF NOT EXISTS idx_nodes_session ON nodes(session_file);
        CREATE INDEX IF NOT EXISTS idx_nodes_project ON nodes(project_path);
        CREATE INDEX IF NOT EXISTS idx_nodes_ts ON nodes(ts DESC);
        CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(status, priority, queued_at);
        CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(source);
        CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target);
        "#,
    )?;

    conn.execute(&format!("PRAGMA user_version = {}", SCHEMA_VERSION), [])?;

    Ok(())
}

fn drop_all_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        DROP TABLE IF EXISTS cluster_members;
        DROP TABLE IF EXISTS clusters;
        DROP TABLE IF EXISTS lesson_patterns;
        DROP TABLE IF EXISTS quirk_patterns;
        DROP TABLE IF EXISTS failure_patterns;
        DROP TABLE IF EXISTS jobs;
        DROP TABLE IF EXISTS embeddings;
        DROP TABLE IF EXISTS edges;
        DROP TABLE IF EXISTS node_files;
        DROP TABLE IF EXISTS node_topics;
        DROP TABLE IF EXISTS node_tags;
        DROP TABLE IF EXISTS node_tool_errors;
        DROP TABLE IF EXISTS node_quirks;
        DROP TABLE IF EXISTS node_lessons;
        DROP TABLE IF EXISTS node_decisions;
        DROP TABLE IF EXISTS nodes;
        DROP TABLE IF EXISTS nodes_fts;
        "#,
    )?;
    Ok(())
}
