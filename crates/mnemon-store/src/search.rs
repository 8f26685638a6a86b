use crate::store::{Store, ts_to_sql};
use crate::Result;
use chrono::{DateTime, Utc};
use mnemon_types::{NodeType, Outcome};
use rusqlite::types::Value as SqlValue;

/// Structured filters shared by full-text and vector search. Empty filters
/// match everything; tag/topic lists are AND-sets.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub project: Option<String>,
    pub node_type: Option<NodeType>,
    pub outcome: Option<Outcome>,
    pub computer: Option<String>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub had_clear_goal: Option<bool>,
    pub is_new_project: Option<bool>,
    pub tags: Vec<String>,
    pub topics: Vec<String>,
}

impl SearchFilters {
    /// Append SQL predicates over the aliased `nodes` table `n`.
    pub(crate) fn push_sql(&self, clauses: &mut Vec<String>, params: &mut Vec<SqlValue>) {
        if let Some(project) = &self.project {
            clauses.push(format!("n.project_path = ?{}", params.len() + 1));
            params.push(SqlValue::Text(project.clone()));
        }
        if let Some(node_type) = self.node_type {
            clauses.push(format!("n.node_type = ?{}", params.len() + 1));
            params.push(SqlValue::Text(node_type.as_str().to_string()));
        }
        if let Some(outcome) = self.outcome {
            clauses.push(format!("n.outcome = ?{}", params.len() + 1));
            params.push(SqlValue::Text(outcome.as_str().to_string()));
        }
        if let Some(computer) = &self.computer {
            clauses.push(format!("n.computer = ?{}", params.len() + 1));
            params.push(SqlValue::Text(computer.clone()));
        }
        if let Some(from) = &self.date_from {
            clauses.push(format!("n.ts >= ?{}", params.len() + 1));
            params.push(SqlValue::Text(ts_to_sql(from)));
        }
        if let Some(to) = &self.date_to {
            clauses.push(format!("n.ts <= ?{}", params.len() + 1));
            params.push(SqlValue::Text(ts_to_sql(to)));
        }
        if let Some(flag) = self.had_clear_goal {
            clauses.push(format!("n.had_clear_goal = ?{}", params.len() + 1));
            params.push(SqlValue::Integer(flag as i64));
        }
        if let Some(flag) = self.is_new_project {
            clauses.push(format!("n.is_new_project = ?{}", params.len() + 1));
            params.push(SqlValue::Integer(flag as i64));
        }
        for (table, column, values) in [
            ("node_tags", "tag", &self.tags),
            ("node_topics", "topic", &self.topics),
        ] {
            if values.is_empty() {
                continue;
            }
            let placeholders: Vec<String> = values
                .iter()
                .enumerate()
                .map(|(i, _)| format!("?{}", params.len() + 1 + i))
                .collect();
            clauses.push(format!(
                "(SELECT COUNT(DISTINCT {column}) FROM {table} c WHERE c.node_id = n.node_id AND c.{column} IN ({})) = {}",
                placeholders.join(", "),
                values.len()
            ));
            for value in values {
                params.push(SqlValue::Text(value.clone()));
            }
        }
    }
}

/// Columns a full-text query may be restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchField {
    Summary,
    Decisions,
    Lessons,
    Tags,
    Topics,
}

impl SearchField {
    fn column(&self) -> &'static str {
        match self {
            SearchField::Summary => "summary",
            SearchField::Decisions => "decisions",
            SearchField::Lessons => "lessons",
            SearchField::Tags => "tags",
            SearchField::Topics => "topics",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub node_id: String,
    /// bm25 rank; lower is better.
    pub rank: f64,
    pub snippet: String,
}

impl Store {
    /// Unrestricted ranked full-text search.
    pub fn search_nodes(&self, query: &str, limit: usize, offset: usize) -> Result<Vec<SearchHit>> {
        self.search_nodes_advanced(query, &SearchFilters::default(), None, limit, offset)
    }

    /// Ranked full-text search with field restriction, structured filters
    /// and pagination. For any filters, the result set is a subset of the
    /// unfiltered query.
    pub fn search_nodes_advanced(
        &self,
        query: &str,
        filters: &SearchFilters,
        fields: Option<&[SearchField]>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<SearchHit>> {
        let match_expr = build_match_expr(query, fields);
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }

        let mut params: Vec<SqlValue> = vec![SqlValue::Text(match_expr)];
        let mut clauses: Vec<String> = vec!["nodes_fts MATCH ?1".to_string()];
        filters.push_sql(&mut clauses, &mut params);

        let limit_idx = params.len() + 1;
        params.push(SqlValue::Integer(limit as i64));
        let offset_idx = params.len() + 1;
        params.push(SqlValue::Integer(offset as i64));

        // Field weights: summary 5, decisions 2, lessons 2, tags 3, topics 3.
        let sql = format!(
            r#"
            SELECT nodes_fts.node_id,
                   bm25(nodes_fts, 0.0, 5.0, 2.0, 2.0, 3.0, 3.0) AS rank,
                   snippet(nodes_fts, 1, '[', ']', '…', 12) AS snip
            FROM nodes_fts
            JOIN nodes n ON n.node_id = nodes_fts.node_id
            WHERE {}
            ORDER BY rank ASC
            LIMIT ?{} OFFSET ?{}
            "#,
            clauses.join(" AND "),
            limit_idx,
            offset_idx
        );

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(params))?;

        let mut hits = Vec::new();
        while let Some(row) = rows.next()? {
            hits.push(SearchHit {
                node_id: row.get(0)?,
                rank: row.get(1)?,
                snippet: row.get(2)?,
            });
        }
        Ok(hits)
    }
}

/// Quote each term so user input cannot inject FTS5 operators; restrict to
/// the requested columns with the `{cols}: (...)` syntax.
fn build_match_expr(query: &str, fields: Option<&[SearchField]>) -> String {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|term| term.replace('"', ""))
        .filter(|term| term.len() >= 2)
        .map(|term| format!("\"{}\"", term))
        .collect();

    if terms.is_empty() {
        return String::new();
    }
    let joined = terms.join(" ");

    match fields {
        Some(fields) if !fields.is_empty() => {
            let columns: Vec<&str> = fields.iter().map(SearchField::column).collect();
            format!("{{{}}}: ({})", columns.join(" "), joined)
        }
        _ => joined,
    }
}
