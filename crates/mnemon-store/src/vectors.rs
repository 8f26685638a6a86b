use crate::search::SearchFilters;
use crate::store::Store;
use crate::{Error, Result};
use rusqlite::types::Value as SqlValue;
use rusqlite::{OptionalExtension, params};

/// One stored embedding: the vector plus the model and exact input text that
/// produced it, so staleness is detectable.
#[derive(Debug, Clone)]
pub struct EmbeddingRecord {
    pub node_id: String,
    pub model: String,
    pub dimension: usize,
    pub input_text: String,
    pub vector: Vec<f32>,
}

pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 1.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }

    1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())
}

fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

fn blob_to_vec(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(Error::Query(format!(
            "embedding blob length {} is not a multiple of 4",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

impl Store {
    /// Insert-or-replace the embedding for a node.
    pub fn upsert_embedding(&self, record: &EmbeddingRecord) -> Result<()> {
        if record.vector.len() != record.dimension {
            return Err(Error::Query(format!(
                "vector length {} does not match dimension {}",
                record.vector.len(),
                record.dimension
            )));
        }

        let conn = self.lock();
        conn.execute(
            r#"
            INSERT INTO embeddings (node_id, model, dimension, input_text, vector)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(node_id) DO UPDATE SET
                model = ?2,
                dimension = ?3,
                input_text = ?4,
                vector = ?5
            "#,
            params![
                &record.node_id,
                &record.model,
                record.dimension as i64,
                &record.input_text,
                vec_to_blob(&record.vector),
            ],
        )?;
        Ok(())
    }

    pub fn get_embedding(&self, node_id: &str) -> Result<Option<EmbeddingRecord>> {
        let conn = self.lock();
        let record = conn
            .query_row(
                "SELECT node_id, model, dimension, input_text, vector FROM embeddings WHERE node_id = ?1",
                [node_id],
                |row| {
                    let blob: Vec<u8> = row.get(4)?;
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        blob,
                    ))
                },
            )
            .optional()?;

        match record {
            Some((node_id, model, dimension, input_text, blob)) => Ok(Some(EmbeddingRecord {
                node_id,
                model,
                dimension: dimension as usize,
                input_text,
                vector: blob_to_vec(&blob)?,
            })),
            None => Ok(None),
        }
    }

    pub fn delete_embedding(&self, node_id: &str) -> Result<bool> {
        let conn = self.lock();
        let changed = conn.execute("DELETE FROM embeddings WHERE node_id = ?1", [node_id])?;
        Ok(changed > 0)
    }

    /// Brute-force nearest neighbors by cosine distance, honoring the same
    /// structured filters as full-text search. Returns `(node_id, distance)`
    /// pairs, closest first.
    pub fn vector_search(
        &self,
        query: &[f32],
        k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<(String, f32)>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut sql_params: Vec<SqlValue> = Vec::new();
        filters.push_sql(&mut clauses, &mut sql_params);

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            r#"
            SELECT e.node_id, e.vector
            FROM embeddings e
            JOIN nodes n ON n.node_id = e.node_id
            {}
            "#,
            where_sql
        );

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(sql_params))?;

        let mut scored: Vec<(String, f32)> = Vec::new();
        while let Some(row) = rows.next()? {
            let node_id: String = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            let vector = blob_to_vec(&blob)?;
            scored.push((node_id, cosine_distance(query, &vector)));
        }

        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    /// Embeddings for the most recent nodes, newest first.
    pub fn recent_embeddings(&self, limit: usize) -> Result<Vec<EmbeddingRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT e.node_id, e.model, e.dimension, e.input_text, e.vector
            FROM embeddings e
            JOIN nodes n ON n.node_id = e.node_id
            ORDER BY n.ts DESC
            LIMIT ?1
            "#,
        )?;
        let mut rows = stmt.query([limit as i64])?;

        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let blob: Vec<u8> = row.get(4)?;
            records.push(EmbeddingRecord {
                node_id: row.get(0)?,
                model: row.get(1)?,
                dimension: row.get::<_, i64>(2)? as usize,
                input_text: row.get(3)?,
                vector: blob_to_vec(&blob)?,
            });
        }
        Ok(records)
    }

    /// Replace the cluster tables with a fresh clustering result.
    pub fn replace_clusters(
        &self,
        clusters: &[(Vec<f32>, Vec<String>)],
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM cluster_members", [])?;
        tx.execute("DELETE FROM clusters", [])?;

        let ts = crate::store::ts_to_sql(&now);
        for (index, (centroid, members)) in clusters.iter().enumerate() {
            let cluster_id = index as i64 + 1;
            tx.execute(
                "INSERT INTO clusters (cluster_id, created_at, centroid) VALUES (?1, ?2, ?3)",
                params![cluster_id, &ts, vec_to_blob(centroid)],
            )?;
            for node_id in members {
                tx.execute(
                    "INSERT OR IGNORE INTO cluster_members (cluster_id, node_id) VALUES (?1, ?2)",
                    params![cluster_id, node_id],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn cluster_count(&self) -> Result<usize> {
        let conn = self.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM clusters", [], |r| r.get(0))?;
        Ok(count as usize)
    }

    /// Nodes whose embedding is missing or outdated: none stored, produced
    /// by a different model, or generated from pre-marker input text.
    pub fn nodes_needing_embeddings(
        &self,
        model: &str,
        format_marker: &str,
        limit: usize,
    ) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT n.node_id
            FROM nodes n
            LEFT JOIN embeddings e ON e.node_id = n.node_id
            WHERE e.node_id IS NULL
               OR e.model != ?1
               OR instr(e.input_text, ?2) = 0
            ORDER BY n.ts DESC
            LIMIT ?3
            "#,
        )?;
        let ids = stmt
            .query_map(params![model, format_marker, limit as i64], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}
