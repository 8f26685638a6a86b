use crate::store::{NodeRow, Store, ts_from_sql, ts_to_sql};
use crate::{Error, Result};
use mnemon_types::{Edge, EdgeCreator, EdgeKind, UNRESOLVED_TARGET};
use rusqlite::params;
use std::collections::HashSet;

pub const MAX_TRAVERSAL_DEPTH: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
    Both,
}

/// Subgraph returned by traversal: the visited nodes' row projections plus
/// every edge walked to reach them.
#[derive(Debug, Clone, Default)]
pub struct GraphSlice {
    pub nodes: Vec<NodeRow>,
    pub edges: Vec<Edge>,
}

impl Store {
    /// Insert an edge; `(source, target, kind)` duplicates are ignored.
    /// Returns whether a new edge was written. Self-edges are rejected.
    pub fn add_edge(&self, edge: &Edge) -> Result<bool> {
        if edge.source == edge.target {
            return Err(Error::Query(format!(
                "self edge rejected: {} -[{}]-> itself",
                edge.source,
                edge.kind.as_str()
            )));
        }

        let conn = self.lock();
        let changed = conn.execute(
            r#"
            INSERT OR IGNORE INTO edges
                (source, target, kind, created_by, confidence, similarity, unresolved_target, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                &edge.source,
                &edge.target,
                edge.kind.as_str(),
                edge.created_by.as_str(),
                edge.confidence,
                edge.similarity,
                &edge.unresolved_target,
                ts_to_sql(&edge.created_at),
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn edges_of(
        &self,
        node_id: &str,
        direction: Direction,
        kinds: Option<&[EdgeKind]>,
    ) -> Result<Vec<Edge>> {
        let direction_sql = match direction {
            Direction::Outgoing => "source = ?1",
            Direction::Incoming => "target = ?1",
            Direction::Both => "(source = ?1 OR target = ?1)",
        };
        let kind_sql = kind_filter_sql(kinds);

        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE {}{} ORDER BY created_at",
            SELECT_EDGE, direction_sql, kind_sql
        ))?;
        let mut rows = stmt.query([node_id])?;

        let mut edges = Vec::new();
        while let Some(row) = rows.next()? {
            edges.push(map_edge(row)?);
        }
        Ok(edges)
    }

    /// Edges whose target is the unresolved sentinel, oldest first.
    pub fn unresolved_edges(&self, limit: usize) -> Result<Vec<Edge>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE target = ?1 ORDER BY created_at LIMIT ?2",
            SELECT_EDGE
        ))?;
        let mut rows = stmt.query(params![UNRESOLVED_TARGET, limit as i64])?;

        let mut edges = Vec::new();
        while let Some(row) = rows.next()? {
            edges.push(map_edge(row)?);
        }
        Ok(edges)
    }

    /// Replace an unresolved edge with a concrete target, keeping kind and
    /// provenance but recording the discovered similarity.
    pub fn resolve_edge(
        &self,
        source: &str,
        kind: EdgeKind,
        target: &str,
        similarity: f64,
    ) -> Result<bool> {
        if source == target {
            return Ok(false);
        }

        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let removed = tx.execute(
            "DELETE FROM edges WHERE source = ?1 AND target = ?2 AND kind = ?3",
            params![source, UNRESOLVED_TARGET, kind.as_str()],
        )?;
        if removed == 0 {
            return Ok(false);
        }

        tx.execute(
            r#"
            INSERT OR IGNORE INTO edges
                (source, target, kind, created_by, confidence, similarity, unresolved_target, created_at)
            SELECT ?1, ?2, ?3, 'daemon', ?4, ?4, NULL, ?5
            "#,
            params![
                source,
                target,
                kind.as_str(),
                similarity,
                ts_to_sql(&chrono::Utc::now()),
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Breadth-first neighborhood bounded by `max_depth` (clamped to
    /// 1..=5), with direction and edge-kind filters.
    pub fn neighborhood(
        &self,
        roots: &[String],
        max_depth: usize,
        direction: Direction,
        kinds: Option<&[EdgeKind]>,
    ) -> Result<GraphSlice> {
        let max_depth = max_depth.clamp(1, MAX_TRAVERSAL_DEPTH);

        let mut visited: HashSet<String> = roots.iter().cloned().collect();
        let mut frontier: Vec<String> = roots.to_vec();
        let mut collected_edges: Vec<Edge> = Vec::new();
        let mut seen_edges: HashSet<(String, String, EdgeKind)> = HashSet::new();

        for _ in 0..max_depth {
            let mut next_frontier = Vec::new();

            for node_id in &frontier {
                for edge in self.edges_of(node_id, direction, kinds)? {
                    if edge.target == UNRESOLVED_TARGET {
                        continue;
                    }
                    let key = (edge.source.clone(), edge.target.clone(), edge.kind);
                    if seen_edges.insert(key) {
                        collected_edges.push(edge.clone());
                    }

                    let neighbor = if edge.source == *node_id {
                        &edge.target
                    } else {
                        &edge.source
                    };
                    if visited.insert(neighbor.clone()) {
                        next_frontier.push(neighbor.clone());
                    }
                }
            }

            if next_frontier.is_empty() {
                break;
            }
            frontier = next_frontier;
        }

        let mut nodes = Vec::new();
        for node_id in &visited {
            if let Some(row) = self.get_node(node_id)? {
                nodes.push(row);
            }
        }
        nodes.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

        Ok(GraphSlice {
            nodes,
            edges: collected_edges,
        })
    }

    /// Shortest path between two nodes following edges in either direction.
    pub fn shortest_path(
        &self,
        from: &str,
        to: &str,
        max_depth: usize,
    ) -> Result<Option<Vec<String>>> {
        let max_depth = max_depth.clamp(1, MAX_TRAVERSAL_DEPTH);
        if from == to {
            return Ok(Some(vec![from.to_string()]));
        }

        let mut parent: std::collections::HashMap<String, String> =
            std::collections::HashMap::new();
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(from.to_string());
        let mut frontier = vec![from.to_string()];

        for _ in 0..max_depth {
            let mut next_frontier = Vec::new();

            for node_id in &frontier {
                for edge in self.edges_of(node_id, Direction::Both, None)? {
                    if edge.target == UNRESOLVED_TARGET {
                        continue;
                    }
                    let neighbor = if edge.source == *node_id {
                        edge.target.clone()
                    } else {
                        edge.source.clone()
                    };
                    if !visited.insert(neighbor.clone()) {
                        continue;
                    }
                    parent.insert(neighbor.clone(), node_id.clone());

                    if neighbor == to {
                        let mut path = vec![neighbor];
                        while let Some(prev) = parent.get(path.last().unwrap()) {
                            path.push(prev.clone());
                        }
                        path.reverse();
                        return Ok(Some(path));
                    }
                    next_frontier.push(neighbor);
                }
            }

            if next_frontier.is_empty() {
                break;
            }
            frontier = next_frontier;
        }

        Ok(None)
    }

    /// Nodes reachable by walking incoming edges only.
    pub fn ancestors(&self, node_id: &str, max_depth: usize) -> Result<GraphSlice> {
        self.neighborhood(&[node_id.to_string()], max_depth, Direction::Incoming, None)
    }

    /// Nodes reachable by walking outgoing edges only.
    pub fn descendants(&self, node_id: &str, max_depth: usize) -> Result<GraphSlice> {
        self.neighborhood(&[node_id.to_string()], max_depth, Direction::Outgoing, None)
    }
}

const SELECT_EDGE: &str = r#"
    SELECT source, target, kind, created_by, confidence, similarity,
           unresolved_target, created_at
    FROM edges
"#;

fn kind_filter_sql(kinds: Option<&[EdgeKind]>) -> String {
    match kinds {
        Some(kinds) if !kinds.is_empty() => {
            let list: Vec<String> = kinds
                .iter()
                .map(|k| format!("'{}'", k.as_str()))
                .collect();
            format!(" AND kind IN ({})", list.join(", "))
        }
        _ => String::new(),
    }
}

fn map_edge(row: &rusqlite::Row<'_>) -> rusqlite::Result<Edge> {
    let kind: String = row.get(2)?;
    let created_by: String = row.get(3)?;
    let created_at: String = row.get(7)?;

    Ok(Edge {
        source: row.get(0)?,
        target: row.get(1)?,
        kind: EdgeKind::parse(&kind).unwrap_or(EdgeKind::Semantic),
        created_by: EdgeCreator::parse(&created_by).unwrap_or(EdgeCreator::Daemon),
        confidence: row.get(4)?,
        similarity: row.get(5)?,
        unresolved_target: row.get(6)?,
        created_at: ts_from_sql(&created_at).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::node;
    use chrono::Utc;
    use tempfile::TempDir;

    fn chain_store(len: usize) -> (TempDir, Store, Vec<String>) {
        let dir = TempDir::new().unwrap();
        let store = Store::open_in_memory(dir.path()).unwrap();

        let ids: Vec<String> = (0..len)
            .map(|i| format!("{:016x}", 0x1000 + i as u64))
            .collect();
        for (i, id) in ids.iter().enumerate() {
            let mut n = node(id, &format!("node {}", i));
            n.source.timestamp = (chrono::DateTime::parse_from_rfc3339("2026-03-05T10:00:00Z")
                .unwrap()
                .with_timezone(&Utc))
                + chrono::Duration::minutes(i as i64);
            store.upsert(&n).unwrap();
        }
        for window in ids.windows(2) {
            store
                .add_edge(&Edge::structural(
                    &window[0],
                    &window[1],
                    EdgeKind::Continuation,
                    Utc::now(),
                ))
                .unwrap();
        }

        (dir, store, ids)
    }

    #[test]
    fn test_self_edge_rejected() {
        let (_dir, store, ids) = chain_store(1);
        let edge = Edge::structural(&ids[0], &ids[0], EdgeKind::Semantic, Utc::now());
        assert!(store.add_edge(&edge).is_err());
    }

    #[test]
    fn test_duplicate_edge_ignored() {
        let (_dir, store, ids) = chain_store(2);
        let edge = Edge::structural(&ids[0], &ids[1], EdgeKind::Continuation, Utc::now());
        assert!(!store.add_edge(&edge).unwrap());

        let different_kind = Edge::structural(&ids[0], &ids[1], EdgeKind::Resume, Utc::now());
        assert!(store.add_edge(&different_kind).unwrap());
    }

    #[test]
    fn test_bfs_depth_bound() {
        let (_dir, store, ids) = chain_store(6);

        for depth in 1..=3 {
            let slice = store
                .neighborhood(&[ids[0].clone()], depth, Direction::Outgoing, None)
                .unwrap();
            // Root plus exactly `depth` hops down the chain.
            assert_eq!(slice.nodes.len(), depth + 1, "depth {}", depth);
            assert_eq!(slice.edges.len(), depth);
        }
    }

    #[test]
    fn test_depth_clamped_to_max() {
        let (_dir, store, ids) = chain_store(8);
        let slice = store
            .neighborhood(&[ids[0].clone()], 50, Direction::Outgoing, None)
            .unwrap();
        assert_eq!(slice.nodes.len(), MAX_TRAVERSAL_DEPTH + 1);
    }

    #[test]
    fn test_direction_filters() {
        let (_dir, store, ids) = chain_store(3);

        let incoming = store.ancestors(&ids[2], 5).unwrap();
        assert_eq!(incoming.nodes.len(), 3);

        let outgoing = store.descendants(&ids[2], 5).unwrap();
        assert_eq!(outgoing.nodes.len(), 1);
    }

    #[test]
    fn test_kind_filter() {
        let (_dir, store, ids) = chain_store(3);
        store
            .add_edge(&Edge {
                similarity: Some(0.8),
                ..Edge::structural(&ids[0], &ids[2], EdgeKind::Semantic, Utc::now())
            })
            .unwrap();

        let only_semantic = store
            .neighborhood(
                &[ids[0].clone()],
                5,
                Direction::Outgoing,
                Some(&[EdgeKind::Semantic]),
            )
            .unwrap();
        assert_eq!(only_semantic.edges.len(), 1);
        assert_eq!(only_semantic.edges[0].kind, EdgeKind::Semantic);
    }

    #[test]
    fn test_shortest_path() {
        let (_dir, store, ids) = chain_store(4);

        let path = store.shortest_path(&ids[0], &ids[3], 5).unwrap().unwrap();
        assert_eq!(path.len(), 4);
        assert_eq!(path.first(), Some(&ids[0]));
        assert_eq!(path.last(), Some(&ids[3]));

        assert!(store.shortest_path(&ids[0], "ffffffffffffffff", 5).unwrap().is_none());
    }

    #[test]
    fn test_unresolved_edges_and_resolution() {
        let (_dir, store, ids) = chain_store(2);

        let edge = Edge {
            source: ids[0].clone(),
            target: UNRESOLVED_TARGET.to_string(),
            kind: EdgeKind::Reference,
            created_by: EdgeCreator::Daemon,
            confidence: 0.5,
            similarity: None,
            unresolved_target: Some("that session about backoff".into()),
            created_at: Utc::now(),
        };
        store.add_edge(&edge).unwrap();

        let unresolved = store.unresolved_edges(10).unwrap();
        assert_eq!(unresolved.len(), 1);
        assert!(unresolved[0].is_unresolved());

        let resolved = store
            .resolve_edge(&ids[0], EdgeKind::Reference, &ids[1], 0.92)
            .unwrap();
        assert!(resolved);
        assert!(store.unresolved_edges(10).unwrap().is_empty());

        let outgoing = store
            .edges_of(&ids[0], Direction::Outgoing, Some(&[EdgeKind::Reference]))
            .unwrap();
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].target, ids[1]);
        assert_eq!(outgoing[0].similarity, Some(0.92));
    }
}
