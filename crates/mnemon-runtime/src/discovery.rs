use crate::worker::{WorkerContext, write_embedding};
use crate::{Error, Result};
use chrono::Utc;
use mnemon_store::SearchFilters;
use mnemon_types::{Edge, EdgeCreator, EdgeKind};

const NEIGHBOR_CANDIDATES: usize = 10;
const UNRESOLVED_BATCH: usize = 32;

/// Semantic connection discovery for one node: vector-search its neighbors
/// into `semantic` edges, then try to resolve this node's parked unresolved
/// references through full-text search.
pub fn run_connection_discovery(ctx: &WorkerContext, node_id: &str) -> Result<()> {
    let node = ctx
        .store
        .get_node_document(node_id)?
        .ok_or_else(|| Error::Agent(format!("node {} not found in store", node_id)))?;

    // The embedding may be missing when an earlier run failed after commit;
    // recompute rather than fail the job.
    let embedding = match ctx.store.get_embedding(node_id)? {
        Some(record) => record,
        None => {
            write_embedding(ctx, &node)?;
            ctx.store
                .get_embedding(node_id)?
                .ok_or_else(|| Error::InvalidOperation("embedding write not visible".into()))?
        }
    };

    let neighbors = ctx.store.vector_search(
        &embedding.vector,
        NEIGHBOR_CANDIDATES + 1,
        &SearchFilters::default(),
    )?;

    let threshold = ctx.config.worker.similarity_threshold;
    let now = Utc::now();
    let mut linked = 0usize;

    for (neighbor_id, distance) in neighbors {
        if neighbor_id == node_id {
            continue;
        }
        let similarity = 1.0 - distance as f64;
        if similarity < threshold {
            continue;
        }

        let created = ctx.store.add_edge(&Edge {
            source: node_id.to_string(),
            target: neighbor_id,
            kind: EdgeKind::Semantic,
            created_by: EdgeCreator::Daemon,
            confidence: similarity,
            similarity: Some(similarity),
            unresolved_target: None,
            created_at: now,
        })?;
        if created {
            linked += 1;
        }
    }

    let resolved = resolve_unresolved_references(ctx, node_id)?;

    tracing::info!(
        node = %node_id,
        semantic_edges = linked,
        resolved_references = resolved,
        "connection discovery done"
    );

    Ok(())
}

/// Full-text match each parked reference hint against the corpus; a
/// sufficiently confident hit replaces the sentinel edge.
fn resolve_unresolved_references(ctx: &WorkerContext, node_id: &str) -> Result<usize> {
    let mut resolved = 0usize;

    for edge in ctx.store.unresolved_edges(UNRESOLVED_BATCH)? {
        if edge.source != node_id {
            continue;
        }
        let Some(hint) = edge.unresolved_target.as_deref() else {
            continue;
        };

        let hits = ctx.store.search_nodes(hint, 3, 0)?;
        let Some(best) = hits.into_iter().find(|hit| hit.node_id != node_id) else {
            continue;
        };

        if ctx
            .store
            .resolve_edge(&edge.source, edge.kind, &best.node_id, edge.confidence)?
        {
            resolved += 1;
        }
    }

    Ok(resolved)
}
