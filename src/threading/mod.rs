//! Thread reconstruction: reference graph, subject pruning, components.
//!
//! The whole message set is loaded once (identifiers, references and
//! subjects only, no bodies), turned into an arena graph, pruned, split into
//! connected components and written back in a single transaction.

pub mod components;
pub mod graph;
pub mod normalize;
pub mod prune;

use serde::Serialize;

use crate::db::{DbError, LeadDb};

use self::components::{partition, reconcile};
use self::graph::ThreadGraph;
use self::prune::prune_edges;

/// Counts from one reconstruction pass.
#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadingReport {
    pub messages: usize,
    pub missing_identifiers: usize,
    pub malformed_metadata: usize,
    pub ghost_references: usize,
    pub edges: usize,
    pub edges_pruned: usize,
    pub components: usize,
    pub threads_reused: usize,
    pub threads_created: usize,
    pub threads_deleted: usize,
    pub messages_moved: usize,
}

/// Rebuild the message-to-thread assignment from header references.
pub fn reconstruct_threads(db: &LeadDb) -> Result<ThreadingReport, DbError> {
    let (rows, malformed_metadata) = db.load_graph_rows()?;
    let graph = ThreadGraph::build(rows);
    let (kept, edges_pruned) = prune_edges(&graph);
    let components = partition(&graph.nodes, &kept);

    log::info!(
        "Thread graph: {} messages, {} edges ({} pruned), {} components",
        graph.node_count(),
        graph.edges.len(),
        edges_pruned,
        components.len()
    );

    let stats = db.with_transaction(|tx| reconcile(tx, &graph, &components))?;

    log::info!(
        "Threads reconciled: {} reused, {} created, {} deleted, {} messages moved",
        stats.threads_reused,
        stats.threads_created,
        stats.threads_deleted,
        stats.messages_moved
    );

    Ok(ThreadingReport {
        messages: graph.node_count(),
        missing_identifiers: graph.synthetic_keys,
        malformed_metadata,
        ghost_references: graph.ghost_references,
        edges: graph.edges.len(),
        edges_pruned,
        components: stats.components,
        threads_reused: stats.threads_reused,
        threads_created: stats.threads_created,
        threads_deleted: stats.threads_deleted,
        messages_moved: stats.messages_moved,
    })
}
