//! Reference graph over message identities.
//!
//! Nodes live in a flat arena addressed by dense `u32` indices, one node per
//! stored message. Edges are undirected `(low, high)` index pairs, deduplicated,
//! and only ever connect two messages that are both present in the corpus.

use std::collections::HashMap;

use crate::db::GraphMessageRow;

use super::normalize::{normalize_message_id, subject_compare_key};

/// One message in the graph arena.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub message_id: i64,
    pub thread_id: i64,
    pub contact_id: i64,
    pub sent_at: String,
    pub subject: Option<String>,
    /// Lower-cased, whitespace-free normalized subject used by the pruner.
    pub subject_key: String,
}

#[derive(Debug, Default)]
pub struct ThreadGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<(u32, u32)>,
    /// Records whose identifier was absent or malformed.
    pub synthetic_keys: usize,
    /// References naming identifiers outside the corpus. Never turned into edges.
    pub ghost_references: usize,
}

impl ThreadGraph {
    pub fn build(rows: Vec<GraphMessageRow>) -> Self {
        let mut graph = ThreadGraph::default();
        let mut index: HashMap<String, u32> = HashMap::with_capacity(rows.len());
        let mut pending_refs: Vec<(u32, Vec<String>)> = Vec::with_capacity(rows.len());

        for row in rows {
            let idx = graph.nodes.len() as u32;
            // Records without a usable identifier never enter the index and
            // their own headers are not followed, so they stay isolated.
            let linkable = match normalize_message_id(row.message_identifier.as_deref()) {
                Some(key) => {
                    match index.get(&key) {
                        // Same identity stored twice under different spellings.
                        Some(&existing) => graph.edges.push(ordered(existing, idx)),
                        None => {
                            index.insert(key, idx);
                        }
                    }
                    true
                }
                None => {
                    graph.synthetic_keys += 1;
                    false
                }
            };

            if linkable {
                let mut refs = Vec::with_capacity(row.references.len() + 1);
                refs.extend(row.in_reply_to.clone());
                refs.extend(row.references.iter().cloned());
                pending_refs.push((idx, refs));
            }

            graph.nodes.push(GraphNode {
                message_id: row.id,
                thread_id: row.thread_id,
                contact_id: row.contact_id,
                subject_key: subject_compare_key(row.subject.as_deref()),
                subject: row.subject,
                sent_at: row.sent_at,
            });
        }

        // Targets are resolved only after every node is known, so reference
        // order in the source does not matter.
        for (idx, refs) in pending_refs {
            for raw in refs {
                let Some(target_key) = normalize_message_id(Some(&raw)) else {
                    continue;
                };
                match index.get(&target_key) {
                    Some(&target) if target != idx => graph.edges.push(ordered(idx, target)),
                    Some(_) => {}
                    None => graph.ghost_references += 1,
                }
            }
        }

        graph.edges.sort_unstable();
        graph.edges.dedup();
        graph
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

fn ordered(a: u32, b: u32) -> (u32, u32) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}
