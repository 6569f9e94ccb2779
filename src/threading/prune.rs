//! Subject-consistency pruning.
//!
//! Removes reference edges whose endpoints talk about clearly different
//! things. Pruning only ever removes edges, so it can split a conversation
//! but never merge two.

use std::collections::HashSet;

use super::graph::ThreadGraph;

/// Below this bigram Jaccard similarity an edge is cut.
const MIN_SIMILARITY: f64 = 0.3;
/// A substring match is kept only when the shorter key is at least this long relative to the longer.
const MIN_CONTAINMENT_RATIO: f64 = 0.3;

/// Decide whether an edge between two subject compare keys survives.
pub fn keep_edge(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() || a == b {
        return true;
    }

    let len_a = a.chars().count();
    let len_b = b.chars().count();
    if a.contains(b) || b.contains(a) {
        let ratio = len_a.min(len_b) as f64 / len_a.max(len_b) as f64;
        if ratio > MIN_CONTAINMENT_RATIO {
            return true;
        }
    }

    jaccard(&bigrams(a), &bigrams(b)) >= MIN_SIMILARITY
}

fn bigrams(s: &str) -> HashSet<String> {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() < 2 {
        return HashSet::from([s.to_string()]);
    }
    chars.windows(2).map(|w| w.iter().collect()).collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Return the edges of `graph` that survive pruning, plus the number removed.
pub fn prune_edges(graph: &ThreadGraph) -> (Vec<(u32, u32)>, usize) {
    let mut kept = Vec::with_capacity(graph.edges.len());
    let mut removed = 0;
    for &(u, v) in &graph.edges {
        let (su, sv) = (
            &graph.nodes[u as usize].subject_key,
            &graph.nodes[v as usize].subject_key,
        );
        if keep_edge(su, sv) {
            kept.push((u, v));
        } else {
            removed += 1;
            log::debug!(
                "Pruned edge between messages {} and {}: '{}' vs '{}'",
                graph.nodes[u as usize].message_id,
                graph.nodes[v as usize].message_id,
                su,
                sv
            );
        }
    }
    (kept, removed)
}
