//! Connected components over the pruned graph and their reconciliation with
//! persisted thread assignments.

use std::collections::HashSet;

use crate::db::{DbError, LeadDb};

use super::graph::{GraphNode, ThreadGraph};

/// Disjoint-set forest over dense node indices (path halving, union by size).
pub struct UnionFind {
    parent: Vec<u32>,
    size: Vec<u32>,
}

impl UnionFind {
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n as u32).collect(),
            size: vec![1; n],
        }
    }

    pub fn find(&mut self, mut x: u32) -> u32 {
        while self.parent[x as usize] != x {
            let grandparent = self.parent[self.parent[x as usize] as usize];
            self.parent[x as usize] = grandparent;
            x = grandparent;
        }
        x
    }

    pub fn union(&mut self, a: u32, b: u32) {
        let (mut ra, mut rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        if self.size[ra as usize] < self.size[rb as usize] {
            std::mem::swap(&mut ra, &mut rb);
        }
        self.parent[rb as usize] = ra;
        self.size[ra as usize] += self.size[rb as usize];
    }
}

/// Group nodes into connected components.
///
/// Members of each component are sorted by `(sent_at, message_id)`, so the
/// first member is the leader. Components are ordered by their leader the
/// same way, which fixes which component wins a contested thread id.
pub fn partition(nodes: &[GraphNode], edges: &[(u32, u32)]) -> Vec<Vec<u32>> {
    let mut uf = UnionFind::new(nodes.len());
    for &(u, v) in edges {
        uf.union(u, v);
    }

    let mut root_slot: Vec<Option<usize>> = vec![None; nodes.len()];
    let mut components: Vec<Vec<u32>> = Vec::new();
    for idx in 0..nodes.len() as u32 {
        let root = uf.find(idx) as usize;
        let slot = *root_slot[root].get_or_insert_with(|| {
            components.push(Vec::new());
            components.len() - 1
        });
        components[slot].push(idx);
    }

    let order_key = |idx: &u32| {
        let node = &nodes[*idx as usize];
        (node.sent_at.clone(), node.message_id)
    };
    for component in &mut components {
        component.sort_by_key(order_key);
    }
    components.sort_by_key(|c| order_key(&c[0]));
    components
}

/// Outcome counts of one reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileStats {
    pub components: usize,
    pub threads_reused: usize,
    pub threads_created: usize,
    pub threads_deleted: usize,
    pub messages_moved: usize,
}

/// Map every component onto one thread and rewrite message assignments.
///
/// A component reuses its leader's current thread unless an earlier component
/// already claimed it; otherwise a new thread is allocated. Afterwards empty
/// threads are deleted and counts recomputed. Must run inside a transaction.
pub fn reconcile(
    db: &LeadDb,
    graph: &ThreadGraph,
    components: &[Vec<u32>],
) -> Result<ReconcileStats, DbError> {
    let mut stats = ReconcileStats {
        components: components.len(),
        ..Default::default()
    };
    let mut claimed: HashSet<i64> = HashSet::with_capacity(components.len());

    for component in components {
        let leader = &graph.nodes[component[0] as usize];
        let target = if claimed.contains(&leader.thread_id) {
            stats.threads_created += 1;
            db.create_thread(leader.contact_id, leader.subject.as_deref())?
        } else {
            stats.threads_reused += 1;
            db.update_thread_owner(leader.thread_id, leader.contact_id, leader.subject.as_deref())?;
            leader.thread_id
        };
        claimed.insert(target);

        for &idx in component {
            let node = &graph.nodes[idx as usize];
            if node.thread_id != target {
                db.assign_message_thread(node.message_id, target)?;
                stats.messages_moved += 1;
            }
        }
    }

    stats.threads_deleted = db.delete_empty_threads()?;
    db.refresh_thread_stats()?;
    Ok(stats)
}
