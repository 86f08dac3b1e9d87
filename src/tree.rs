/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The vote aggregation overlay: a rooted tree over the replica set.
//!
//! Replica 0 is the root. Every replica deterministically computes the same tree from the
//! canonical replica ordering and the configured `fanout`, so no coordination is needed at
//! bootstrap: proposals flow down parent-to-children edges, votes and vote relays flow up
//! child-to-parent edges, and connections are only established along those edges.
//!
//! # Shape
//!
//! Replicas are assigned breadth-first: level `l` nominally holds `fanout^l` replicas. When the
//! replicas remaining for the last level are fewer than the level's nominal capacity, the
//! per-parent fanout is re-divided so the stragglers spread evenly over the remaining parents of
//! the previous level. Internal nodes therefore have between `⌊r/p⌋` and `fanout` children, and
//! all leaves sit on the last two levels.
//!
//! `fanout >= n` degenerates to a star: every replica is a direct child of the root, which is the
//! plain HotStuff topology.

use crate::types::basic::ReplicaID;

/// One replica's view of the aggregation tree: its parent, its direct children, and the count of
/// its transitive descendants.
#[derive(Clone)]
pub struct TreeOverlay {
    id: ReplicaID,
    parent: Option<ReplicaID>,
    children: Vec<ReplicaID>,
    descendants: usize,
}

impl TreeOverlay {
    /// Compute the overlay for replica `id` in a set of `n` replicas with the given `fanout`.
    ///
    /// # Panics
    ///
    /// Panics if `n` is 0, `fanout` is 0, or `id` is not in `0..n`.
    pub fn build(n: usize, fanout: usize, id: ReplicaID) -> TreeOverlay {
        assert!(n > 0 && fanout > 0 && id.as_index() < n);

        let parents = parent_assignment(n, fanout);

        let parent = parents[id.as_index()].map(|p| ReplicaID::new(p as u8));
        let children: Vec<ReplicaID> = (0..n)
            .filter(|i| parents[*i] == Some(id.as_index()))
            .map(|i| ReplicaID::new(i as u8))
            .collect();

        // Transitive closure over the descendant relation. Parents always precede their children
        // in the canonical order, so one forward pass suffices.
        let mut is_descendant = vec![false; n];
        for i in 1..n {
            if let Some(p) = parents[i] {
                if p == id.as_index() || is_descendant[p] {
                    is_descendant[i] = true;
                }
            }
        }
        let descendants = is_descendant.iter().filter(|d| **d).count();

        TreeOverlay {
            id,
            parent,
            children,
            descendants,
        }
    }

    pub fn id(&self) -> ReplicaID {
        self.id
    }

    /// The parent of this replica in the tree. `None` for the root.
    pub fn parent(&self) -> Option<ReplicaID> {
        self.parent
    }

    /// The direct children of this replica, in canonical order.
    pub fn children(&self) -> &[ReplicaID] {
        &self.children
    }

    /// The number of transitive descendants of this replica.
    ///
    /// An internal node is responsible for aggregating one partial signature from each of its
    /// descendants plus its own, so its relay threshold is `descendant_count() + 1`.
    pub fn descendant_count(&self) -> usize {
        self.descendants
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Compute the parent of every replica. `assignment[0]` is `None`; `assignment[i]` for `i > 0` is
/// the index of `i`'s parent, which is always smaller than `i`.
pub(crate) fn parent_assignment(n: usize, fanout: usize) -> Vec<Option<usize>> {
    let mut assignment: Vec<Option<usize>> = vec![None; n];

    let mut parent = 0usize;
    let mut level = 0u32;
    let mut max_fanout = fanout;
    let mut current_children = 0usize;
    let mut pre_level = 0usize;

    for i in 0..n {
        let remaining = n - i;
        let processes_on_level = fanout.pow(level);

        if i != 0 {
            current_children += 1;
        }
        if current_children > max_fanout {
            parent += 1;
            current_children = 1;
        }

        // Re-divide the last level: when fewer replicas remain than the level nominally holds,
        // spread them evenly over the parents of the previous level that still lack children.
        if fanout < n && level >= 1 && current_children == 1 && processes_on_level > remaining {
            let previous: usize = (0..level - 1).map(|l| fanout.pow(l)).sum();
            let done_parents = parent - previous;
            let parents_on_prev = fanout.pow(level - 1);
            if parents_on_prev > done_parents {
                max_fanout = (remaining / (parents_on_prev - done_parents)).max(1);
            }
        }

        if i != 0 {
            assignment[i] = Some(parent);
        }

        if i == fanout.pow(level) + pre_level {
            pre_level = fanout.pow(level);
            level += 1;
        }
    }

    assignment
}
