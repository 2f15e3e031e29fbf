use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use arbor_core::types::{BlockHash, Level};

/// The tips a new proposal should build on: the heaviest leaf as pivot plus
/// every other leaf.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DagFrontier {
    pub pivot: BlockHash,
    pub tips: Vec<BlockHash>,
}

/// In-memory block DAG over the non-finalized region.
///
/// Two edge sets are kept: pivot edges alone form the pivot tree that ghost
/// traversal walks, while pivot + tip edges form the full graph used for
/// anchor ordering. Edges point parent → child; a vertex with no children is
/// a leaf. Vertices are only inserted once their parents are present, so the
/// graph is acyclic by construction.
pub struct Dag {
    /// All children (pivot + tip edges).
    children: HashMap<BlockHash, Vec<BlockHash>>,
    /// Children along pivot edges only.
    pivot_children: HashMap<BlockHash, Vec<BlockHash>>,
    parents: HashMap<BlockHash, Vec<BlockHash>>,
    genesis: BlockHash,
}

impl Dag {
    pub fn new(genesis: BlockHash) -> Self {
        let mut dag = Self {
            children: HashMap::new(),
            pivot_children: HashMap::new(),
            parents: HashMap::new(),
            genesis,
        };
        dag.children.insert(genesis, Vec::new());
        dag.pivot_children.insert(genesis, Vec::new());
        dag.parents.insert(genesis, Vec::new());
        dag
    }

    pub fn genesis(&self) -> BlockHash {
        self.genesis
    }

    pub fn has_vertex(&self, hash: &BlockHash) -> bool {
        self.children.contains_key(hash)
    }

    pub fn vertex_count(&self) -> usize {
        self.children.len()
    }

    /// Insert a vertex. All parents must already be present and the hash must
    /// be new; returns false otherwise.
    pub fn add_vertex(&mut self, hash: BlockHash, pivot: BlockHash, tips: &[BlockHash]) -> bool {
        if self.has_vertex(&hash) {
            return false;
        }
        if !self.has_vertex(&pivot) || tips.iter().any(|t| !self.has_vertex(t)) {
            return false;
        }

        self.children.insert(hash, Vec::new());
        self.pivot_children.insert(hash, Vec::new());

        let mut parents = Vec::with_capacity(1 + tips.len());
        self.children.get_mut(&pivot).expect("pivot checked").push(hash);
        self.pivot_children
            .get_mut(&pivot)
            .expect("pivot checked")
            .push(hash);
        parents.push(pivot);
        for tip in tips {
            self.children.get_mut(tip).expect("tip checked").push(hash);
            parents.push(*tip);
        }
        self.parents.insert(hash, parents);
        true
    }

    /// Vertices with out-degree zero, in ascending hash order.
    pub fn leaves(&self) -> Vec<BlockHash> {
        let mut out: Vec<BlockHash> = self
            .children
            .iter()
            .filter(|(_, ch)| ch.is_empty())
            .map(|(h, _)| *h)
            .collect();
        out.sort();
        out
    }

    /// Whether `to` is reachable from `from` along child edges, i.e. `from`
    /// is an ancestor of `to` (or equal).
    pub fn reachable(&self, from: &BlockHash, to: &BlockHash) -> bool {
        if from == to {
            return true;
        }
        let mut stack = vec![*from];
        let mut visited = HashSet::new();
        visited.insert(*from);
        while let Some(cur) = stack.pop() {
            for child in self.children.get(&cur).into_iter().flatten() {
                if child == to {
                    return true;
                }
                if visited.insert(*child) {
                    stack.push(*child);
                }
            }
        }
        false
    }

    /// Heaviest-subtree path from `root` down the pivot tree.
    ///
    /// Subtree weights are accumulated in post order (weight = 1 + Σ child
    /// weights); descent picks the heaviest child, breaking ties toward the
    /// smaller hash, so every node computes the identical path.
    pub fn ghost_path(&self, root: &BlockHash) -> Vec<BlockHash> {
        let mut path = Vec::new();
        if !self.has_vertex(root) {
            return path;
        }

        // Pre-order collection, reversed, puts every child before its parent.
        let mut order = Vec::new();
        let mut stack = vec![*root];
        while let Some(cur) = stack.pop() {
            order.push(cur);
            for child in self.pivot_children.get(&cur).into_iter().flatten() {
                stack.push(*child);
            }
        }
        order.reverse();

        let mut weight: HashMap<BlockHash, u64> = HashMap::new();
        for v in &order {
            let total: u64 = self
                .pivot_children
                .get(v)
                .into_iter()
                .flatten()
                .filter_map(|c| weight.get(c))
                .sum();
            weight.insert(*v, total + 1);
        }

        let mut cur = *root;
        loop {
            path.push(cur);
            let mut heaviest = 0u64;
            let mut next = cur;
            for child in self.pivot_children.get(&cur).into_iter().flatten() {
                let w = *weight.get(child).expect("weights cover the subtree");
                if w > heaviest || (w == heaviest && heaviest > 0 && *child < next) {
                    heaviest = w;
                    next = *child;
                }
            }
            if heaviest == 0 {
                break;
            }
            cur = next;
        }
        path
    }

    /// Deterministic total order of the non-finalized vertices that reach
    /// `anchor`, anchor included (last).
    ///
    /// Depth-first from the anchor's epoch set with children visited in
    /// ascending hash order; the reversed post order is the same on every
    /// node. Returns `None` when the anchor is unknown.
    pub fn compute_order(
        &self,
        anchor: &BlockHash,
        non_finalized: &BTreeMap<Level, HashSet<BlockHash>>,
    ) -> Option<Vec<BlockHash>> {
        if !self.has_vertex(anchor) {
            return None;
        }

        // Epoch set: everything non-finalized that is an ancestor of the
        // anchor, plus the anchor itself. BTreeSet fixes the scan order.
        let mut epoch: BTreeSet<BlockHash> = BTreeSet::new();
        epoch.insert(*anchor);
        for level in non_finalized.values() {
            for blk in level {
                if self.has_vertex(blk) && self.reachable(blk, anchor) {
                    epoch.insert(*blk);
                }
            }
        }

        let mut ordered = Vec::with_capacity(epoch.len());
        let mut visited: HashSet<BlockHash> = HashSet::new();
        let mut stack: Vec<(BlockHash, bool)> = Vec::new();

        for start in &epoch {
            if visited.contains(start) {
                continue;
            }
            stack.push((*start, false));
            visited.insert(*start);
            while let Some((cur, expanded)) = stack.pop() {
                if expanded {
                    ordered.push(cur);
                    continue;
                }
                stack.push((cur, true));
                let mut neighbors: Vec<BlockHash> = self
                    .children
                    .get(&cur)
                    .into_iter()
                    .flatten()
                    .filter(|c| epoch.contains(*c) && !visited.contains(*c))
                    .copied()
                    .collect();
                neighbors.sort();
                for n in neighbors {
                    visited.insert(n);
                    stack.push((n, false));
                }
            }
        }

        ordered.reverse();
        Some(ordered)
    }

    /// Make `hash` a parentless vertex if it is not present yet. Used when a
    /// synced anchor becomes the new traversal root without ever having been
    /// admitted locally.
    pub fn ensure_root(&mut self, hash: BlockHash) {
        if !self.has_vertex(&hash) {
            self.children.insert(hash, Vec::new());
            self.pivot_children.insert(hash, Vec::new());
            self.parents.insert(hash, Vec::new());
        }
    }

    /// Remove finalized vertices and every edge touching them.
    pub fn erase(&mut self, finalized: &[BlockHash]) {
        let gone: HashSet<&BlockHash> = finalized.iter().collect();
        for hash in finalized {
            self.children.remove(hash);
            self.pivot_children.remove(hash);
            self.parents.remove(hash);
        }
        for ch in self.children.values_mut() {
            ch.retain(|c| !gone.contains(c));
        }
        for ch in self.pivot_children.values_mut() {
            ch.retain(|c| !gone.contains(c));
        }
        for ps in self.parents.values_mut() {
            ps.retain(|p| !gone.contains(p));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(n: u8) -> BlockHash {
        BlockHash::from_bytes([n; 32])
    }

    fn index_of(levels: &[(Level, &[BlockHash])]) -> BTreeMap<Level, HashSet<BlockHash>> {
        levels
            .iter()
            .map(|(l, blks)| (*l, blks.iter().copied().collect()))
            .collect()
    }

    #[test]
    fn linear_chain_order() {
        // G <- A <- B <- C, all pivot edges
        let g = h(0);
        let mut dag = Dag::new(g);
        assert!(dag.add_vertex(h(1), g, &[]));
        assert!(dag.add_vertex(h(2), h(1), &[]));
        assert!(dag.add_vertex(h(3), h(2), &[]));

        assert_eq!(dag.ghost_path(&g), vec![g, h(1), h(2), h(3)]);

        let non_finalized = index_of(&[(1, &[h(1)]), (2, &[h(2)]), (3, &[h(3)])]);
        let order = dag.compute_order(&h(3), &non_finalized).unwrap();
        assert_eq!(order, vec![h(1), h(2), h(3)]);
    }

    #[test]
    fn sibling_tie_breaks_to_smaller_hash_until_outweighed() {
        let g = h(0);
        let mut dag = Dag::new(g);
        let x = h(1);
        let y = h(2);
        assert!(x < y);
        dag.add_vertex(x, g, &[]);
        dag.add_vertex(y, g, &[]);

        // Equal weight: the smaller hash wins.
        assert_eq!(dag.ghost_path(&g), vec![g, x]);

        // Y gains a child, its subtree outweighs X.
        let y1 = h(3);
        dag.add_vertex(y1, y, &[]);
        assert_eq!(dag.ghost_path(&g), vec![g, y, y1]);
    }

    #[test]
    fn vertex_requires_known_parents() {
        let g = h(0);
        let mut dag = Dag::new(g);
        assert!(!dag.add_vertex(h(2), h(1), &[]), "unknown pivot rejected");
        assert!(dag.add_vertex(h(1), g, &[]));
        assert!(!dag.add_vertex(h(1), g, &[]), "duplicate rejected");
        assert!(!dag.add_vertex(h(3), h(1), &[h(9)]), "unknown tip rejected");
    }

    #[test]
    fn leaves_are_outdegree_zero() {
        let g = h(0);
        let mut dag = Dag::new(g);
        dag.add_vertex(h(1), g, &[]);
        dag.add_vertex(h(2), g, &[]);
        dag.add_vertex(h(3), h(1), &[h(2)]);
        assert_eq!(dag.leaves(), vec![h(3)]);
    }

    #[test]
    fn order_ignores_blocks_past_the_anchor() {
        let g = h(0);
        let mut dag = Dag::new(g);
        dag.add_vertex(h(1), g, &[]);
        dag.add_vertex(h(2), h(1), &[]);
        // side branch not reaching the anchor
        dag.add_vertex(h(5), g, &[]);

        let non_finalized = index_of(&[(1, &[h(1), h(5)]), (2, &[h(2)])]);
        let order = dag.compute_order(&h(2), &non_finalized).unwrap();
        assert_eq!(order, vec![h(1), h(2)]);
    }

    #[test]
    fn order_with_tip_edges_is_topological() {
        let g = h(0);
        let mut dag = Dag::new(g);
        dag.add_vertex(h(1), g, &[]);
        dag.add_vertex(h(2), g, &[]);
        dag.add_vertex(h(3), h(1), &[h(2)]);

        let non_finalized = index_of(&[(1, &[h(1), h(2)]), (2, &[h(3)])]);
        let order = dag.compute_order(&h(3), &non_finalized).unwrap();
        assert_eq!(order.len(), 3);
        let pos = |b: &BlockHash| order.iter().position(|x| x == b).unwrap();
        assert!(pos(&h(1)) < pos(&h(3)));
        assert!(pos(&h(2)) < pos(&h(3)));
    }

    #[test]
    fn erase_detaches_finalized_region() {
        let g = h(0);
        let mut dag = Dag::new(g);
        dag.add_vertex(h(1), g, &[]);
        dag.add_vertex(h(2), h(1), &[]);
        dag.erase(&[h(1)]);
        assert!(!dag.has_vertex(&h(1)));
        assert!(dag.has_vertex(&h(2)));
        // the pivot tree no longer descends through the erased vertex
        assert_eq!(dag.ghost_path(&g), vec![g]);
    }

    #[test]
    fn unknown_anchor_yields_none() {
        let dag = Dag::new(h(0));
        assert!(dag.compute_order(&h(9), &BTreeMap::new()).is_none());
    }

    #[test]
    fn traversals_are_insertion_order_independent() {
        // Two nodes admit the same diamond in different orders; ghost path
        // and anchor order must not differ.
        let g = h(0);
        let edges: [(BlockHash, BlockHash, &[BlockHash]); 4] = [
            (h(1), g, &[]),
            (h(2), g, &[]),
            (h(3), h(1), &[h(2)]),
            (h(4), h(3), &[]),
        ];

        let mut first = Dag::new(g);
        for (v, pivot, tips) in edges.iter() {
            assert!(first.add_vertex(*v, *pivot, tips));
        }

        let mut second = Dag::new(g);
        // siblings swapped, then the rest
        assert!(second.add_vertex(h(2), g, &[]));
        assert!(second.add_vertex(h(1), g, &[]));
        assert!(second.add_vertex(h(3), h(1), &[h(2)]));
        assert!(second.add_vertex(h(4), h(3), &[]));

        assert_eq!(first.ghost_path(&g), second.ghost_path(&g));

        let non_finalized = index_of(&[
            (1, &[h(1), h(2)]),
            (2, &[h(3)]),
            (3, &[h(4)]),
        ]);
        assert_eq!(
            first.compute_order(&h(4), &non_finalized),
            second.compute_order(&h(4), &non_finalized)
        );
    }
}
