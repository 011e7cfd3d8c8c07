//! Dominator tree computation.
//!
//! A node `d` **dominates** a node `n` if every path from the entry node to `n`
//! must pass through `d`. The **immediate dominator** of `n` is the unique
//! strict dominator of `n` that does not strictly dominate any other strict
//! dominator of `n`. The elimination pass uses dominance to place type
//! conversions, to decide whether an existing instruction can stand in for a
//! removed load, and the loop analysis uses it to find back edges.
//!
//! # Algorithm
//!
//! This implementation uses the iterative algorithm of Cooper, Harvey and
//! Kennedy ("A Simple, Fast Dominance Algorithm"): immediate dominators are
//! refined in reverse postorder until a fixpoint is reached, intersecting the
//! current candidates of already-processed predecessors by walking up the
//! partially built tree using postorder numbers. Method-sized graphs converge
//! in two or three sweeps.

use crate::utils::graph::{
    algorithms::traversal::postorder, NodeId, Predecessors, RootedGraph, Successors,
};

/// Result of dominator tree computation.
///
/// Nodes unreachable from the entry have no immediate dominator and are
/// dominated by nothing but themselves.
///
/// # Examples
///
/// ```rust,ignore
/// // Diamond: 0 -> {1, 2} -> 3
/// let tree = compute_dominators(&graph);
/// assert_eq!(tree.immediate_dominator(NodeId::new(3)), Some(NodeId::new(0)));
/// assert!(!tree.dominates(NodeId::new(1), NodeId::new(3)));
/// ```
#[derive(Debug, Clone)]
pub struct DominatorTree {
    entry: NodeId,
    /// Immediate dominator per node; the entry maps to itself, unreachable nodes to `None`.
    idom: Vec<Option<NodeId>>,
    /// Depth in the dominator tree, entry is 0.
    depth: Vec<usize>,
}

impl DominatorTree {
    /// Returns the entry (root) node of the dominator tree.
    #[inline]
    #[must_use]
    pub fn entry(&self) -> NodeId {
        self.entry
    }

    /// Returns the immediate dominator of a node, or `None` for the entry and
    /// unreachable nodes.
    #[must_use]
    pub fn immediate_dominator(&self, node: NodeId) -> Option<NodeId> {
        if node == self.entry {
            return None;
        }
        self.idom.get(node.index()).copied().flatten()
    }

    /// Returns `true` if `node` is reachable from the entry.
    #[must_use]
    pub fn is_reachable(&self, node: NodeId) -> bool {
        matches!(self.idom.get(node.index()), Some(Some(_)))
    }

    /// Checks if node `a` dominates node `b`. A node dominates itself.
    ///
    /// # Complexity
    ///
    /// O(depth(b) - depth(a)), walking the tree upwards from `b`.
    #[must_use]
    pub fn dominates(&self, a: NodeId, b: NodeId) -> bool {
        if a == b {
            return true;
        }
        if !self.is_reachable(a) || !self.is_reachable(b) {
            return false;
        }
        let target_depth = self.depth[a.index()];
        let mut current = b;
        while self.depth[current.index()] > target_depth {
            match self.immediate_dominator(current) {
                Some(parent) => current = parent,
                None => return false,
            }
        }
        current == a
    }

    /// Checks if node `a` strictly dominates node `b`.
    #[inline]
    #[must_use]
    pub fn strictly_dominates(&self, a: NodeId, b: NodeId) -> bool {
        a != b && self.dominates(a, b)
    }

    /// Returns the depth of a node in the dominator tree. The entry node has depth 0.
    #[must_use]
    pub fn depth(&self, node: NodeId) -> usize {
        self.depth.get(node.index()).copied().unwrap_or(0)
    }

    /// Returns all children of a node in the dominator tree, in ascending order.
    #[must_use]
    pub fn children(&self, node: NodeId) -> Vec<NodeId> {
        (0..self.idom.len())
            .map(NodeId::new)
            .filter(|&n| n != self.entry && self.idom[n.index()] == Some(node))
            .collect()
    }

    /// Returns the number of nodes covered by the tree.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.idom.len()
    }
}

/// Computes the dominator tree for a rooted graph.
///
/// # Arguments
///
/// * `graph` - The graph to analyze, its [`RootedGraph::entry`] is the root
///
/// # Returns
///
/// A `DominatorTree` covering every node of the graph.
pub fn compute_dominators<G>(graph: &G) -> DominatorTree
where
    G: RootedGraph + Predecessors,
{
    let node_count = graph.node_count();
    let entry = graph.entry();
    let mut idom: Vec<Option<NodeId>> = vec![None; node_count];
    if entry.index() >= node_count {
        return DominatorTree {
            entry,
            idom,
            depth: vec![0; node_count],
        };
    }

    let order = postorder(graph, entry);
    let mut po_number = vec![usize::MAX; node_count];
    for (number, node) in order.iter().enumerate() {
        po_number[node.index()] = number;
    }

    idom[entry.index()] = Some(entry);
    let mut changed = true;
    while changed {
        changed = false;
        for &node in order.iter().rev() {
            if node == entry {
                continue;
            }
            let mut candidate: Option<NodeId> = None;
            for pred in graph.predecessors(node) {
                if idom[pred.index()].is_none() {
                    continue;
                }
                candidate = Some(match candidate {
                    None => pred,
                    Some(current) => intersect(&idom, &po_number, pred, current),
                });
            }
            if candidate.is_some() && idom[node.index()] != candidate {
                idom[node.index()] = candidate;
                changed = true;
            }
        }
    }

    let mut depth = vec![0; node_count];
    for &node in order.iter().rev() {
        if node != entry {
            if let Some(parent) = idom[node.index()] {
                depth[node.index()] = depth[parent.index()] + 1;
            }
        }
    }

    DominatorTree { entry, idom, depth }
}

/// Finds the nearest common ancestor of two nodes in the partial dominator tree.
fn intersect(idom: &[Option<NodeId>], po_number: &[usize], a: NodeId, b: NodeId) -> NodeId {
    let mut finger_a = a;
    let mut finger_b = b;
    while finger_a != finger_b {
        while po_number[finger_a.index()] < po_number[finger_b.index()] {
            finger_a = idom[finger_a.index()].unwrap_or(finger_b);
        }
        while po_number[finger_b.index()] < po_number[finger_a.index()] {
            finger_b = idom[finger_b.index()].unwrap_or(finger_a);
        }
    }
    finger_a
}

/// Computes the dominance frontier of every node.
///
/// The frontier of `n` contains the merge points where the dominance of `n`
/// ends. Used to place merge phis when rewriting partially escaping
/// allocations.
pub fn compute_dominance_frontiers<G>(graph: &G, tree: &DominatorTree) -> Vec<Vec<NodeId>>
where
    G: Successors + Predecessors,
{
    let node_count = graph.node_count();
    let mut frontiers: Vec<Vec<NodeId>> = vec![Vec::new(); node_count];
    for index in 0..node_count {
        let node = NodeId::new(index);
        if !tree.is_reachable(node) {
            continue;
        }
        let preds: Vec<NodeId> = graph
            .predecessors(node)
            .filter(|p| tree.is_reachable(*p))
            .collect();
        if preds.len() < 2 {
            continue;
        }
        let Some(idom) = tree.immediate_dominator(node) else {
            continue;
        };
        for pred in preds {
            let mut runner = pred;
            while runner != idom {
                if !frontiers[runner.index()].contains(&node) {
                    frontiers[runner.index()].push(node);
                }
                match tree.immediate_dominator(runner) {
                    Some(parent) => runner = parent,
                    None => break,
                }
            }
        }
    }
    for frontier in &mut frontiers {
        frontier.sort();
    }
    frontiers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::graph::testing::TestGraph;

    fn n(index: usize) -> NodeId {
        NodeId::new(index)
    }

    #[test]
    fn diamond() {
        let graph = TestGraph::new(4, &[(0, 1), (0, 2), (1, 3), (2, 3)]);
        let tree = compute_dominators(&graph);
        assert_eq!(tree.immediate_dominator(n(0)), None);
        assert_eq!(tree.immediate_dominator(n(1)), Some(n(0)));
        assert_eq!(tree.immediate_dominator(n(3)), Some(n(0)));
        assert!(tree.dominates(n(0), n(3)));
        assert!(!tree.dominates(n(1), n(3)));
        assert!(tree.strictly_dominates(n(0), n(1)));
        assert!(!tree.strictly_dominates(n(1), n(1)));
        assert_eq!(tree.children(n(0)), vec![n(1), n(2), n(3)]);
        assert_eq!(tree.depth(n(3)), 1);
    }

    #[test]
    fn loop_with_exit() {
        // 0 -> 1 -> 2 -> 1, 2 -> 3
        let graph = TestGraph::new(4, &[(0, 1), (1, 2), (2, 1), (2, 3)]);
        let tree = compute_dominators(&graph);
        assert_eq!(tree.immediate_dominator(n(2)), Some(n(1)));
        assert_eq!(tree.immediate_dominator(n(3)), Some(n(2)));
        assert!(tree.dominates(n(1), n(3)));
        assert_eq!(tree.depth(n(3)), 3);
    }

    #[test]
    fn unreachable_node() {
        let graph = TestGraph::new(3, &[(0, 1), (2, 1)]);
        let tree = compute_dominators(&graph);
        assert!(!tree.is_reachable(n(2)));
        assert_eq!(tree.immediate_dominator(n(1)), Some(n(0)));
        assert!(!tree.dominates(n(2), n(1)));
    }

    #[test]
    fn frontiers_of_diamond() {
        let graph = TestGraph::new(4, &[(0, 1), (0, 2), (1, 3), (2, 3)]);
        let tree = compute_dominators(&graph);
        let frontiers = compute_dominance_frontiers(&graph, &tree);
        assert_eq!(frontiers[1], vec![n(3)]);
        assert_eq!(frontiers[2], vec![n(3)]);
        assert!(frontiers[0].is_empty());
        assert!(frontiers[3].is_empty());
    }
}
