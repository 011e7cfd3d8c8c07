//! Depth-first traversal orders.
//!
//! All traversals are iterative so that deeply nested control flow cannot
//! exhaust the native stack, and successors are visited in the order the graph
//! reports them, which makes every order deterministic for a given graph.

use crate::utils::{
    graph::{NodeId, Predecessors, Successors},
    BitSet,
};

/// Computes the depth-first postorder of all nodes reachable from `start`.
///
/// A node is emitted after all of its unvisited successors. Returns an empty
/// vector when `start` is not a valid node.
///
/// # Examples
///
/// ```rust,ignore
/// // 0 -> 1 -> 2, 0 -> 2
/// let order = postorder(&graph, NodeId::new(0));
/// assert_eq!(order, vec![NodeId::new(2), NodeId::new(1), NodeId::new(0)]);
/// ```
#[allow(clippy::items_after_statements)]
pub fn postorder<G: Successors>(graph: &G, start: NodeId) -> Vec<NodeId> {
    let node_count = graph.node_count();
    if start.index() >= node_count {
        return Vec::new();
    }

    #[derive(Clone, Copy)]
    enum Step {
        Enter,
        Exit,
    }

    let mut visited = BitSet::new(node_count);
    let mut order = Vec::with_capacity(node_count);
    let mut stack = vec![(start, Step::Enter)];

    while let Some((node, step)) = stack.pop() {
        match step {
            Step::Enter => {
                if !visited.insert(node.index()) {
                    continue;
                }
                stack.push((node, Step::Exit));

                let successors: Vec<NodeId> = graph.successors(node).collect();
                for &succ in successors.iter().rev() {
                    if !visited.contains(succ.index()) {
                        stack.push((succ, Step::Enter));
                    }
                }
            }
            Step::Exit => order.push(node),
        }
    }

    order
}

/// Computes the reverse postorder of all nodes reachable from `start`.
///
/// In reverse postorder every node appears before its successors, except for
/// the targets of back edges. For a reducible control-flow graph this means all
/// forward predecessors of a block are visited before the block itself.
pub fn reverse_postorder<G: Successors>(graph: &G, start: NodeId) -> Vec<NodeId> {
    let mut order = postorder(graph, start);
    order.reverse();
    order
}

/// Returns the set of nodes reachable from `start` by following successor edges.
///
/// `start` is always part of the result when it is a valid node.
pub fn reachable_from<G: Successors>(graph: &G, start: NodeId) -> BitSet {
    let mut seen = BitSet::new(graph.node_count());
    if start.index() >= graph.node_count() {
        return seen;
    }
    let mut worklist = vec![start];
    seen.insert(start.index());
    while let Some(node) = worklist.pop() {
        for succ in graph.successors(node) {
            if seen.insert(succ.index()) {
                worklist.push(succ);
            }
        }
    }
    seen
}

/// Returns the set of nodes from which any of `targets` can be reached.
///
/// Walks predecessor edges backwards; the targets themselves are included.
pub fn reaching<G: Predecessors>(graph: &G, targets: impl IntoIterator<Item = NodeId>) -> BitSet {
    let mut seen = BitSet::new(graph.node_count());
    let mut worklist: Vec<NodeId> = targets
        .into_iter()
        .filter(|t| t.index() < graph.node_count())
        .collect();
    for target in &worklist {
        seen.insert(target.index());
    }
    while let Some(node) = worklist.pop() {
        for pred in graph.predecessors(node) {
            if seen.insert(pred.index()) {
                worklist.push(pred);
            }
        }
    }
    seen
}

/// Computes, for every node, the set of nodes reachable through at least one edge.
///
/// Entry `n` of the result contains `m` iff there is a non-empty path `n -> .. -> m`.
/// A node is therefore in its own set only when it lies on a cycle.
pub fn transitive_successors<G: Successors>(graph: &G) -> Vec<BitSet> {
    let node_count = graph.node_count();
    (0..node_count)
        .map(|index| {
            let mut seen = BitSet::new(node_count);
            let mut worklist: Vec<NodeId> = graph.successors(NodeId::new(index)).collect();
            for succ in &worklist {
                seen.insert(succ.index());
            }
            while let Some(node) = worklist.pop() {
                for succ in graph.successors(node) {
                    if seen.insert(succ.index()) {
                        worklist.push(succ);
                    }
                }
            }
            seen
        })
        .collect()
}
