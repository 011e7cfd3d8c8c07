//! Trait definitions for graph abstractions.
//!
//! The trait hierarchy is deliberately minimal:
//!
//! - [`GraphBase`] - node count and node iteration
//! - [`Successors`] - forward edge traversal
//! - [`Predecessors`] - backward edge traversal
//! - [`RootedGraph`] - graphs with a designated entry node (for dominator computation)
//!
//! Adjacency queries return iterators so that implementors backed by plain
//! vectors (such as the basic-block lists of [`crate::ir::Graph`]) do not
//! need to allocate.

use crate::utils::graph::NodeId;

/// Base trait providing core graph properties.
pub trait GraphBase {
    /// Returns the number of nodes in the graph.
    ///
    /// Node identifiers are dense: every id in `0..node_count()` is valid.
    fn node_count(&self) -> usize;

    /// Returns an iterator over all node identifiers in the graph, in ascending order.
    fn node_ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.node_count()).map(NodeId::new)
    }
}

/// Trait for graphs that support forward edge traversal.
pub trait Successors: GraphBase {
    /// Returns an iterator over the successor nodes of the given node.
    ///
    /// The order of successors is significant for deterministic traversals.
    ///
    /// # Panics
    ///
    /// May panic if `node` is not a valid node in the graph.
    fn successors(&self, node: NodeId) -> impl Iterator<Item = NodeId>;
}

/// Trait for graphs that support backward edge traversal.
pub trait Predecessors: GraphBase {
    /// Returns an iterator over the predecessor nodes of the given node.
    ///
    /// # Panics
    ///
    /// May panic if `node` is not a valid node in the graph.
    fn predecessors(&self, node: NodeId) -> impl Iterator<Item = NodeId>;
}

/// A graph with a single designated entry node.
pub trait RootedGraph: Successors {
    /// Returns the entry node from which all analysed nodes are reachable.
    fn entry(&self) -> NodeId;
}
