//! Graph abstractions shared by the control-flow analyses.
//!
//! The control-flow graph of a method lives inside [`crate::ir::Graph`]; this
//! module provides the vocabulary ([`NodeId`] and the adjacency traits) and the
//! generic algorithms that run over it: traversal orders, dominator trees and
//! reachability.
//!
//! # Key Components
//!
//! - [`NodeId`] - Strongly-typed node identifier
//! - [`GraphBase`], [`Successors`], [`Predecessors`], [`RootedGraph`] - adjacency traits
//! - [`algorithms`] - Graph algorithms (traversal, dominators, reachability)

pub mod algorithms;
mod node;
mod traits;

pub use node::NodeId;
pub use traits::{GraphBase, Predecessors, RootedGraph, Successors};

#[cfg(test)]
pub(crate) mod testing {
    //! A small adjacency-list graph used by the algorithm tests.

    use super::{GraphBase, NodeId, Predecessors, RootedGraph, Successors};

    pub struct TestGraph {
        pub succs: Vec<Vec<usize>>,
        pub preds: Vec<Vec<usize>>,
    }

    impl TestGraph {
        pub fn new(node_count: usize, edges: &[(usize, usize)]) -> Self {
            let mut succs = vec![Vec::new(); node_count];
            let mut preds = vec![Vec::new(); node_count];
            for &(from, to) in edges {
                succs[from].push(to);
                preds[to].push(from);
            }
            Self { succs, preds }
        }
    }

    impl GraphBase for TestGraph {
        fn node_count(&self) -> usize {
            self.succs.len()
        }
    }

    impl Successors for TestGraph {
        fn successors(&self, node: NodeId) -> impl Iterator<Item = NodeId> {
            self.succs[node.index()].iter().copied().map(NodeId::new)
        }
    }

    impl Predecessors for TestGraph {
        fn predecessors(&self, node: NodeId) -> impl Iterator<Item = NodeId> {
            self.preds[node.index()].iter().copied().map(NodeId::new)
        }
    }

    impl RootedGraph for TestGraph {
        fn entry(&self) -> NodeId {
            NodeId::new(0)
        }
    }
}
