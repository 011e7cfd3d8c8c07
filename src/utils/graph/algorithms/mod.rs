//! Graph algorithms for control-flow analysis.
//!
//! # Available Algorithms
//!
//! ## Traversal
//!
//! - [`postorder`] / [`reverse_postorder`] - depth-first orders (the elimination
//!   pass visits blocks in reverse postorder)
//! - [`reachable_from`] / [`reaching`] - forward and backward reachability
//! - [`transitive_successors`] - all-pairs path existence
//!
//! ## Dominator Analysis
//!
//! - [`compute_dominators`] - dominator tree (Cooper-Harvey-Kennedy)
//! - [`compute_dominance_frontiers`] - dominance frontiers
//! - [`DominatorTree`] - result of dominator computation
//!
//! | Algorithm | Time Complexity | Use Case |
//! |-----------|-----------------|----------|
//! | Postorder / RPO | O(V + E) | block visiting order |
//! | Dominators | O(V + E) per sweep | loops, dominance of definitions |
//! | Transitive successors | O(V (V + E)) | execution subgraph concavity, path queries |

mod dominators;
mod traversal;

pub use dominators::{compute_dominance_frontiers, compute_dominators, DominatorTree};
pub use traversal::{postorder, reachable_from, reaching, reverse_postorder, transitive_successors};
