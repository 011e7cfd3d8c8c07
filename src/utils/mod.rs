//! Shared utilities: dense bit sets and generic graph algorithms.

mod bitset;
pub mod graph;

pub use bitset::{BitSet, BitSetIter};
