//! Analyses over the instruction graph.
//!
//! The analysis module is organized into focused sub-modules:
//!
//! - [`escape`] - how far each allocated reference escapes
//! - [`subgraph`] - the part of the CFG on which a partially escaping
//!   allocation has not escaped yet
//! - [`heap`] - heap locations, reference facts and the may-alias relation
//!
//! # Usage
//!
//! ```rust,ignore
//! use heapscope::analysis::{CollectorOptions, HeapLocationCollector};
//! use heapscope::ir::ControlFlowInfo;
//!
//! let cfg = ControlFlowInfo::compute(&graph);
//! let collector = HeapLocationCollector::collect(&graph, &cfg, CollectorOptions::default())?;
//! for (i, location) in collector.locations().iter().enumerate() {
//!     println!("{i}: {location:?}");
//! }
//! ```

pub mod escape;
pub mod heap;
pub mod subgraph;

pub use escape::{calculate_escape, does_not_escape, EscapeInfo, EscapeKind};
pub use heap::{
    CollectorOptions, HeapLocation, HeapLocationCollector, LocationKind, ReferenceInfo, SkipReason,
};
pub use subgraph::{ExcludedCohort, ExecutionSubgraph};
