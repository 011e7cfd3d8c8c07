//! Graph transformation passes.
//!
//! - [`lse`] - load-store elimination with partial escape materialization

pub mod lse;

pub use lse::LoadStoreEliminationPass;
