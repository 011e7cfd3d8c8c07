//! # heapscope Prelude
//!
//! This module provides a convenient prelude for the most commonly used types and traits
//! from the heapscope library. Import this module to get quick access to the essential
//! types for building graphs and running the passes over them.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all heapscope operations
pub use crate::Error;

/// The result type used throughout heapscope
pub use crate::Result;

// ================================================================================================
// Instruction Graph
// ================================================================================================

/// Graph, builder and the identifiers of its parts
pub use crate::ir::{
    BlockId, ClassId, ConstValue, ControlFlowInfo, DataType, FieldId, Graph, GraphBuilder, InstId,
    Op,
};

/// Verification, dumps and differential execution
pub use crate::ir::{dump, dump_stage, verify, Interpreter, Observation};

// ================================================================================================
// Analyses
// ================================================================================================

/// Escape facts and heap locations
pub use crate::analysis::{CollectorOptions, EscapeKind, HeapLocationCollector};

// ================================================================================================
// Pipeline
// ================================================================================================

/// Running passes and inspecting what they did
pub use crate::compiler::{
    CompilerConfig, CompilerContext, EventKind, EventLog, LoadStoreEliminationPass, PassScheduler,
    SsaPass,
};
