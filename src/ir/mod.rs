//! The SSA instruction graph.
//!
//! A method is a [`Graph`] of [`BasicBlock`]s holding [`Instruction`]s, all
//! stored in arenas and addressed by [`BlockId`] and [`InstId`]. Every
//! instruction carries an [`Op`] from a closed set; operands are instruction
//! ids and the graph maintains exact use lists.
//!
//! # Key Components
//!
//! - [`Graph`] - Arena, use lists and all mutation primitives
//! - [`GraphBuilder`] - Declarative construction for tests and front ends
//! - [`ControlFlowInfo`] - Reverse post-order, dominators, loops, reachability
//! - [`verify`] - Structural invariants checked after construction and passes
//! - [`dump`] - Line-oriented textual form
//! - [`Interpreter`] - Reference semantics used by the differential tests

mod block;
pub mod builder;
pub mod cfg;
pub mod dump;
mod graph;
mod instruction;
pub mod interp;
pub mod loops;
#[allow(missing_docs)]
mod ops;
mod types;
pub mod verify;

pub use block::BasicBlock;
pub use builder::{BlockBuilder, FunctionBuilder, GraphBuilder};
pub use cfg::ControlFlowInfo;
pub use dump::{dump, dump_stage};
pub use graph::Graph;
pub use instruction::Instruction;
pub use interp::{Completion, ExceptionKind, Heap, Interpreter, Observation, SnapValue, Value};
pub use loops::{LoopForest, LoopInfo};
pub use ops::{BinaryOp, Condition, Op, OpKind, SideEffects, UnaryOp};
pub use types::{BlockId, ClassId, ClassInfo, ConstValue, DataType, FieldId, FieldInfo, InstId};
pub use verify::verify;
