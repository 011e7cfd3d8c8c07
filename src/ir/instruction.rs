//! Instructions stored in the graph arena.

use crate::ir::{BlockId, ClassId, DataType, InstId, Op};

/// A single instruction of the graph.
///
/// Instructions are owned by [`crate::ir::Graph`] and addressed by [`InstId`].
/// An instruction that has been removed keeps its arena slot but no longer
/// belongs to a block.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub(crate) id: InstId,
    pub(crate) block: Option<BlockId>,
    pub(crate) op: Op,
    pub(crate) ty: DataType,
    pub(crate) class: Option<ClassId>,
}

impl Instruction {
    pub(crate) fn new(id: InstId, op: Op, ty: DataType) -> Self {
        Self {
            id,
            block: None,
            op,
            ty,
            class: None,
        }
    }

    /// The arena index of this instruction.
    #[must_use]
    pub fn id(&self) -> InstId {
        self.id
    }

    /// The block containing this instruction, `None` once removed.
    #[must_use]
    pub fn block(&self) -> Option<BlockId> {
        self.block
    }

    /// The operation performed.
    #[must_use]
    pub fn op(&self) -> &Op {
        &self.op
    }

    /// The type of the produced value, `Void` if none.
    #[must_use]
    pub fn ty(&self) -> DataType {
        self.ty
    }

    /// Static class of a reference value, if known.
    #[must_use]
    pub fn class(&self) -> Option<ClassId> {
        self.class
    }

    /// Returns `true` once the instruction has been removed from the graph.
    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.block.is_none()
    }

    /// Shorthand for [`Op::inputs`].
    #[must_use]
    pub fn inputs(&self) -> Vec<InstId> {
        self.op.inputs()
    }
}
