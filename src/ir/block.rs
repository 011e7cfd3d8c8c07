//! Basic blocks of the control-flow graph.

use crate::ir::{BlockId, InstId};

/// A basic block: phis, then a straight-line instruction list ending in a terminator.
///
/// Predecessor order is significant: the `n`-th input of every phi in the
/// block flows in from the `n`-th predecessor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BasicBlock {
    pub(crate) id: BlockId,
    pub(crate) predecessors: Vec<BlockId>,
    pub(crate) successors: Vec<BlockId>,
    pub(crate) phis: Vec<InstId>,
    pub(crate) instructions: Vec<InstId>,
}

impl BasicBlock {
    pub(crate) fn new(id: BlockId) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// The arena index of this block.
    #[must_use]
    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Predecessors in phi-input order.
    #[must_use]
    pub fn predecessors(&self) -> &[BlockId] {
        &self.predecessors
    }

    /// Successors; for an `If` terminator the true target comes first.
    #[must_use]
    pub fn successors(&self) -> &[BlockId] {
        &self.successors
    }

    /// The phis at the start of the block.
    #[must_use]
    pub fn phis(&self) -> &[InstId] {
        &self.phis
    }

    /// The non-phi instructions, terminator last.
    #[must_use]
    pub fn instructions(&self) -> &[InstId] {
        &self.instructions
    }

    /// The last instruction, which is the terminator of a well-formed block.
    #[must_use]
    pub fn last(&self) -> Option<InstId> {
        self.instructions.last().copied()
    }

    /// Index of `pred` in the predecessor list.
    #[must_use]
    pub fn predecessor_index(&self, pred: BlockId) -> Option<usize> {
        self.predecessors.iter().position(|&p| p == pred)
    }

    /// Phis followed by the other instructions.
    pub fn all_instructions(&self) -> impl Iterator<Item = InstId> + '_ {
        self.phis.iter().chain(self.instructions.iter()).copied()
    }
}

impl Default for BlockId {
    fn default() -> Self {
        BlockId::new(0)
    }
}
