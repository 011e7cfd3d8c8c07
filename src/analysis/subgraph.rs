//! Execution subgraphs for partial escape analysis.
//!
//! An [`ExecutionSubgraph`] is the part of a method's control-flow graph on
//! which an allocation does *not* escape. It starts as the whole graph; every
//! block containing an escape is removed, then the subgraph is pruned to the
//! blocks lying on some path from the entry to a method exit (a block ending
//! in `Return`, `ReturnVoid` or `Throw`).
//!
//! The removed blocks group into [`ExcludedCohort`]s: connected regions where
//! the object has escaped. A valid subgraph with at least one cohort means
//! the object escapes on some paths only.
//!
//! # Algorithm
//!
//! 1. Every block keeps a bit mask of the successor edges still allowed
//!    (blocks with more than eight successors are not analysable)
//! 2. `remove_block` clears the edges into the removed block
//! 3. `prune` keeps blocks both reachable from the entry and reaching an exit
//!    over allowed edges
//! 4. `remove_concavity` also removes blocks lying between excluded blocks,
//!    so that the object is never "un-escaped" on a path
//! 5. Cohorts are flood-filled over the removed blocks

use crate::{
    ir::{BlockId, ControlFlowInfo, Graph},
    utils::BitSet,
};

/// Maximum number of successors a block may have for the analysis to run.
pub const MAX_SUCCESSORS: usize = 8;

/// A connected region of blocks excluded from the subgraph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExcludedCohort {
    blocks: BitSet,
    entry_blocks: BitSet,
    exit_blocks: BitSet,
}

impl ExcludedCohort {
    /// Blocks of the cohort.
    #[must_use]
    pub fn blocks(&self) -> &BitSet {
        &self.blocks
    }

    /// Blocks of the cohort with a predecessor outside it.
    #[must_use]
    pub fn entry_blocks(&self) -> &BitSet {
        &self.entry_blocks
    }

    /// Blocks of the cohort with a successor outside it.
    #[must_use]
    pub fn exit_blocks(&self) -> &BitSet {
        &self.exit_blocks
    }

    /// Returns `true` if `block` is part of this cohort.
    #[must_use]
    pub fn contains_block(&self, block: BlockId) -> bool {
        self.blocks.contains(block.index())
    }

    /// Returns `true` if `block` is outside the cohort and a path leads from it
    /// into the cohort.
    #[must_use]
    pub fn succeeds_block(&self, cfg: &ControlFlowInfo, block: BlockId) -> bool {
        !self.contains_block(block)
            && self
                .entry_blocks
                .iter()
                .any(|entry| block.index() == entry || cfg.path_between(block, BlockId::new(entry)))
    }

    /// Returns `true` if `block` is outside the cohort and a path leads from
    /// the cohort to it.
    #[must_use]
    pub fn precedes_block(&self, cfg: &ControlFlowInfo, block: BlockId) -> bool {
        !self.contains_block(block)
            && self
                .exit_blocks
                .iter()
                .any(|exit| cfg.path_between(BlockId::new(exit), block))
    }
}

/// The blocks of a method on which an allocation does not escape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionSubgraph {
    successors: Vec<Vec<BlockId>>,
    predecessors: Vec<Vec<BlockId>>,
    exits: BitSet,
    allowed_successors: Vec<u8>,
    unreachable: BitSet,
    valid: bool,
    needs_prune: bool,
    cohorts: Vec<ExcludedCohort>,
}

impl ExecutionSubgraph {
    /// Creates the subgraph covering all of `graph`.
    #[must_use]
    pub fn new(graph: &Graph) -> Self {
        let block_count = graph.block_count();
        let successors: Vec<Vec<BlockId>> = graph
            .blocks()
            .map(|b| b.successors().to_vec())
            .collect();
        let predecessors = graph
            .blocks()
            .map(|b| b.predecessors().to_vec())
            .collect();
        let mut exits = BitSet::new(block_count);
        for block in graph.blocks() {
            if block.last().is_some_and(|t| graph.op(t).is_exit()) {
                exits.insert(block.id().index());
            }
        }
        let valid = successors.iter().all(|s| s.len() <= MAX_SUCCESSORS);
        let allowed_successors = successors
            .iter()
            .map(|s| all_bits(s.len().min(MAX_SUCCESSORS)))
            .collect();
        Self {
            successors,
            predecessors,
            exits,
            allowed_successors,
            unreachable: BitSet::new(block_count),
            valid,
            needs_prune: false,
            cohorts: Vec::new(),
        }
    }

    /// Returns `true` if `graph` has no block with too many successors.
    #[must_use]
    pub fn can_analyse(graph: &Graph) -> bool {
        graph
            .blocks()
            .all(|b| b.successors().len() <= MAX_SUCCESSORS)
    }

    /// Returns `true` if the subgraph still describes a non-escaping path.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Marks the subgraph as unusable.
    pub fn invalidate(&mut self) {
        self.valid = false;
        self.cohorts.clear();
    }

    /// Excludes `block` by cutting every edge into it.
    pub fn remove_block(&mut self, block: BlockId) {
        if !self.valid {
            return;
        }
        self.needs_prune = true;
        self.unreachable.insert(block.index());
        for &pred in &self.predecessors[block.index()] {
            let succs = &self.successors[pred.index()];
            for (slot, &succ) in succs.iter().enumerate() {
                if succ == block {
                    self.allowed_successors[pred.index()] &= !(1u8 << slot);
                }
            }
        }
    }

    /// Keeps only blocks on an allowed path from the entry to an exit.
    ///
    /// The subgraph becomes invalid when no exit remains reachable.
    pub fn prune(&mut self) {
        if !self.valid {
            return;
        }
        let block_count = self.successors.len();
        let entry = 0;
        if self.unreachable.contains(entry) {
            self.invalidate();
            return;
        }

        let mut forward = BitSet::new(block_count);
        let mut stack = vec![entry];
        while let Some(block) = stack.pop() {
            if !forward.insert(block) {
                continue;
            }
            for succ in self.allowed(block) {
                if !forward.contains(succ.index()) {
                    stack.push(succ.index());
                }
            }
        }

        let mut backward = BitSet::new(block_count);
        let mut stack: Vec<usize> = self.exits.iter().filter(|&e| forward.contains(e)).collect();
        while let Some(block) = stack.pop() {
            if !backward.insert(block) {
                continue;
            }
            for &pred in &self.predecessors[block] {
                if forward.contains(pred.index())
                    && !backward.contains(pred.index())
                    && self.allowed(pred.index()).any(|s| s.index() == block)
                {
                    stack.push(pred.index());
                }
            }
        }

        if !backward.contains(entry) {
            self.invalidate();
            return;
        }

        let mut kept = forward;
        kept.intersect_with(&backward);
        for block in 0..block_count {
            let mut mask = 0u8;
            if kept.contains(block) {
                for (slot, succ) in self.successors[block].iter().enumerate().take(MAX_SUCCESSORS) {
                    if self.allowed_successors[block] & (1u8 << slot) != 0
                        && kept.contains(succ.index())
                    {
                        mask |= 1u8 << slot;
                    }
                }
            }
            self.allowed_successors[block] = mask;
        }
        self.unreachable = BitSet::full(block_count);
        self.unreachable.difference_with(&kept);
        self.needs_prune = false;
        self.recalculate_cohorts();
    }

    /// Removes every remaining block that lies on a path both from and to an
    /// excluded block, then prunes again.
    pub fn remove_concavity(&mut self, cfg: &ControlFlowInfo) {
        if !self.valid {
            return;
        }
        if self.needs_prune {
            self.prune();
        }
        for block in 0..self.successors.len() {
            if self.unreachable.contains(block) {
                continue;
            }
            let id = BlockId::new(block);
            let after_excluded = self
                .unreachable
                .iter()
                .any(|skipped| cfg.path_between(BlockId::new(skipped), id));
            let before_excluded = self
                .unreachable
                .iter()
                .any(|skipped| cfg.path_between(id, BlockId::new(skipped)));
            if after_excluded && before_excluded {
                self.remove_block(id);
            }
        }
        self.prune();
    }

    /// Prunes and removes concavity, leaving the subgraph ready for queries.
    pub fn finalize(&mut self, cfg: &ControlFlowInfo) {
        self.prune();
        self.remove_concavity(cfg);
    }

    /// Returns `true` if `block` belongs to a valid subgraph.
    #[must_use]
    pub fn contains_block(&self, block: BlockId) -> bool {
        self.valid && !self.unreachable.contains(block.index())
    }

    /// The excluded regions, empty for invalid subgraphs.
    #[must_use]
    pub fn excluded_cohorts(&self) -> &[ExcludedCohort] {
        &self.cohorts
    }

    fn allowed(&self, block: usize) -> impl Iterator<Item = BlockId> + '_ {
        let mask = self.allowed_successors[block];
        self.successors[block]
            .iter()
            .enumerate()
            .filter(move |(slot, _)| *slot < MAX_SUCCESSORS && mask & (1u8 << slot) != 0)
            .map(|(_, &s)| s)
    }

    fn recalculate_cohorts(&mut self) {
        self.cohorts.clear();
        let mut assigned = BitSet::new(self.successors.len());
        for start in self.unreachable.iter() {
            if assigned.contains(start) {
                continue;
            }
            let mut blocks = BitSet::new(self.successors.len());
            let mut stack = vec![start];
            while let Some(block) = stack.pop() {
                if !blocks.insert(block) {
                    continue;
                }
                assigned.insert(block);
                let neighbours = self.successors[block]
                    .iter()
                    .chain(self.predecessors[block].iter());
                for n in neighbours {
                    if self.unreachable.contains(n.index()) && !blocks.contains(n.index()) {
                        stack.push(n.index());
                    }
                }
            }

            let mut entry_blocks = BitSet::new(self.successors.len());
            let mut exit_blocks = BitSet::new(self.successors.len());
            for block in blocks.iter() {
                if self.predecessors[block]
                    .iter()
                    .any(|p| !blocks.contains(p.index()))
                {
                    entry_blocks.insert(block);
                }
                if self.successors[block]
                    .iter()
                    .any(|s| !blocks.contains(s.index()))
                {
                    exit_blocks.insert(block);
                }
            }
            self.cohorts.push(ExcludedCohort {
                blocks,
                entry_blocks,
                exit_blocks,
            });
        }
    }
}

fn all_bits(count: usize) -> u8 {
    if count >= 8 {
        u8::MAX
    } else {
        (1u8 << count) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{DataType, GraphBuilder};

    /// ```text
    ///        B0
    ///       /  \
    ///     B1    B2
    ///       \  /
    ///        B3
    /// ```
    fn diamond() -> Graph {
        GraphBuilder::new("void Main.f(boolean)")
            .build(|f| {
                let c = f.param(DataType::Bool);
                f.block(0, |b| b.branch(c, 1, 2));
                f.block(1, |b| b.goto(3));
                f.block(2, |b| b.goto(3));
                f.block(3, |b| b.ret_void());
            })
            .unwrap()
    }

    #[test]
    fn escape_on_one_branch_forms_one_cohort() {
        let graph = diamond();
        let cfg = ControlFlowInfo::compute(&graph);
        let mut subgraph = ExecutionSubgraph::new(&graph);
        subgraph.remove_block(BlockId::new(1));
        subgraph.finalize(&cfg);

        assert!(subgraph.is_valid());
        assert!(subgraph.contains_block(BlockId::new(0)));
        assert!(!subgraph.contains_block(BlockId::new(1)));
        assert!(subgraph.contains_block(BlockId::new(3)));

        let cohorts = subgraph.excluded_cohorts();
        assert_eq!(cohorts.len(), 1);
        let cohort = &cohorts[0];
        assert_eq!(cohort.entry_blocks().iter().collect::<Vec<_>>(), vec![1]);
        assert!(cohort.precedes_block(&cfg, BlockId::new(3)));
        assert!(cohort.succeeds_block(&cfg, BlockId::new(0)));
        assert!(!cohort.precedes_block(&cfg, BlockId::new(2)));
    }

    #[test]
    fn escape_on_every_path_invalidates() {
        let graph = diamond();
        let cfg = ControlFlowInfo::compute(&graph);
        let mut subgraph = ExecutionSubgraph::new(&graph);
        subgraph.remove_block(BlockId::new(3));
        subgraph.finalize(&cfg);
        assert!(!subgraph.is_valid());
        assert!(subgraph.excluded_cohorts().is_empty());
    }

    #[test]
    fn concave_blocks_are_removed() {
        // B0 -> B1 -> B2 -> B3 -> B5, B0 -> B4 -> B5; escapes in B1 and B3.
        let graph = GraphBuilder::new("void Main.f(boolean)")
            .build(|f| {
                let c = f.param(DataType::Bool);
                f.block(0, |b| b.branch(c, 1, 4));
                f.block(1, |b| b.goto(2));
                f.block(2, |b| b.goto(3));
                f.block(3, |b| b.goto(5));
                f.block(4, |b| b.goto(5));
                f.block(5, |b| b.ret_void());
            })
            .unwrap();
        let cfg = ControlFlowInfo::compute(&graph);
        let mut subgraph = ExecutionSubgraph::new(&graph);
        subgraph.remove_block(BlockId::new(1));
        subgraph.remove_block(BlockId::new(3));
        subgraph.finalize(&cfg);

        assert!(subgraph.is_valid());
        assert!(!subgraph.contains_block(BlockId::new(2)));
        assert!(subgraph.contains_block(BlockId::new(4)));
        let cohorts = subgraph.excluded_cohorts();
        assert_eq!(cohorts.len(), 1);
        assert_eq!(cohorts[0].blocks().count(), 3);
    }
}
