//! Control-flow facts derived from a [`Graph`].
//!
//! [`ControlFlowInfo`] bundles what the analyses ask of the block structure:
//! the reverse post-order, the dominator tree, natural loops and block-level
//! reachability. It is a snapshot: any pass that adds or removes blocks must
//! recompute it. Passes that only add or remove instructions may keep using it.

use crate::{
    ir::{BlockId, Graph, InstId},
    ir::loops::{detect_loops, LoopForest, LoopInfo},
    utils::{
        graph::{
            algorithms::{compute_dominators, reverse_postorder, transitive_successors, DominatorTree},
            NodeId,
        },
        BitSet,
    },
};

/// Block ordering, dominance, loops and reachability of a method.
#[derive(Debug, Clone)]
pub struct ControlFlowInfo {
    rpo: Vec<BlockId>,
    rpo_index: Vec<Option<usize>>,
    dominators: DominatorTree,
    loops: LoopForest,
    irreducible: bool,
    reachability: Vec<BitSet>,
}

impl ControlFlowInfo {
    /// Computes the control-flow facts of `graph`.
    #[must_use]
    pub fn compute(graph: &Graph) -> Self {
        let rpo: Vec<BlockId> = reverse_postorder(graph, NodeId::new(0))
            .into_iter()
            .map(|n| BlockId::new(n.index()))
            .collect();
        let mut rpo_index = vec![None; graph.block_count()];
        for (i, b) in rpo.iter().enumerate() {
            rpo_index[b.index()] = Some(i);
        }

        let dominators = compute_dominators(graph);
        let loops = detect_loops(graph, &dominators);

        // A retreating edge whose target does not dominate its source enters a
        // cycle somewhere other than its header.
        let irreducible = rpo.iter().any(|&block| {
            graph.block(block).successors().iter().any(|&succ| {
                matches!(
                    (rpo_index[succ.index()], rpo_index[block.index()]),
                    (Some(s), Some(b)) if s <= b
                ) && !dominators.dominates(NodeId::new(succ.index()), NodeId::new(block.index()))
            })
        });

        let reachability = transitive_successors(graph);

        Self {
            rpo,
            rpo_index,
            dominators,
            loops,
            irreducible,
            reachability,
        }
    }

    /// Blocks reachable from the entry in reverse post-order.
    #[must_use]
    pub fn reverse_post_order(&self) -> &[BlockId] {
        &self.rpo
    }

    /// Position of `block` in the reverse post-order, `None` if unreachable.
    #[must_use]
    pub fn rpo_index(&self, block: BlockId) -> Option<usize> {
        self.rpo_index.get(block.index()).copied().flatten()
    }

    /// The dominator tree.
    #[must_use]
    pub fn dominators(&self) -> &DominatorTree {
        &self.dominators
    }

    /// Returns `true` if `a` dominates `b` (reflexive).
    #[must_use]
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        self.dominators
            .dominates(NodeId::new(a.index()), NodeId::new(b.index()))
    }

    /// Immediate dominator of `block`.
    #[must_use]
    pub fn immediate_dominator(&self, block: BlockId) -> Option<BlockId> {
        self.dominators
            .immediate_dominator(NodeId::new(block.index()))
            .map(|n| BlockId::new(n.index()))
    }

    /// All natural loops.
    #[must_use]
    pub fn loops(&self) -> &LoopForest {
        &self.loops
    }

    /// Innermost loop containing `block`.
    #[must_use]
    pub fn loop_of(&self, block: BlockId) -> Option<&LoopInfo> {
        self.loops.innermost_loop(block)
    }

    /// Returns `true` if `block` is the header of a natural loop.
    #[must_use]
    pub fn is_loop_header(&self, block: BlockId) -> bool {
        self.loops
            .innermost_loop(block)
            .is_some_and(|l| l.header == block)
    }

    /// Returns `true` if some cycle is not a natural loop.
    #[must_use]
    pub fn has_irreducible_loops(&self) -> bool {
        self.irreducible
    }

    /// Returns `true` if every loop has a preheader.
    #[must_use]
    pub fn all_loops_have_preheaders(&self) -> bool {
        self.loops.loops().iter().all(LoopInfo::has_preheader)
    }

    /// Returns `true` if a non-empty path leads from `from` to `to`.
    ///
    /// A block reaches itself only through a cycle.
    #[must_use]
    pub fn path_between(&self, from: BlockId, to: BlockId) -> bool {
        self.reachability[from.index()].contains(to.index())
    }

    /// Returns `true` if the definition `def` dominates the operand slot of `user`.
    ///
    /// Phi operands are used at the end of the corresponding predecessor, so
    /// they are checked against that block instead.
    #[must_use]
    pub fn instruction_dominates(
        &self,
        graph: &Graph,
        def: InstId,
        user: InstId,
        pred_for_phi: Option<BlockId>,
    ) -> bool {
        let (Some(def_block), Some(user_block)) = (graph.inst(def).block(), graph.inst(user).block())
        else {
            return false;
        };
        if let Some(pred) = pred_for_phi {
            return self.dominates(def_block, pred);
        }
        if def_block != user_block {
            return self.dominates(def_block, user_block);
        }
        match (graph.position_in_block(def), graph.position_in_block(user)) {
            (Some(d), Some(u)) => d < u || (d == 0 && u == 0 && def != user),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{DataType, Op};

    fn diamond() -> Graph {
        let mut graph = Graph::new("void Main.f(boolean)");
        for _ in 0..3 {
            graph.add_block();
        }
        let (b0, b1, b2, b3) = (BlockId::new(0), BlockId::new(1), BlockId::new(2), BlockId::new(3));
        graph.add_edge(b0, b1);
        graph.add_edge(b0, b2);
        graph.add_edge(b1, b3);
        graph.add_edge(b2, b3);
        let cond = graph.append(b0, Op::ParameterValue { index: 0 }, DataType::Bool);
        graph.append(b0, Op::If { condition: cond }, DataType::Void);
        graph.append(b1, Op::Goto, DataType::Void);
        graph.append(b2, Op::Goto, DataType::Void);
        graph.append(b3, Op::ReturnVoid, DataType::Void);
        graph
    }

    #[test]
    fn diamond_order_and_dominance() {
        let graph = diamond();
        let cfg = ControlFlowInfo::compute(&graph);
        assert_eq!(cfg.reverse_post_order().first(), Some(&BlockId::new(0)));
        assert_eq!(cfg.reverse_post_order().last(), Some(&BlockId::new(3)));
        assert_eq!(cfg.immediate_dominator(BlockId::new(3)), Some(BlockId::new(0)));
        assert!(!cfg.dominates(BlockId::new(1), BlockId::new(3)));
        assert!(cfg.path_between(BlockId::new(1), BlockId::new(3)));
        assert!(!cfg.path_between(BlockId::new(3), BlockId::new(3)));
        assert!(!cfg.has_irreducible_loops());
        assert!(cfg.loops().is_empty());
    }

    #[test]
    fn irreducible_cycle_is_detected() {
        // Both 1 and 2 are entered from 0 and form a cycle.
        let mut graph = Graph::new("void Main.f()");
        for _ in 0..3 {
            graph.add_block();
        }
        let b = BlockId::new;
        graph.add_edge(b(0), b(1));
        graph.add_edge(b(0), b(2));
        graph.add_edge(b(1), b(2));
        graph.add_edge(b(2), b(1));
        graph.add_edge(b(2), b(3));
        let cfg = ControlFlowInfo::compute(&graph);
        assert!(cfg.has_irreducible_loops());
    }

    #[test]
    fn same_block_dominance_uses_positions() {
        let graph = diamond();
        let cfg = ControlFlowInfo::compute(&graph);
        let entry = graph.block(BlockId::new(0)).instructions().to_vec();
        assert!(cfg.instruction_dominates(&graph, entry[0], entry[1], None));
        assert!(!cfg.instruction_dominates(&graph, entry[1], entry[0], None));
    }
}
