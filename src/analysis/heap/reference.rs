//! Per-reference facts used by the heap location collector.

use crate::{
    analysis::{
        escape::{calculate_escape, partial_escape_points, EscapeInfo, EscapeKind},
        subgraph::ExecutionSubgraph,
    },
    ir::{ControlFlowInfo, Graph, InstId, Op},
};

/// Escape facts of one reference-producing instruction.
#[derive(Debug, Clone)]
pub struct ReferenceInfo {
    reference: InstId,
    position: usize,
    escape: EscapeInfo,
    removable: bool,
    kind: EscapeKind,
    subgraph: Option<ExecutionSubgraph>,
}

impl ReferenceInfo {
    pub(crate) fn new(
        graph: &Graph,
        cfg: &ControlFlowInfo,
        reference: InstId,
        position: usize,
        partial_escape: bool,
    ) -> Self {
        let escape = calculate_escape(graph, reference);
        let removable = escape.is_singleton
            && escape.is_singleton_and_not_returned
            && escape.is_singleton_and_not_deopt_visible
            && is_removable_allocation(graph, reference);

        let mut subgraph = None;
        let kind = if escape.is_singleton {
            EscapeKind::NoEscape
        } else if partial_escape && is_partial_escape_candidate(graph, reference) {
            let candidate = compute_subgraph(graph, cfg, reference);
            let block = graph.inst(reference).block();
            if candidate.is_valid()
                && block.is_some_and(|b| candidate.contains_block(b))
                && !candidate.excluded_cohorts().is_empty()
            {
                subgraph = Some(candidate);
                EscapeKind::PartialEscape
            } else {
                EscapeKind::FullEscape
            }
        } else {
            EscapeKind::FullEscape
        };

        Self {
            reference,
            position,
            escape,
            removable,
            kind,
            subgraph,
        }
    }

    /// The reference instruction.
    #[must_use]
    pub fn reference(&self) -> InstId {
        self.reference
    }

    /// Discovery order of the reference in reverse post-order.
    #[must_use]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Only name of a fresh allocation.
    #[must_use]
    pub fn is_singleton(&self) -> bool {
        self.escape.is_singleton
    }

    /// Singleton that is neither returned nor thrown.
    #[must_use]
    pub fn is_singleton_and_not_returned(&self) -> bool {
        self.escape.is_singleton_and_not_returned
    }

    /// Singleton whose field values can never be observed after the method
    /// finishes, so its stores need not happen at all.
    #[must_use]
    pub fn is_singleton_and_removable(&self) -> bool {
        self.removable
    }

    /// How far the reference escapes.
    #[must_use]
    pub fn escape_kind(&self) -> EscapeKind {
        self.kind
    }

    /// The non-escaping subgraph of a partially escaping allocation.
    #[must_use]
    pub fn subgraph(&self) -> Option<&ExecutionSubgraph> {
        self.subgraph.as_ref()
    }
}

/// Returns `true` if the allocation `inst` may disappear once its uses are
/// gone.
///
/// Instances qualify unless the allocation also runs access or initialization
/// checks. Arrays need a constant non-negative length, and every element
/// access must use a constant index.
#[must_use]
pub fn is_removable_allocation(graph: &Graph, inst: InstId) -> bool {
    match graph.op(inst) {
        Op::NewInstance { needs_checks, .. } => !needs_checks,
        Op::NewArray { length, .. } => {
            let constant_length = graph
                .constant_value(*length)
                .and_then(|c| c.as_i64())
                .is_some_and(|len| len >= 0);
            constant_length
                && graph.uses(inst).iter().all(|&user| match graph.op(user) {
                    Op::ArrayGet { array, index } | Op::ArraySet { array, index, .. }
                        if *array == inst =>
                    {
                        graph.constant_value(*index).is_some()
                    }
                    _ => true,
                })
        }
        _ => false,
    }
}

fn is_partial_escape_candidate(graph: &Graph, reference: InstId) -> bool {
    match graph.op(reference) {
        Op::NewInstance { class, .. } => !graph.class(*class).is_finalizable,
        _ => false,
    }
}

fn compute_subgraph(graph: &Graph, cfg: &ControlFlowInfo, reference: InstId) -> ExecutionSubgraph {
    let mut subgraph = ExecutionSubgraph::new(graph);
    if !subgraph.is_valid() {
        return subgraph;
    }
    for point in partial_escape_points(graph, reference) {
        match graph.inst(point).block() {
            Some(block) => subgraph.remove_block(block),
            None => subgraph.invalidate(),
        }
    }
    subgraph.finalize(cfg);
    subgraph
}
