//! Structural verification of instruction graphs.
//!
//! Run after construction and, in tests, after every pass. A graph that
//! verifies satisfies everything the analyses rely on:
//!
//! - every block is reachable from the entry and ends in exactly one terminator
//!   whose successor count matches the block's successor list
//! - every phi has one input per predecessor
//! - parameters and constants live in the entry block
//! - every operand is live and dominates its use
//! - use lists are exactly the inverse of the operand lists

use rustc_hash::FxHashMap;

use crate::{
    ir::{cfg::ControlFlowInfo, BlockId, Graph, InstId, Op},
    Result,
};

/// Verifies the structural invariants of `graph`.
///
/// # Errors
///
/// Returns [`crate::Error::InvalidGraph`] describing the first violation found.
pub fn verify(graph: &Graph) -> Result<()> {
    let cfg = ControlFlowInfo::compute(graph);

    for block in graph.blocks() {
        let id = block.id();
        if cfg.rpo_index(id).is_none() {
            return Err(invalid(format!("{id} is unreachable from the entry")));
        }
        verify_edges(graph, id)?;
        verify_terminator(graph, id)?;

        for &phi in block.phis() {
            if !graph.op(phi).is_phi() {
                return Err(invalid(format!("{phi} is in the phi list of {id} but is not a phi")));
            }
            let inputs = graph.op(phi).inputs();
            if inputs.len() != block.predecessors().len() {
                return Err(invalid(format!(
                    "phi {phi} in {id} has {} inputs for {} predecessors",
                    inputs.len(),
                    block.predecessors().len()
                )));
            }
        }

        for inst in block.all_instructions() {
            if graph.inst(inst).block() != Some(id) {
                return Err(invalid(format!("{inst} is listed in {id} but placed elsewhere")));
            }
            match graph.op(inst) {
                Op::ParameterValue { .. } | Op::Constant(_) if id != graph.entry() => {
                    return Err(invalid(format!("{inst} must live in the entry block")));
                }
                Op::Phi { .. } if !block.phis().contains(&inst) => {
                    return Err(invalid(format!("phi {inst} is not in the phi list of {id}")));
                }
                _ => {}
            }
            verify_operands(graph, &cfg, id, inst)?;
        }
    }

    verify_use_lists(graph)
}

fn invalid(message: String) -> crate::Error {
    crate::Error::InvalidGraph(message)
}

fn verify_edges(graph: &Graph, id: BlockId) -> Result<()> {
    let block = graph.block(id);
    for &succ in block.successors() {
        let back = graph
            .block(succ)
            .predecessors()
            .iter()
            .filter(|&&p| p == id)
            .count();
        let forward = block.successors().iter().filter(|&&s| s == succ).count();
        if back != forward {
            return Err(invalid(format!("edge {id} -> {succ} is not mirrored")));
        }
    }
    Ok(())
}

fn verify_terminator(graph: &Graph, id: BlockId) -> Result<()> {
    let block = graph.block(id);
    let Some(last) = block.last() else {
        return Err(invalid(format!("{id} is empty")));
    };
    let Some(expected) = graph.op(last).successor_count() else {
        return Err(invalid(format!("{id} does not end in a terminator")));
    };
    if expected != block.successors().len() {
        return Err(invalid(format!(
            "{id} ends in {} but has {} successors",
            graph.op(last).kind(),
            block.successors().len()
        )));
    }
    let early = block.instructions()[..block.instructions().len() - 1]
        .iter()
        .find(|&&i| graph.op(i).is_terminator());
    if let Some(early) = early {
        return Err(invalid(format!("terminator {early} in the middle of {id}")));
    }
    Ok(())
}

fn verify_operands(graph: &Graph, cfg: &ControlFlowInfo, block: BlockId, inst: InstId) -> Result<()> {
    let inputs = graph.op(inst).inputs();
    let preds = graph.block(block).predecessors();
    for (slot, &input) in inputs.iter().enumerate() {
        if input.index() >= graph.instruction_count() || graph.inst(input).is_removed() {
            return Err(invalid(format!("{inst} uses removed instruction {input}")));
        }
        let pred = graph.op(inst).is_phi().then(|| preds[slot]);
        if !cfg.instruction_dominates(graph, input, inst, pred) {
            return Err(invalid(format!("{input} does not dominate its use in {inst}")));
        }
    }
    Ok(())
}

fn verify_use_lists(graph: &Graph) -> Result<()> {
    let mut expected: FxHashMap<InstId, Vec<InstId>> = FxHashMap::default();
    for user in graph.live_instructions() {
        for input in graph.op(user).inputs() {
            expected.entry(input).or_default().push(user);
        }
    }
    for inst in graph.live_instructions() {
        let mut want = expected.remove(&inst).unwrap_or_default();
        let mut have = graph.uses(inst).to_vec();
        want.sort();
        have.sort();
        if want != have {
            return Err(invalid(format!(
                "use list of {inst} is {have:?}, operands say {want:?}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ir::{DataType, GraphBuilder},
        Error,
    };

    #[test]
    fn well_formed_graph_verifies() {
        let graph = GraphBuilder::new("int Main.f(int)").build(|f| {
            let a = f.param(DataType::Int32);
            f.block(0, |b| b.goto(1));
            f.block(1, |b| b.ret(a));
        });
        assert!(graph.is_ok());
    }

    #[test]
    fn missing_terminator_is_rejected() {
        let result = GraphBuilder::new("void Main.f()").build(|f| {
            f.block(0, |b| b.goto(1));
            f.block(1, |b| b.int(3));
        });
        assert!(matches!(result, Err(Error::InvalidGraph(_))));
    }

    #[test]
    fn use_before_definition_is_rejected() {
        let result = GraphBuilder::new("int Main.f(boolean)").build(|f| {
            let c = f.param(DataType::Bool);
            f.block(0, |b| b.branch(c, 1, 2));
            let v = f.block(1, |b| {
                let one = b.int(1);
                let v = b.add(one, one);
                b.goto(3);
                v
            });
            f.block(2, |b| b.goto(3));
            // `v` is only defined on one path.
            f.block(3, |b| b.ret(v));
        });
        assert!(matches!(result, Err(Error::InvalidGraph(_))));
    }

    #[test]
    fn edits_after_building_are_checked() {
        let (mut graph, ret) = GraphBuilder::new("int Main.f(int)")
            .build_with(|f| {
                let a = f.param(DataType::Int32);
                f.block(0, |b| b.ret(a))
            })
            .unwrap();
        assert!(verify(&graph).is_ok());
        graph.remove(ret).unwrap();
        assert!(matches!(verify(&graph), Err(Error::InvalidGraph(_))));
    }

    #[test]
    fn unreachable_block_is_rejected() {
        let result = GraphBuilder::new("void Main.f()").build(|f| {
            f.block(0, |b| b.ret_void());
            f.block(1, |b| b.ret_void());
        });
        assert!(matches!(result, Err(Error::InvalidGraph(_))));
    }
}
