//! Textual dumps of instruction graphs.
//!
//! The format lists blocks in id order, phis first, one instruction per line:
//!
//! ```text
//! CHECK-START: int Main.test1(TestClass, TestClass) load_store_elimination (after)
//! B0 preds:[] succs:[B1]
//!   i0 ParameterValue [] index:0 class:TestClass type:reference
//!   i2 Constant [] value:1 type:int32
//!   i3 Goto []
//! B1 preds:[B0] succs:[]
//!   i5 InstanceFieldSet [i0,i2] field_name:TestClass.i
//!   i9 Return [i2]
//! ```
//!
//! Lines carry the kind, the operands in canonical order and a few
//! kind-specific annotations, so tests can match on them with plain string
//! searches.

use std::fmt::Write as _;

use crate::ir::{DataType, Graph, InstId, Op};

/// Dumps `graph` without a header.
#[must_use]
pub fn dump(graph: &Graph) -> String {
    let mut out = String::new();
    for block in graph.blocks() {
        let preds: Vec<String> = block.predecessors().iter().map(ToString::to_string).collect();
        let succs: Vec<String> = block.successors().iter().map(ToString::to_string).collect();
        let _ = writeln!(
            out,
            "{} preds:[{}] succs:[{}]",
            block.id(),
            preds.join(","),
            succs.join(",")
        );
        for inst in block.all_instructions() {
            let _ = writeln!(out, "  {}", instruction_line(graph, inst));
        }
    }
    out
}

/// Dumps `graph` under a `CHECK-START` header naming the pass and the phase.
#[must_use]
pub fn dump_stage(graph: &Graph, pass: &str, after: bool) -> String {
    let phase = if after { "after" } else { "before" };
    format!(
        "CHECK-START: {} {} ({})\n{}",
        graph.signature(),
        pass,
        phase,
        dump(graph)
    )
}

/// One dump line for `inst`, without indentation.
#[must_use]
pub fn instruction_line(graph: &Graph, inst: InstId) -> String {
    let op = graph.op(inst);
    let inputs: Vec<String> = op.inputs().iter().map(ToString::to_string).collect();
    let mut line = format!("{} {} [{}]", inst, op.kind(), inputs.join(","));

    match op {
        Op::ParameterValue { index } => {
            let _ = write!(line, " index:{index}");
        }
        Op::Constant(value) => {
            let _ = write!(line, " value:{value}");
        }
        Op::Binary { op, .. } => {
            let _ = write!(line, " op:{op}");
        }
        Op::Unary { op, .. } => {
            let _ = write!(line, " op:{op}");
        }
        Op::Compare { cond, .. } => {
            let _ = write!(line, " cond:{cond}");
        }
        Op::NewArray { elem, .. } => {
            let _ = write!(line, " elem:{elem}");
        }
        Op::NewInstance { needs_checks, .. } if *needs_checks => {
            line.push_str(" checks:true");
        }
        Op::InvokeStaticOrDirect { method, .. } => {
            let _ = write!(line, " method:{method}");
        }
        Op::MonitorOperation { enter, .. } => {
            let _ = write!(line, " enter:{enter}");
        }
        _ => {}
    }

    if let Some(field) = op.accessed_field() {
        let info = graph.field(field);
        let class = &graph.class(info.class).name;
        let _ = write!(line, " field_name:{}.{}", class, info.name);
    }
    if let Op::InstanceFieldSet {
        predicated: true, ..
    } = op
    {
        line.push_str(" predicated:true");
    }
    if let Some(class) = graph.inst(inst).class() {
        let _ = write!(line, " class:{}", graph.class(class).name);
    }
    if graph.ty(inst) != DataType::Void {
        let _ = write!(line, " type:{}", graph.ty(inst));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::GraphBuilder;

    #[test]
    fn dump_lists_annotations() {
        let graph = GraphBuilder::new("int Main.test(TestClass)")
            .build(|f| {
                let class = f.class("TestClass", None);
                let i = f.field(class, "i", DataType::Int32);
                let obj = f.param_of(class);
                f.block(0, |b| {
                    let one = b.int(1);
                    b.set_field(obj, i, one);
                    let value = b.get_field(obj, i);
                    b.ret(value);
                });
            })
            .unwrap();
        let text = dump_stage(&graph, "load_store_elimination", false);
        assert!(text.starts_with(
            "CHECK-START: int Main.test(TestClass) load_store_elimination (before)\n"
        ));
        assert!(text.contains("ParameterValue [] index:0 class:TestClass type:reference"));
        assert!(text.contains("Constant [] value:1 type:int32"));
        assert!(text.contains("InstanceFieldSet [i0,i1] field_name:TestClass.i\n"));
        assert!(text.contains("InstanceFieldGet [i0] field_name:TestClass.i type:int32"));
        assert!(text.contains("B0 preds:[] succs:[]"));
    }
}
