//! Partial escape integration tests.
//!
//! Allocations escaping on some paths only are replaced by shadow values on
//! the paths where they did not escape and by an allocation at every escape
//! point. The escape handler used here bumps `obj.i` by 10, so whether the
//! object escaped is visible in the value the method returns.

use heapscope::{
    compiler::{CompilerConfig, CompilerContext, EventKind, LoadStoreEliminationPass, SsaPass},
    ir::{
        verify, Completion, Condition, DataType, FieldId, Graph, GraphBuilder, Interpreter, Op,
        SnapValue, Value,
    },
    Result,
};

const ESCAPE: &str = "Main.$noinline$escape";

fn interpreter(i: FieldId) -> Interpreter {
    Interpreter::new().with_handler(ESCAPE, move |heap, args| {
        if let [Value::Ref(Some(obj))] = args {
            let old = match heap.field(*obj, i, DataType::Int32) {
                Some(Value::Int(v)) => v,
                _ => 0,
            };
            heap.set_field(*obj, i, DataType::Int32, Value::Int(old + 10));
        }
        Ok(Value::Void)
    })
}

fn optimize(graph: &mut Graph) -> Result<CompilerContext> {
    let ctx = CompilerContext::new(CompilerConfig::default());
    LoadStoreEliminationPass::new().run_on_method(graph, &ctx)?;
    verify(graph)?;
    Ok(ctx)
}

fn run(interpreter: &Interpreter, graph: &Graph, args: &[Value]) -> Result<SnapValue> {
    match interpreter.run(graph, args)?.completion {
        Completion::Returned(value) => Ok(value),
        other => panic!("method did not return: {other:?}"),
    }
}

fn count(graph: &Graph, pred: impl Fn(&Op) -> bool) -> usize {
    graph.live_instructions().filter(|&i| pred(graph.op(i))).count()
}

/// ```text
/// obj = new TestClass; obj.i = n;
/// if (a) escape(obj) else if (b) escape(obj);
/// return obj.i;
/// ```
#[test]
fn test_every_escape_point_gets_its_own_materialization() -> Result<()> {
    let (original, i) = GraphBuilder::new("int Main.testTwoEscapes(boolean, boolean, int)")
        .build_with(|f| {
            let class = f.class("TestClass", None);
            let i = f.field(class, "i", DataType::Int32);
            let a = f.param(DataType::Bool);
            let b_flag = f.param(DataType::Bool);
            let n = f.param(DataType::Int32);
            let obj = f.block(0, |b| {
                let obj = b.new_instance(class);
                b.set_field(obj, i, n);
                b.branch(a, 1, 2);
                obj
            });
            f.block(1, |b| {
                b.invoke(ESCAPE, &[obj], DataType::Void);
                b.goto(6);
            });
            f.block(2, |b| b.branch(b_flag, 3, 4));
            f.block(3, |b| {
                b.invoke(ESCAPE, &[obj], DataType::Void);
                b.goto(5);
            });
            f.block(4, |b| b.goto(5));
            f.block(5, |b| b.goto(6));
            f.block(6, |b| {
                let v = b.get_field(obj, i);
                b.ret(v);
            });
            i
        })?;
    let mut graph = original.clone();
    let ctx = optimize(&mut graph)?;

    assert_eq!(ctx.events.count_kind(EventKind::AllocationMaterialized), 2);
    assert_eq!(count(&graph, |op| matches!(op, Op::NewInstance { .. })), 2);
    assert_eq!(count(&graph, |op| matches!(op, Op::InstanceFieldGet { .. })), 0);

    let interpreter = interpreter(i);
    for (a, b, expected) in [(1, 0, 13), (1, 1, 13), (0, 1, 13), (0, 0, 3)] {
        let args = [Value::Int(a), Value::Int(b), Value::Int(3)];
        assert_eq!(run(&interpreter, &graph, &args)?, SnapValue::Int(expected));
        assert_eq!(interpreter.run(&original, &args)?, interpreter.run(&graph, &args)?);
    }
    Ok(())
}

/// ```text
/// obj = new TestClass; obj.i = 1;
/// if (flag) escape(obj);
/// for (k = 0; k < m; k++) obj.i = obj.i + obj.i;
/// return obj.i;
/// ```
#[test]
fn test_loop_after_escape_uses_predicated_accesses() -> Result<()> {
    let (original, i) = GraphBuilder::new("int Main.testLoopAfterEscape(boolean, int)")
        .build_with(|f| {
            let class = f.class("TestClass", None);
            let i = f.field(class, "i", DataType::Int32);
            let flag = f.param(DataType::Bool);
            let m = f.param(DataType::Int32);
            let (obj, zero, one) = f.block(0, |b| {
                let obj = b.new_instance(class);
                let zero = b.int(0);
                let one = b.int(1);
                b.set_field(obj, i, one);
                b.branch(flag, 1, 2);
                (obj, zero, one)
            });
            f.block(1, |b| {
                b.invoke(ESCAPE, &[obj], DataType::Void);
                b.goto(3);
            });
            f.block(2, |b| b.goto(3));
            f.block(3, |b| b.goto(4));
            let k = f.block(4, |b| {
                let k = b.phi(DataType::Int32);
                let c = b.compare(Condition::LessThan, k, m);
                b.branch(c, 5, 6);
                k
            });
            let next = f.block(5, |b| {
                let v = b.get_field(obj, i);
                let w = b.get_field(obj, i);
                let sum = b.add(v, w);
                b.set_field(obj, i, sum);
                let next = b.add(k, one);
                b.goto(4);
                next
            });
            f.block(6, |b| {
                let v = b.get_field(obj, i);
                b.ret(v);
            });
            f.set_phi_inputs(k, &[(3, zero), (5, next)]);
            i
        })?;
    let mut graph = original.clone();
    let ctx = optimize(&mut graph)?;

    assert!(ctx.events.has(EventKind::AllocationMaterialized));
    assert!(count(&graph, |op| matches!(op, Op::PredicatedInstanceFieldGet { .. })) >= 1);
    assert!(
        count(&graph, |op| matches!(
            op,
            Op::InstanceFieldSet {
                predicated: true,
                ..
            }
        )) >= 1
    );

    let interpreter = interpreter(i);
    for flag in [0, 1] {
        for m in 0..5 {
            let args = [Value::Int(flag), Value::Int(m)];
            let start = if flag == 1 { 11 } else { 1 };
            assert_eq!(
                run(&interpreter, &graph, &args)?,
                SnapValue::Int(start << m),
                "flag = {flag}, m = {m}"
            );
            assert_eq!(interpreter.run(&original, &args)?, interpreter.run(&graph, &args)?);
        }
    }
    Ok(())
}

fn escape_with_class(finalizable: bool) -> Result<Graph> {
    GraphBuilder::new("int Main.testFinalizable(boolean)").build(|f| {
        let class = if finalizable {
            f.finalizable_class("TestClass", None)
        } else {
            f.class("TestClass", None)
        };
        let i = f.field(class, "i", DataType::Int32);
        let flag = f.param(DataType::Bool);
        let obj = f.block(0, |b| {
            let obj = b.new_instance(class);
            let one = b.int(1);
            b.set_field(obj, i, one);
            b.branch(flag, 1, 2);
            obj
        });
        f.block(1, |b| {
            b.invoke(ESCAPE, &[obj], DataType::Void);
            b.goto(3);
        });
        f.block(2, |b| b.goto(3));
        f.block(3, |b| {
            let v = b.get_field(obj, i);
            b.ret(v);
        });
    })
}

#[test]
fn test_finalizable_instances_stay() -> Result<()> {
    let mut graph = escape_with_class(true)?;
    let ctx = optimize(&mut graph)?;
    assert!(!ctx.events.has(EventKind::AllocationMaterialized));
    assert_eq!(count(&graph, |op| matches!(op, Op::NewInstance { .. })), 1);

    let mut graph = escape_with_class(false)?;
    let ctx = optimize(&mut graph)?;
    assert!(ctx.events.has(EventKind::AllocationMaterialized));
    Ok(())
}

#[test]
fn test_partial_escape_disabled_keeps_allocation() -> Result<()> {
    let mut graph = escape_with_class(false)?;
    let ctx = CompilerContext::new(CompilerConfig::default().with_partial_escape(false));
    LoadStoreEliminationPass::new().run_on_method(&mut graph, &ctx)?;
    verify(&graph)?;
    assert_eq!(count(&graph, |op| matches!(op, Op::NewInstance { .. })), 1);
    assert_eq!(count(&graph, |op| matches!(op, Op::PredicatedInstanceFieldGet { .. })), 0);
    Ok(())
}
