//! Differential testing of load-store elimination.
//!
//! Random methods over a parameter object, two local allocations, a local and
//! a parameter array, and a sink object are run through the reference
//! interpreter before and after the pass. Every loaded value is accumulated
//! into the sink, so a wrongly forwarded value changes the observation.
//! Escaped objects are stashed by the interpreter and rewritten by every
//! later call, so forwarding across a call is observable too.
//!
//! Method shape:
//!
//! ```text
//!        B0
//!       /  \
//!     B1    B2
//!       \  /
//!        B3
//!        |
//!        B4 <--------+
//!       /  \         |
//!     B6    B5       |
//!           |        |
//!           B7 <-+   |
//!          /  \  |   |
//!        B9    B8+   |
//!         |          |
//!         +----------+
//! ```

use std::sync::{Arc, Mutex};

use heapscope::{
    compiler::{CompilerConfig, CompilerContext, LoadStoreEliminationPass, SsaPass},
    ir::{
        dump, interp::ObjRef, verify, BinaryOp, BlockBuilder, ClassId, Condition, DataType,
        FieldId, Graph, GraphBuilder, Heap, InstId, Interpreter, Value,
    },
};
use proptest::prelude::*;

#[derive(Debug, Clone, Copy)]
enum Src {
    Const(i32),
    Param,
    LastLoad,
}

#[derive(Debug, Clone, Copy)]
enum Idx {
    Const(i32),
    Dynamic,
    /// `k + c` for the outer loop index `k`, `c` outside the loop.
    Loop(i32),
}

#[derive(Debug, Clone)]
enum Stmt {
    Store { obj: usize, field: usize, value: Src },
    Load { obj: usize, field: usize },
    ArrayStore { array: usize, index: Idx, value: Src },
    ArrayLoad { array: usize, index: Idx },
    Escape { obj: usize },
    Call,
}

#[derive(Debug, Clone)]
struct Program {
    prologue: Vec<Stmt>,
    then_branch: Vec<Stmt>,
    else_branch: Vec<Stmt>,
    merge: Vec<Stmt>,
    body: Vec<Stmt>,
    inner: Vec<Stmt>,
    exit: Vec<Stmt>,
}

/// Field slots: `a` and `b` are ints, `c` is a byte.
const FIELD_TYPES: [DataType; 3] = [DataType::Int32, DataType::Int32, DataType::Int8];

const ARRAY_LENGTH: usize = 4;

struct Env {
    objects: [InstId; 3],
    fields: [FieldId; 3],
    sink: InstId,
    acc: FieldId,
    arrays: [InstId; 2],
    dynamic: InstId,
    n: InstId,
}

struct Classes {
    class: ClassId,
    sink: ClassId,
    fields: [FieldId; 3],
}

fn src() -> impl Strategy<Value = Src> {
    prop_oneof![
        (-1..3i32).prop_map(Src::Const),
        Just(Src::Param),
        Just(Src::LastLoad),
    ]
}

fn idx() -> impl Strategy<Value = Idx> {
    prop_oneof![
        (0..4i32).prop_map(Idx::Const),
        Just(Idx::Dynamic),
        (0..2i32).prop_map(Idx::Loop),
    ]
}

fn stmt() -> impl Strategy<Value = Stmt> {
    prop_oneof![
        4 => (0..3usize, 0..3usize, src()).prop_map(|(obj, field, value)| Stmt::Store { obj, field, value }),
        4 => (0..3usize, 0..3usize).prop_map(|(obj, field)| Stmt::Load { obj, field }),
        2 => (0..2usize, idx(), src()).prop_map(|(array, index, value)| Stmt::ArrayStore { array, index, value }),
        2 => (0..2usize, idx()).prop_map(|(array, index)| Stmt::ArrayLoad { array, index }),
        1 => (0..3usize).prop_map(|obj| Stmt::Escape { obj }),
        1 => Just(Stmt::Call),
    ]
}

fn program() -> impl Strategy<Value = Program> {
    let block = || proptest::collection::vec(stmt(), 0..5);
    (
        block(),
        block(),
        block(),
        block(),
        block(),
        proptest::collection::vec(stmt(), 0..3),
        block(),
    )
        .prop_map(
            |(prologue, then_branch, else_branch, merge, body, inner, exit)| Program {
                prologue,
                then_branch,
                else_branch,
                merge,
                body,
                inner,
                exit,
            },
        )
}

fn value_of(b: &mut BlockBuilder<'_>, env: &Env, src: Src, last: Option<InstId>) -> InstId {
    match (src, last) {
        (Src::LastLoad, Some(load)) => load,
        (Src::Param, _) => env.n,
        (Src::Const(v), _) => b.int(v),
        (Src::LastLoad, None) => b.int(7),
    }
}

fn index_of(b: &mut BlockBuilder<'_>, env: &Env, index: Idx, k: Option<InstId>) -> InstId {
    match (index, k) {
        (Idx::Const(v), _) | (Idx::Loop(v), None) => b.int(v),
        (Idx::Dynamic, _) => env.dynamic,
        (Idx::Loop(c), Some(k)) => {
            let c = b.int(c);
            b.add(k, c)
        }
    }
}

fn sink(b: &mut BlockBuilder<'_>, env: &Env, value: InstId) {
    let acc = b.get_field(env.sink, env.acc);
    let sum = b.add(acc, value);
    b.set_field(env.sink, env.acc, sum);
}

/// Emits `stmts`; `k` is the outer loop index where it is in scope.
fn emit(b: &mut BlockBuilder<'_>, env: &Env, stmts: &[Stmt], k: Option<InstId>) {
    let mut last = None;
    for stmt in stmts {
        match *stmt {
            Stmt::Store { obj, field, value } => {
                let value = value_of(b, env, value, last);
                b.set_field(env.objects[obj], env.fields[field], value);
            }
            Stmt::Load { obj, field } => {
                let value = b.get_field(env.objects[obj], env.fields[field]);
                sink(b, env, value);
                last = Some(value);
            }
            Stmt::ArrayStore {
                array,
                index,
                value,
            } => {
                let index = index_of(b, env, index, k);
                let value = value_of(b, env, value, last);
                b.array_set(env.arrays[array], index, value);
            }
            Stmt::ArrayLoad { array, index } => {
                let index = index_of(b, env, index, k);
                let value = b.array_get(env.arrays[array], index, DataType::Int32);
                sink(b, env, value);
                last = Some(value);
            }
            Stmt::Escape { obj } => {
                b.invoke("Main.$noinline$escape", &[env.objects[obj]], DataType::Void);
            }
            Stmt::Call => {
                b.invoke("Main.$noinline$call", &[], DataType::Void);
            }
        }
    }
}

fn build(program: &Program) -> (Graph, Classes) {
    GraphBuilder::new("void Main.random(TestClass, Sink, int[], boolean, int, int)")
        .build_with(|f| {
            let class = f.class("TestClass", None);
            let sink_class = f.class("Sink", None);
            let fields = [
                f.field(class, "a", FIELD_TYPES[0]),
                f.field(class, "b", FIELD_TYPES[1]),
                f.field(class, "c", FIELD_TYPES[2]),
            ];
            let acc = f.field(sink_class, "acc", DataType::Int32);
            let p = f.param_of(class);
            let sink = f.param_of(sink_class);
            let shared = f.param(DataType::Reference);
            let flag = f.param(DataType::Bool);
            let m = f.param(DataType::Int32);
            let n = f.param(DataType::Int32);

            let (env, zero, one, two) = f.block(0, |b| {
                let o1 = b.new_instance(class);
                let o2 = b.new_instance(class);
                let length = b.int(ARRAY_LENGTH as i32);
                let array = b.new_array(length, DataType::Int32);
                let three = b.int(3);
                let dynamic = b.binary(BinaryOp::And, n, three);
                let zero = b.int(0);
                let one = b.int(1);
                let two = b.int(2);
                let env = Env {
                    objects: [p, o1, o2],
                    fields,
                    sink,
                    acc,
                    arrays: [array, shared],
                    dynamic,
                    n,
                };
                emit(b, &env, &program.prologue, None);
                b.branch(flag, 1, 2);
                (env, zero, one, two)
            });
            f.block(1, |b| {
                emit(b, &env, &program.then_branch, None);
                b.goto(3);
            });
            f.block(2, |b| {
                emit(b, &env, &program.else_branch, None);
                b.goto(3);
            });
            f.block(3, |b| {
                emit(b, &env, &program.merge, None);
                b.goto(4);
            });
            let k = f.block(4, |b| {
                let k = b.phi(DataType::Int32);
                let c = b.compare(Condition::LessThan, k, m);
                b.branch(c, 5, 6);
                k
            });
            f.block(5, |b| {
                emit(b, &env, &program.body, Some(k));
                b.goto(7);
            });
            f.block(6, |b| {
                emit(b, &env, &program.exit, Some(k));
                b.ret_void();
            });
            let j = f.block(7, |b| {
                let j = b.phi(DataType::Int32);
                let c = b.compare(Condition::LessThan, j, two);
                b.branch(c, 8, 9);
                j
            });
            let j_next = f.block(8, |b| {
                emit(b, &env, &program.inner, Some(k));
                let next = b.add(j, one);
                b.goto(7);
                next
            });
            let k_next = f.block(9, |b| {
                let next = b.add(k, one);
                b.goto(4);
                next
            });
            f.set_phi_inputs(k, &[(3, zero), (9, k_next)]);
            f.set_phi_inputs(j, &[(5, zero), (8, j_next)]);
            Classes {
                class,
                sink: sink_class,
                fields,
            }
        })
        .unwrap()
}

fn arguments(heap: &mut Heap, classes: &Classes, flag: bool, m: i32, n: i32) -> Vec<Value> {
    let p = heap.alloc_instance(classes.class);
    let sink = heap.alloc_instance(classes.sink);
    let shared = heap.alloc_array(DataType::Int32, ARRAY_LENGTH);
    vec![
        Value::Ref(Some(p)),
        Value::Ref(Some(sink)),
        Value::Ref(Some(shared)),
        Value::Int(i32::from(flag)),
        Value::Int(m),
        Value::Int(n),
    ]
}

/// An interpreter whose escape handler stashes objects and whose call
/// handler rewrites every stashed object.
///
/// Object references are per heap, so every execution gets its own stash.
fn interpreter(classes: &Classes) -> Interpreter {
    let stash: Arc<Mutex<Vec<ObjRef>>> = Arc::default();
    let escaped = Arc::clone(&stash);
    let fields = classes.fields;
    Interpreter::new()
        .with_handler("Main.$noinline$escape", move |_, args| {
            if let [Value::Ref(Some(obj))] = args {
                escaped.lock().unwrap().push(*obj);
            }
            Ok(Value::Void)
        })
        .with_handler("Main.$noinline$call", move |heap, _| {
            for &obj in stash.lock().unwrap().iter() {
                if let Some(Value::Int(a)) = heap.field(obj, fields[0], FIELD_TYPES[0]) {
                    heap.set_field(obj, fields[0], FIELD_TYPES[0], Value::Int(a.wrapping_add(10)));
                }
                heap.set_field(obj, fields[2], FIELD_TYPES[2], Value::Int(-3));
            }
            Ok(Value::Void)
        })
}

fn check(program: &Program, partial_escape: bool) -> Result<(), TestCaseError> {
    let (original, classes) = build(program);
    let mut graph = original.clone();
    let config = CompilerConfig::default().with_partial_escape(partial_escape);
    let ctx = CompilerContext::new(config);
    let result = LoadStoreEliminationPass::new().run_on_method(&mut graph, &ctx);
    prop_assert!(result.is_ok(), "pass failed: {:?}", result.err());
    prop_assert!(verify(&graph).is_ok(), "graph does not verify");

    for flag in [false, true] {
        for m in 0..3 {
            for n in [0, 5, 300] {
                let mut heap = Heap::new();
                let args = arguments(&mut heap, &classes, flag, m, n);
                let before = interpreter(&classes).run_with_heap(&original, &args, heap.clone());
                prop_assert!(
                    before.is_ok(),
                    "original failed: {:?} (flag = {}, m = {}, n = {})",
                    before.as_ref().err(),
                    flag,
                    m,
                    n
                );
                let after = interpreter(&classes).run_with_heap(&graph, &args, heap);
                prop_assert_eq!(
                    before.ok(),
                    after.ok(),
                    "flag = {}, m = {}, n = {}",
                    flag,
                    m,
                    n
                );
            }
        }
    }
    Ok(())
}

fn check_settled(program: &Program, partial_escape: bool) -> Result<(), TestCaseError> {
    let (mut graph, _) = build(program);
    let config = CompilerConfig::default().with_partial_escape(partial_escape);
    let pass = LoadStoreEliminationPass::new();
    let first = pass.run_on_method(&mut graph, &CompilerContext::new(config.clone()));
    prop_assert!(first.is_ok(), "pass failed: {:?}", first.err());
    let settled = dump(&graph);

    let ctx = CompilerContext::new(config);
    let second = pass.run_on_method(&mut graph, &ctx);
    prop_assert!(
        matches!(second, Ok(false)),
        "second run changed the method ({:?}): {}",
        ctx.events.summary(),
        settled
    );
    prop_assert_eq!(dump(&graph), settled);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn elimination_preserves_observations(program in program()) {
        check(&program, false)?;
    }

    #[test]
    fn partial_escape_preserves_observations(program in program()) {
        check(&program, true)?;
    }

    #[test]
    fn second_run_changes_nothing(program in program(), partial_escape in any::<bool>()) {
        check_settled(&program, partial_escape)?;
    }
}

#[test]
fn empty_program_is_left_alone() {
    let program = Program {
        prologue: Vec::new(),
        then_branch: Vec::new(),
        else_branch: Vec::new(),
        merge: Vec::new(),
        body: Vec::new(),
        inner: Vec::new(),
        exit: Vec::new(),
    };
    let (mut graph, _) = build(&program);
    let before = graph.clone();
    let ctx = CompilerContext::new(CompilerConfig::default());
    let changed = LoadStoreEliminationPass::new()
        .run_on_method(&mut graph, &ctx)
        .unwrap();
    assert!(!changed);
    assert_eq!(graph, before);
}
