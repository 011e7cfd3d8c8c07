//! Load-store elimination pass.
//!
//! Removes heap loads whose value is already known, stores whose value is
//! never observed, and allocations that become unused once both are gone.
//! Values flowing across merges and loop back edges are represented by phi
//! placeholders and only turned into phis when an eliminated load needs them.
//!
//! # Example
//!
//! Before:
//! ```text
//! i0 NewInstance
//! i2 InstanceFieldSet [i0,i1] field_name:Point.x
//! i3 InstanceFieldGet [i0] field_name:Point.x
//! i4 Return [i3]
//! ```
//!
//! After:
//! ```text
//! i4 Return [i1]
//! ```
//!
//! # Algorithm
//!
//! 1. Visit the blocks in reverse post-order, tracking one value record per
//!    heap location and recording loads that can be replaced ([`visitor`]).
//! 2. Materialize the phis needed by loads that depend on loop back edges
//!    ([`phis`]).
//! 3. Decide which stores are observable and drop the ones that write the
//!    value the location already holds ([`stores`]).
//! 4. Rewrite the graph.
//!
//! The steps repeat, a bounded number of times, until a round changes
//! nothing, so running the pass again on its output is a no-op.
//!
//! With partial escape enabled, allocations that escape only on some paths are
//! first split into shadow values and materializations at the escape points
//! ([`partial`]).
//!
//! # Limitations
//!
//! - Debuggable methods, methods with try/catch and methods with irreducible
//!   loops or loops without a preheader are left alone.
//! - Methods touching volatile fields or monitors are left alone.

mod partial;
mod phis;
mod stores;
mod value;
mod visitor;

use log::{debug, trace};

pub use value::{PhiPlaceholder, Value, ValueRecord};

use crate::{
    analysis::heap::{CollectorOptions, HeapLocationCollector},
    compiler::{context::CompilerContext, events::EventKind, pass::SsaPass},
    ir::{ControlFlowInfo, Graph, InstId},
    Result,
};

use self::visitor::LseVisitor;

/// Upper bound on elimination rounds per method.
const MAX_ELIMINATION_ROUNDS: usize = 4;

/// A change made to a graph, reported as an event once the pass succeeds.
#[derive(Debug, Clone)]
struct Transformation {
    kind: EventKind,
    inst: InstId,
    message: String,
}

/// Load-store elimination pass.
///
/// Forwards stored values to loads, removes unobservable stores and
/// allocations, and materializes partially escaping allocations at their
/// escape points.
pub struct LoadStoreEliminationPass;

impl Default for LoadStoreEliminationPass {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadStoreEliminationPass {
    /// Creates a new load-store elimination pass.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Why `graph` cannot be optimized, if it cannot.
    fn bail_out_reason(graph: &Graph, cfg: &ControlFlowInfo) -> Option<&'static str> {
        if graph.is_debuggable() {
            Some("debuggable")
        } else if graph.has_try_catch() {
            Some("has try/catch")
        } else if cfg.has_irreducible_loops() {
            Some("irreducible loops")
        } else if !cfg.all_loops_have_preheaders() {
            Some("loop without preheader")
        } else {
            None
        }
    }

    fn skip(&self, ctx: &CompilerContext, method: &str, reason: &str) {
        debug!("{}: skipping {}: {}", self.name(), method, reason);
        ctx.events
            .record(EventKind::PassSkipped)
            .method(method)
            .pass(self.name())
            .message(reason);
    }
}

impl SsaPass for LoadStoreEliminationPass {
    fn name(&self) -> &'static str {
        "load_store_elimination"
    }

    fn description(&self) -> &'static str {
        "Eliminates redundant heap loads, unobservable stores and unused allocations"
    }

    fn run_on_method(&self, graph: &mut Graph, ctx: &CompilerContext) -> Result<bool> {
        let method = graph.signature().to_string();
        let cfg = ControlFlowInfo::compute(graph);
        if let Some(reason) = Self::bail_out_reason(graph, &cfg) {
            self.skip(ctx, &method, reason);
            return Ok(false);
        }

        let options = CollectorOptions {
            partial_escape: false,
            ..ctx.config.collector_options()
        };
        let mut transformations = Vec::new();
        // Dropping a store can leave a later kill moot, so a round may expose
        // more work. Repeat until a round changes nothing.
        for round in 0..MAX_ELIMINATION_ROUNDS {
            let mut found = Vec::new();
            if ctx.config.enable_partial_escape {
                if let Ok(collector) =
                    HeapLocationCollector::collect(graph, &cfg, ctx.config.collector_options())
                {
                    found.extend(partial::materialize_partial_escapes(graph, &cfg, &collector)?);
                }
            }
            match HeapLocationCollector::collect(graph, &cfg, options) {
                Ok(collector) => found.extend(LseVisitor::new(graph, &cfg, &collector).run()?),
                Err(reason) if round == 0 => self.skip(ctx, &method, &reason.to_string()),
                Err(_) => {}
            }
            if found.is_empty() {
                break;
            }
            trace!("{}: round {} made {} changes", method, round, found.len());
            transformations.extend(found);
        }

        let changed = !transformations.is_empty();
        for transformation in transformations {
            ctx.events
                .record(transformation.kind)
                .at(method.as_str(), transformation.inst.index())
                .pass(self.name())
                .message(transformation.message);
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        compiler::CompilerConfig,
        ir::{verify, BinaryOp, DataType, GraphBuilder, Op},
    };

    fn run(graph: &mut Graph, config: CompilerConfig) -> (bool, CompilerContext) {
        let ctx = CompilerContext::new(config);
        let changed = LoadStoreEliminationPass::new()
            .run_on_method(graph, &ctx)
            .unwrap();
        verify(graph).unwrap();
        (changed, ctx)
    }

    #[test]
    fn stored_value_reaches_load_of_a_parameter() {
        let mut graph = GraphBuilder::new("int Main.f(Point)")
            .build(|f| {
                let point = f.class("Point", None);
                let x = f.field(point, "x", DataType::Int32);
                let p = f.param_of(point);
                f.block(0, |b| {
                    let one = b.int(1);
                    b.set_field(p, x, one);
                    let v = b.get_field(p, x);
                    b.ret(v);
                });
            })
            .unwrap();

        let (changed, ctx) = run(&mut graph, CompilerConfig::default());
        assert!(changed);
        assert_eq!(ctx.events.count_kind(EventKind::LoadEliminated), 1);
        // The parameter is visible to the caller.
        assert_eq!(ctx.events.count_kind(EventKind::StoreEliminated), 0);
        assert!(graph
            .live_instructions()
            .all(|i| !matches!(graph.op(i), Op::InstanceFieldGet { .. })));
    }

    #[test]
    fn unused_singleton_disappears() {
        let mut graph = GraphBuilder::new("int Main.f()")
            .build(|f| {
                let point = f.class("Point", None);
                let x = f.field(point, "x", DataType::Int32);
                f.block(0, |b| {
                    let o = b.new_instance(point);
                    let seven = b.int(7);
                    b.set_field(o, x, seven);
                    let v = b.get_field(o, x);
                    b.ret(v);
                });
            })
            .unwrap();

        let (changed, ctx) = run(&mut graph, CompilerConfig::default());
        assert!(changed);
        assert_eq!(ctx.events.count_kind(EventKind::LoadEliminated), 1);
        assert_eq!(ctx.events.count_kind(EventKind::StoreEliminated), 1);
        assert_eq!(ctx.events.count_kind(EventKind::AllocationRemoved), 1);
        let event = ctx.events.filter_kind(EventKind::AllocationRemoved).next().unwrap();
        assert_eq!(event.pass.as_deref(), Some("load_store_elimination"));
        assert_eq!(event.method.as_deref(), Some("int Main.f()"));
    }

    #[test]
    fn debuggable_methods_are_skipped() {
        let mut graph = GraphBuilder::new("int Main.f()")
            .debuggable()
            .build(|f| {
                let point = f.class("Point", None);
                let x = f.field(point, "x", DataType::Int32);
                f.block(0, |b| {
                    let o = b.new_instance(point);
                    let seven = b.int(7);
                    b.set_field(o, x, seven);
                    let v = b.get_field(o, x);
                    b.ret(v);
                });
            })
            .unwrap();
        let before = graph.clone();

        let (changed, ctx) = run(&mut graph, CompilerConfig::default());
        assert!(!changed);
        assert_eq!(graph, before);
        let skipped = ctx.events.filter_kind(EventKind::PassSkipped).next().unwrap();
        assert_eq!(skipped.message, "debuggable");
    }

    #[test]
    fn methods_without_stores_are_skipped() {
        let mut graph = GraphBuilder::new("int Main.f(Point)")
            .build(|f| {
                let point = f.class("Point", None);
                let x = f.field(point, "x", DataType::Int32);
                let p = f.param_of(point);
                f.block(0, |b| {
                    let v = b.get_field(p, x);
                    b.ret(v);
                });
            })
            .unwrap();

        let (changed, ctx) = run(&mut graph, CompilerConfig::default());
        assert!(!changed);
        assert!(ctx.events.has(EventKind::PassSkipped));
    }

    #[test]
    fn partial_escape_can_be_disabled() {
        let build = || {
            GraphBuilder::new("int Main.f(boolean)")
                .build(|f| {
                    let point = f.class("Point", None);
                    let x = f.field(point, "x", DataType::Int32);
                    let flag = f.param(DataType::Bool);
                    let o = f.block(0, |b| {
                        let o = b.new_instance(point);
                        let one = b.int(1);
                        b.set_field(o, x, one);
                        b.branch(flag, 1, 2);
                        o
                    });
                    f.block(1, |b| {
                        b.invoke("Main.$noinline$escape", &[o], DataType::Void);
                        b.goto(3);
                    });
                    f.block(2, |b| b.goto(3));
                    f.block(3, |b| {
                        let v = b.get_field(o, x);
                        b.ret(v);
                    });
                })
                .unwrap()
        };

        let mut graph = build();
        let (_, ctx) = run(&mut graph, CompilerConfig::default());
        assert!(ctx.events.has(EventKind::AllocationMaterialized));

        let mut graph = build();
        let (_, ctx) = run(&mut graph, CompilerConfig::default().with_partial_escape(false));
        assert!(!ctx.events.has(EventKind::AllocationMaterialized));
        assert!(!ctx.events.has(EventKind::PredicatedAccessCreated));
    }

    #[test]
    fn dropped_store_exposes_more_work_in_the_same_run() {
        // a[1] = 1; a[n & 3] = 2; a[n & 3] = 1; return a[1]
        let mut graph = GraphBuilder::new("int Main.f(int[], int)")
            .build(|f| {
                let a = f.param(DataType::Reference);
                let n = f.param(DataType::Int32);
                f.block(0, |b| {
                    let one = b.int(1);
                    let two = b.int(2);
                    let three = b.int(3);
                    let i = b.binary(BinaryOp::And, n, three);
                    b.array_set(a, one, one);
                    b.array_set(a, i, two);
                    b.array_set(a, i, one);
                    let v = b.array_get(a, one, DataType::Int32);
                    b.ret(v);
                });
            })
            .unwrap();

        let (changed, ctx) = run(&mut graph, CompilerConfig::default());
        assert!(changed);
        assert_eq!(ctx.events.count_kind(EventKind::StoreEliminated), 1);
        assert_eq!(ctx.events.count_kind(EventKind::LoadEliminated), 1);

        let (changed, _) = run(&mut graph, CompilerConfig::default());
        assert!(!changed);
    }
}
