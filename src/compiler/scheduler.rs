//! Pass scheduler for running passes over all methods of a context.
//!
//! The [`PassScheduler`] runs its passes in order, each over every method, and
//! repeats the whole pipeline up to `max_iterations` times or until no pass
//! changes anything. Methods are processed in parallel with rayon; a method's
//! graph is taken out of the context for the duration of a pass, so every
//! run owns its graph exclusively.
//!
//! A pass that fails on a method, or leaves a graph that no longer verifies,
//! is rolled back: the method keeps the graph it had before the pass, the
//! failure is logged and recorded, and the pipeline carries on.

use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, warn};
use rayon::prelude::*;

use crate::{
    compiler::{
        context::CompilerContext, events::EventKind, pass::SsaPass,
        passes::LoadStoreEliminationPass,
    },
    ir::{dump_stage, verify, Graph},
    Error, Result,
};

/// Orchestrates pass execution over the methods of a [`CompilerContext`].
pub struct PassScheduler {
    max_iterations: usize,
    /// Passes in execution order.
    pub passes: Vec<Box<dyn SsaPass>>,
}

impl Default for PassScheduler {
    fn default() -> Self {
        Self::new(1)
    }
}

impl PassScheduler {
    /// Creates a scheduler without passes.
    ///
    /// # Arguments
    ///
    /// * `max_iterations` - Maximum number of pipeline repetitions.
    #[must_use]
    pub fn new(max_iterations: usize) -> Self {
        Self {
            max_iterations,
            passes: Vec::new(),
        }
    }

    /// Creates a scheduler running load-store elimination, configured from `ctx`.
    #[must_use]
    pub fn with_default_passes(ctx: &CompilerContext) -> Self {
        let mut scheduler = Self::new(ctx.config.max_iterations);
        scheduler.add_pass(LoadStoreEliminationPass::new());
        scheduler
    }

    /// Appends a pass to the pipeline.
    pub fn add_pass(&mut self, pass: impl SsaPass + 'static) {
        self.passes.push(Box::new(pass));
    }

    /// Runs the pipeline until no pass changes anything or the iteration
    /// limit is reached.
    ///
    /// Returns the number of iterations run.
    ///
    /// # Errors
    ///
    /// Returns an error if a pass fails to initialize or finalize. Failures on
    /// individual methods are rolled back and never returned.
    pub fn run_pipeline(&mut self, ctx: &CompilerContext) -> Result<usize> {
        let mut iterations = 0;
        for _ in 0..self.max_iterations {
            iterations += 1;
            if !Self::run_passes_once(ctx, &mut self.passes)? {
                break;
            }
        }
        debug!(
            "pipeline finished after {} iterations: {}",
            iterations,
            ctx.events.summary()
        );
        Ok(iterations)
    }

    /// Runs every pass once over all methods.
    ///
    /// Returns `true` if any pass made changes.
    fn run_passes_once(ctx: &CompilerContext, passes: &mut [Box<dyn SsaPass>]) -> Result<bool> {
        let any_changed = AtomicBool::new(false);

        for pass in passes.iter_mut() {
            pass.initialize(ctx)?;
        }

        let methods = ctx.all_methods();
        for pass in passes.iter() {
            methods.par_iter().for_each(|method| {
                if !pass.should_run(method, ctx) {
                    return;
                }
                let Some(mut graph) = ctx.take_graph(method) else {
                    return;
                };
                if Self::run_on_method(pass.as_ref(), &mut graph, ctx) {
                    any_changed.store(true, Ordering::Relaxed);
                    ctx.processed_methods.insert(method.clone());
                }
                ctx.add_graph(graph);
            });
        }

        for pass in passes.iter_mut() {
            pass.finalize(ctx)?;
        }

        Ok(any_changed.load(Ordering::Relaxed))
    }

    /// Runs `pass` on one graph, rolling back on failure. Returns `true` if
    /// the graph changed.
    fn run_on_method(pass: &dyn SsaPass, graph: &mut Graph, ctx: &CompilerContext) -> bool {
        let method = graph.signature().to_string();
        let backup = graph.clone();
        let before = ctx
            .config
            .record_dumps
            .then(|| dump_stage(graph, pass.name(), false));

        let result = pass.run_on_method(graph, ctx).and_then(|changed| {
            if changed && ctx.config.verify_graphs {
                verify(graph)?;
            }
            Ok(changed)
        });

        match result {
            Ok(true) => {
                if let Some(before) = before {
                    ctx.record_dump(&method, before);
                    ctx.record_dump(&method, dump_stage(graph, pass.name(), true));
                }
                true
            }
            Ok(false) => false,
            Err(error) => {
                Self::roll_back(pass, graph, backup, ctx, &method, &error);
                false
            }
        }
    }

    fn roll_back(
        pass: &dyn SsaPass,
        graph: &mut Graph,
        backup: Graph,
        ctx: &CompilerContext,
        method: &str,
        error: &Error,
    ) {
        warn!("{} failed on {}, rolling back: {}", pass.name(), method, error);
        *graph = backup;
        ctx.failed_methods.insert(method.to_string());
        ctx.events
            .record(EventKind::Error)
            .method(method)
            .pass(pass.name())
            .message(error.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        compiler::CompilerConfig,
        ir::{DataType, GraphBuilder, Op},
    };

    struct FailingPass;

    impl SsaPass for FailingPass {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn run_on_method(&self, graph: &mut Graph, _ctx: &CompilerContext) -> Result<bool> {
            let entry = graph.entry();
            graph.append(entry, Op::ParameterValue { index: 9 }, DataType::Int32);
            Err(invariant_error!("broken on purpose"))
        }
    }

    struct CountingPass;

    impl SsaPass for CountingPass {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn run_on_method(&self, graph: &mut Graph, ctx: &CompilerContext) -> Result<bool> {
            ctx.events
                .record(EventKind::Info)
                .method(graph.signature())
                .message("visited");
            Ok(false)
        }
    }

    fn method(signature: &str) -> Graph {
        GraphBuilder::new(signature)
            .build(|f| {
                f.block(0, |b| b.ret_void());
            })
            .unwrap()
    }

    #[test]
    fn failing_pass_is_rolled_back() {
        let ctx = CompilerContext::with_graphs(CompilerConfig::default(), [method("void Main.a()")]);
        let original = ctx.with_graph("void Main.a()", Clone::clone).unwrap();

        let mut scheduler = PassScheduler::new(3);
        scheduler.add_pass(FailingPass);
        let iterations = scheduler.run_pipeline(&ctx).unwrap();

        assert_eq!(iterations, 1);
        assert!(ctx.is_failed("void Main.a()"));
        assert!(!ctx.is_processed("void Main.a()"));
        assert_eq!(ctx.with_graph("void Main.a()", Clone::clone).unwrap(), original);
        let error = ctx.events.errors().next().unwrap();
        assert_eq!(error.pass.as_deref(), Some("failing"));
        assert!(error.message.contains("broken on purpose"));
    }

    #[test]
    fn passes_visit_every_method() {
        let ctx = CompilerContext::with_graphs(
            CompilerConfig::default(),
            (0..8).map(|i| method(&format!("void Main.m{i}()"))),
        );
        let mut scheduler = PassScheduler::new(2);
        scheduler.add_pass(CountingPass);
        scheduler.run_pipeline(&ctx).unwrap();
        assert_eq!(ctx.events.count_kind(EventKind::Info), 8);
        assert_eq!(ctx.method_count(), 8);
    }
}
