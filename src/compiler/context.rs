//! Shared state of a compilation run.
//!
//! The [`CompilerContext`] owns the graphs of all methods being optimized,
//! keyed by method signature, together with the event log and the sets of
//! methods that were changed or had to be rolled back. All collections are
//! thread-safe so the scheduler can process methods in parallel.

use std::time::{Duration, Instant};

use dashmap::{DashMap, DashSet};

use crate::{
    compiler::{config::CompilerConfig, events::EventLog},
    ir::Graph,
};

/// Shared state of a compilation run.
pub struct CompilerContext {
    /// Graph of each method, keyed by signature.
    pub graphs: DashMap<String, Graph>,

    /// Accumulated events from all passes.
    pub events: EventLog,

    /// Methods changed by at least one pass.
    pub processed_methods: DashSet<String>,

    /// Methods on which a pass failed and was rolled back.
    pub failed_methods: DashSet<String>,

    /// Configuration shared by all passes.
    pub config: CompilerConfig,

    /// Recorded `CHECK-START` dumps, per method, in recording order.
    dumps: DashMap<String, Vec<String>>,

    start_time: Instant,
}

impl CompilerContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new(config: CompilerConfig) -> Self {
        Self {
            graphs: DashMap::new(),
            events: EventLog::new(),
            processed_methods: DashSet::new(),
            failed_methods: DashSet::new(),
            config,
            dumps: DashMap::new(),
            start_time: Instant::now(),
        }
    }

    /// Creates a context holding `graphs`.
    #[must_use]
    pub fn with_graphs(config: CompilerConfig, graphs: impl IntoIterator<Item = Graph>) -> Self {
        let ctx = Self::new(config);
        for graph in graphs {
            ctx.add_graph(graph);
        }
        ctx
    }

    /// Returns the elapsed time since the context was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    // ── Graph access ────────────────────────────────────────────────────

    /// Adds a method, replacing any graph with the same signature.
    pub fn add_graph(&self, graph: Graph) {
        self.graphs.insert(graph.signature().to_string(), graph);
    }

    /// Executes a closure with a reference to a method's graph.
    pub fn with_graph<R, F>(&self, method: &str, f: F) -> Option<R>
    where
        F: FnOnce(&Graph) -> R,
    {
        self.graphs.get(method).map(|g| f(&g))
    }

    /// Executes a closure with a mutable reference to a method's graph.
    pub fn with_graph_mut<R, F>(&self, method: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut Graph) -> R,
    {
        self.graphs.get_mut(method).map(|mut g| f(&mut g))
    }

    /// Removes a method's graph from the context.
    pub fn take_graph(&self, method: &str) -> Option<Graph> {
        self.graphs.remove(method).map(|(_, graph)| graph)
    }

    /// Signatures of all methods, sorted.
    #[must_use]
    pub fn all_methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.graphs.iter().map(|e| e.key().clone()).collect();
        methods.sort();
        methods
    }

    /// Number of methods.
    #[must_use]
    pub fn method_count(&self) -> usize {
        self.graphs.len()
    }

    // ── Method status ───────────────────────────────────────────────────

    /// Returns `true` if some pass changed the method.
    #[must_use]
    pub fn is_processed(&self, method: &str) -> bool {
        self.processed_methods.contains(method)
    }

    /// Returns `true` if some pass failed on the method.
    #[must_use]
    pub fn is_failed(&self, method: &str) -> bool {
        self.failed_methods.contains(method)
    }

    // ── Dumps ───────────────────────────────────────────────────────────

    /// Stores a dump for `method`.
    pub fn record_dump(&self, method: &str, dump: String) {
        self.dumps.entry(method.to_string()).or_default().push(dump);
    }

    /// The dumps recorded for `method`.
    #[must_use]
    pub fn dumps(&self, method: &str) -> Vec<String> {
        self.dumps
            .get(method)
            .map(|d| d.value().clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::GraphBuilder;

    fn empty(signature: &str) -> Graph {
        GraphBuilder::new(signature)
            .build(|f| {
                f.block(0, |b| b.ret_void());
            })
            .unwrap()
    }

    #[test]
    fn graphs_are_keyed_by_signature() {
        let ctx = CompilerContext::with_graphs(
            CompilerConfig::default(),
            [empty("void Main.b()"), empty("void Main.a()")],
        );
        assert_eq!(ctx.method_count(), 2);
        assert_eq!(ctx.all_methods(), vec!["void Main.a()", "void Main.b()"]);
        assert_eq!(ctx.with_graph("void Main.a()", Graph::block_count), Some(1));

        let graph = ctx.take_graph("void Main.a()").unwrap();
        assert_eq!(graph.signature(), "void Main.a()");
        assert_eq!(ctx.method_count(), 1);
    }

    #[test]
    fn dumps_accumulate() {
        let ctx = CompilerContext::new(CompilerConfig::default());
        ctx.record_dump("void Main.a()", "before".into());
        ctx.record_dump("void Main.a()", "after".into());
        assert_eq!(ctx.dumps("void Main.a()"), vec!["before", "after"]);
        assert!(ctx.dumps("void Main.b()").is_empty());
    }
}
