//! The pass trait implemented by every graph transformation.

use crate::{compiler::context::CompilerContext, ir::Graph, Result};

/// A transformation of one method's graph.
///
/// Passes must be thread-safe (`Send + Sync`): the scheduler runs the same
/// pass on several methods in parallel. Each invocation gets exclusive access
/// to one graph and shared access to the context.
pub trait SsaPass: Send + Sync {
    /// Unique name for logging, events and dumps.
    fn name(&self) -> &'static str;

    /// Should this pass run on a specific method?
    fn should_run(&self, _method: &str, _ctx: &CompilerContext) -> bool {
        true
    }

    /// Runs the pass on a single method.
    ///
    /// Returns `true` if the graph changed. Declining to optimize is not an
    /// error and returns `Ok(false)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pass detects an internal inconsistency. The
    /// scheduler then restores the graph as it was before the pass.
    fn run_on_method(&self, graph: &mut Graph, ctx: &CompilerContext) -> Result<bool>;

    /// Called once before the pass runs over all methods.
    ///
    /// # Errors
    ///
    /// Returns an error if initialization fails.
    fn initialize(&mut self, _ctx: &CompilerContext) -> Result<()> {
        Ok(())
    }

    /// Called once after the pass ran over all methods.
    ///
    /// # Errors
    ///
    /// Returns an error if finalization fails.
    fn finalize(&mut self, _ctx: &CompilerContext) -> Result<()> {
        Ok(())
    }

    /// Get a description of what this pass does.
    fn description(&self) -> &'static str {
        "No description available"
    }
}
