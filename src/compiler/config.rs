//! Configuration of the optimization pipeline.

use crate::analysis::heap::{CollectorOptions, DEFAULT_MAX_HEAP_LOCATIONS};

/// Configuration for the pass scheduler and the passes it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerConfig {
    /// Maximum number of heap locations tracked per method (default: 32).
    ///
    /// Methods touching more locations are left alone.
    pub max_heap_locations: usize,

    /// Rewrite partially escaping allocations with predicated accesses
    /// (default: true).
    pub enable_partial_escape: bool,

    /// Verify every graph after a pass changed it (default: true).
    ///
    /// A graph failing verification is rolled back like a failing pass.
    pub verify_graphs: bool,

    /// Record `CHECK-START` dumps before and after every pass that changed a
    /// method (default: false).
    pub record_dumps: bool,

    /// Number of times the whole pipeline runs (default: 1).
    pub max_iterations: usize,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            max_heap_locations: DEFAULT_MAX_HEAP_LOCATIONS,
            enable_partial_escape: true,
            verify_graphs: true,
            record_dumps: false,
            max_iterations: 1,
        }
    }
}

impl CompilerConfig {
    /// Sets the heap location cap.
    #[must_use]
    pub fn with_max_heap_locations(mut self, max: usize) -> Self {
        self.max_heap_locations = max;
        self
    }

    /// Enables or disables partial escape materialization.
    #[must_use]
    pub fn with_partial_escape(mut self, enabled: bool) -> Self {
        self.enable_partial_escape = enabled;
        self
    }

    /// Enables or disables dump recording.
    #[must_use]
    pub fn with_dumps(mut self, enabled: bool) -> Self {
        self.record_dumps = enabled;
        self
    }

    /// Options for the heap location collector derived from this configuration.
    #[must_use]
    pub fn collector_options(&self) -> CollectorOptions {
        CollectorOptions {
            max_heap_locations: self.max_heap_locations,
            partial_escape: self.enable_partial_escape,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = CompilerConfig::default();
        assert_eq!(config.max_heap_locations, 32);
        assert!(config.enable_partial_escape);
        assert!(config.verify_graphs);
        assert!(!config.record_dumps);
        assert_eq!(config.max_iterations, 1);

        let options = config.with_partial_escape(false).collector_options();
        assert!(!options.partial_escape);
        assert_eq!(options.max_heap_locations, 32);
    }
}
