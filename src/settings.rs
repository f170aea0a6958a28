//! Pipeline-wide tunables.

/// Bounds and display toggles threaded through the pipeline. Defaults match
/// the constants the original implementation hard-coded in a handful of
/// modules (`dataflow`'s `MAX_STEPS`, `cfa`'s `MAX_ITERATIONS`).
#[derive(Debug, Clone)]
pub struct Settings {
    /// Step budget for `DefUseExplorer` walks before giving up and answering
    /// conservatively.
    pub max_steps: usize,
    /// Iteration budget for the interval-collapsing loop-structuring
    /// algorithm before declaring the graph irreducible.
    pub max_interval_iterations: usize,
    /// Whether the free-memory-pointer special case in the `Mem` may-equal
    /// oracle is enabled (it assumes the free memory pointer is never
    /// aliased by any other memory region).
    pub simplify_free_mem_ptr: bool,
    /// Whether generated code includes assignments whose result is
    /// immediately discarded (`_ = ...;`), useful for debugging the lifter.
    pub show_unused_assignments: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            max_steps: 35,
            max_interval_iterations: 20,
            simplify_free_mem_ptr: true,
            show_unused_assignments: false,
        }
    }
}
