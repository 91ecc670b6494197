use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Session-wide configuration recognized by the core.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Run nodes on the calling thread in topological order instead of the
    /// parallel scheduler.
    pub enable_sequential_execution: bool,
    /// Worker pool size for the parallel scheduler; 0 means half the
    /// hardware threads.
    pub session_thread_pool_size: usize,
    /// Fixed-point cap for the graph rewriter.
    pub max_num_graph_transformation_steps: usize,
    /// Register the built-in rewrite rule set.
    pub enable_default_transformers: bool,
    /// Cache memory-pattern templates keyed on input shapes.
    pub enable_mem_pattern: bool,
    /// Passed to the default CPU provider.
    pub enable_cpu_mem_arena: bool,
    pub enable_profiling: bool,
    pub profile_file_prefix: String,
    pub session_logid: String,
    pub session_log_verbosity_level: i32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            enable_sequential_execution: true,
            session_thread_pool_size: 0,
            max_num_graph_transformation_steps: 5,
            enable_default_transformers: true,
            enable_mem_pattern: true,
            enable_cpu_mem_arena: true,
            enable_profiling: false,
            profile_file_prefix: "graphinfer_profile".to_string(),
            session_logid: String::new(),
            session_log_verbosity_level: 0,
        }
    }
}

/// Per-run configuration.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub run_tag: String,
    pub run_log_verbosity_level: i32,
    /// Shared cancellation flag; setting it true makes in-flight workers
    /// abandon the run at the next node boundary.
    pub terminate: Option<Arc<AtomicBool>>,
}
