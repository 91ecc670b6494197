//! Immutable per-session state shared by all executors: the frozen graph,
//! the allocation plan, resolved kernels, and nested subgraph states.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use crate::graph::Graph;
use crate::ops::OpKernel;
use crate::tensor::SharedTensor;

use super::pattern::MemoryPatternGroup;
use super::plan::SequentialPlan;
use super::provider::ExecutionProviders;

pub struct SessionState {
    pub(crate) graph: Graph,
    pub(crate) plan: Arc<SequentialPlan>,
    pub(crate) kernels: HashMap<usize, Box<dyn OpKernel>>,
    pub(crate) queues: HashMap<usize, usize>,
    pub(crate) providers: ExecutionProviders,
    /// Initializers boxed once per session and shared into every frame.
    pub(crate) initializer_values: HashMap<usize, SharedTensor>,
    /// Outer-scope values each subgraph-carrying node passes through.
    pub(crate) node_implicit_inputs: HashMap<usize, Vec<String>>,
    /// Everything this graph needs from an enclosing scope: its own
    /// implicit inputs plus nested-graph reads it cannot satisfy locally.
    pub(crate) external_inputs: Vec<String>,
    /// Execution state per (node index, attribute name) nested graph.
    pub(crate) subgraphs: HashMap<(usize, String), Arc<SessionState>>,
    pub(crate) enable_mem_pattern: bool,
    pub(crate) pattern_cache: Mutex<HashMap<Vec<Vec<usize>>, Arc<MemoryPatternGroup>>>,
    pub(crate) logid: String,
}

static NO_IMPLICIT: [String; 0] = [];

impl SessionState {
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn plan(&self) -> &Arc<SequentialPlan> {
        &self.plan
    }

    pub fn providers(&self) -> &ExecutionProviders {
        &self.providers
    }

    pub fn logid(&self) -> &str {
        &self.logid
    }

    pub fn kernel(&self, node_index: usize) -> Result<&dyn OpKernel> {
        self.kernels
            .get(&node_index)
            .map(|kernel| kernel.as_ref())
            .ok_or_else(|| anyhow!("no kernel resolved for node {}", node_index))
    }

    pub fn exec_queue_id(&self, node_index: usize) -> usize {
        self.queues.get(&node_index).copied().unwrap_or(0)
    }

    pub fn implicit_inputs(&self, node_index: usize) -> &[String] {
        self.node_implicit_inputs
            .get(&node_index)
            .map(|names| names.as_slice())
            .unwrap_or(&NO_IMPLICIT)
    }

    /// Values this state expects the enclosing scope (or the caller, for a
    /// main graph) to provide.
    pub fn external_inputs(&self) -> &[String] {
        &self.external_inputs
    }

    pub fn subgraph(&self, node_index: usize, attr: &str) -> Option<Arc<SessionState>> {
        self.subgraphs.get(&(node_index, attr.to_string())).cloned()
    }

    pub fn mem_pattern_enabled(&self) -> bool {
        self.enable_mem_pattern
    }

    pub fn cached_pattern(&self, key: &[Vec<usize>]) -> Option<Arc<MemoryPatternGroup>> {
        self.pattern_cache
            .lock()
            .expect("pattern cache poisoned")
            .get(key)
            .cloned()
    }

    /// Insert a freshly generated pattern group; the first writer wins.
    pub fn update_pattern_cache(&self, key: Vec<Vec<usize>>, group: MemoryPatternGroup) {
        let mut cache = self.pattern_cache.lock().expect("pattern cache poisoned");
        cache.entry(key).or_insert_with(|| Arc::new(group));
    }

    /// Number of pattern groups cached so far; used by tests.
    pub fn cached_pattern_count(&self) -> usize {
        self.pattern_cache
            .lock()
            .expect("pattern cache poisoned")
            .len()
    }
}
