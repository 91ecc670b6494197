use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard};

use anyhow::{anyhow, Result};

use crate::exec::{ExecutionFrame, SessionState};
use crate::graph::{Attributes, Node};
use crate::tensor::{DType, MlValue, SharedTensor, Tensor};

pub(crate) fn lock_tensor(shared: &SharedTensor) -> Result<MutexGuard<'_, Tensor>> {
    shared.lock().map_err(|_| anyhow!("tensor lock poisoned"))
}

/// Everything a kernel may touch while computing one node: input/output
/// tensor handles, the attribute bag, implicit outer-scope inputs, and the
/// run's terminate flag.
pub struct KernelContext<'a> {
    node: &'a Node,
    frame: &'a ExecutionFrame,
    state: &'a SessionState,
    terminate: &'a AtomicBool,
}

impl<'a> KernelContext<'a> {
    pub(crate) fn new(
        node: &'a Node,
        frame: &'a ExecutionFrame,
        state: &'a SessionState,
        terminate: &'a AtomicBool,
    ) -> Self {
        KernelContext {
            node,
            frame,
            state,
            terminate,
        }
    }

    pub fn node(&self) -> &Node {
        self.node
    }

    pub fn attrs(&self) -> &Attributes {
        &self.node.attrs
    }

    pub fn input_count(&self) -> usize {
        self.node.inputs.len()
    }

    pub fn input(&self, index: usize) -> Result<SharedTensor> {
        self.opt_input(index).ok_or_else(|| {
            anyhow!(
                "node {} is missing required input {}",
                self.node.name,
                index
            )
        })
    }

    pub fn opt_input(&self, index: usize) -> Option<SharedTensor> {
        let name = self.node.inputs.get(index)?;
        if name.is_empty() {
            return None;
        }
        self.frame.value_by_name(name).ok()?.as_tensor().ok()
    }

    /// Tensor handle for output `index`, created in the frame on first use.
    pub fn output(&self, index: usize, dtype: DType, shape: &[usize]) -> Result<SharedTensor> {
        let name = self
            .node
            .outputs
            .get(index)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| anyhow!("node {} has no output {}", self.node.name, index))?;
        let value_index = self.frame.index_of(name)?;
        self.frame.get_or_create(value_index, dtype, shape)
    }

    /// Outer-scope value visible to this node's nested graphs.
    pub fn implicit_input(&self, name: &str) -> Result<MlValue> {
        self.frame.value_by_name(name)
    }

    pub fn subgraph_state(&self, attr: &str) -> Option<Arc<SessionState>> {
        self.state.subgraph(self.node.index, attr)
    }

    pub fn terminate_flag(&self) -> &AtomicBool {
        self.terminate
    }

    pub fn terminated(&self) -> bool {
        self.terminate.load(Ordering::Relaxed)
    }
}
