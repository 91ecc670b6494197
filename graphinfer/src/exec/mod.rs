mod fence;
mod frame;
mod parallel;
mod pattern;
pub(crate) mod plan;
mod provider;
pub(crate) mod sequential;
mod state;

pub use fence::Fence;
pub use frame::ExecutionFrame;
pub use parallel::ParallelExecutor;
pub use pattern::{MemoryPattern, MemoryPatternGroup};
pub use plan::{SequentialPlan, ValueKind};
pub use provider::{CpuExecutionProvider, ExecutionProvider, ExecutionProviders};
pub use sequential::SequentialExecutor;
pub use state::SessionState;

pub use crate::tensor::CPU_PROVIDER;

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};

use crate::error::EngineError;
use crate::ops::KernelContext;

/// Run one node to completion on the current thread: input/output fence
/// observations bracket the synchronous kernel invocation.
pub(crate) fn run_node_once(
    state: &SessionState,
    frame: &ExecutionFrame,
    node_index: usize,
    terminate: &AtomicBool,
) -> Result<()> {
    if terminate.load(Ordering::Relaxed) {
        crate::warning!("exiting due to terminate flag being set to true");
        return Err(EngineError::terminated());
    }

    let node = state.graph().node(node_index)?;
    let kernel = state.kernel(node_index)?;
    let queue_id = state.exec_queue_id(node_index);

    let input_fences = frame.fences_for(node.present_inputs())?;
    let implicit_fences = frame.fences_for(state.implicit_inputs(node_index).iter())?;
    let output_fences = frame.fences_for(node.present_outputs())?;

    for fence in input_fences.iter().chain(implicit_fences.iter()).flatten() {
        fence.before_using_as_input(node.provider, queue_id);
    }
    for fence in output_fences.iter().flatten() {
        fence.before_using_as_output(node.provider, queue_id);
    }

    crate::trace!("computing kernel for node {} ({})", node.name, node.op);
    let ctx = KernelContext::new(node, frame, state, terminate);
    kernel
        .compute(&ctx)
        .with_context(|| format!("compute failed for node {}", node.name))?;

    for fence in input_fences.iter().chain(implicit_fences.iter()).flatten() {
        fence.after_used_as_input(queue_id);
    }
    for fence in output_fences.iter().flatten() {
        fence.after_used_as_output(queue_id);
    }

    Ok(())
}
