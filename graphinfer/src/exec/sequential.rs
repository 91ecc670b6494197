//! Single-threaded executor: visits nodes in the precomputed topological
//! order on the calling thread. Functionally equivalent to the parallel
//! executor; used for single-threaded sessions and deterministic debugging.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Result;

use crate::tensor::MlValue;

use super::frame::ExecutionFrame;
use super::parallel::release_node_inputs;
use super::state::SessionState;

pub struct SequentialExecutor {
    terminate: Arc<AtomicBool>,
}

impl SequentialExecutor {
    pub fn new(terminate: Arc<AtomicBool>) -> Self {
        SequentialExecutor { terminate }
    }

    pub fn execute(
        &self,
        state: &SessionState,
        frame: &ExecutionFrame,
        output_names: &[String],
    ) -> Result<Vec<MlValue>> {
        for &index in &state.plan().topo {
            super::run_node_once(state, frame, index, &self.terminate)?;
            release_node_inputs(state, frame, index);
        }
        frame.fetch(output_names)
    }
}

/// Run a nested session state to completion on the current thread, feeding
/// the subgraph's implicit inputs from the given map.
pub(crate) fn execute_subgraph(
    state: &SessionState,
    feeds: &HashMap<String, MlValue>,
    terminate: &AtomicBool,
) -> Result<Vec<MlValue>> {
    let outputs = state.graph().outputs().to_vec();
    let frame = ExecutionFrame::new(state, feeds, &outputs, None)?;
    for &index in &state.plan().topo {
        super::run_node_once(state, &frame, index, terminate)?;
        release_node_inputs(state, &frame, index);
    }
    frame.fetch(&outputs)
}
