//! Ready-queue dataflow scheduler over a fixed worker pool.
//!
//! Each task runs one node to completion, then adopts the first successor it
//! made ready and enqueues the rest. `execute` blocks the calling thread
//! until the outstanding-task count reaches zero.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use anyhow::Result;

use crate::error::EngineError;
use crate::tensor::MlValue;

use super::frame::ExecutionFrame;
use super::state::SessionState;

struct SchedulerState {
    /// Per-node remaining predecessor count; a node is ready at zero.
    refs: Mutex<Vec<usize>>,
    /// In-flight task count; guarded by the same mutex the waiter sleeps on.
    outstanding: Mutex<usize>,
    done: Condvar,
    first_error: Mutex<Option<anyhow::Error>>,
    terminate: Arc<AtomicBool>,
}

impl SchedulerState {
    fn new(initial_refs: Vec<usize>, terminate: Arc<AtomicBool>) -> Self {
        SchedulerState {
            refs: Mutex::new(initial_refs),
            outstanding: Mutex::new(0),
            done: Condvar::new(),
            first_error: Mutex::new(None),
            terminate,
        }
    }

    fn enqueue_tick(&self) {
        let mut outstanding = self.outstanding.lock().expect("outstanding poisoned");
        *outstanding += 1;
    }

    /// Decrement successor refcounts for a completed node; returns the nodes
    /// that just became ready.
    fn complete(&self, successors: &[usize]) -> Vec<usize> {
        let mut refs = self.refs.lock().expect("node refs poisoned");
        let mut ready = Vec::new();
        for &next in successors {
            refs[next] -= 1;
            if refs[next] == 0 {
                ready.push(next);
            }
        }
        ready
    }

    /// First error wins; any error also trips the terminate flag so other
    /// workers stop at their next node boundary.
    fn record_error(&self, err: anyhow::Error) {
        let mut slot = self.first_error.lock().expect("error slot poisoned");
        if slot.is_none() {
            *slot = Some(err);
        }
        self.terminate.store(true, Ordering::Relaxed);
    }

    fn finish(&self) {
        let mut outstanding = self.outstanding.lock().expect("outstanding poisoned");
        *outstanding -= 1;
        if *outstanding == 0 {
            self.done.notify_all();
        }
    }

    fn wait_done(&self) {
        let mut outstanding = self.outstanding.lock().expect("outstanding poisoned");
        while *outstanding > 0 {
            outstanding = self.done.wait(outstanding).expect("outstanding poisoned");
        }
    }

    fn take_error(&self) -> Option<anyhow::Error> {
        self.first_error.lock().expect("error slot poisoned").take()
    }
}

pub struct ParallelExecutor {
    pool: Arc<rayon::ThreadPool>,
    terminate: Arc<AtomicBool>,
    last_outstanding: AtomicUsize,
}

impl ParallelExecutor {
    pub fn new(pool: Arc<rayon::ThreadPool>, terminate: Arc<AtomicBool>) -> Self {
        ParallelExecutor {
            pool,
            terminate,
            last_outstanding: AtomicUsize::new(usize::MAX),
        }
    }

    /// Outstanding-task count observed after the last `execute` returned.
    pub fn outstanding(&self) -> usize {
        self.last_outstanding.load(Ordering::Relaxed)
    }

    pub fn execute(
        &self,
        state: &SessionState,
        frame: &ExecutionFrame,
        output_names: &[String],
    ) -> Result<Vec<MlValue>> {
        let plan = state.plan();
        let sched = SchedulerState::new(plan.initial_refs.clone(), Arc::clone(&self.terminate));
        let sched = &sched;

        self.pool.scope(|scope| {
            for &root in &plan.roots {
                sched.enqueue_tick();
                scope.spawn(move |scope| run_node(root, state, frame, sched, scope));
            }
        });

        sched.wait_done();
        self.last_outstanding
            .store(*sched.outstanding.lock().expect("outstanding poisoned"), Ordering::Relaxed);

        if let Some(err) = sched.take_error() {
            return Err(err);
        }
        crate::trace!("fetching output");
        frame.fetch(output_names)
    }
}

fn run_node<'s>(
    mut index: usize,
    state: &'s SessionState,
    frame: &'s ExecutionFrame,
    sched: &'s SchedulerState,
    scope: &rayon::Scope<'s>,
) {
    // Avoid context switching where possible: keep running along the chain
    // of successors this worker itself unblocks.
    loop {
        if sched.terminate.load(Ordering::Relaxed) {
            sched.record_error(EngineError::terminated());
            break;
        }

        if let Err(err) = super::run_node_once(state, frame, index, &sched.terminate) {
            sched.record_error(err);
            break;
        }

        release_node_inputs(state, frame, index);

        let ready = sched.complete(&state.plan().successors[index]);
        let mut ready = ready.into_iter();
        match ready.next() {
            Some(first) => {
                for next in ready {
                    sched.enqueue_tick();
                    scope.spawn(move |scope| run_node(next, state, frame, sched, scope));
                }
                index = first;
            }
            None => break,
        }
    }
    sched.finish();
}

/// Note completed consumption of the node's inputs so the frame can release
/// values whose last consumer has run.
pub(crate) fn release_node_inputs(state: &SessionState, frame: &ExecutionFrame, index: usize) {
    let Ok(node) = state.graph().node(index) else { return };
    for input in node.present_inputs() {
        if let Ok(idx) = frame.index_of(input) {
            let _ = frame.decrement_value_ref(idx);
        }
    }
}
