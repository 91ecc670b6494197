//! Cross-queue synchronization handle published by the provider owning a
//! tensor. A producer on one queue hands the tensor to consumers on another
//! without the scheduler owning the sync primitive.

use std::sync::{Condvar, Mutex};

use crate::tensor::ProviderId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// No producer has touched the tensor yet.
    Created,
    /// A producer on `queue` is writing.
    Producing { queue: usize },
    /// The write on `queue` is complete; readers may proceed.
    Produced { queue: usize },
}

#[derive(Debug)]
struct FenceState {
    phase: Phase,
    active_reads: usize,
}

/// Per-tensor synchronization state machine with four observations.
#[derive(Debug)]
pub struct Fence {
    state: Mutex<FenceState>,
    cond: Condvar,
}

impl Default for Fence {
    fn default() -> Self {
        Self::new()
    }
}

impl Fence {
    pub fn new() -> Self {
        Fence {
            state: Mutex::new(FenceState {
                phase: Phase::Created,
                active_reads: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Observed before a kernel reads the tensor. Blocks until the producing
    /// queue has published the value; a read from the producing queue itself
    /// is already ordered by the scheduler and passes through.
    pub fn before_using_as_input(&self, _provider: ProviderId, queue: usize) {
        let mut state = self.state.lock().expect("fence state poisoned");
        loop {
            match state.phase {
                Phase::Created => {
                    // Feed or initializer: nothing to wait for.
                    state.active_reads += 1;
                    return;
                }
                Phase::Producing { queue: writer } if writer == queue => {
                    state.active_reads += 1;
                    return;
                }
                Phase::Produced { .. } => {
                    state.active_reads += 1;
                    return;
                }
                Phase::Producing { .. } => {
                    state = self.cond.wait(state).expect("fence state poisoned");
                }
            }
        }
    }

    /// Observed before a kernel writes the tensor.
    pub fn before_using_as_output(&self, _provider: ProviderId, queue: usize) {
        let mut state = self.state.lock().expect("fence state poisoned");
        state.phase = Phase::Producing { queue };
    }

    /// Observed after a kernel has finished reading.
    pub fn after_used_as_input(&self, _queue: usize) {
        let mut state = self.state.lock().expect("fence state poisoned");
        state.active_reads = state.active_reads.saturating_sub(1);
        self.cond.notify_all();
    }

    /// Observed after a kernel has finished writing; publishes the value.
    pub fn after_used_as_output(&self, queue: usize) {
        let mut state = self.state.lock().expect("fence state poisoned");
        state.phase = Phase::Produced { queue };
        self.cond.notify_all();
    }

    /// True once the producing write has been published.
    pub fn is_produced(&self) -> bool {
        matches!(
            self.state.lock().expect("fence state poisoned").phase,
            Phase::Produced { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::CPU_PROVIDER;

    #[test]
    fn produced_transition_unblocks_readers() {
        let fence = Fence::new();
        fence.before_using_as_output(CPU_PROVIDER, 1);
        assert!(!fence.is_produced());
        fence.after_used_as_output(1);
        assert!(fence.is_produced());
        fence.before_using_as_input(CPU_PROVIDER, 0);
        fence.after_used_as_input(0);
    }

    #[test]
    fn same_queue_reader_is_not_blocked() {
        let fence = Fence::new();
        fence.before_using_as_output(CPU_PROVIDER, 2);
        // Reader on the producing queue relies on scheduler ordering.
        fence.before_using_as_input(CPU_PROVIDER, 2);
        fence.after_used_as_input(2);
        fence.after_used_as_output(2);
    }
}
