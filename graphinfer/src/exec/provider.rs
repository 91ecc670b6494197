use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::tensor::{ArenaBuffer, MemoryInfo, ProviderId, Tensor, CPU_PROVIDER};

use super::fence::Fence;

/// Execution backend: owns allocation, cross-device copies, and fence
/// publication for tensors placed on it.
pub trait ExecutionProvider: Send + Sync {
    fn id(&self) -> ProviderId;

    /// Copy `src` into `dst`; both tensors are already allocated and shaped.
    fn copy_tensor(&self, src: &Tensor, dst: &mut Tensor) -> Result<()>;

    fn on_run_start(&self) -> Result<()> {
        Ok(())
    }

    fn on_run_end(&self) -> Result<()> {
        Ok(())
    }

    /// Fence for a tensor placed at `info`, or None when accesses on this
    /// provider are ordered by the scheduler alone.
    fn create_fence(&self, info: &MemoryInfo) -> Option<Arc<Fence>> {
        let _ = info;
        None
    }

    /// One contiguous device buffer for arena-realized values.
    fn allocate_arena(&self, nbytes: usize) -> Arc<ArenaBuffer> {
        Arc::new(ArenaBuffer::new(nbytes))
    }

    /// Queue kernels run on unless their definition says otherwise.
    fn default_queue(&self) -> usize {
        0
    }
}

/// Default CPU backend.
pub struct CpuExecutionProvider {
    use_arena: bool,
}

impl CpuExecutionProvider {
    pub fn new(use_arena: bool) -> Self {
        CpuExecutionProvider { use_arena }
    }

    pub fn arena_enabled(&self) -> bool {
        self.use_arena
    }
}

impl ExecutionProvider for CpuExecutionProvider {
    fn id(&self) -> ProviderId {
        CPU_PROVIDER
    }

    fn copy_tensor(&self, src: &Tensor, dst: &mut Tensor) -> Result<()> {
        if src.dtype() != dst.dtype() || src.shape() != dst.shape() {
            return Err(anyhow!(
                "copy_tensor mismatch: {:?} {:?} vs {:?} {:?}",
                src.dtype(),
                src.shape(),
                dst.dtype(),
                dst.shape()
            ));
        }
        dst.as_bytes_mut().copy_from_slice(src.as_bytes());
        Ok(())
    }
}

/// Registered providers in insertion order; lookups are by id.
#[derive(Default, Clone)]
pub struct ExecutionProviders {
    order: Vec<ProviderId>,
    map: HashMap<ProviderId, Arc<dyn ExecutionProvider>>,
}

impl ExecutionProviders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, provider: Arc<dyn ExecutionProvider>) {
        let id = provider.id();
        if self.map.insert(id, provider).is_none() {
            self.order.push(id);
        }
    }

    pub fn get(&self, id: ProviderId) -> Option<Arc<dyn ExecutionProvider>> {
        self.map.get(&id).cloned()
    }

    pub fn contains(&self, id: ProviderId) -> bool {
        self.map.contains_key(&id)
    }

    /// Provider for `id`, falling back to the CPU provider.
    pub fn get_or_cpu(&self, id: ProviderId) -> Result<Arc<dyn ExecutionProvider>> {
        self.get(id)
            .or_else(|| self.get(CPU_PROVIDER))
            .ok_or_else(|| anyhow!("no execution provider registered for {}", id))
    }

    pub fn iter(&self) -> impl Iterator<Item = Arc<dyn ExecutionProvider>> + '_ {
        self.order.iter().filter_map(|id| self.map.get(id).cloned())
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
