mod context;
mod cpu;
mod registry;

use anyhow::Result;

pub use context::KernelContext;
pub use registry::{lookup_kernel, KernelDef, KernelFactory, KernelRegistration};

/// An operator kernel. `compute` runs synchronously; cross-device asynchrony
/// is expressed through fences, not by pausing the task.
pub trait OpKernel: Send + Sync {
    fn compute(&self, ctx: &KernelContext) -> Result<()>;
}

pub(crate) use context::lock_tensor;
