//! Kernel registry keyed on (op type, domain, since-version, provider).

use std::collections::HashMap;

use anyhow::Result;
use once_cell::sync::Lazy;

use crate::error::EngineError;
use crate::graph::{Domain, Node, OpKind};
use crate::tensor::{DType, ProviderId, CPU_PROVIDER};

use super::OpKernel;

/// Declared capabilities of a registered kernel.
#[derive(Debug, Clone, Copy)]
pub struct KernelDef {
    pub op: OpKind,
    pub domain: Domain,
    pub since_version: u32,
    pub provider: ProviderId,
    /// Element types accepted for the primary input.
    pub dtypes: &'static [DType],
    /// Queue the kernel executes on; fences key their observations on it.
    pub exec_queue_id: usize,
}

pub type KernelFactory = fn(&Node) -> Result<Box<dyn OpKernel>>;

pub struct KernelRegistration {
    pub def: KernelDef,
    pub factory: KernelFactory,
}

impl KernelRegistration {
    pub(crate) fn cpu(op: OpKind, dtypes: &'static [DType], factory: KernelFactory) -> Self {
        KernelRegistration {
            def: KernelDef {
                op,
                domain: op.domain(),
                since_version: op.since_version(),
                provider: CPU_PROVIDER,
                dtypes,
                exec_queue_id: 0,
            },
            factory,
        }
    }
}

static CPU_KERNELS: Lazy<HashMap<OpKind, KernelRegistration>> = Lazy::new(|| {
    let mut map = HashMap::new();
    super::cpu::register_all(&mut map);
    map
});

/// Resolve the kernel registration for an op on a provider.
///
/// Providers without a registry of their own borrow the CPU kernels; a real
/// device backend would shadow this table with its own registrations.
pub fn lookup_kernel(provider: ProviderId, op: OpKind) -> Result<&'static KernelRegistration> {
    CPU_KERNELS.get(&op).ok_or_else(|| {
        EngineError::not_implemented(format!(
            "no kernel registered for op {} on provider {}",
            op, provider
        ))
    })
}
