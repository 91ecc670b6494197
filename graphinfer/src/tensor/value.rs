use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use super::tensor::Tensor;

/// Tensor handle shared between the frame and kernel contexts.
pub type SharedTensor = Arc<Mutex<Tensor>>;

/// Run-time value slot: the execution counterpart of a value definition.
#[derive(Debug, Clone, Default)]
pub enum MlValue {
    #[default]
    Unallocated,
    Tensor(SharedTensor),
    Sequence(Vec<SharedTensor>),
    Map(BTreeMap<i64, f32>),
}

impl MlValue {
    pub fn from_tensor(tensor: Tensor) -> Self {
        MlValue::Tensor(Arc::new(Mutex::new(tensor)))
    }

    pub fn is_allocated(&self) -> bool {
        !matches!(self, MlValue::Unallocated)
    }

    pub fn is_tensor(&self) -> bool {
        matches!(self, MlValue::Tensor(_))
    }

    pub fn as_tensor(&self) -> Result<SharedTensor> {
        match self {
            MlValue::Tensor(tensor) => Ok(Arc::clone(tensor)),
            MlValue::Unallocated => Err(anyhow!("value is unallocated")),
            _ => Err(anyhow!("value is not a tensor")),
        }
    }

    /// Clone out the underlying tensor data.
    pub fn to_tensor(&self) -> Result<Tensor> {
        let shared = self.as_tensor()?;
        let guard = shared.lock().map_err(|_| anyhow!("tensor lock poisoned"))?;
        Ok(guard.clone())
    }
}

impl From<Tensor> for MlValue {
    fn from(tensor: Tensor) -> Self {
        MlValue::from_tensor(tensor)
    }
}
