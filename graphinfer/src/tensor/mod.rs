mod dtype;
mod location;
mod math;
mod tensor;
mod value;

pub use dtype::{DType, Element};
pub use location::{MemType, MemoryInfo, ProviderId, CPU_PROVIDER};
pub use tensor::{ArenaBuffer, Tensor};
pub use value::{MlValue, SharedTensor};
