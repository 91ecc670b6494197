pub mod logging;

mod error;
mod exec;
mod graph;
mod model;
mod ops;
mod profile;
mod rewrite;
mod session;
mod tensor;

pub use error::EngineError;
pub use exec::{
    CpuExecutionProvider, ExecutionFrame, ExecutionProvider, ExecutionProviders, Fence,
    MemoryPattern, MemoryPatternGroup, ParallelExecutor, SequentialExecutor, SequentialPlan,
    SessionState, ValueKind, CPU_PROVIDER,
};
pub use graph::{AttrValue, Attributes, Domain, Graph, Node, OpKind, ValueInfo};
pub use model::Model;
pub use ops::{lookup_kernel, KernelContext, KernelDef, KernelRegistration, OpKernel};
pub use profile::Profiler;
pub use rewrite::{
    ConstantFolding, ConvAddFusion, ConvBnFusion, ConvMulFusion, EliminateIdentity, EliminateSlice,
    GraphTransformer, OpTarget, RewriteRule, RuleBasedPass, TransformerManager,
    UnsqueezeElimination,
};
pub use session::{RunOptions, Session, SessionOptions};
pub use tensor::{
    ArenaBuffer, DType, Element, MemType, MemoryInfo, MlValue, ProviderId, SharedTensor, Tensor,
};
