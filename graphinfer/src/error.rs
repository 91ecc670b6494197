use thiserror::Error;

/// Failure kinds surfaced at the session boundary.
///
/// Every fallible entry point reports errors through `anyhow`; attaching one
/// of these kinds lets callers classify a failure with
/// `err.downcast_ref::<EngineError>()` without parsing messages.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid model: {0}")]
    InvalidModel(String),

    #[error("this session already contains a loaded model")]
    ModelAlreadyLoaded,

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("runtime exception: {0}")]
    RuntimeException(String),

    #[error("exiting due to terminate flag being set to true")]
    Terminated,

    #[error("{0}")]
    Fail(String),
}

impl EngineError {
    pub fn invalid_argument(msg: impl Into<String>) -> anyhow::Error {
        anyhow::Error::new(EngineError::InvalidArgument(msg.into()))
    }

    pub fn invalid_model(msg: impl Into<String>) -> anyhow::Error {
        anyhow::Error::new(EngineError::InvalidModel(msg.into()))
    }

    pub fn not_implemented(msg: impl Into<String>) -> anyhow::Error {
        anyhow::Error::new(EngineError::NotImplemented(msg.into()))
    }

    pub fn runtime_exception(msg: impl Into<String>) -> anyhow::Error {
        anyhow::Error::new(EngineError::RuntimeException(msg.into()))
    }

    pub fn terminated() -> anyhow::Error {
        anyhow::Error::new(EngineError::Terminated)
    }

    pub fn fail(msg: impl Into<String>) -> anyhow::Error {
        anyhow::Error::new(EngineError::Fail(msg.into()))
    }

    /// True when `err` carries a `Terminated` kind anywhere in its chain.
    pub fn is_terminated(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<EngineError>(), Some(EngineError::Terminated))
    }
}
