use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("illegal transition: {0}")]
    IllegalTransition(String),

    #[error("concurrency rejected: {0}")]
    ConcurrencyRejected(String),

    #[error("image not allowed: {0}")]
    ImageNotAllowed(String),

    #[error("no GPU available: {0}")]
    NoGpuAvailable(String),

    #[error("no host available: {0}")]
    NoHostAvailable(String),

    #[error("transient runtime error: {0}")]
    TransientRuntimeError(String),

    #[error("guardrail violation: {0}")]
    GuardrailViolation(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
