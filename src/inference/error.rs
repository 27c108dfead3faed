//! Inference error types
//!
//! `GenerationError` is terminal for one request only. `EngineError` covers the
//! process-level failures around the worker (backend, model, context).

use thiserror::Error;

/// Failure reported by one of the runtime boundaries (codec, session, sampler).
///
/// The native library signals failures through negative lengths and status codes;
/// adapters turn those into this error so the engine only branches on `Result`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct BackendError(pub String);

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Classification of per-request failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("Failed to apply chat template")]
    TemplateFailure,
    #[error("Failed to tokenize prompt")]
    TokenizeFailure,
    #[error("Context size exceeded")]
    ContextExceeded,
    #[error("Failed to decode")]
    DecodeFailure,
    #[error("Failed to convert token to text")]
    DetokenizeFailure,
}

impl ErrorKind {
    /// Numeric code surfaced to clients, following HTTP status semantics.
    pub fn code(&self) -> u16 {
        match self {
            ErrorKind::TokenizeFailure | ErrorKind::ContextExceeded => 400,
            ErrorKind::TemplateFailure
            | ErrorKind::DecodeFailure
            | ErrorKind::DetokenizeFailure => 500,
        }
    }
}

/// A request that ended in a terminal error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {detail}")]
pub struct GenerationError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl GenerationError {
    pub fn new(kind: ErrorKind, detail: impl ToString) -> Self {
        Self {
            kind,
            detail: detail.to_string(),
        }
    }

    pub fn code(&self) -> u16 {
        self.kind.code()
    }
}

/// Errors that can occur while running the inference worker
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("No model path configured")]
    NoModelConfigured,

    #[error("Failed to initialize backend: {0}")]
    BackendInit(String),

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Failed to create context: {0}")]
    ContextCreate(String),

    #[error("Model validation failed: {0}")]
    ModelValidation(String),

    #[error("Worker thread error: {0}")]
    WorkerError(String),

    #[error(transparent)]
    Generation(#[from] GenerationError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_error_message() {
        let err = GenerationError::new(ErrorKind::ContextExceeded, "40 tokens requested, 8 free");
        assert_eq!(
            err.to_string(),
            "Context size exceeded: 40 tokens requested, 8 free"
        );
        assert_eq!(err.code(), 400);
    }

    #[test]
    fn test_kind_messages() {
        assert_eq!(ErrorKind::TemplateFailure.to_string(), "Failed to apply chat template");
        assert_eq!(ErrorKind::ContextExceeded.to_string(), "Context size exceeded");
        assert_eq!(
            ErrorKind::DetokenizeFailure.to_string(),
            "Failed to convert token to text"
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(ErrorKind::TokenizeFailure.code(), 400);
        assert_eq!(ErrorKind::DecodeFailure.code(), 500);
        assert_eq!(ErrorKind::DetokenizeFailure.code(), 500);
        assert_eq!(ErrorKind::TemplateFailure.code(), 500);
    }

    #[test]
    fn test_engine_error_wraps_generation_error() {
        let err: EngineError = GenerationError::new(ErrorKind::DecodeFailure, "status 1").into();
        assert_eq!(err.to_string(), "Failed to decode: status 1");
    }
}
