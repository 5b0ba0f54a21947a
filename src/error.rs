//! Error types for the serving engine
//!
//! Construction problems surface as [`EngineError::Configuration`] before any
//! serving begins. Per-request problems (tokenization, bad generation
//! configs) never escape `Engine::add_request`; they are delivered through
//! the request's callback instead.

use thiserror::Error;

/// Errors produced by the engine and its collaborators
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid constructor arguments, zero models, or a model whose context
    /// window is smaller than the maximum single sequence length
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The tokenizer failed to encode or decode
    #[error("tokenization error: {0}")]
    Tokenization(String),

    /// A request that can never be served (bad generation config, input too long)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A model collaborator reported a failure
    #[error("model error: {0}")]
    Model(String),

    /// Cache accounting was asked to do something impossible
    #[error("cache error: {0}")]
    Cache(String),

    /// Mismatched or out-of-range sampler inputs
    #[error("sampler error: {0}")]
    Sampler(String),

    /// The background engine loop has stopped
    #[error("engine has shut down")]
    Shutdown,

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Shorthand for [`EngineError::Configuration`]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Whether this error is a construction-time failure
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

/// Result alias used throughout the engine
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::config("no model provided");
        assert_eq!(err.to_string(), "configuration error: no model provided");
        assert!(err.is_configuration());

        let err = EngineError::Cache("out of pages".to_string());
        assert!(!err.is_configuration());
    }

    #[test]
    fn test_json_conversion() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: EngineError = parse.unwrap_err().into();
        assert!(matches!(err, EngineError::Json(_)));
    }
}
