//! Error types for lm-session.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for lm-session operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for lm-session.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid session parameters (capacity, top bar, batch size, ...).
    #[error("configuration error: {0}")]
    Config(String),

    /// Sampling could not run with the configured policy.
    #[error("sampling error: {0}")]
    Sampling(String),

    /// The model runtime failed to load weights or create a context.
    #[error("failed to load model: {0}")]
    ModelLoad(String),

    /// No registered backend recognizes the weights file.
    #[error("no backend recognizes weights file {0}")]
    NoBackend(PathBuf),

    /// Tokenization error.
    #[error("tokenization error: {0}")]
    Tokenization(String),

    /// The runtime's decode operation failed.
    #[error("decode error: {0}")]
    Decode(String),

    /// A feature was requested that the active backend does not provide.
    #[error("{0} is not available for this model backend")]
    FeatureUnavailable(&'static str),

    /// Caller contract violation (empty prompt, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Invalid session state transition.
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition {
        from: &'static str,
        to: &'static str,
    },

    /// A serialized session was written for a different context size.
    #[error("context length differs (mine {expected} vs. file {found})")]
    ContextMismatch { expected: usize, found: usize },

    /// A savestate was restored into a session that did not create it.
    #[error("savestate does not match context")]
    SavestateMismatch,

    /// Session serialization failed.
    #[error("failed to serialize {0}")]
    Serialize(String),

    /// Session deserialization failed.
    #[error("failed to deserialize {0}")]
    Deserialize(String),

    /// Grammar parsing or matching error.
    #[error("grammar error: {0}")]
    Grammar(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
