//! Model tree error types

use thiserror::Error;

/// Errors raised while traversing or executing a module tree.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error("module path not found: {0}")]
    PathNotFound(String),

    #[error("shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    #[error("auxiliary forward argument `{0}` was not supplied")]
    MissingAux(String),

    #[error("module `{0}` requires token input; got hidden states")]
    TokenInputRequired(String),

    #[error("token id {id} out of range for embedding with vocab size {vocab}")]
    TokenOutOfRange { id: usize, vocab: usize },
}

/// Result type for model tree operations.
pub type Result<T> = std::result::Result<T, ModelError>;
