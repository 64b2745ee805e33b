//! Quantization error types

use thiserror::Error;

use crate::model::ModelError;

/// Errors raised by the weight-only quantization core.
#[derive(Debug, Error)]
pub enum QuantError {
    /// Rejected at configuration-resolution time, before quantization.
    #[error("invalid bit width: {0}")]
    InvalidBits(u8),

    /// Group size must be -1 (whole row) or positive.
    #[error("invalid group size: {0}")]
    InvalidGroupSize(i32),

    /// Column block size must be positive.
    #[error("invalid block size: {0}")]
    InvalidBlockSize(usize),

    /// Cholesky failure on the damped Hessian: fatal for the layer.
    /// Callers may retry with a larger damping percentage.
    #[error("Hessian for layer `{layer}` is not positive-definite after damping (pivot {pivot})")]
    NotPositiveDefinite { layer: String, pivot: usize },

    /// Calibration batch incompatible with the layer's input width, or
    /// inconsistent sample shapes.
    #[error("shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    /// The model has no repeating block container to iterate.
    #[error("model has no repeating block container")]
    NoRepeatingBlocks,

    /// Model tree traversal or execution failure.
    #[error(transparent)]
    Model(#[from] ModelError),
}

impl QuantError {
    /// Attach a layer name to a [`QuantError::NotPositiveDefinite`]
    /// raised below the orchestrator, where only the pivot is known.
    pub(crate) fn with_layer(self, name: &str) -> Self {
        match self {
            QuantError::NotPositiveDefinite { pivot, .. } => QuantError::NotPositiveDefinite {
                layer: name.to_string(),
                pivot,
            },
            other => other,
        }
    }
}

/// Result type for quantization operations.
pub type Result<T> = std::result::Result<T, QuantError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quant_error_display() {
        let err = QuantError::InvalidBits(0);
        assert!(format!("{err}").contains("bit width"));

        let err = QuantError::InvalidGroupSize(-3);
        assert!(format!("{err}").contains("-3"));

        let err = QuantError::NotPositiveDefinite {
            layer: "layers.0.attn.q_proj".to_string(),
            pivot: 17,
        };
        let msg = format!("{err}");
        assert!(msg.contains("layers.0.attn.q_proj"));
        assert!(msg.contains("17"));
    }

    #[test]
    fn test_with_layer_names_the_layer() {
        let err = QuantError::NotPositiveDefinite {
            layer: String::new(),
            pivot: 3,
        }
        .with_layer("ffn.down");
        assert!(format!("{err}").contains("ffn.down"));
    }
}
