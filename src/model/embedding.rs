//! Token embedding layer
//!
//! Embeddings sit in the model prelude, before the transformer stack.
//! They are not quantized by the weight-only algorithms but are needed to
//! turn calibration token ids into block-0 hidden states.

use ndarray::Array2;

use super::error::{ModelError, Result};

/// Embedding layer: token id lookup into a `[vocab, hidden]` table.
#[derive(Clone, Debug)]
pub struct Embedding {
    /// Embedding table `[vocab_size, hidden_size]`.
    pub weight: Array2<f32>,
}

impl Embedding {
    /// Create an embedding from its table.
    pub fn new(weight: Array2<f32>) -> Self {
        Self { weight }
    }

    /// Vocabulary size.
    pub fn vocab_size(&self) -> usize {
        self.weight.nrows()
    }

    /// Hidden dimension.
    pub fn hidden_size(&self) -> usize {
        self.weight.ncols()
    }

    /// Look up embeddings for a token sequence, producing `[seq, hidden]`.
    pub fn embed(&self, tokens: &[usize]) -> Result<Array2<f32>> {
        let vocab = self.vocab_size();
        let hidden = self.hidden_size();
        let mut out = Array2::<f32>::zeros((tokens.len(), hidden));
        for (row, &id) in tokens.iter().enumerate() {
            if id >= vocab {
                return Err(ModelError::TokenOutOfRange { id, vocab });
            }
            out.row_mut(row).assign(&self.weight.row(id));
        }
        Ok(out)
    }
}
