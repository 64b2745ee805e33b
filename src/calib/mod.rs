//! Calibration data collaborator
//!
//! The quantization core consumes calibration data as an in-memory,
//! re-iterable buffer of fixed-shape samples. Sequence assembly (padding,
//! concatenation, tokenization) is the data provider's concern; the core
//! validates shape uniformity eagerly and nothing else.

mod ranges;

pub use ranges::{ActivationRange, ActivationStats};

use ndarray::Array2;

use crate::model::AuxArgs;
use crate::quant::error::{QuantError, Result};

/// One calibration sample.
#[derive(Clone, Debug)]
pub enum CalibSample {
    /// Token ids, embedded by the model prelude.
    Tokens(Vec<usize>),
    /// Pre-embedded hidden states `[seq, hidden]`.
    Hidden(Array2<f32>),
}

impl CalibSample {
    /// Flat element count, used for shape-uniformity checks.
    fn extent(&self) -> usize {
        match self {
            CalibSample::Tokens(t) => t.len(),
            CalibSample::Hidden(h) => h.len(),
        }
    }

    fn shape_matches(&self, other: &CalibSample) -> bool {
        match (self, other) {
            (CalibSample::Tokens(a), CalibSample::Tokens(b)) => a.len() == b.len(),
            (CalibSample::Hidden(a), CalibSample::Hidden(b)) => a.dim() == b.dim(),
            _ => false,
        }
    }
}

/// Buffered calibration set: samples plus the opaque auxiliary forward
/// arguments echoed into every block forward.
///
/// Buffering in memory satisfies the multi-pass contract: every capture
/// pass iterates the same samples in the same order.
#[derive(Clone, Debug, Default)]
pub struct CalibrationSet {
    samples: Vec<CalibSample>,
    aux: AuxArgs,
}

impl CalibrationSet {
    /// Create an empty calibration set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach auxiliary forward arguments.
    pub fn with_aux(mut self, aux: AuxArgs) -> Self {
        self.aux = aux;
        self
    }

    /// Append a sample, enforcing kind and shape uniformity.
    pub fn push(&mut self, sample: CalibSample) -> Result<()> {
        if let Some(first) = self.samples.first() {
            if !first.shape_matches(&sample) {
                return Err(QuantError::ShapeMismatch {
                    context: "calibration sample".to_string(),
                    expected: first.extent(),
                    actual: sample.extent(),
                });
            }
        }
        self.samples.push(sample);
        Ok(())
    }

    /// Build from an iterator of samples.
    pub fn from_samples<I: IntoIterator<Item = CalibSample>>(samples: I) -> Result<Self> {
        let mut set = Self::new();
        for sample in samples {
            set.push(sample)?;
        }
        Ok(set)
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// The buffered samples, iteration order fixed.
    pub fn samples(&self) -> &[CalibSample] {
        &self.samples
    }

    /// The auxiliary forward arguments.
    pub fn aux(&self) -> &AuxArgs {
        &self.aux
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn test_push_validates_shape() {
        let mut set = CalibrationSet::new();
        set.push(CalibSample::Tokens(vec![1, 2, 3])).unwrap();
        set.push(CalibSample::Tokens(vec![4, 5, 6])).unwrap();
        let err = set.push(CalibSample::Tokens(vec![7])).unwrap_err();
        assert!(matches!(err, QuantError::ShapeMismatch { .. }));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_push_rejects_mixed_kinds() {
        let mut set = CalibrationSet::new();
        set.push(CalibSample::Hidden(arr2(&[[1.0, 2.0]]))).unwrap();
        let err = set.push(CalibSample::Tokens(vec![0, 1])).unwrap_err();
        assert!(matches!(err, QuantError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_from_samples() {
        let set = CalibrationSet::from_samples(vec![
            CalibSample::Hidden(arr2(&[[1.0], [2.0]])),
            CalibSample::Hidden(arr2(&[[3.0], [4.0]])),
        ])
        .unwrap();
        assert_eq!(set.len(), 2);
        assert!(!set.is_empty());
    }
}
