//! Streaming Hessian accumulation
//!
//! One accumulator per in-flight layer: it consumes `[batch,
//! in_channels]` activation rows (im2col-unfolded for convolutions) and
//! maintains the sample-count-normalized second-moment matrix GPTQ
//! inverts. The matrix is `O(in_channels²)` and is freed as soon as the
//! layer is quantized.

use ndarray::{Array2, ArrayView2};

use super::error::{QuantError, Result};

/// Running second-moment matrix for one layer's inputs.
#[derive(Clone, Debug)]
pub struct HessianAccumulator {
    h: Array2<f32>,
    nsamples: usize,
    columns: usize,
}

impl HessianAccumulator {
    /// Create an accumulator for `in_channels`-wide inputs.
    pub fn new(columns: usize) -> Self {
        Self {
            h: Array2::zeros((columns, columns)),
            nsamples: 0,
            columns,
        }
    }

    /// Input width this accumulator expects.
    pub fn columns(&self) -> usize {
        self.columns
    }

    /// Total rows observed so far.
    pub fn nsamples(&self) -> usize {
        self.nsamples
    }

    /// Fold a `[m, in_channels]` activation batch into the running
    /// matrix.
    ///
    /// The update order is fixed: the existing matrix is rescaled by
    /// `n/(n+m)`, the count advances, then the batch is scaled by
    /// `sqrt(2/n)` and its Gram matrix accumulated. The result is an
    /// exponentially-reweighted covariance estimate, not a plain
    /// average.
    pub fn add_batch(&mut self, batch: ArrayView2<f32>) -> Result<()> {
        if batch.ncols() != self.columns {
            return Err(QuantError::ShapeMismatch {
                context: "hessian add_batch".to_string(),
                expected: self.columns,
                actual: batch.ncols(),
            });
        }
        let m = batch.nrows();
        if m == 0 {
            return Ok(());
        }

        let prev = self.nsamples as f32;
        self.h *= prev / (prev + m as f32);
        self.nsamples += m;

        let factor = (2.0 / self.nsamples as f32).sqrt();
        let scaled = batch.mapv(|v| v * factor);
        self.h += &scaled.t().dot(&scaled);
        Ok(())
    }

    /// Borrow the accumulated matrix.
    pub fn matrix(&self) -> &Array2<f32> {
        &self.h
    }

    /// Consume the accumulator, yielding the matrix for inversion.
    pub fn into_matrix(self) -> Array2<f32> {
        self.h
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr2;

    #[test]
    fn test_two_batch_closed_form() {
        // After batches of 3 and 5 rows, n = 8 and
        // H = 1/4 X1ᵀX1 + 1/4 X2ᵀX2:
        //   batch 1: H = (2/3) X1ᵀX1, then rescaled by 3/8 → (1/4) X1ᵀX1
        //   batch 2: adds (2/8) X2ᵀX2 = (1/4) X2ᵀX2
        let x1 = arr2(&[[1.0, 0.0], [0.0, 2.0], [1.0, 1.0]]);
        let x2 = arr2(&[
            [2.0, 0.0],
            [0.0, 1.0],
            [1.0, -1.0],
            [0.5, 0.5],
            [0.0, 0.0],
        ]);

        let mut acc = HessianAccumulator::new(2);
        acc.add_batch(x1.view()).unwrap();
        acc.add_batch(x2.view()).unwrap();
        assert_eq!(acc.nsamples(), 8);

        let expected = x1.t().dot(&x1).mapv(|v| v * 0.25) + x2.t().dot(&x2).mapv(|v| v * 0.25);
        for (a, b) in acc.matrix().iter().zip(expected.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_single_batch_scaling() {
        // One batch of m rows: H = (2/m) XᵀX.
        let x = arr2(&[[1.0, 2.0], [3.0, 4.0]]);
        let mut acc = HessianAccumulator::new(2);
        acc.add_batch(x.view()).unwrap();
        let expected = x.t().dot(&x).mapv(|v| v * (2.0 / 2.0));
        for (a, b) in acc.matrix().iter().zip(expected.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_symmetry() {
        let x = arr2(&[[1.0, 2.0, 3.0], [0.5, -1.0, 0.0], [2.0, 2.0, -2.0]]);
        let mut acc = HessianAccumulator::new(3);
        acc.add_batch(x.view()).unwrap();
        let h = acc.matrix();
        for i in 0..3 {
            for j in 0..3 {
                assert_abs_diff_eq!(h[[i, j]], h[[j, i]], epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_width_mismatch_rejected() {
        let mut acc = HessianAccumulator::new(4);
        let err = acc.add_batch(arr2(&[[1.0, 2.0]]).view()).unwrap_err();
        assert!(matches!(err, QuantError::ShapeMismatch { .. }));
        assert_eq!(acc.nsamples(), 0);
    }

    #[test]
    fn test_empty_batch_is_a_no_op() {
        let mut acc = HessianAccumulator::new(2);
        let empty = Array2::<f32>::zeros((0, 2));
        acc.add_batch(empty.view()).unwrap();
        assert_eq!(acc.nsamples(), 0);
        assert_abs_diff_eq!(acc.matrix()[[0, 0]], 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_dead_channel_has_zero_diagonal() {
        // Channel 1 never activates: its diagonal entry stays zero.
        let x = arr2(&[[1.0, 0.0], [2.0, 0.0]]);
        let mut acc = HessianAccumulator::new(2);
        acc.add_batch(x.view()).unwrap();
        assert_abs_diff_eq!(acc.matrix()[[1, 1]], 0.0, epsilon = 1e-9);
        assert!(acc.matrix()[[0, 0]] > 0.0);
    }
}
