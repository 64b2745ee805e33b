//! RMS normalization

use ndarray::{Array1, Array2};

/// RMS normalization layer.
///
/// `RMSNorm(x) = x / sqrt(mean(x²) + eps) * weight`, applied per row.
#[derive(Clone, Debug)]
pub struct RmsNorm {
    /// Scale parameter `[hidden_size]`.
    pub weight: Array1<f32>,
    eps: f32,
}

impl RmsNorm {
    /// Create a norm with unit scale.
    pub fn new(hidden_size: usize, eps: f32) -> Self {
        Self {
            weight: Array1::ones(hidden_size),
            eps,
        }
    }

    /// Forward pass for `[tokens, hidden]` input.
    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let hidden = x.ncols() as f32;
        let mut out = x.clone();
        for mut row in out.rows_mut() {
            let sq_sum: f32 = row.iter().map(|v| v * v).sum();
            let rms = (sq_sum / hidden + self.eps).sqrt();
            for (v, w) in row.iter_mut().zip(self.weight.iter()) {
                *v = *v / rms * w;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr2;

    #[test]
    fn test_rms_norm_unit_rows() {
        let norm = RmsNorm::new(2, 1e-6);
        let out = norm.forward(&arr2(&[[3.0, 4.0]]));
        // rms = sqrt((9 + 16)/2) = sqrt(12.5)
        let rms = 12.5f32.sqrt();
        assert_abs_diff_eq!(out[[0, 0]], 3.0 / rms, epsilon = 1e-5);
        assert_abs_diff_eq!(out[[0, 1]], 4.0 / rms, epsilon = 1e-5);
    }
}
