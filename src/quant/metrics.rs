//! Quantization error metrics

use ndarray::Array2;

/// Mean squared error between two equally-shaped tensors.
pub fn quantization_mse(original: &Array2<f32>, quantized: &Array2<f32>) -> f32 {
    debug_assert_eq!(original.dim(), quantized.dim());
    let n = original.len().max(1) as f32;
    original
        .iter()
        .zip(quantized.iter())
        .map(|(a, b)| (a - b) * (a - b))
        .sum::<f32>()
        / n
}

/// Largest absolute elementwise deviation.
pub fn max_abs_error(original: &Array2<f32>, quantized: &Array2<f32>) -> f32 {
    original
        .iter()
        .zip(quantized.iter())
        .map(|(a, b)| (a - b).abs())
        .fold(0.0, f32::max)
}

/// Activation-weighted reconstruction error: mean of
/// `‖X Wᵀ − X Qᵀ‖²` over calibration rows `X`.
///
/// This is the quantity GPTQ minimizes; it weights weight deviations by
/// how strongly the corresponding input channels actually activate.
pub fn reconstruction_error(
    activations: &Array2<f32>,
    original: &Array2<f32>,
    quantized: &Array2<f32>,
) -> f32 {
    let ref_out = activations.dot(&original.t());
    let q_out = activations.dot(&quantized.t());
    quantization_mse(&ref_out, &q_out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr2;

    #[test]
    fn test_mse_zero_for_identical() {
        let a = arr2(&[[1.0, 2.0], [3.0, 4.0]]);
        assert_abs_diff_eq!(quantization_mse(&a, &a), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_mse_known_value() {
        let a = arr2(&[[0.0, 0.0]]);
        let b = arr2(&[[1.0, -1.0]]);
        assert_abs_diff_eq!(quantization_mse(&a, &b), 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(max_abs_error(&a, &b), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_reconstruction_error_weights_active_channels() {
        // Only channel 0 activates; deviation in channel 1 is invisible.
        let x = arr2(&[[1.0, 0.0]]);
        let w = arr2(&[[1.0, 1.0]]);
        let q_bad_dead = arr2(&[[1.0, 0.0]]);
        let q_bad_live = arr2(&[[0.0, 1.0]]);
        assert_abs_diff_eq!(reconstruction_error(&x, &w, &q_bad_dead), 0.0, epsilon = 1e-9);
        assert!(reconstruction_error(&x, &w, &q_bad_live) > 0.5);
    }
}
