//! Quantizable layer variants
//!
//! The closed set of layer kinds the weight-only quantizers operate on.
//! Every kind can flatten its kernel to a `[out_channels, in_channels]`
//! matrix, restore a quantized matrix back into its native layout, and
//! unfold calibration inputs into rows matching the flattened columns.

use ndarray::{Array1, Array2, Array3, Array4};

use super::error::{ModelError, Result};

/// Type tag for a quantizable layer, used by tree-walk allowlists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LayerType {
    /// `y = x Wᵀ + b`, weight `[out, in]`.
    Linear,
    /// GPT-2 style fused linear: `y = x W + b`, weight `[in, out]`.
    TransposedLinear,
    /// 1-D convolution, weight `[out, in, k]`.
    Conv1d,
    /// 2-D convolution, weight `[out, in, kh, kw]`.
    Conv2d,
}

impl LayerType {
    /// All quantizable layer types (the default allowlist).
    pub const ALL: [LayerType; 4] = [
        LayerType::Linear,
        LayerType::TransposedLinear,
        LayerType::Conv1d,
        LayerType::Conv2d,
    ];
}

/// Dense linear layer.
#[derive(Clone, Debug)]
pub struct Linear {
    /// Weight matrix `[out_features, in_features]`.
    pub weight: Array2<f32>,
    /// Optional bias `[out_features]`.
    pub bias: Option<Array1<f32>>,
}

impl Linear {
    /// Create a linear layer from a weight matrix.
    pub fn new(weight: Array2<f32>) -> Self {
        Self { weight, bias: None }
    }

    /// Attach a bias vector.
    pub fn with_bias(mut self, bias: Array1<f32>) -> Self {
        self.bias = Some(bias);
        self
    }

    /// Forward pass for `[tokens, in_features]` input.
    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let mut y = x.dot(&self.weight.t());
        if let Some(bias) = &self.bias {
            y += bias;
        }
        y
    }
}

/// Fused linear layer with transposed weight storage (GPT-2 `Conv1D`).
#[derive(Clone, Debug)]
pub struct TransposedLinear {
    /// Weight matrix `[in_features, out_features]`.
    pub weight: Array2<f32>,
    /// Optional bias `[out_features]`.
    pub bias: Option<Array1<f32>>,
}

impl TransposedLinear {
    /// Create a fused linear layer from a `[in, out]` weight matrix.
    pub fn new(weight: Array2<f32>) -> Self {
        Self { weight, bias: None }
    }

    /// Attach a bias vector.
    pub fn with_bias(mut self, bias: Array1<f32>) -> Self {
        self.bias = Some(bias);
        self
    }

    /// Forward pass for `[tokens, in_features]` input.
    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let mut y = x.dot(&self.weight);
        if let Some(bias) = &self.bias {
            y += bias;
        }
        y
    }
}

/// 1-D convolution over `[seq, channels]` input.
#[derive(Clone, Debug)]
pub struct Conv1d {
    /// Kernel `[out_channels, in_channels, kernel_size]`.
    pub weight: Array3<f32>,
    /// Optional bias `[out_channels]`.
    pub bias: Option<Array1<f32>>,
    pub stride: usize,
    pub padding: usize,
    pub dilation: usize,
}

impl Conv1d {
    /// Create a convolution with unit stride/dilation and no padding.
    pub fn new(weight: Array3<f32>) -> Self {
        Self {
            weight,
            bias: None,
            stride: 1,
            padding: 0,
            dilation: 1,
        }
    }

    /// Number of output positions for an input of length `seq`.
    pub fn out_positions(&self, seq: usize) -> usize {
        let k = self.weight.dim().2;
        let span = self.dilation * (k - 1) + 1;
        (seq + 2 * self.padding).saturating_sub(span) / self.stride + 1
    }

    /// Unfold `[seq, in_channels]` input into im2col rows
    /// `[positions, in_channels * k]`, zero-padded at the borders.
    ///
    /// Feature order is channel-major (`c * k + j`), matching the
    /// flattened kernel.
    pub fn unfold(&self, x: &Array2<f32>) -> Array2<f32> {
        let (seq, in_ch) = x.dim();
        let k = self.weight.dim().2;
        let positions = self.out_positions(seq);
        Array2::from_shape_fn((positions, in_ch * k), |(t, f)| {
            let c = f / k;
            let j = f % k;
            let pos = (t * self.stride + j * self.dilation) as isize - self.padding as isize;
            if pos < 0 || pos as usize >= seq {
                0.0
            } else {
                x[[pos as usize, c]]
            }
        })
    }

    /// Forward pass for `[seq, in_channels]` input via im2col.
    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let (out_ch, in_ch, k) = self.weight.dim();
        let flat = Array2::from_shape_fn((out_ch, in_ch * k), |(o, f)| {
            self.weight[[o, f / k, f % k]]
        });
        let mut y = self.unfold(x).dot(&flat.t());
        if let Some(bias) = &self.bias {
            y += bias;
        }
        y
    }
}

/// 2-D convolution over `[channels, height, width]` input.
#[derive(Clone, Debug)]
pub struct Conv2d {
    /// Kernel `[out_channels, in_channels, kh, kw]`.
    pub weight: Array4<f32>,
    /// Optional bias `[out_channels]`.
    pub bias: Option<Array1<f32>>,
    pub stride: usize,
    pub padding: usize,
    pub dilation: usize,
}

impl Conv2d {
    /// Create a convolution with unit stride/dilation and no padding.
    pub fn new(weight: Array4<f32>) -> Self {
        Self {
            weight,
            bias: None,
            stride: 1,
            padding: 0,
            dilation: 1,
        }
    }

    fn out_extent(&self, extent: usize, k: usize) -> usize {
        let span = self.dilation * (k - 1) + 1;
        (extent + 2 * self.padding).saturating_sub(span) / self.stride + 1
    }

    /// Unfold `[in_channels, h, w]` input into im2col rows
    /// `[positions, in_channels * kh * kw]`, channel-major feature order.
    pub fn unfold(&self, x: &Array3<f32>) -> Array2<f32> {
        let (in_ch, h, w) = x.dim();
        let (_, _, kh, kw) = self.weight.dim();
        let oh = self.out_extent(h, kh);
        let ow = self.out_extent(w, kw);
        Array2::from_shape_fn((oh * ow, in_ch * kh * kw), |(t, f)| {
            let (ty, tx) = (t / ow, t % ow);
            let c = f / (kh * kw);
            let u = (f / kw) % kh;
            let v = f % kw;
            let py = (ty * self.stride + u * self.dilation) as isize - self.padding as isize;
            let px = (tx * self.stride + v * self.dilation) as isize - self.padding as isize;
            if py < 0 || px < 0 || py as usize >= h || px as usize >= w {
                0.0
            } else {
                x[[c, py as usize, px as usize]]
            }
        })
    }

    /// Forward pass via im2col, producing `[out_channels, oh, ow]`.
    pub fn forward_im2col(&self, x: &Array3<f32>) -> Array3<f32> {
        let (out_ch, in_ch, kh, kw) = self.weight.dim();
        let (_, h, w) = x.dim();
        let oh = self.out_extent(h, kh);
        let ow = self.out_extent(w, kw);
        let flat = Array2::from_shape_fn((out_ch, in_ch * kh * kw), |(o, f)| {
            self.weight[[o, f / (kh * kw), (f / kw) % kh, f % kw]]
        });
        let cols = self.unfold(x);
        let y = cols.dot(&flat.t()); // [positions, out]
        Array3::from_shape_fn((out_ch, oh, ow), |(o, ty, tx)| {
            let mut v = y[[ty * ow + tx, o]];
            if let Some(bias) = &self.bias {
                v += bias[o];
            }
            v
        })
    }
}

/// A quantizable layer: the tagged union the quantizers dispatch over.
#[derive(Clone, Debug)]
pub enum QuantLayer {
    Linear(Linear),
    TransposedLinear(TransposedLinear),
    Conv1d(Conv1d),
    Conv2d(Conv2d),
}

impl QuantLayer {
    /// Type tag of this layer.
    pub fn layer_type(&self) -> LayerType {
        match self {
            QuantLayer::Linear(_) => LayerType::Linear,
            QuantLayer::TransposedLinear(_) => LayerType::TransposedLinear,
            QuantLayer::Conv1d(_) => LayerType::Conv1d,
            QuantLayer::Conv2d(_) => LayerType::Conv2d,
        }
    }

    /// Flattened input width (columns of the weight matrix).
    pub fn in_features(&self) -> usize {
        match self {
            QuantLayer::Linear(l) => l.weight.ncols(),
            QuantLayer::TransposedLinear(l) => l.weight.nrows(),
            QuantLayer::Conv1d(c) => {
                let (_, in_ch, k) = c.weight.dim();
                in_ch * k
            }
            QuantLayer::Conv2d(c) => {
                let (_, in_ch, kh, kw) = c.weight.dim();
                in_ch * kh * kw
            }
        }
    }

    /// Output channel count (rows of the weight matrix).
    pub fn out_features(&self) -> usize {
        match self {
            QuantLayer::Linear(l) => l.weight.nrows(),
            QuantLayer::TransposedLinear(l) => l.weight.ncols(),
            QuantLayer::Conv1d(c) => c.weight.dim().0,
            QuantLayer::Conv2d(c) => c.weight.dim().0,
        }
    }

    /// Kernel flattened to `[out_channels, in_channels]`.
    ///
    /// Convolutions flatten their trailing kernel axes; the fused linear
    /// transposes. The inverse is [`QuantLayer::set_weight_matrix`].
    pub fn weight_matrix(&self) -> Array2<f32> {
        match self {
            QuantLayer::Linear(l) => l.weight.clone(),
            QuantLayer::TransposedLinear(l) => l.weight.t().to_owned(),
            QuantLayer::Conv1d(c) => {
                let (o, i, k) = c.weight.dim();
                Array2::from_shape_fn((o, i * k), |(r, f)| c.weight[[r, f / k, f % k]])
            }
            QuantLayer::Conv2d(c) => {
                let (o, i, kh, kw) = c.weight.dim();
                Array2::from_shape_fn((o, i * kh * kw), |(r, f)| {
                    c.weight[[r, f / (kh * kw), (f / kw) % kh, f % kw]]
                })
            }
        }
    }

    /// Write a `[out_channels, in_channels]` matrix back into the native
    /// kernel layout.
    pub fn set_weight_matrix(&mut self, matrix: &Array2<f32>) -> Result<()> {
        let (rows, cols) = (self.out_features(), self.in_features());
        if matrix.dim() != (rows, cols) {
            return Err(ModelError::ShapeMismatch {
                context: "set_weight_matrix".to_string(),
                expected: rows * cols,
                actual: matrix.len(),
            });
        }
        match self {
            QuantLayer::Linear(l) => l.weight.assign(matrix),
            QuantLayer::TransposedLinear(l) => l.weight.assign(&matrix.t()),
            QuantLayer::Conv1d(c) => {
                let (_, _, k) = c.weight.dim();
                c.weight = Array3::from_shape_fn(c.weight.dim(), |(r, i, j)| {
                    matrix[[r, i * k + j]]
                });
            }
            QuantLayer::Conv2d(c) => {
                let (_, _, kh, kw) = c.weight.dim();
                c.weight = Array4::from_shape_fn(c.weight.dim(), |(r, i, u, v)| {
                    matrix[[r, i * kh * kw + u * kw + v]]
                });
            }
        }
        Ok(())
    }

    /// Unfold a `[tokens, features]` activation batch into Hessian rows
    /// `[samples, in_features]`.
    ///
    /// Linear kinds pass rows through unchanged; `Conv1d` applies im2col.
    /// `Conv2d` inputs are 3-D — unfold them through [`Conv2d::unfold`].
    pub fn unfold_input(&self, x: &Array2<f32>) -> Result<Array2<f32>> {
        let expected = match self {
            QuantLayer::Linear(l) => l.weight.ncols(),
            QuantLayer::TransposedLinear(l) => l.weight.nrows(),
            QuantLayer::Conv1d(c) => c.weight.dim().1,
            QuantLayer::Conv2d(_) => {
                return Err(ModelError::ShapeMismatch {
                    context: "unfold_input: Conv2d takes 3-D input".to_string(),
                    expected: 3,
                    actual: 2,
                })
            }
        };
        if x.ncols() != expected {
            return Err(ModelError::ShapeMismatch {
                context: "unfold_input".to_string(),
                expected,
                actual: x.ncols(),
            });
        }
        Ok(match self {
            QuantLayer::Linear(_) | QuantLayer::TransposedLinear(_) => x.clone(),
            QuantLayer::Conv1d(c) => c.unfold(x),
            QuantLayer::Conv2d(_) => unreachable!(),
        })
    }

    /// Forward pass for `[tokens, features]` input.
    pub fn forward(&self, x: &Array2<f32>) -> Result<Array2<f32>> {
        let expected = match self {
            QuantLayer::Linear(l) => l.weight.ncols(),
            QuantLayer::TransposedLinear(l) => l.weight.nrows(),
            QuantLayer::Conv1d(c) => c.weight.dim().1,
            QuantLayer::Conv2d(_) => {
                return Err(ModelError::ShapeMismatch {
                    context: "forward: Conv2d takes 3-D input".to_string(),
                    expected: 3,
                    actual: 2,
                })
            }
        };
        if x.ncols() != expected {
            return Err(ModelError::ShapeMismatch {
                context: "layer forward".to_string(),
                expected,
                actual: x.ncols(),
            });
        }
        Ok(match self {
            QuantLayer::Linear(l) => l.forward(x),
            QuantLayer::TransposedLinear(l) => l.forward(x),
            QuantLayer::Conv1d(c) => c.forward(x),
            QuantLayer::Conv2d(_) => unreachable!(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2, Array3};

    #[test]
    fn test_linear_forward() {
        let layer = Linear::new(arr2(&[[1.0, 0.0], [0.0, 2.0]])).with_bias(arr1(&[0.5, -0.5]));
        let y = layer.forward(&arr2(&[[3.0, 4.0]]));
        assert_abs_diff_eq!(y[[0, 0]], 3.5, epsilon = 1e-6);
        assert_abs_diff_eq!(y[[0, 1]], 7.5, epsilon = 1e-6);
    }

    #[test]
    fn test_transposed_linear_matches_linear() {
        let w = arr2(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]); // [out=2, in=3]
        let linear = QuantLayer::Linear(Linear::new(w.clone()));
        let fused = QuantLayer::TransposedLinear(TransposedLinear::new(w.t().to_owned()));
        let x = arr2(&[[1.0, -1.0, 0.5], [0.0, 2.0, -0.5]]);
        let a = linear.forward(&x).unwrap();
        let b = fused.forward(&x).unwrap();
        for (p, q) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(p, q, epsilon = 1e-6);
        }
        // Both flatten to the same [out, in] matrix.
        assert_eq!(linear.weight_matrix(), fused.weight_matrix());
    }

    #[test]
    fn test_weight_matrix_round_trip() {
        let weight = Array3::from_shape_fn((2, 3, 2), |(o, i, k)| (o * 6 + i * 2 + k) as f32);
        let mut layer = QuantLayer::Conv1d(Conv1d::new(weight.clone()));
        let flat = layer.weight_matrix();
        assert_eq!(flat.dim(), (2, 6));
        layer.set_weight_matrix(&flat).unwrap();
        if let QuantLayer::Conv1d(c) = &layer {
            assert_eq!(c.weight, weight);
        } else {
            unreachable!();
        }
    }

    #[test]
    fn test_set_weight_matrix_rejects_bad_shape() {
        let mut layer = QuantLayer::Linear(Linear::new(arr2(&[[1.0, 2.0], [3.0, 4.0]])));
        let err = layer.set_weight_matrix(&arr2(&[[1.0, 2.0, 3.0]])).unwrap_err();
        assert!(matches!(err, ModelError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_conv1d_unfold_identity_kernel() {
        // k=1, stride=1: unfold is the identity on rows.
        let weight = Array3::from_shape_fn((2, 3, 1), |(o, i, _)| if o == 0 { i as f32 } else { 1.0 });
        let conv = Conv1d::new(weight);
        let x = arr2(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        let cols = conv.unfold(&x);
        assert_eq!(cols, x);
    }

    #[test]
    fn test_conv1d_forward_known_values() {
        // Single in/out channel, k=2 box filter.
        let weight = Array3::from_shape_fn((1, 1, 2), |_| 1.0);
        let conv = Conv1d::new(weight);
        let x = arr2(&[[1.0], [2.0], [3.0]]);
        let y = conv.forward(&x);
        assert_eq!(y.dim(), (2, 1));
        assert_abs_diff_eq!(y[[0, 0]], 3.0, epsilon = 1e-6);
        assert_abs_diff_eq!(y[[1, 0]], 5.0, epsilon = 1e-6);
    }

    #[test]
    fn test_conv2d_unfold_shape_and_padding() {
        let weight = ndarray::Array4::from_shape_fn((1, 2, 2, 2), |_| 1.0);
        let mut conv = Conv2d::new(weight);
        conv.padding = 1;
        let x = Array3::from_shape_fn((2, 2, 2), |(c, i, j)| (c * 4 + i * 2 + j) as f32);
        let cols = conv.unfold(&x);
        // (2 + 2*1 - 2)/1 + 1 = 3 positions per axis
        assert_eq!(cols.dim(), (9, 8));
        // Top-left patch touches only x[.., 0, 0] at kernel tap (1, 1).
        assert_abs_diff_eq!(cols[[0, 3]], x[[0, 0, 0]], epsilon = 1e-6);
        assert_abs_diff_eq!(cols[[0, 0]], 0.0, epsilon = 1e-6);
    }
}
