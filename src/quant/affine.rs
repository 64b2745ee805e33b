//! Affine weight quantizer
//!
//! Scale/zero-point computation and fake quantize-dequantize shared by
//! every weight-only algorithm (RTN, GPTQ). Parameters are computed per
//! output channel (or once per tensor), per column group when grouping
//! is enabled, with optional shrink-grid MSE refinement of the range.

use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use super::config::{LayerConfig, NO_GROUPING};
use super::error::Result;

/// Fake quantize-dequantize one value with explicit parameters.
///
/// A negative `maxq` selects the ternary threshold mode: values above
/// half the positive level snap to it, values below half the negative
/// level snap to that, everything else to zero.
pub fn quantize_value(x: f32, scale: f32, zero: f32, minq: i32, maxq: i32) -> f32 {
    if maxq < 0 {
        if x > scale / 2.0 {
            scale
        } else if x < zero / 2.0 {
            zero
        } else {
            0.0
        }
    } else {
        let q = ((x / scale).round() + zero).clamp(minq as f32, maxq as f32);
        scale * (q - zero)
    }
}

/// Integer level for one value (without dequantization).
pub fn quantize_level(x: f32, scale: f32, zero: f32, minq: i32, maxq: i32) -> i32 {
    if maxq < 0 {
        if x > scale / 2.0 {
            1
        } else if x < zero / 2.0 {
            -1
        } else {
            0
        }
    } else {
        (((x / scale).round() + zero).clamp(minq as f32, maxq as f32)) as i32
    }
}

/// Dequantize an integer level produced by [`quantize_level`].
pub fn dequantize_level(level: i32, scale: f32, zero: f32, maxq: i32) -> f32 {
    if maxq < 0 {
        match level {
            1 => scale,
            -1 => zero,
            _ => 0.0,
        }
    } else {
        scale * (level as f32 - zero)
    }
}

/// Affine quantizer state for one tensor or column group.
///
/// `scale`/`zero` hold one entry per output channel once
/// [`AffineQuantizer::find_params`] has run (a per-tensor quantizer
/// repeats its single parameter across channels).
#[derive(Clone, Debug)]
pub struct AffineQuantizer {
    bits: u8,
    minq: i32,
    maxq: i32,
    sym: bool,
    per_channel: bool,
    mse: bool,
    margin: f32,
    norm: f32,
    grid: usize,
    max_shrink: f32,
    scale: Array1<f32>,
    zero: Array1<f32>,
}

impl AffineQuantizer {
    /// Create a quantizer for the given integer grid.
    ///
    /// Symmetric grids are `[-(2^(bits-1)), 2^(bits-1)-1]` with a zero
    /// offset of 0; the 1-bit symmetric grid is `[0, 1]` (a symmetric
    /// 1-bit range would be zero-width). Asymmetric grids are
    /// `[0, 2^bits - 1]`.
    pub fn configure(bits: u8, per_channel: bool, sym: bool, mse: bool) -> Self {
        let (minq, maxq) = if sym {
            if bits == 1 {
                (0, 1)
            } else {
                (-(1 << (bits - 1)), (1 << (bits - 1)) - 1)
            }
        } else {
            (0, (1 << bits) - 1)
        };
        Self {
            bits,
            minq,
            maxq,
            sym,
            per_channel,
            mse,
            margin: 0.0,
            norm: 2.4,
            grid: 100,
            max_shrink: 0.8,
            scale: Array1::zeros(0),
            zero: Array1::zeros(0),
        }
    }

    /// Create a quantizer from a layer configuration.
    pub fn from_config(config: &LayerConfig) -> Self {
        Self::configure(config.bits, config.per_channel, config.sym, config.mse)
    }

    /// Create a ternary threshold quantizer (`maxq < 0` sentinel).
    pub fn ternary(per_channel: bool) -> Self {
        let mut q = Self::configure(2, per_channel, true, false);
        q.minq = 0;
        q.maxq = -1;
        q
    }

    /// Add a relative margin to symmetric scales.
    pub fn with_margin(mut self, margin: f32) -> Self {
        self.margin = margin;
        self
    }

    /// Top integer level (negative for ternary mode).
    pub fn maxq(&self) -> i32 {
        self.maxq
    }

    /// Bottom integer level.
    pub fn minq(&self) -> i32 {
        self.minq
    }

    /// Configured bit width.
    pub fn bits(&self) -> u8 {
        self.bits
    }

    /// Per-channel scales (valid after [`AffineQuantizer::find_params`]).
    pub fn scale(&self) -> &Array1<f32> {
        &self.scale
    }

    /// Per-channel zero offsets.
    pub fn zero(&self) -> &Array1<f32> {
        &self.zero
    }

    /// Whether parameters have been computed and are usable.
    pub fn ready(&self) -> bool {
        !self.scale.is_empty() && self.scale.iter().all(|&s| s != 0.0)
    }

    /// Compute scale/zero-point from a `[out_channels, cols]` weight
    /// view (a full tensor or one column group).
    ///
    /// Channels whose values are identically zero get the range forced
    /// to `[-1, 1]`, so the scale is never zero.
    pub fn find_params(&mut self, x: ArrayView2<f32>) {
        let param_rows: Vec<Array1<f32>> = if self.per_channel {
            x.rows().into_iter().map(|r| r.to_owned()).collect()
        } else {
            vec![x.iter().copied().collect()]
        };

        let n = param_rows.len();
        let mut xmin = vec![0.0f32; n];
        let mut xmax = vec![0.0f32; n];
        for (i, row) in param_rows.iter().enumerate() {
            let mut lo = 0.0f32;
            let mut hi = 0.0f32;
            for &v in row.iter() {
                lo = lo.min(v);
                hi = hi.max(v);
            }
            if self.sym {
                hi = hi.max(lo.abs());
                if lo < 0.0 {
                    lo = -hi;
                }
            }
            if lo == 0.0 && hi == 0.0 {
                lo = -1.0;
                hi = 1.0;
            }
            xmin[i] = lo;
            xmax[i] = hi;
        }

        let mut scale = vec![0.0f32; n];
        let mut zero = vec![0.0f32; n];
        for i in 0..n {
            if self.maxq < 0 {
                scale[i] = xmax[i];
                zero[i] = xmin[i];
            } else if self.sym {
                scale[i] = xmax[i] * (1.0 + self.margin) / self.maxq as f32;
                zero[i] = 0.0;
            } else {
                scale[i] = (xmax[i] - xmin[i]) / self.maxq as f32;
                zero[i] = (-xmin[i] / scale[i])
                    .round()
                    .clamp(0.0, self.maxq as f32);
            }
        }

        if self.mse && self.maxq >= 0 {
            self.refine_mse(&param_rows, &xmin, &xmax, &mut scale, &mut zero);
        }

        // Expand per-tensor parameters across all output channels.
        let rows = x.nrows();
        if self.per_channel {
            self.scale = Array1::from_vec(scale);
            self.zero = Array1::from_vec(zero);
        } else {
            self.scale = Array1::from_elem(rows, scale[0]);
            self.zero = Array1::from_elem(rows, zero[0]);
        }
    }

    /// Shrink-grid search minimizing the per-channel sum of
    /// `|q(x) - x|^norm`, keeping the best scale/zero per channel.
    fn refine_mse(
        &self,
        param_rows: &[Array1<f32>],
        xmin: &[f32],
        xmax: &[f32],
        scale: &mut [f32],
        zero: &mut [f32],
    ) {
        let steps = (self.max_shrink * self.grid as f32) as usize;
        let mut best = vec![f32::INFINITY; param_rows.len()];
        for step in 0..steps {
            let p = 1.0 - step as f32 / self.grid as f32;
            for (i, row) in param_rows.iter().enumerate() {
                let lo = p * xmin[i];
                let hi = p * xmax[i];
                let (s, z) = if self.sym {
                    (hi * (1.0 + self.margin) / self.maxq as f32, 0.0)
                } else {
                    let s = (hi - lo) / self.maxq as f32;
                    (s, (-lo / s).round())
                };
                if s == 0.0 {
                    continue;
                }
                let err: f32 = row
                    .iter()
                    .map(|&v| {
                        (quantize_value(v, s, z, self.minq, self.maxq) - v)
                            .abs()
                            .powf(self.norm)
                    })
                    .sum();
                if err < best[i] {
                    best[i] = err;
                    scale[i] = s;
                    zero[i] = z;
                }
            }
        }
    }

    /// Fake quantize-dequantize a column vector with per-channel params.
    pub fn quantize_dequantize_column(&self, w: &Array1<f32>) -> Array1<f32> {
        Array1::from_shape_fn(w.len(), |r| {
            quantize_value(w[r], self.scale[r], self.zero[r], self.minq, self.maxq)
        })
    }

    /// Fake quantize-dequantize a `[out_channels, cols]` matrix.
    pub fn quantize_dequantize(&self, w: &Array2<f32>) -> Array2<f32> {
        Array2::from_shape_fn(w.dim(), |(r, c)| {
            quantize_value(w[[r, c]], self.scale[r], self.zero[r], self.minq, self.maxq)
        })
    }

    /// Integer levels for a `[out_channels, cols]` matrix.
    pub fn quantize_levels(&self, w: &Array2<f32>) -> Array2<i32> {
        Array2::from_shape_fn(w.dim(), |(r, c)| {
            quantize_level(w[[r, c]], self.scale[r], self.zero[r], self.minq, self.maxq)
        })
    }
}

/// Scale/zero-point record for one quantized layer, one entry per
/// column group (a single entry when ungrouped).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QuantizerRecord {
    /// Bit width of the integer grid.
    pub bits: u8,
    /// Symmetric scheme flag.
    pub sym: bool,
    /// Group size used (-1 for whole-row).
    pub group_size: i32,
    /// Per-group, per-output-channel scales.
    pub scales: Vec<Vec<f32>>,
    /// Per-group, per-output-channel zero offsets.
    pub zeros: Vec<Vec<f32>>,
    /// Column permutation applied before quantization, if any.
    pub perm: Option<Vec<usize>>,
}

impl QuantizerRecord {
    pub(crate) fn new(config: &LayerConfig) -> Self {
        Self {
            bits: config.bits,
            sym: config.sym,
            group_size: config.group_size,
            scales: Vec::new(),
            zeros: Vec::new(),
            perm: None,
        }
    }

    pub(crate) fn push_group(&mut self, quantizer: &AffineQuantizer) {
        self.scales.push(quantizer.scale().to_vec());
        self.zeros.push(quantizer.zero().to_vec());
    }

    /// Number of recorded column groups.
    pub fn num_groups(&self) -> usize {
        self.scales.len()
    }
}

/// Group-wise fake quantization of a `[out_channels, in_channels]`
/// matrix: parameters are recomputed per `group_size`-wide column
/// window. When the width is not divisible, the largest divisible
/// prefix forms whole groups and the remainder a single trailing group.
pub fn quantize_dequantize_grouped(
    w: &Array2<f32>,
    config: &LayerConfig,
) -> Result<(Array2<f32>, QuantizerRecord)> {
    config.validate()?;
    let cols = w.ncols();
    let group = if config.group_size == NO_GROUPING {
        cols
    } else {
        config.group_size as usize
    };

    let mut out = w.clone();
    let mut record = QuantizerRecord::new(config);
    let mut start = 0;
    while start < cols {
        let end = (start + group).min(cols);
        let view = w.slice(ndarray::s![.., start..end]);
        let mut quantizer = AffineQuantizer::from_config(config);
        quantizer.find_params(view);
        let dq = quantizer.quantize_dequantize(&view.to_owned());
        out.slice_mut(ndarray::s![.., start..end]).assign(&dq);
        record.push_group(&quantizer);
        start = end;
    }
    Ok((out, record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2, s};
    use proptest::prelude::*;

    #[test]
    fn test_symmetric_8bit_scale_and_zero() {
        // Per-row scales come out as max |row| / 127 with zero = 0.
        let w = arr2(&[
            [1.0, 0.0, 0.0, 0.0],
            [0.0, -2.0, 0.0, 0.0],
            [0.0, 0.0, 4.0, 0.0],
            [0.0, 0.0, 0.0, -8.0],
        ]);
        let mut q = AffineQuantizer::configure(8, true, true, false);
        q.find_params(w.view());
        for (row, expected) in [1.0f32, 2.0, 4.0, 8.0].iter().enumerate() {
            assert_abs_diff_eq!(q.scale()[row], expected / 127.0, epsilon = 1e-6);
            assert_abs_diff_eq!(q.zero()[row], 0.0, epsilon = 1e-9);
        }
        let dq = q.quantize_dequantize(&w);
        for (orig, deq) in w.iter().zip(dq.iter()) {
            // Within one quantization step of the original.
            let step = 8.0 / 127.0;
            assert!((orig - deq).abs() <= step, "{orig} vs {deq}");
        }
    }

    #[test]
    fn test_asymmetric_8bit_round_trip_on_integers() {
        // 8 bits represent 0..=15 exactly: round trip is the identity.
        let w = arr2(&[[0.0, 3.0, 7.0, 15.0], [1.0, 2.0, 4.0, 8.0]]);
        let mut q = AffineQuantizer::configure(8, true, false, false);
        q.find_params(w.view());
        let dq = q.quantize_dequantize(&w);
        for (orig, deq) in w.iter().zip(dq.iter()) {
            assert_abs_diff_eq!(orig, deq, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_degenerate_zero_channel() {
        let w = arr2(&[[0.0, 0.0, 0.0], [1.0, 2.0, 3.0]]);
        let mut q = AffineQuantizer::configure(4, true, true, false);
        q.find_params(w.view());
        // Zero channel gets the forced [-1, 1] range: scale 1/maxq.
        assert_abs_diff_eq!(q.scale()[0], 1.0 / 7.0, epsilon = 1e-6);
        assert!(q.ready());
        let dq = q.quantize_dequantize(&w);
        assert_abs_diff_eq!(dq[[0, 0]], 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_one_bit_symmetric_uses_unit_range() {
        let q = AffineQuantizer::configure(1, true, true, false);
        assert_eq!(q.minq(), 0);
        assert_eq!(q.maxq(), 1);
    }

    #[test]
    fn test_ternary_threshold() {
        let w = arr2(&[[2.0, -3.0, 0.1, -0.2]]);
        let mut q = AffineQuantizer::ternary(true);
        q.find_params(w.view());
        assert!(q.maxq() < 0);
        let dq = q.quantize_dequantize(&w);
        assert_abs_diff_eq!(dq[[0, 0]], 2.0, epsilon = 1e-6); // > scale/2
        assert_abs_diff_eq!(dq[[0, 1]], -3.0, epsilon = 1e-6); // < zero/2
        assert_abs_diff_eq!(dq[[0, 2]], 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(dq[[0, 3]], 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_per_tensor_repeats_params() {
        let w = arr2(&[[1.0, 2.0], [3.0, 4.0]]);
        let mut q = AffineQuantizer::configure(8, false, true, false);
        q.find_params(w.view());
        assert_eq!(q.scale().len(), 2);
        assert_abs_diff_eq!(q.scale()[0], q.scale()[1], epsilon = 1e-9);
        assert_abs_diff_eq!(q.scale()[0], 4.0 / 127.0, epsilon = 1e-6);
    }

    #[test]
    fn test_mse_refinement_does_not_hurt() {
        let w = arr2(&[[0.1, -0.5, 0.9, 10.0, -0.3, 0.2, 0.4, -0.8]]);
        let mut plain = AffineQuantizer::configure(4, true, false, false);
        plain.find_params(w.view());
        let mut refined = AffineQuantizer::configure(4, true, false, true);
        refined.find_params(w.view());

        let err = |q: &AffineQuantizer| -> f32 {
            q.quantize_dequantize(&w)
                .iter()
                .zip(w.iter())
                .map(|(a, b)| (a - b).abs().powf(2.4))
                .sum()
        };
        assert!(err(&refined) <= err(&plain) + 1e-5);
    }

    #[test]
    fn test_grouped_matches_manual_slices() {
        // Group-boundary invariance: quantizing with group_size = 2 on a
        // 4-column matrix equals quantizing the two halves independently.
        let w = arr2(&[
            [0.1, 0.2, 5.0, -6.0],
            [-1.0, 0.5, 0.25, 0.75],
        ]);
        let grouped_cfg = LayerConfig::new().with_bits(4).with_group_size(2);
        let (grouped, record) = quantize_dequantize_grouped(&w, &grouped_cfg).unwrap();
        assert_eq!(record.num_groups(), 2);

        let whole_cfg = LayerConfig::new().with_bits(4).with_group_size(NO_GROUPING);
        for g in 0..2 {
            let slice = w.slice(s![.., 2 * g..2 * g + 2]).to_owned();
            let (dq, _) = quantize_dequantize_grouped(&slice, &whole_cfg).unwrap();
            for r in 0..2 {
                for c in 0..2 {
                    assert_abs_diff_eq!(grouped[[r, 2 * g + c]], dq[[r, c]], epsilon = 1e-7);
                }
            }
        }
    }

    #[test]
    fn test_grouped_trailing_remainder() {
        // 5 columns with group 2: groups [0,2), [2,4), [4,5).
        let w = arr2(&[[1.0, 2.0, 3.0, 4.0, 100.0]]);
        let cfg = LayerConfig::new().with_bits(4).with_group_size(2);
        let (_, record) = quantize_dequantize_grouped(&w, &cfg).unwrap();
        assert_eq!(record.num_groups(), 3);
    }

    #[test]
    fn test_levels_within_grid() {
        let w = arr2(&[[-7.0, -1.0, 0.0, 1.0, 7.0]]);
        let mut q = AffineQuantizer::configure(3, true, true, false);
        q.find_params(w.view());
        let levels = q.quantize_levels(&w);
        for &l in levels.iter() {
            assert!(l >= q.minq() && l <= q.maxq());
        }
    }

    #[test]
    fn test_column_and_matrix_paths_agree() {
        let w = arr2(&[[0.3, -1.7], [2.5, 0.9]]);
        let mut q = AffineQuantizer::configure(4, true, false, false);
        q.find_params(w.view());
        let dq = q.quantize_dequantize(&w);
        for c in 0..2 {
            let col = q.quantize_dequantize_column(&arr1(&[w[[0, c]], w[[1, c]]]));
            assert_abs_diff_eq!(col[0], dq[[0, c]], epsilon = 1e-9);
            assert_abs_diff_eq!(col[1], dq[[1, c]], epsilon = 1e-9);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_dequantized_within_one_step(
            values in proptest::collection::vec(-50.0f32..50.0, 4..64)
        ) {
            let w = Array2::from_shape_vec((1, values.len()), values.clone()).unwrap();
            let mut q = AffineQuantizer::configure(8, true, false, false);
            q.find_params(w.view());
            let dq = q.quantize_dequantize(&w);
            let step = q.scale()[0];
            for (orig, deq) in w.iter().zip(dq.iter()) {
                prop_assert!((orig - deq).abs() <= step * 0.5 + 1e-4);
            }
        }

        #[test]
        fn prop_more_bits_never_increase_mse(
            values in proptest::collection::vec(-10.0f32..10.0, 8..64)
        ) {
            // The 2-bit symmetric grid is a subset of the 8-bit grid, so
            // nearest-point rounding can only improve per value.
            let w = Array2::from_shape_vec((1, values.len()), values.clone()).unwrap();
            let mse_at = |bits: u8| -> f32 {
                let mut q = AffineQuantizer::configure(bits, true, true, false);
                q.find_params(w.view());
                let dq = q.quantize_dequantize(&w);
                w.iter()
                    .zip(dq.iter())
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum::<f32>()
                    / w.len() as f32
            };
            prop_assert!(mse_at(8) <= mse_at(2) + 1e-6);
        }

        #[test]
        fn prop_symmetric_zero_maps_to_zero(
            values in proptest::collection::vec(-20.0f32..20.0, 4..32)
        ) {
            let w = Array2::from_shape_vec((1, values.len()), values).unwrap();
            let mut q = AffineQuantizer::configure(4, true, true, false);
            q.find_params(w.view());
            let z = quantize_value(0.0, q.scale()[0], q.zero()[0], q.minq(), q.maxq());
            prop_assert!(z.abs() < 1e-6);
        }
    }
}
