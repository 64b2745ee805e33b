//! GPTQ layer solver
//!
//! Hessian-guided weight rounding for one layer: columns are quantized
//! left to right in blocks, each column's rounding error is propagated
//! into the not-yet-quantized columns through the inverse-Cholesky
//! factor of the damped Hessian, and grouped parameters are recomputed
//! at group boundaries from the still-unquantized weights.
//!
//! Reference: Frantar et al., "GPTQ: Accurate Post-Training Quantization
//! for Generative Pre-trained Transformers", arXiv:2210.17323.

use std::time::{Duration, Instant};

use ndarray::{s, Array2, ArrayView2};

use crate::linalg::{cholesky_inverse, cholesky_lower, cholesky_upper};
use crate::model::QuantLayer;
use crate::quant::affine::{dequantize_level, quantize_level, AffineQuantizer, QuantizerRecord};
use crate::quant::config::{LayerConfig, NO_GROUPING};
use crate::quant::error::{QuantError, Result};
use crate::quant::hessian::HessianAccumulator;

/// Result of quantizing one layer.
#[derive(Clone, Debug)]
pub struct GptqOutcome {
    /// Scale/zero-point record per column group, plus the permutation.
    pub record: QuantizerRecord,
    /// Integer levels of the quantized weight, in original column
    /// order. Grouped levels are interpreted through `record` (and its
    /// permutation, when activation ordering was on).
    pub levels: Array2<i32>,
    /// Accumulated squared quantization loss, `Σ (w−q)²/d² / 2`.
    pub loss: f32,
    /// Wall-clock time spent in the column sweep.
    pub elapsed: Duration,
}

/// Per-layer GPTQ state: the streaming Hessian plus the layer config.
///
/// One solver exists per in-flight layer; consuming it through
/// [`GptqSolver::quantize`] frees the Hessian.
#[derive(Clone, Debug)]
pub struct GptqSolver {
    hessian: HessianAccumulator,
    config: LayerConfig,
}

impl GptqSolver {
    /// Create a solver for a layer with `in_features` flattened input
    /// channels.
    pub fn new(in_features: usize, config: LayerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            hessian: HessianAccumulator::new(in_features),
            config,
        })
    }

    /// Rows observed so far.
    pub fn nsamples(&self) -> usize {
        self.hessian.nsamples()
    }

    /// Fold a `[m, in_features]` activation batch into the Hessian.
    pub fn add_batch(&mut self, batch: ArrayView2<f32>) -> Result<()> {
        self.hessian.add_batch(batch)
    }

    /// Quantize the layer in place.
    ///
    /// The write-back is atomic: on any failure the layer keeps its
    /// original weight. The Hessian is consumed either way.
    pub fn quantize(self, layer: &mut QuantLayer) -> Result<GptqOutcome> {
        let mut weight = layer.weight_matrix();
        let outcome = fasterquant(&mut weight, self.hessian.into_matrix(), &self.config)?;
        layer.set_weight_matrix(&weight)?;
        Ok(outcome)
    }
}

/// Build a solver from unfolded activation batches and quantize the
/// layer in one call. Used for direct layer-level quantization outside
/// the block orchestrator.
pub fn quantize_layer(
    layer: &mut QuantLayer,
    batches: &[Array2<f32>],
    config: &LayerConfig,
) -> Result<GptqOutcome> {
    let mut solver = GptqSolver::new(layer.in_features(), config.clone())?;
    for batch in batches {
        solver.add_batch(batch.view())?;
    }
    solver.quantize(layer)
}

/// The GPTQ column sweep over a flattened `[out, in]` weight matrix.
///
/// `weight` is replaced by its quantized-dequantized counterpart in the
/// original column order; `hessian` is consumed. A Cholesky failure on
/// the damped Hessian aborts with [`QuantError::NotPositiveDefinite`]
/// (layer name left empty for the caller to fill in) and leaves
/// `weight` untouched.
pub fn fasterquant(
    weight: &mut Array2<f32>,
    hessian: Array2<f32>,
    config: &LayerConfig,
) -> Result<GptqOutcome> {
    config.validate()?;
    let (rows, columns) = weight.dim();
    if hessian.dim() != (columns, columns) {
        return Err(QuantError::ShapeMismatch {
            context: "fasterquant hessian".to_string(),
            expected: columns,
            actual: hessian.nrows(),
        });
    }

    let tick = Instant::now();
    let mut wk = weight.clone();
    let mut h = hessian;

    let mut quantizer = AffineQuantizer::from_config(config);
    quantizer.find_params(wk.view());
    let mut record = QuantizerRecord::new(config);
    if config.group_size == NO_GROUPING {
        record.push_group(&quantizer);
    }

    // Dead channels: a zero diagonal entry means the channel never
    // activated; force the pivot to 1 and zero the weight column so it
    // contributes nothing to reconstruction.
    for i in 0..columns {
        if h[[i, i]] == 0.0 {
            h[[i, i]] = 1.0;
            for r in 0..rows {
                wk[[r, i]] = 0.0;
            }
        }
    }

    // Activation order: quantize high-curvature columns first.
    let perm: Option<Vec<usize>> = if config.act_order {
        let diag: Vec<f32> = (0..columns).map(|i| h[[i, i]]).collect();
        let mut idx: Vec<usize> = (0..columns).collect();
        idx.sort_by(|&a, &b| {
            diag[b]
                .partial_cmp(&diag[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        wk = Array2::from_shape_fn((rows, columns), |(r, c)| wk[[r, idx[c]]]);
        h = Array2::from_shape_fn((columns, columns), |(i, j)| h[[idx[i], idx[j]]]);
        Some(idx)
    } else {
        None
    };

    // Damp the diagonal before inversion.
    let mean_diag = h.diag().mean().unwrap_or(0.0);
    let damp = config.damping * mean_diag;
    for i in 0..columns {
        h[[i, i]] += damp;
    }

    // Working inverse: chol(H) -> (H)^-1 -> upper chol of the inverse.
    let not_pd = |e: crate::linalg::NotPositiveDefinite| QuantError::NotPositiveDefinite {
        layer: String::new(),
        pivot: e.pivot,
    };
    let l = cholesky_lower(&h).map_err(not_pd)?;
    let h_inv = cholesky_inverse(&l);
    let hinv = cholesky_upper(&h_inv).map_err(not_pd)?;

    let block_size = config.block_size;
    let group_size = config.group_size;
    let mut q_mat = Array2::<f32>::zeros((rows, columns));
    let mut levels = Array2::<i32>::zeros((rows, columns));
    let mut loss_acc = 0.0f32;

    let mut i1 = 0;
    while i1 < columns {
        let i2 = (i1 + block_size).min(columns);
        let count = i2 - i1;

        let mut w1 = wk.slice(s![.., i1..i2]).to_owned();
        let mut err1 = Array2::<f32>::zeros((rows, count));

        for i in 0..count {
            let col = i1 + i;
            let d = hinv[[col, col]];

            // Group boundary: recompute parameters from the weights no
            // column sweep has touched yet (inter-block corrections
            // from earlier blocks included).
            if group_size != NO_GROUPING && (col as i32) % group_size == 0 {
                let gend = (col + group_size as usize).min(columns);
                quantizer.find_params(wk.slice(s![.., col..gend]));
                record.push_group(&quantizer);
            }

            let scale = quantizer.scale();
            let zero = quantizer.zero();
            for r in 0..rows {
                let w = w1[[r, i]];
                let lev = quantize_level(w, scale[r], zero[r], quantizer.minq(), quantizer.maxq());
                let q = dequantize_level(lev, scale[r], zero[r], quantizer.maxq());
                let e = (w - q) / d;
                loss_acc += (w - q) * (w - q) / (d * d);
                levels[[r, col]] = lev;
                q_mat[[r, col]] = q;
                err1[[r, i]] = e;
            }

            // Lazy in-block correction of the remaining columns.
            for j in i..count {
                let hij = hinv[[col, i1 + j]];
                if hij == 0.0 {
                    continue;
                }
                for r in 0..rows {
                    w1[[r, j]] -= err1[[r, i]] * hij;
                }
            }
        }

        // Global correction of all later blocks.
        if i2 < columns {
            let delta = err1.dot(&hinv.slice(s![i1..i2, i2..]));
            let mut tail = wk.slice_mut(s![.., i2..]);
            tail -= &delta;
        }

        i1 = i2;
    }

    let loss = loss_acc / 2.0;

    // Undo the activation-order permutation so columns line up with the
    // layer's native layout.
    if let Some(idx) = &perm {
        let mut inverse = vec![0usize; columns];
        for (pos, &orig) in idx.iter().enumerate() {
            inverse[orig] = pos;
        }
        let q_perm = q_mat;
        let lev_perm = levels;
        q_mat = Array2::from_shape_fn((rows, columns), |(r, c)| q_perm[[r, inverse[c]]]);
        levels = Array2::from_shape_fn((rows, columns), |(r, c)| lev_perm[[r, inverse[c]]]);
    }
    record.perm = perm;

    weight.assign(&q_mat);
    Ok(GptqOutcome {
        record,
        levels,
        loss,
        elapsed: tick.elapsed(),
    })
}
