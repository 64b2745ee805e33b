//! Block-wise quantization orchestrator
//!
//! Walks the repeating transformer blocks strictly in model order. Per
//! block: a capture pass streams the cached calibration inputs through
//! the block, feeding one Hessian accumulator per configured sub-layer;
//! each sub-layer is then quantized and written back atomically; finally
//! the now-quantized block recomputes its outputs, which become the next
//! block's inputs. At most one block's caches and one layer's Hessian
//! are live at a time.

use std::collections::HashMap;

use ndarray::Array2;

use crate::calib::{ActivationRange, ActivationStats, CalibSample, CalibrationSet};
use crate::model::{
    find_block_container, find_layers, get_layer_mut, get_submodule, prelude_modules, AuxArgs,
    LayerTap, LayerType, ModelError, Module, QuantLayer,
};
use crate::quant::affine::QuantizerRecord;
use crate::quant::config::WeightConfig;
use crate::quant::error::{QuantError, Result};

use super::report::{LayerOutcome, QuantSummary, SkipReason};
use super::solver::GptqSolver;

/// Action requested by an observer after a notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineAction {
    /// Keep going.
    Continue,
    /// Stop the pass at the next layer boundary.
    Stop,
}

/// Progress observer for a quantization pass.
///
/// All methods have no-op defaults. Returning
/// [`PipelineAction::Stop`] aborts the pass between layers; layers
/// already written back stay quantized.
pub trait PipelineObserver {
    /// Called before a block's capture pass begins.
    fn on_block_begin(&mut self, _block: usize, _total: usize) -> PipelineAction {
        PipelineAction::Continue
    }

    /// Called after a layer was quantized and written back.
    fn on_layer_quantized(&mut self, _name: &str, _loss: f32) -> PipelineAction {
        PipelineAction::Continue
    }

    /// Called when a layer is skipped (absent from the configuration).
    fn on_layer_skipped(&mut self, _name: &str, _reason: SkipReason) {}

    /// Called when a layer fails non-fatally.
    fn on_layer_failed(&mut self, _name: &str, _error: &QuantError) {}

    /// Called after a block's outputs have been recomputed.
    fn on_block_end(&mut self, _block: usize) {}
}

/// Observer that ignores every notification.
pub struct NullObserver;

impl PipelineObserver for NullObserver {}

/// Orchestrator options.
#[derive(Clone, Debug)]
pub struct PipelineOptions {
    /// Escalate per-layer numerical failures instead of recording them.
    pub stop_on_error: bool,
    /// Collect per-layer activation ranges during capture passes.
    pub collect_ranges: bool,
    /// Quantizable layer type allowlist.
    pub layer_types: Vec<LayerType>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            stop_on_error: false,
            collect_ranges: false,
            layer_types: LayerType::ALL.to_vec(),
        }
    }
}

/// Output of a quantization pass.
#[derive(Clone, Debug)]
pub struct PipelineOutput {
    /// Per-layer outcomes.
    pub summary: QuantSummary,
    /// Scale/zero-point records keyed by fully-qualified layer name,
    /// for external packing.
    pub records: HashMap<String, QuantizerRecord>,
    /// Activation ranges, when collection was enabled.
    pub ranges: Option<HashMap<String, ActivationRange>>,
}

/// GPTQ block orchestrator.
///
/// # Example
///
/// ```ignore
/// use comprimir::quant::{gptq::GptqPipeline, LayerConfig, WeightConfig};
///
/// let config = WeightConfig::from_layers(vec![
///     ("layers.0.ffn_up", LayerConfig::default()),
/// ])?;
/// let output = GptqPipeline::new(&config).run(&mut model, &calib)?;
/// println!("{}", output.summary.to_json()?);
/// ```
pub struct GptqPipeline<'a> {
    config: &'a WeightConfig,
    options: PipelineOptions,
}

impl<'a> GptqPipeline<'a> {
    /// Create a pipeline over a resolved weight configuration.
    pub fn new(config: &'a WeightConfig) -> Self {
        Self {
            config,
            options: PipelineOptions::default(),
        }
    }

    /// Replace the default options.
    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    /// Run the pass, mutating weights in place.
    pub fn run(&self, model: &mut Module, calib: &CalibrationSet) -> Result<PipelineOutput> {
        self.run_observed(model, calib, &mut NullObserver)
    }

    /// Run the pass with progress observation.
    pub fn run_observed(
        &self,
        model: &mut Module,
        calib: &CalibrationSet,
        observer: &mut dyn PipelineObserver,
    ) -> Result<PipelineOutput> {
        if calib.is_empty() {
            return Err(QuantError::ShapeMismatch {
                context: "calibration set".to_string(),
                expected: 1,
                actual: 0,
            });
        }
        let (container, num_blocks) =
            find_block_container(model).ok_or(QuantError::NoRepeatingBlocks)?;

        // CAPTURE: block-0 inputs from the model prelude.
        let mut cache = capture_block_inputs(model, &container, calib)?;
        let aux = calib.aux().clone();

        let mut summary = QuantSummary::new(num_blocks, calib.len());
        let mut records = HashMap::new();
        let mut all_stats = self.options.collect_ranges.then(ActivationStats::new);

        'blocks: for block_idx in 0..num_blocks {
            if observer.on_block_begin(block_idx, num_blocks) == PipelineAction::Stop {
                summary.aborted = true;
                break 'blocks;
            }
            let block_path = if container.is_empty() {
                block_idx.to_string()
            } else {
                format!("{container}.{block_idx}")
            };

            // Discover sub-layers; accumulate Hessians for configured
            // ones while the calibration inputs stream through.
            let mut solvers: Vec<(String, GptqSolver)> = Vec::new();
            {
                let block = get_submodule(model, &block_path)
                    .ok_or_else(|| ModelError::PathNotFound(block_path.clone()))?;
                let mut layer_refs: HashMap<String, &QuantLayer> = HashMap::new();
                for (rel, layer) in find_layers(block, &self.options.layer_types) {
                    let full = format!("{block_path}.{rel}");
                    match self.config.get(&full) {
                        Some(cfg) => {
                            let solver = GptqSolver::new(layer.in_features(), cfg.clone())?;
                            layer_refs.insert(rel.clone(), layer);
                            solvers.push((rel, solver));
                        }
                        None => {
                            observer.on_layer_skipped(&full, SkipReason::NoConfig);
                            summary.push(
                                full,
                                LayerOutcome::Skipped {
                                    reason: SkipReason::NoConfig,
                                },
                            );
                        }
                    }
                }

                let index: HashMap<String, usize> = solvers
                    .iter()
                    .enumerate()
                    .map(|(slot, (rel, _))| (rel.clone(), slot))
                    .collect();
                let mut block_stats = self.options.collect_ranges.then(ActivationStats::new);
                let mut tap = CaptureTap {
                    layers: layer_refs,
                    index,
                    solvers: &mut solvers,
                    stats: block_stats.as_mut(),
                    error: None,
                };
                for hidden in &cache {
                    block.forward_traced(hidden, &aux, &mut tap)?;
                    if let Some(err) = tap.error.take() {
                        return Err(err);
                    }
                }
                if let (Some(all), Some(local)) = (all_stats.as_mut(), block_stats) {
                    all.absorb_prefixed(&block_path, local);
                }
            }

            // QUANTIZE: consume each solver, freeing its Hessian.
            for (rel, solver) in solvers {
                let full = format!("{block_path}.{rel}");
                let layer = get_layer_mut(model, &full)
                    .ok_or_else(|| ModelError::PathNotFound(full.clone()))?;
                match solver.quantize(layer) {
                    Ok(outcome) => {
                        let action = observer.on_layer_quantized(&full, outcome.loss);
                        records.insert(full.clone(), outcome.record.clone());
                        summary.push(
                            full,
                            LayerOutcome::Quantized {
                                bits: outcome.record.bits,
                                group_size: outcome.record.group_size,
                                loss: outcome.loss,
                                elapsed_ms: outcome.elapsed.as_secs_f64() * 1e3,
                            },
                        );
                        if action == PipelineAction::Stop {
                            summary.aborted = true;
                            break 'blocks;
                        }
                    }
                    Err(err @ QuantError::NotPositiveDefinite { .. }) => {
                        let err = err.with_layer(&full);
                        if self.options.stop_on_error {
                            return Err(err);
                        }
                        observer.on_layer_failed(&full, &err);
                        summary.push(
                            full,
                            LayerOutcome::Failed {
                                error: err.to_string(),
                            },
                        );
                    }
                    Err(other) => return Err(other),
                }
            }

            // ADVANCE: the quantized block's outputs feed the next block.
            {
                let block = get_submodule(model, &block_path)
                    .ok_or_else(|| ModelError::PathNotFound(block_path.clone()))?;
                let mut next = Vec::with_capacity(cache.len());
                for hidden in &cache {
                    next.push(block.forward(hidden, &aux)?);
                }
                cache = next;
            }
            observer.on_block_end(block_idx);
        }

        Ok(PipelineOutput {
            summary,
            records,
            ranges: all_stats.map(ActivationStats::into_ranges),
        })
    }
}

/// Run the model prelude over every calibration sample, producing the
/// first block's input hidden states.
fn capture_block_inputs(
    model: &Module,
    container: &str,
    calib: &CalibrationSet,
) -> Result<Vec<Array2<f32>>> {
    let prelude = prelude_modules(model, container);
    let aux: &AuxArgs = calib.aux();
    let mut cache = Vec::with_capacity(calib.len());

    for sample in calib.samples() {
        let mut tokens: Option<&[usize]> = None;
        let mut state: Option<Array2<f32>> = None;
        match sample {
            CalibSample::Hidden(h) => state = Some(h.clone()),
            CalibSample::Tokens(t) => tokens = Some(t.as_slice()),
        }
        for (name, module) in &prelude {
            state = Some(match (state.take(), module) {
                (None, Module::Embedding(emb)) => {
                    let t = tokens
                        .ok_or_else(|| ModelError::TokenInputRequired(name.clone()))?;
                    emb.embed(t)?
                }
                (Some(x), m) => m.forward(&x, aux)?,
                (None, _) => return Err(ModelError::TokenInputRequired(name.clone()).into()),
            });
        }
        match state {
            Some(hidden) => cache.push(hidden),
            None => {
                return Err(QuantError::ShapeMismatch {
                    context: "prelude produced no hidden states".to_string(),
                    expected: 1,
                    actual: 0,
                })
            }
        }
    }
    Ok(cache)
}

/// Capture-pass tap: routes each configured sub-layer's input into its
/// Hessian accumulator (unfolded for convolutions) and optionally into
/// the range collector. The first error is held and surfaced after the
/// forward call.
struct CaptureTap<'a> {
    layers: HashMap<String, &'a QuantLayer>,
    index: HashMap<String, usize>,
    solvers: &'a mut Vec<(String, GptqSolver)>,
    stats: Option<&'a mut ActivationStats>,
    error: Option<QuantError>,
}

impl LayerTap for CaptureTap<'_> {
    fn on_layer(&mut self, name: &str, input: &Array2<f32>) {
        if let Some(stats) = self.stats.as_deref_mut() {
            stats.on_layer(name, input);
        }
        if self.error.is_some() {
            return;
        }
        let Some(&slot) = self.index.get(name) else {
            return;
        };
        let Some(layer) = self.layers.get(name) else {
            return;
        };
        match layer.unfold_input(input) {
            Ok(rows) => {
                if let Err(err) = self.solvers[slot].1.add_batch(rows.view()) {
                    self.error = Some(err);
                }
            }
            Err(err) => self.error = Some(err.into()),
        }
    }
}
