//! Round-to-nearest weight quantization
//!
//! The calibration-free baseline: every configured layer's weight is
//! fake-quantized independently through the shared affine quantizer,
//! group by group, with no error propagation. Shares configuration,
//! record and report types with GPTQ.

use std::collections::HashMap;
use std::time::Instant;

use crate::model::{find_layers, get_layer_mut, LayerType, ModelError, Module, QuantLayer};

use super::affine::{quantize_dequantize_grouped, QuantizerRecord};
use super::config::{LayerConfig, WeightConfig};
use super::error::Result;
use super::gptq::{LayerOutcome, QuantSummary, SkipReason};
use super::metrics::quantization_mse;

/// Quantize a single layer in place, round-to-nearest.
pub fn rtn_quantize_layer(
    layer: &mut QuantLayer,
    config: &LayerConfig,
) -> Result<QuantizerRecord> {
    let weight = layer.weight_matrix();
    let (dq, record) = quantize_dequantize_grouped(&weight, config)?;
    layer.set_weight_matrix(&dq)?;
    Ok(record)
}

/// Quantize every configured layer in a module tree, round-to-nearest.
///
/// Layers absent from the configuration are skipped and reported, the
/// same policy the GPTQ orchestrator applies.
pub fn rtn_quantize_model(
    model: &mut Module,
    config: &WeightConfig,
) -> Result<(QuantSummary, HashMap<String, QuantizerRecord>)> {
    let names: Vec<String> = find_layers(model, &LayerType::ALL)
        .into_iter()
        .map(|(name, _)| name)
        .collect();

    let mut summary = QuantSummary::new(0, 0);
    let mut records = HashMap::new();

    for name in names {
        match config.get(&name) {
            Some(layer_config) => {
                let layer = get_layer_mut(model, &name)
                    .ok_or_else(|| ModelError::PathNotFound(name.clone()))?;
                let tick = Instant::now();
                let before = layer.weight_matrix();
                let record = rtn_quantize_layer(layer, layer_config)?;
                let after = layer.weight_matrix();
                let loss = quantization_mse(&before, &after) * before.len() as f32;
                records.insert(name.clone(), record);
                summary.push(
                    name,
                    LayerOutcome::Quantized {
                        bits: layer_config.bits,
                        group_size: layer_config.group_size,
                        loss,
                        elapsed_ms: tick.elapsed().as_secs_f64() * 1e3,
                    },
                );
            }
            None => summary.push(
                name,
                LayerOutcome::Skipped {
                    reason: SkipReason::NoConfig,
                },
            ),
        }
    }
    Ok((summary, records))
}
