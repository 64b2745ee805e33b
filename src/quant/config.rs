//! Per-layer quantization configuration
//!
//! The core never parses configuration files. It consumes a
//! [`WeightConfig`]: a resolved mapping from fully-qualified layer name
//! to [`LayerConfig`], validated eagerly before any quantization starts.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::error::{QuantError, Result};

/// Whole-row quantization (no grouping).
pub const NO_GROUPING: i32 = -1;

/// Resolved quantization settings for one layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    /// Bit width of the integer grid.
    pub bits: u8,
    /// Input channels per scale/zero-point group; -1 quantizes whole
    /// rows with a single group.
    pub group_size: i32,
    /// Symmetric (zero-point-free) quantization.
    pub sym: bool,
    /// Reorder columns by descending Hessian diagonal before GPTQ.
    pub act_order: bool,
    /// Column block width for the lazy error-propagation sweep.
    pub block_size: usize,
    /// Hessian damping as a fraction of the mean diagonal.
    pub damping: f32,
    /// Per-output-channel quantization parameters.
    pub per_channel: bool,
    /// Shrink-grid MSE refinement of the quantization range.
    pub mse: bool,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            bits: 4,
            group_size: 128,
            sym: false,
            act_order: true,
            block_size: 128,
            damping: 0.01,
            per_channel: true,
            mse: false,
        }
    }
}

impl LayerConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bit width.
    pub fn with_bits(mut self, bits: u8) -> Self {
        self.bits = bits;
        self
    }

    /// Set the group size (-1 for whole-row).
    pub fn with_group_size(mut self, group_size: i32) -> Self {
        self.group_size = group_size;
        self
    }

    /// Set symmetric quantization.
    pub fn with_sym(mut self, sym: bool) -> Self {
        self.sym = sym;
        self
    }

    /// Enable or disable activation ordering.
    pub fn with_act_order(mut self, act_order: bool) -> Self {
        self.act_order = act_order;
        self
    }

    /// Set the column block size.
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Set the Hessian damping fraction.
    pub fn with_damping(mut self, damping: f32) -> Self {
        self.damping = damping;
        self
    }

    /// Enable or disable per-channel parameters.
    pub fn with_per_channel(mut self, per_channel: bool) -> Self {
        self.per_channel = per_channel;
        self
    }

    /// Enable or disable MSE range refinement.
    pub fn with_mse(mut self, mse: bool) -> Self {
        self.mse = mse;
        self
    }

    /// Validate the configuration.
    ///
    /// Rejects zero bit widths, widths beyond the 8-bit integer grid,
    /// group sizes that are neither -1 nor positive, and a zero block
    /// size.
    pub fn validate(&self) -> Result<()> {
        if self.bits == 0 || self.bits > 8 {
            return Err(QuantError::InvalidBits(self.bits));
        }
        if self.group_size != NO_GROUPING && self.group_size <= 0 {
            return Err(QuantError::InvalidGroupSize(self.group_size));
        }
        if self.block_size == 0 {
            return Err(QuantError::InvalidBlockSize(self.block_size));
        }
        Ok(())
    }
}

/// Resolved mapping from fully-qualified layer name to [`LayerConfig`].
///
/// Layers present in the model but absent here are skipped (and
/// reported), never failed.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WeightConfig {
    layers: HashMap<String, LayerConfig>,
}

impl WeightConfig {
    /// Create an empty mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(name, config)` pairs, validating each entry.
    pub fn from_layers<I, S>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, LayerConfig)>,
        S: Into<String>,
    {
        let mut config = Self::new();
        for (name, layer) in entries {
            config.insert(name, layer)?;
        }
        Ok(config)
    }

    /// Insert a validated entry.
    pub fn insert(&mut self, name: impl Into<String>, config: LayerConfig) -> Result<()> {
        config.validate()?;
        self.layers.insert(name.into(), config);
        Ok(())
    }

    /// Look up the configuration for a layer.
    pub fn get(&self, name: &str) -> Option<&LayerConfig> {
        self.layers.get(name)
    }

    /// Whether a layer is configured.
    pub fn contains(&self, name: &str) -> bool {
        self.layers.contains_key(name)
    }

    /// Number of configured layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}
