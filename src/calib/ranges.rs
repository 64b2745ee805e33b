//! Per-layer activation range collection
//!
//! Records input min/max per quantizable layer while calibration samples
//! stream through a block. The records are the calibration-range output
//! contract for downstream activation handling; nothing here quantizes
//! activations.

use std::collections::HashMap;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::model::LayerTap;

/// Observed input range for one layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActivationRange {
    /// Smallest observed input value.
    pub min: f32,
    /// Largest observed input value.
    pub max: f32,
    /// Largest observed absolute value.
    pub absmax: f32,
    /// Number of observed rows.
    pub samples: usize,
}

impl ActivationRange {
    fn empty() -> Self {
        Self {
            min: f32::INFINITY,
            max: f32::NEG_INFINITY,
            absmax: 0.0,
            samples: 0,
        }
    }

    fn observe(&mut self, input: &Array2<f32>) {
        for &v in input.iter() {
            self.min = self.min.min(v);
            self.max = self.max.max(v);
            self.absmax = self.absmax.max(v.abs());
        }
        self.samples += input.nrows();
    }
}

/// Min-max activation statistics keyed by layer name.
///
/// Implements [`LayerTap`], so it can ride along any traced forward pass.
#[derive(Clone, Debug, Default)]
pub struct ActivationStats {
    ranges: HashMap<String, ActivationRange>,
}

impl ActivationStats {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Observed range for a layer, if any input was seen.
    pub fn get(&self, name: &str) -> Option<&ActivationRange> {
        self.ranges.get(name)
    }

    /// All observed ranges.
    pub fn ranges(&self) -> &HashMap<String, ActivationRange> {
        &self.ranges
    }

    /// Consume the collector, yielding the range records.
    pub fn into_ranges(self) -> HashMap<String, ActivationRange> {
        self.ranges
    }

    /// Merge another collector's records under a name prefix.
    pub fn absorb_prefixed(&mut self, prefix: &str, other: ActivationStats) {
        for (name, range) in other.ranges {
            let full = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}.{name}")
            };
            self.ranges.insert(full, range);
        }
    }
}

impl LayerTap for ActivationStats {
    fn on_layer(&mut self, name: &str, input: &Array2<f32>) {
        self.ranges
            .entry(name.to_string())
            .or_insert_with(ActivationRange::empty)
            .observe(input);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr2;

    #[test]
    fn test_observe_min_max() {
        let mut stats = ActivationStats::new();
        stats.on_layer("ffn.up", &arr2(&[[1.0, -2.0], [3.0, 0.5]]));
        stats.on_layer("ffn.up", &arr2(&[[-4.0, 0.0], [0.0, 0.0]]));
        let range = stats.get("ffn.up").unwrap();
        assert_abs_diff_eq!(range.min, -4.0, epsilon = 1e-6);
        assert_abs_diff_eq!(range.max, 3.0, epsilon = 1e-6);
        assert_abs_diff_eq!(range.absmax, 4.0, epsilon = 1e-6);
        assert_eq!(range.samples, 4);
    }

    #[test]
    fn test_absorb_prefixed() {
        let mut inner = ActivationStats::new();
        inner.on_layer("up", &arr2(&[[1.0]]));
        let mut outer = ActivationStats::new();
        outer.absorb_prefixed("layers.2", inner);
        assert!(outer.get("layers.2.up").is_some());
    }
}
