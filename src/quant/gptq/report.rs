//! Structured quantization reports
//!
//! The orchestrator never silently drops a layer: every quantizable
//! layer it sees ends up in the summary as quantized, skipped, or
//! failed. The final model always reflects "quantized where possible,
//! original floating point elsewhere".

use serde::{Deserialize, Serialize};

/// Why a layer was left unquantized without being an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// The layer is absent from the resolved weight configuration.
    NoConfig,
}

impl SkipReason {
    /// Display name for report rendering.
    pub fn display_name(&self) -> &'static str {
        match self {
            SkipReason::NoConfig => "skipped, no config",
        }
    }
}

/// Outcome for one quantizable layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum LayerOutcome {
    /// Quantized and written back.
    Quantized {
        bits: u8,
        group_size: i32,
        /// Accumulated squared quantization loss.
        loss: f32,
        /// Column sweep duration in milliseconds.
        elapsed_ms: f64,
    },
    /// Left at its original weights, non-fatally.
    Skipped { reason: SkipReason },
    /// Quantization failed; weights left at their original values.
    Failed { error: String },
}

/// Per-layer report entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LayerReport {
    /// Fully-qualified layer name.
    pub name: String,
    /// What happened to it.
    pub outcome: LayerOutcome,
}

/// Summary of one quantization pass.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QuantSummary {
    /// Per-layer outcomes, in processing order.
    pub layers: Vec<LayerReport>,
    /// Number of transformer blocks processed.
    pub blocks: usize,
    /// Number of calibration samples used.
    pub samples: usize,
    /// Whether an observer stopped the pass early.
    pub aborted: bool,
}

impl QuantSummary {
    pub(crate) fn new(blocks: usize, samples: usize) -> Self {
        Self {
            blocks,
            samples,
            ..Self::default()
        }
    }

    pub(crate) fn push(&mut self, name: String, outcome: LayerOutcome) {
        self.layers.push(LayerReport { name, outcome });
    }

    /// Names of successfully quantized layers.
    pub fn quantized(&self) -> Vec<&str> {
        self.layers
            .iter()
            .filter(|r| matches!(r.outcome, LayerOutcome::Quantized { .. }))
            .map(|r| r.name.as_str())
            .collect()
    }

    /// Names of skipped layers.
    pub fn skipped(&self) -> Vec<&str> {
        self.layers
            .iter()
            .filter(|r| matches!(r.outcome, LayerOutcome::Skipped { .. }))
            .map(|r| r.name.as_str())
            .collect()
    }

    /// Names of failed layers.
    pub fn failed(&self) -> Vec<&str> {
        self.layers
            .iter()
            .filter(|r| matches!(r.outcome, LayerOutcome::Failed { .. }))
            .map(|r| r.name.as_str())
            .collect()
    }

    /// Whether every discovered layer was quantized and the pass ran to
    /// completion.
    pub fn is_complete(&self) -> bool {
        !self.aborted && self.quantized().len() == self.layers.len()
    }

    /// Serialize the summary as pretty JSON for external tooling.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_summary() -> QuantSummary {
        let mut summary = QuantSummary::new(2, 8);
        summary.push(
            "layers.0.up".to_string(),
            LayerOutcome::Quantized {
                bits: 4,
                group_size: 128,
                loss: 0.5,
                elapsed_ms: 1.2,
            },
        );
        summary.push(
            "layers.0.gate".to_string(),
            LayerOutcome::Skipped {
                reason: SkipReason::NoConfig,
            },
        );
        summary.push(
            "layers.1.up".to_string(),
            LayerOutcome::Failed {
                error: "not positive-definite".to_string(),
            },
        );
        summary
    }

    #[test]
    fn test_summary_partitions() {
        let summary = sample_summary();
        assert_eq!(summary.quantized(), vec!["layers.0.up"]);
        assert_eq!(summary.skipped(), vec!["layers.0.gate"]);
        assert_eq!(summary.failed(), vec!["layers.1.up"]);
        assert!(!summary.is_complete());
    }

    #[test]
    fn test_summary_json_round_trip() {
        let summary = sample_summary();
        let json = summary.to_json().unwrap();
        assert!(json.contains("layers.0.up"));
        let back: QuantSummary = serde_json::from_str(&json).unwrap();
        assert_eq!(back.layers.len(), 3);
        assert_eq!(back.blocks, 2);
    }

    #[test]
    fn test_skip_reason_display() {
        assert_eq!(SkipReason::NoConfig.display_name(), "skipped, no config");
    }
}
