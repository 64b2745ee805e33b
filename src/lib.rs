//! Comprimir: post-training model compression
//!
//! Weight-only quantization for transformer language models. The crate
//! quantizes a model's weight matrices in place — RTN as the
//! calibration-free baseline, GPTQ for Hessian-guided rounding with
//! error propagation — while keeping activations in floating point.
//!
//! ## Architecture Components
//!
//! - `model`: module trees with a closed set of quantizable layer kinds
//!   and observer-based activation capture
//! - `calib`: buffered calibration samples and activation-range records
//! - `quant`: the affine quantizer, Hessian accumulation, RTN, and the
//!   GPTQ solver + block orchestrator
//! - `linalg`: the Cholesky kernels GPTQ inverts the Hessian with
//!
//! ## Example
//!
//! ```ignore
//! use comprimir::calib::{CalibSample, CalibrationSet};
//! use comprimir::quant::gptq::GptqPipeline;
//! use comprimir::quant::{LayerConfig, WeightConfig};
//!
//! let config = WeightConfig::from_layers(vec![
//!     ("layers.0.ffn_up", LayerConfig::default().with_bits(4)),
//!     ("layers.0.ffn_down", LayerConfig::default().with_bits(4)),
//! ])?;
//! let calib = CalibrationSet::from_samples(samples)?;
//! let output = GptqPipeline::new(&config).run(&mut model, &calib)?;
//! println!("{}", output.summary.to_json()?);
//! ```

pub mod calib;
pub mod linalg;
pub mod model;
pub mod quant;

pub use calib::{CalibSample, CalibrationSet};
pub use model::{Module, QuantLayer};
pub use quant::{LayerConfig, QuantError, WeightConfig};
