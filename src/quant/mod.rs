//! Weight-only quantization
//!
//! Provides post-training weight quantization for transformer models:
//! - Shared affine quantizer (symmetric/asymmetric, grouped, MSE-refined)
//! - RTN round-to-nearest baseline
//! - GPTQ Hessian-guided quantization with block-wise orchestration

pub mod affine;
pub mod config;
pub mod error;
pub mod gptq;
pub mod hessian;
pub mod metrics;
pub mod rtn;

pub use affine::{
    dequantize_level, quantize_dequantize_grouped, quantize_level, quantize_value,
    AffineQuantizer, QuantizerRecord,
};
pub use config::{LayerConfig, WeightConfig, NO_GROUPING};
pub use error::{QuantError, Result};
pub use hessian::HessianAccumulator;
pub use metrics::{max_abs_error, quantization_mse, reconstruction_error};
pub use rtn::{rtn_quantize_layer, rtn_quantize_model};
