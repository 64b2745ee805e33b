//! GPTQ: Hessian-guided post-training weight quantization
//!
//! Layer-by-layer weight rounding that minimizes the layer's output
//! reconstruction error on calibration activations. The solver handles
//! one layer's column sweep; the pipeline walks the transformer block
//! stack, streaming calibration inputs through each block and feeding
//! every block the previous block's quantized outputs.
//!
//! Reference: Frantar et al., arXiv:2210.17323.

mod pipeline;
mod report;
mod solver;


pub use pipeline::{
    GptqPipeline, NullObserver, PipelineAction, PipelineObserver, PipelineOptions, PipelineOutput,
};
pub use report::{LayerOutcome, LayerReport, QuantSummary, SkipReason};
pub use solver::{fasterquant, quantize_layer, GptqOutcome, GptqSolver};
