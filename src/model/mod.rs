//! Model collaborator: module trees, quantizable layers, forward capture
//!
//! The quantization core consumes models as trees of named modules with a
//! closed set of quantizable leaf kinds (`Linear`, GPT-2 style
//! `TransposedLinear`, `Conv1d`, `Conv2d`). Containers express execution
//! order; the `List` container marks the repeating transformer stack.
//! Activation capture happens through an explicit [`LayerTap`] observer
//! threaded into forward execution, not by patching forward methods.

mod embedding;
mod error;
mod layer;
mod module;
mod norm;
mod tree;

pub use embedding::Embedding;
pub use error::{ModelError, Result};
pub use layer::{Conv1d, Conv2d, LayerType, Linear, QuantLayer, TransposedLinear};
pub use module::{Activation, AuxArgs, LayerTap, Module, NoTap};
pub use norm::RmsNorm;
pub use tree::{
    find_block_container, find_layers, get_layer_mut, get_submodule, get_submodule_mut,
    prelude_modules, set_submodule,
};
