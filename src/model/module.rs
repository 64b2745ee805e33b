//! Module tree and forward execution
//!
//! A model is a tree of named modules: quantizable leaves
//! ([`QuantLayer`]), auxiliary leaves (embedding, norm, activation), and
//! containers (`Sequential`, `List`, `Residual`). The `List` container
//! holds the homogeneous repeated transformer blocks that anchor
//! block-wise quantization.
//!
//! Forward execution threads an optional [`LayerTap`] observer that
//! receives every quantizable sub-layer's input before the layer
//! consumes it. This is the explicit capture protocol used during
//! calibration instead of mutating forward methods on the model.

use std::collections::HashMap;

use ndarray::Array2;

use super::embedding::Embedding;
use super::error::{ModelError, Result};
use super::layer::{Linear, QuantLayer};
use super::norm::RmsNorm;

/// Opaque auxiliary forward arguments (attention masks, position biases).
///
/// The quantization core never inspects these; they are echoed unchanged
/// into every block forward and consumed only by [`Module::AddAux`]
/// nodes the model author placed.
pub type AuxArgs = HashMap<String, Array2<f32>>;

/// Observer for quantizable sub-layer inputs during forward execution.
pub trait LayerTap {
    /// Called with the dotted layer name and its `[tokens, features]`
    /// input, before the layer runs.
    fn on_layer(&mut self, name: &str, input: &Array2<f32>);
}

/// A tap that records nothing.
pub struct NoTap;

impl LayerTap for NoTap {
    fn on_layer(&mut self, _name: &str, _input: &Array2<f32>) {}
}

/// Pointwise activation functions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Activation {
    Relu,
    Gelu,
    Silu,
}

impl Activation {
    /// Apply the activation elementwise.
    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        match self {
            Activation::Relu => x.mapv(|v| v.max(0.0)),
            Activation::Gelu => x.mapv(|v| {
                let c = (2.0 / std::f32::consts::PI).sqrt();
                0.5 * v * (1.0 + (c * (v + 0.044_715 * v * v * v)).tanh())
            }),
            Activation::Silu => x.mapv(|v| v / (1.0 + (-v).exp())),
        }
    }
}

/// A node in the module tree.
#[derive(Clone, Debug)]
pub enum Module {
    /// Token embedding (prelude only; rejects hidden-state input).
    Embedding(Embedding),
    /// Quantizable layer leaf.
    Layer(QuantLayer),
    /// RMS normalization leaf.
    Norm(RmsNorm),
    /// Pointwise activation leaf.
    Activation(Activation),
    /// Adds the named auxiliary tensor to the hidden state.
    AddAux(String),
    /// Residual wrapper: `x + body(x)`. The child path segment is `body`.
    Residual(Box<Module>),
    /// Named children executed in order.
    Sequential(Vec<(String, Module)>),
    /// Homogeneous repeated children (the transformer stack).
    List(Vec<Module>),
}

impl Module {
    /// Convenience: a linear layer leaf.
    pub fn linear(weight: Array2<f32>) -> Self {
        Module::Layer(QuantLayer::Linear(Linear::new(weight)))
    }

    /// Convenience: a sequential container from borrowed names.
    pub fn sequential(children: Vec<(&str, Module)>) -> Self {
        Module::Sequential(
            children
                .into_iter()
                .map(|(name, m)| (name.to_string(), m))
                .collect(),
        )
    }

    /// Forward pass without observation.
    pub fn forward(&self, x: &Array2<f32>, aux: &AuxArgs) -> Result<Array2<f32>> {
        self.forward_traced(x, aux, &mut NoTap)
    }

    /// Forward pass reporting every quantizable sub-layer input to `tap`.
    ///
    /// Layer names are dotted paths relative to `self`, matching
    /// [`crate::model::find_layers`].
    pub fn forward_traced(
        &self,
        x: &Array2<f32>,
        aux: &AuxArgs,
        tap: &mut dyn LayerTap,
    ) -> Result<Array2<f32>> {
        self.walk(x, aux, "", tap)
    }

    fn walk(
        &self,
        x: &Array2<f32>,
        aux: &AuxArgs,
        prefix: &str,
        tap: &mut dyn LayerTap,
    ) -> Result<Array2<f32>> {
        match self {
            Module::Embedding(_) => {
                Err(ModelError::TokenInputRequired(prefix.to_string()))
            }
            Module::Layer(layer) => {
                tap.on_layer(prefix, x);
                layer.forward(x)
            }
            Module::Norm(norm) => Ok(norm.forward(x)),
            Module::Activation(act) => Ok(act.forward(x)),
            Module::AddAux(name) => {
                let bias = aux
                    .get(name)
                    .ok_or_else(|| ModelError::MissingAux(name.clone()))?;
                if bias.dim() != x.dim() {
                    return Err(ModelError::ShapeMismatch {
                        context: format!("add_aux `{name}`"),
                        expected: x.len(),
                        actual: bias.len(),
                    });
                }
                Ok(x + bias)
            }
            Module::Residual(body) => {
                let inner = body.walk(x, aux, &join(prefix, "body"), tap)?;
                if inner.dim() != x.dim() {
                    return Err(ModelError::ShapeMismatch {
                        context: "residual body".to_string(),
                        expected: x.len(),
                        actual: inner.len(),
                    });
                }
                Ok(x + &inner)
            }
            Module::Sequential(children) => {
                let mut state = x.clone();
                for (name, child) in children {
                    state = child.walk(&state, aux, &join(prefix, name), tap)?;
                }
                Ok(state)
            }
            Module::List(items) => {
                let mut state = x.clone();
                for (idx, child) in items.iter().enumerate() {
                    state = child.walk(&state, aux, &join(prefix, &idx.to_string()), tap)?;
                }
                Ok(state)
            }
        }
    }
}

/// Join dotted path segments.
pub(crate) fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr2;

    struct Recorder(Vec<String>);

    impl LayerTap for Recorder {
        fn on_layer(&mut self, name: &str, _input: &Array2<f32>) {
            self.0.push(name.to_string());
        }
    }

    #[test]
    fn test_sequential_forward_and_tap_names() {
        let block = Module::sequential(vec![
            ("up", Module::linear(arr2(&[[1.0, 0.0], [0.0, 1.0]]))),
            ("act", Module::Activation(Activation::Relu)),
            ("down", Module::linear(arr2(&[[2.0, 0.0], [0.0, 2.0]]))),
        ]);
        let mut tap = Recorder(Vec::new());
        let x = arr2(&[[1.0, -1.0]]);
        let y = block.forward_traced(&x, &AuxArgs::new(), &mut tap).unwrap();
        assert_abs_diff_eq!(y[[0, 0]], 2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(y[[0, 1]], 0.0, epsilon = 1e-6);
        assert_eq!(tap.0, vec!["up".to_string(), "down".to_string()]);
    }

    #[test]
    fn test_residual_and_aux() {
        let block = Module::sequential(vec![
            ("bias", Module::AddAux("position_bias".to_string())),
            (
                "ffn",
                Module::Residual(Box::new(Module::linear(arr2(&[[0.0, 0.0], [0.0, 0.0]])))),
            ),
        ]);
        let mut aux = AuxArgs::new();
        aux.insert("position_bias".to_string(), arr2(&[[1.0, 2.0]]));
        let y = block.forward(&arr2(&[[1.0, 1.0]]), &aux).unwrap();
        // Zero body makes the residual an identity over the biased input.
        assert_eq!(y, arr2(&[[2.0, 3.0]]));
    }

    #[test]
    fn test_missing_aux_is_an_error() {
        let block = Module::AddAux("mask".to_string());
        let err = block.forward(&arr2(&[[1.0]]), &AuxArgs::new()).unwrap_err();
        assert_eq!(err, ModelError::MissingAux("mask".to_string()));
    }

    #[test]
    fn test_embedding_rejects_hidden_input() {
        let block = Module::Embedding(Embedding::new(arr2(&[[1.0, 2.0]])));
        let err = block.forward(&arr2(&[[1.0, 2.0]]), &AuxArgs::new()).unwrap_err();
        assert!(matches!(err, ModelError::TokenInputRequired(_)));
    }

    #[test]
    fn test_list_forward_names_are_indexed() {
        let stack = Module::List(vec![
            Module::linear(arr2(&[[1.0]])),
            Module::linear(arr2(&[[3.0]])),
        ]);
        let mut tap = Recorder(Vec::new());
        let y = stack
            .forward_traced(&arr2(&[[2.0]]), &AuxArgs::new(), &mut tap)
            .unwrap();
        assert_abs_diff_eq!(y[[0, 0]], 6.0, epsilon = 1e-6);
        assert_eq!(tap.0, vec!["0".to_string(), "1".to_string()]);
    }
}
