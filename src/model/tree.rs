//! Module tree traversal utilities
//!
//! Pure recursive helpers over [`Module`] trees: enumerate quantizable
//! layers by type, resolve dotted paths, and detect the repeating block
//! container that anchors block-wise quantization.

use super::error::{ModelError, Result};
use super::layer::{LayerType, QuantLayer};
use super::module::{join, Module};

/// Enumerate quantizable layers under `module`, depth-first, filtered by
/// the `allow` type list. Names are dotted paths relative to `module`.
pub fn find_layers<'a>(module: &'a Module, allow: &[LayerType]) -> Vec<(String, &'a QuantLayer)> {
    let mut out = Vec::new();
    collect_layers(module, "", allow, &mut out);
    out
}

fn collect_layers<'a>(
    module: &'a Module,
    prefix: &str,
    allow: &[LayerType],
    out: &mut Vec<(String, &'a QuantLayer)>,
) {
    match module {
        Module::Layer(layer) => {
            if allow.contains(&layer.layer_type()) {
                out.push((prefix.to_string(), layer));
            }
        }
        Module::Residual(body) => collect_layers(body, &join(prefix, "body"), allow, out),
        Module::Sequential(children) => {
            for (name, child) in children {
                collect_layers(child, &join(prefix, name), allow, out);
            }
        }
        Module::List(items) => {
            for (idx, child) in items.iter().enumerate() {
                collect_layers(child, &join(prefix, &idx.to_string()), allow, out);
            }
        }
        Module::Embedding(_) | Module::Norm(_) | Module::Activation(_) | Module::AddAux(_) => {}
    }
}

/// Resolve a dotted path to a sub-module. An empty path is the root.
pub fn get_submodule<'a>(root: &'a Module, path: &str) -> Option<&'a Module> {
    if path.is_empty() {
        return Some(root);
    }
    let mut node = root;
    for seg in path.split('.') {
        node = child_of(node, seg)?;
    }
    Some(node)
}

/// Mutable variant of [`get_submodule`].
pub fn get_submodule_mut<'a>(root: &'a mut Module, path: &str) -> Option<&'a mut Module> {
    if path.is_empty() {
        return Some(root);
    }
    let mut node = root;
    for seg in path.split('.') {
        node = child_of_mut(node, seg)?;
    }
    Some(node)
}

/// Resolve a dotted path to a quantizable layer, mutably.
pub fn get_layer_mut<'a>(root: &'a mut Module, path: &str) -> Option<&'a mut QuantLayer> {
    match get_submodule_mut(root, path)? {
        Module::Layer(layer) => Some(layer),
        _ => None,
    }
}

/// Replace the sub-module at a dotted path.
pub fn set_submodule(root: &mut Module, path: &str, new: Module) -> Result<()> {
    match get_submodule_mut(root, path) {
        Some(slot) => {
            *slot = new;
            Ok(())
        }
        None => Err(ModelError::PathNotFound(path.to_string())),
    }
}

fn child_of<'a>(node: &'a Module, seg: &str) -> Option<&'a Module> {
    match node {
        Module::Sequential(children) => children
            .iter()
            .find(|(name, _)| name == seg)
            .map(|(_, child)| child),
        Module::List(items) => seg.parse::<usize>().ok().and_then(|idx| items.get(idx)),
        Module::Residual(body) if seg == "body" => Some(body),
        _ => None,
    }
}

fn child_of_mut<'a>(node: &'a mut Module, seg: &str) -> Option<&'a mut Module> {
    match node {
        Module::Sequential(children) => children
            .iter_mut()
            .find(|(name, _)| name == seg)
            .map(|(_, child)| child),
        Module::List(items) => seg.parse::<usize>().ok().and_then(|idx| items.get_mut(idx)),
        Module::Residual(body) if seg == "body" => Some(body),
        _ => None,
    }
}

/// Find the repeating block container: the first `List` in depth-first
/// order. Returns its dotted path and child count.
pub fn find_block_container(root: &Module) -> Option<(String, usize)> {
    find_list(root, "")
}

fn find_list(module: &Module, prefix: &str) -> Option<(String, usize)> {
    match module {
        Module::List(items) => Some((prefix.to_string(), items.len())),
        Module::Sequential(children) => children
            .iter()
            .find_map(|(name, child)| find_list(child, &join(prefix, name))),
        Module::Residual(body) => find_list(body, &join(prefix, "body")),
        _ => None,
    }
}

/// Modules executed before the block container, in execution order.
///
/// These form the model prelude (embeddings, input norms) that turns
/// calibration samples into block-0 hidden states.
pub fn prelude_modules<'a>(
    root: &'a Module,
    container_path: &str,
) -> Vec<(String, &'a Module)> {
    let mut out = Vec::new();
    if container_path.is_empty() {
        return out;
    }
    let mut node = root;
    let mut prefix = String::new();
    for seg in container_path.split('.') {
        match node {
            Module::Sequential(children) => {
                let mut next = None;
                for (name, child) in children {
                    if name == seg {
                        next = Some(child);
                        break;
                    }
                    out.push((join(&prefix, name), child));
                }
                match next {
                    Some(child) => {
                        prefix = join(&prefix, seg);
                        node = child;
                    }
                    None => return out,
                }
            }
            Module::Residual(body) if seg == "body" => {
                prefix = join(&prefix, seg);
                node = body;
            }
            _ => return out,
        }
    }
    out
}
