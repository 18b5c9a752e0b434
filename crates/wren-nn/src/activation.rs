// Activation registry — Named elementwise functions, injectable per network
//
// Layers refer to activation functions by name ("tanh", "relu", ...). The
// registry maps each name to a function that records the activation on a
// tensor handle:
//
//   let act = registry.get("out", "softmax")?;
//   let y = act.apply(&x);
//
// The math itself belongs to the executing engine; most built-ins simply
// record an `Op::Activation(name)` node. Callers can add their own entries,
// including composites built from other tensor ops.
//
// Softmax is special: losses fuse it with cross-entropy, so
// `Activation::is_softmax` lets them recover the logits.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use wren_core::{Error, Result, Tensor};

type ActivationFn = Rc<dyn Fn(&Tensor) -> Tensor>;

/// A named elementwise function.
#[derive(Clone)]
pub struct Activation {
    name: String,
    func: ActivationFn,
}

impl fmt::Debug for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Activation({})", self.name)
    }
}

impl Activation {
    pub fn new(name: impl Into<String>, func: impl Fn(&Tensor) -> Tensor + 'static) -> Self {
        Activation {
            name: name.into(),
            func: Rc::new(func),
        }
    }

    /// An activation the engine implements under this name.
    pub fn named(name: &str) -> Self {
        let owned = name.to_string();
        Activation::new(name, move |x| x.activation(&owned))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn apply(&self, x: &Tensor) -> Tensor {
        (self.func)(x)
    }

    pub fn is_softmax(&self) -> bool {
        self.name == "softmax"
    }

    pub fn is_log_softmax(&self) -> bool {
        self.name == "log_softmax"
    }
}

/// Name → activation function.
#[derive(Debug, Clone)]
pub struct ActivationRegistry {
    entries: BTreeMap<String, Activation>,
}

impl Default for ActivationRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ActivationRegistry {
    /// A registry with no entries.
    pub fn empty() -> Self {
        ActivationRegistry {
            entries: BTreeMap::new(),
        }
    }

    /// The standard set of activations.
    pub fn builtin() -> Self {
        let mut reg = Self::empty();
        for name in [
            "relu",
            "tanh",
            "sigmoid",
            "softmax",
            "log_softmax",
            "elu",
            "softplus",
            "gelu",
        ] {
            reg.insert(Activation::named(name));
        }
        reg.insert(Activation::new("exp", |x| x.exp()));
        reg.insert(Activation::new("identity", |x| x.clone()));
        reg
    }

    /// Add or replace an entry.
    pub fn insert(&mut self, activation: Activation) {
        self.entries.insert(activation.name.clone(), activation);
    }

    /// Look up by name; `layer` is only used for the error.
    pub fn get(&self, layer: &str, name: &str) -> Result<Activation> {
        self.entries.get(name).cloned().ok_or_else(|| {
            tracing::debug!(layer, name, "activation lookup failed");
            Error::UnknownActivation {
                name: name.to_string(),
            }
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wren_core::{DType, Graph, Op, UnaryOp};

    #[test]
    fn test_builtin_names() {
        let reg = ActivationRegistry::builtin();
        for name in ["relu", "tanh", "sigmoid", "softmax", "log_softmax", "exp", "elu", "softplus", "gelu", "identity"] {
            assert!(reg.contains(name), "{name}");
        }
        assert!(matches!(
            reg.get("l", "swishy"),
            Err(Error::UnknownActivation { .. })
        ));
    }

    #[test]
    fn test_apply_records_ops() {
        let g = Graph::new();
        let x = g.placeholder("data", DType::F32, 3);
        let reg = ActivationRegistry::builtin();
        let y = reg.get("l", "tanh").unwrap().apply(&x);
        assert_eq!(y.op(), Op::Activation("tanh".into()));
        let y = reg.get("l", "exp").unwrap().apply(&x);
        assert_eq!(y.op(), Op::Unary(UnaryOp::Exp));
        let before = g.len();
        let y = reg.get("l", "identity").unwrap().apply(&x);
        assert_eq!(y, x);
        assert_eq!(g.len(), before);
    }

    #[test]
    fn test_custom_entry() {
        let mut reg = ActivationRegistry::empty();
        reg.insert(Activation::new("square", |x| x.square()));
        assert_eq!(reg.names().collect::<Vec<_>>(), vec!["square"]);
        assert!(!reg.get("l", "square").unwrap().is_softmax());
    }
}
