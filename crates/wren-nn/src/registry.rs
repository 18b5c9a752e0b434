// Registry — Layer classes and loss kinds by name
//
// Graph descriptions name their layer classes ("linear", "rec", ...) and
// losses ("ce", "ctc", ...). The registry maps those names to the class
// objects and loss constructors:
//
//   let reg = LayerRegistry::global()?;
//   let class = reg.resolve("linear")?;
//   let loss = reg.make_loss("output", "ctc", &opts)?;
//
// The process-wide table is built once, on first use, and is read-only
// afterwards. Callers that want extra classes build their own registry
// with `builtin()` + `register()`; duplicates are rejected.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use serde_json::{Map, Value};

use wren_core::{Error, Result};

use crate::batchnorm::BatchNormClass;
use crate::combine::CombineClass;
use crate::conv::{ConvClass, PoolClass};
use crate::copy::{ActivationClass, CopyClass, SourceClass};
use crate::hidden::GetLastHiddenStateClass;
use crate::layer::LayerClass;
use crate::linear::LinearClass;
use crate::loss::{self, Loss};
use crate::rec::{RecClass, RnnCellClass};
use crate::reduce::ReduceClass;
use crate::slice::SliceClass;
use crate::statistics::FramewiseStatisticsClass;
use crate::subnetwork::SubnetworkClass;

/// Builds a loss from its `loss_opts`; the first argument names the layer.
pub type LossFactory = fn(&str, &Map<String, Value>) -> Result<Box<dyn Loss>>;

/// Name → layer class, name → loss constructor.
#[derive(Clone, Default)]
pub struct LayerRegistry {
    classes: BTreeMap<&'static str, &'static dyn LayerClass>,
    losses: BTreeMap<&'static str, LossFactory>,
}

impl std::fmt::Debug for LayerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerRegistry")
            .field("classes", &self.classes.keys().collect::<Vec<_>>())
            .field("losses", &self.losses.keys().collect::<Vec<_>>())
            .finish()
    }
}

static GLOBAL: OnceLock<std::result::Result<LayerRegistry, (String, &'static str)>> = OnceLock::new();

impl LayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in class and loss.
    pub fn builtin() -> Result<Self> {
        let mut reg = Self::new();
        reg.register(&SourceClass)?;
        reg.register(&CopyClass)?;
        reg.register(&ActivationClass)?;
        reg.register(&BatchNormClass)?;
        reg.register(&SliceClass)?;
        reg.register(&LinearClass::LINEAR)?;
        reg.register(&LinearClass::FORWARD)?;
        reg.register(&LinearClass::SOFTMAX)?;
        reg.register(&ConvClass)?;
        reg.register(&PoolClass)?;
        reg.register(&ReduceClass)?;
        reg.register(&CombineClass)?;
        reg.register(&GetLastHiddenStateClass)?;
        reg.register(&SubnetworkClass)?;
        reg.register(&FramewiseStatisticsClass)?;
        reg.register(&RecClass)?;
        reg.register(&RnnCellClass)?;

        reg.register_loss("ce", loss::ce::CrossEntropyLoss::from_opts)?;
        reg.register_loss("generic_ce", loss::ce::GenericCrossEntropyLoss::from_opts)?;
        reg.register_loss("ctc", loss::ctc::CtcLoss::from_opts)?;
        Ok(reg)
    }

    /// The process-wide built-in registry.
    pub fn global() -> Result<&'static LayerRegistry> {
        let built = GLOBAL.get_or_init(|| {
            LayerRegistry::builtin().map_err(|e| match e {
                Error::DuplicateKind { name, what } => (name, what),
                other => (other.to_string(), "registry"),
            })
        });
        match built {
            Ok(reg) => Ok(reg),
            Err((name, what)) => Err(Error::DuplicateKind {
                name: name.clone(),
                what,
            }),
        }
    }

    pub fn register(&mut self, class: &'static dyn LayerClass) -> Result<()> {
        let kind = class.kind();
        if self.classes.insert(kind, class).is_some() {
            return Err(Error::DuplicateKind {
                name: kind.to_string(),
                what: "layer class",
            });
        }
        Ok(())
    }

    pub fn register_loss(&mut self, kind: &'static str, factory: LossFactory) -> Result<()> {
        if self.losses.insert(kind, factory).is_some() {
            return Err(Error::DuplicateKind {
                name: kind.to_string(),
                what: "loss",
            });
        }
        Ok(())
    }

    pub fn resolve(&self, kind: &str) -> Result<&'static dyn LayerClass> {
        self.classes
            .get(kind)
            .copied()
            .ok_or_else(|| Error::UnknownLayerKind {
                name: kind.to_string(),
            })
    }

    pub fn make_loss(&self, layer: &str, kind: &str, opts: &Map<String, Value>) -> Result<Box<dyn Loss>> {
        let factory = self.losses.get(kind).ok_or_else(|| Error::UnknownLossKind {
            name: kind.to_string(),
        })?;
        factory(layer, opts)
    }

    pub fn class_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.classes.keys().copied()
    }

    pub fn loss_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.losses.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_kinds() {
        let reg = LayerRegistry::global().unwrap();
        for kind in [
            "source", "copy", "activation", "batch_norm", "slice", "linear", "forward", "softmax", "conv", "pool",
            "reduce", "combine", "get_last_hidden_state", "subnetwork", "framewise_statistics", "rec", "rnn_cell",
        ] {
            assert_eq!(reg.resolve(kind).unwrap().kind(), kind);
        }
        assert_eq!(reg.class_names().count(), 17);
        assert_eq!(reg.loss_names().collect::<Vec<_>>(), vec!["ce", "ctc", "generic_ce"]);
    }

    #[test]
    fn test_unknown_names() {
        let reg = LayerRegistry::global().unwrap();
        assert!(matches!(reg.resolve("lienar"), Err(Error::UnknownLayerKind { name }) if name == "lienar"));
        assert!(matches!(
            reg.make_loss("out", "mse", &Map::new()),
            Err(Error::UnknownLossKind { .. })
        ));
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut reg = LayerRegistry::builtin().unwrap();
        assert!(matches!(
            reg.register(&CopyClass),
            Err(Error::DuplicateKind { what: "layer class", .. })
        ));
        assert!(matches!(
            reg.register_loss("ce", loss::ce::CrossEntropyLoss::from_opts),
            Err(Error::DuplicateKind { what: "loss", .. })
        ));
    }
}
