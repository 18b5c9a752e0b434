//! # wren-nn
//!
//! Layers, losses and the network container for Wren.
//!
//! A graph description names layers and their sources; the [`Network`]
//! resolves them lazily and lets every [`LayerClass`] record its ops into
//! the shared [`wren_core::Graph`]:
//!
//! 1. **Layer protocol**: `infer_output` (shape only), then `build`
//! 2. **Registry**: layer classes and loss kinds by name
//! 3. **Concatenation cache**: each source set (and dropout rate) is joined once
//! 4. **Layer classes**: source, copy, linear, conv, pool, slice, reduce,
//!    combine, batch norm, subnetwork, statistics, recurrent
//! 5. **Recurrent cells**: step, fused and native, plus attention/feedback
//! 6. **Losses**: cross-entropy, generic cross-entropy, CTC

pub mod activation;
pub mod batchnorm;
pub mod combine;
pub mod concat;
pub mod conv;
pub mod copy;
pub mod description;
pub mod hidden;
pub mod init;
pub mod layer;
pub mod linear;
pub mod loss;
pub mod network;
pub mod rec;
pub mod reduce;
pub mod registry;
pub mod slice;
pub mod statistics;
pub mod subnetwork;

pub use activation::{Activation, ActivationRegistry};
pub use description::{LayerDescription, NetworkDescription};
pub use layer::{
    last_hidden_state, HiddenState, Layer, LayerBase, LayerClass, LayerObjective, LayerRef, LayerSpec,
    OutputWithActivation, RecurrentState,
};
pub use loss::{Loss, LossInputs};
pub use network::{
    ExternData, ExternalResolver, Network, NetworkConfig, NoResolver, Objective, TrainFlag, TrainFlagConfig,
};
pub use rec::{CellKind, RecLayer, RnnCellLayer, Unit};
pub use registry::LayerRegistry;
pub use subnetwork::SubnetworkLayer;
