//! # Wren
//!
//! Build symbolic computation graphs from declarative layer descriptions.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust
//! use wren::prelude::*;
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `wren-core` | Error, DType, Dim, TensorDescriptor, the symbolic op Graph, length folding |
//! | `wren-nn` | Layer protocol and classes, recurrent cells, losses, the Network container |
//!
//! ## Modules
//!
//! - [`config`]: build options (seed, train flag, default input and target)
//! - [`builder`]: description loading and network construction
//! - [`telemetry`]: tracing subscriber setup

/// Re-export core types.
pub use wren_core::{
    format_shape, BinaryOp, CmpOp, DType, DataOpts, Dim, Error, Graph, Init, LengthFeeds, Node, NodeId, Op,
    Overrides, Padding, PoolMode, ReduceOp, Result, Tensor, TensorDescriptor, UnaryOp,
};

/// Re-export layers, losses and the network container.
pub mod nn {
    pub use wren_nn::*;
}

/// Build options.
pub mod config;

/// From descriptions to constructed networks.
pub mod builder;

/// Tracing subscriber setup.
pub mod telemetry;

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::builder::{build_from_json, load_description, GraphBuilder, GraphDocument};
    pub use crate::config::BuildConfig;
    pub use crate::nn::{
        last_hidden_state, ActivationRegistry, ExternData, ExternalResolver, HiddenState, Layer,
        LayerDescription, LayerRef, Network, NetworkDescription, Objective, RecurrentState, TrainFlag,
        TrainFlagConfig,
    };
    pub use crate::{DType, DataOpts, Dim, Error, Graph, LengthFeeds, Op, Result, Tensor, TensorDescriptor};
}
