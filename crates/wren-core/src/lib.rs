//! # wren-core
//!
//! Core types for Wren graph construction.
//!
//! This crate provides:
//! - [`Graph`] / [`Tensor`]: the append-only symbolic op graph and handles into it
//! - [`Op`]: what each recorded node computes
//! - [`TensorDescriptor`]: shape, dtype and axis roles of a node's output
//! - [`Dim`] / [`DType`]: axis extents and element types
//! - [`Error`]: the error taxonomy shared by the whole workspace

pub mod data;
pub mod dim;
pub mod dtype;
pub mod error;
pub mod graph;
pub mod op;
pub mod tensor;

pub use data::{DataOpts, Overrides, TensorDescriptor};
pub use dim::{format_shape, Dim};
pub use dtype::DType;
pub use error::{Error, Result};
pub use graph::{Graph, LengthFeeds, Node};
pub use op::{BinaryOp, CmpOp, Init, NodeId, Op, Padding, PoolMode, ReduceOp, UnaryOp};
pub use tensor::Tensor;
