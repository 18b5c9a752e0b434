// Dim — One axis of a tensor descriptor: static or dynamic
//
// Sequence models have axes whose extent varies per example (the time axis
// of an utterance, the width of a variable-size image). Such an axis is
// DYNAMIC: the descriptor does not know its size, and the per-example valid
// length travels next to the data as a separate length vector.
//
// Every other axis is STATIC: its size is part of the graph and is shared by
// all examples (the feature axis, a fixed window).
//
// In graph descriptions a shape is written as a JSON list where `null` marks
// a dynamic axis: `[null, 40]` is "variable time, 40 features".

use std::fmt;

use serde::{Deserialize, Serialize};

/// A single axis extent: known at graph-build time, or varying per example.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Option<usize>", into = "Option<usize>")]
pub enum Dim {
    /// Known when the graph is built: 40, 512, ...
    Static(usize),
    /// Varies per example; tracked through a length vector.
    Dynamic,
}

impl Dim {
    /// Is this a statically known extent?
    pub fn is_static(&self) -> bool {
        matches!(self, Dim::Static(_))
    }

    /// Is this a per-example (dynamic) extent?
    pub fn is_dynamic(&self) -> bool {
        matches!(self, Dim::Dynamic)
    }

    /// The static size, if any.
    pub fn size(&self) -> Option<usize> {
        match self {
            Dim::Static(n) => Some(*n),
            Dim::Dynamic => None,
        }
    }

    /// Number of elements a python-style `start:end:step` slice keeps.
    ///
    /// Dynamic axes stay dynamic; their lengths are recomputed separately.
    pub fn sliced(&self, start: Option<usize>, end: Option<usize>, step: usize) -> Dim {
        match self {
            Dim::Static(n) => {
                let end = end.unwrap_or(*n).min(*n);
                let start = start.unwrap_or(0).min(end);
                Dim::Static((end - start).div_ceil(step.max(1)))
            }
            Dim::Dynamic => Dim::Dynamic,
        }
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Static(n) => write!(f, "{n}"),
            Dim::Dynamic => write!(f, "?"),
        }
    }
}

impl From<usize> for Dim {
    fn from(n: usize) -> Self {
        Dim::Static(n)
    }
}

impl From<Option<usize>> for Dim {
    fn from(v: Option<usize>) -> Self {
        match v {
            Some(n) => Dim::Static(n),
            None => Dim::Dynamic,
        }
    }
}

impl From<Dim> for Option<usize> {
    fn from(d: Dim) -> Self {
        d.size()
    }
}

/// Format a shape the way error messages print it: `(?, 40)`.
pub fn format_shape(shape: &[Dim]) -> String {
    let parts: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
    format!("({})", parts.join(", "))
}
