/// All errors that can occur while constructing a Wren graph.
///
/// Graph construction is a one-shot, deterministic process: every variant
/// here describes a defect in the graph description or the build
/// configuration, so none of them is ever retried internally. Each variant
/// carries enough context (layer name, expected vs. actual shape) to fix
/// the description. A single error type across the workspace keeps `?`
/// propagation uniform.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The description names a layer class nobody registered.
    #[error("unknown layer class '{name}'")]
    UnknownLayerKind { name: String },

    /// The description names a loss nobody registered.
    #[error("unknown loss '{name}'")]
    UnknownLossKind { name: String },

    /// A recurrent layer asked for a cell unit that does not exist.
    #[error("unknown recurrent cell unit '{name}'")]
    UnknownCell { name: String },

    /// An activation function name is not in the activation registry.
    #[error("unknown activation function '{name}'")]
    UnknownActivation { name: String },

    /// Output shape could not be inferred (no `n_out`, no `out_type`, no target).
    #[error("cannot infer output shape of layer '{layer}': missing {field}")]
    MissingShape { layer: String, field: String },

    /// Static dimensions disagree between what was declared and what was computed.
    #[error("shape mismatch in layer '{layer}': expected {expected}, got {got}")]
    ShapeMismatch {
        layer: String,
        expected: String,
        got: String,
    },

    /// Options that are individually valid but cannot be combined.
    #[error("unsupported combination in layer '{layer}': {reason}")]
    UnsupportedCombination { layer: String, reason: String },

    /// A `from` reference is absent from the description or would close a cycle.
    #[error("layer '{layer}' cannot resolve source '{source_name}': {reason}")]
    CyclicOrMissingSource {
        layer: String,
        source_name: String,
        reason: String,
    },

    /// Two layers were given the same name in one network.
    #[error("layer '{name}' is already defined in this network")]
    DuplicateLayer { name: String },

    /// A layer class or loss was registered twice. This is a programming error.
    #[error("'{name}' is already registered as a {what}")]
    DuplicateKind { name: String, what: &'static str },

    /// An option has an invalid value or is not understood by the layer class.
    #[error("invalid option '{option}' for layer '{layer}': {reason}")]
    InvalidOption {
        layer: String,
        option: String,
        reason: String,
    },

    /// A loss target key is neither extern data nor a layer.
    #[error("target '{target}' of layer '{layer}' is unknown")]
    UnknownTarget { layer: String, target: String },

    /// Extern data key was never declared.
    #[error("extern data '{key}' is not declared")]
    UnknownExternData { key: String },

    /// The JSON graph description could not be parsed.
    #[error("invalid graph description: {0}")]
    Description(#[from] serde_json::Error),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    /// Shorthand for [`Error::InvalidOption`].
    pub fn invalid_option(
        layer: impl Into<String>,
        option: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::InvalidOption {
            layer: layer.into(),
            option: option.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for [`Error::ShapeMismatch`].
    pub fn shape_mismatch(
        layer: impl Into<String>,
        expected: impl ToString,
        got: impl ToString,
    ) -> Self {
        Error::ShapeMismatch {
            layer: layer.into(),
            expected: expected.to_string(),
            got: got.to_string(),
        }
    }

    /// Shorthand for [`Error::UnsupportedCombination`].
    pub fn unsupported(layer: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::UnsupportedCombination {
            layer: layer.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for [`Error::MissingShape`].
    pub fn missing_shape(layer: impl Into<String>, field: impl Into<String>) -> Self {
        Error::MissingShape {
            layer: layer.into(),
            field: field.into(),
        }
    }
}

/// Convenience Result type used throughout Wren.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
