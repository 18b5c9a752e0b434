// Build configuration
//
// Everything a graph build needs besides the description and the extern
// data declarations. Deserializable so it can sit next to the description
// in one JSON document:
//
//   {"seed": 7, "train_flag": "dynamic", "default_target": "orth"}

use serde::{Deserialize, Serialize};

use wren_nn::{NetworkConfig, TrainFlagConfig};

/// Options of a graph build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    /// Seeds every parameter initializer and dropout mask (default: 42).
    pub seed: u64,
    /// `true`, `false` or `"dynamic"` (a boolean placeholder, the default).
    pub train_flag: TrainFlagConfig,
    /// Extern data read by the source name "data" (default: "data").
    pub default_input: String,
    /// Extern data used as target when a loss names none (default: "classes").
    pub default_target: String,
    /// Upper bound for manually unrolled recurrent loops.
    pub max_seq_len: Option<usize>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            train_flag: TrainFlagConfig::Dynamic,
            default_input: "data".to_string(),
            default_target: "classes".to_string(),
            max_seq_len: None,
        }
    }
}

impl BuildConfig {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Fix the train flag while building.
    pub fn with_training(mut self, training: bool) -> Self {
        self.train_flag = TrainFlagConfig::Static(training);
        self
    }

    /// Decide the train flag per run.
    pub fn with_dynamic_training(mut self) -> Self {
        self.train_flag = TrainFlagConfig::Dynamic;
        self
    }

    pub fn with_default_input(mut self, key: impl Into<String>) -> Self {
        self.default_input = key.into();
        self
    }

    pub fn with_default_target(mut self, key: impl Into<String>) -> Self {
        self.default_target = key.into();
        self
    }

    pub fn with_max_seq_len(mut self, max_seq_len: usize) -> Self {
        self.max_seq_len = Some(max_seq_len);
        self
    }

    /// The part the network container itself consumes.
    pub fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            seed: self.seed,
            train_flag: self.train_flag,
            max_seq_len: self.max_seq_len,
        }
    }
}
