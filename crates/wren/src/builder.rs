// Builder — From a description to a constructed network
//
// Holds the build configuration and the collaborators (external resolver,
// activation registry) and turns a description plus extern data into a
// fully constructed Network. A whole build can also be given as one JSON
// document:
//
//   {
//     "config":      {"seed": 1, "train_flag": false},
//     "extern_data": {"data": {"shape": [null, 5]},
//                     "classes": {"shape": [null], "dim": 3, "sparse": true}},
//     "network":     {"output": {"class": "softmax", "loss": "ce"}}
//   }

use std::collections::BTreeMap;
use std::rc::Rc;

use serde::Deserialize;
use tracing::info;

use wren_core::{DataOpts, Result};
use wren_nn::{ActivationRegistry, ExternData, ExternalResolver, Network, NetworkDescription, NoResolver};

use crate::config::BuildConfig;

/// A complete build in serialized form.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GraphDocument {
    #[serde(default)]
    pub config: BuildConfig,
    pub extern_data: BTreeMap<String, DataOpts>,
    pub network: NetworkDescription,
}

impl GraphDocument {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Parse a graph description (a JSON object of layer name to options).
pub fn load_description(text: &str) -> Result<NetworkDescription> {
    Ok(serde_json::from_str(text)?)
}

/// Builds networks with one configuration.
pub struct GraphBuilder {
    config: BuildConfig,
    resolver: Rc<dyn ExternalResolver>,
    activations: ActivationRegistry,
}

impl GraphBuilder {
    pub fn new(config: BuildConfig) -> Self {
        Self {
            config,
            resolver: Rc::new(NoResolver),
            activations: ActivationRegistry::builtin(),
        }
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn with_resolver(mut self, resolver: Rc<dyn ExternalResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_activations(mut self, activations: ActivationRegistry) -> Self {
        self.activations = activations;
        self
    }

    /// A network ready to resolve layers on demand; nothing is built yet.
    pub fn network(&self, description: NetworkDescription, mut extern_data: ExternData) -> Network {
        extern_data.default_input = self.config.default_input.clone();
        extern_data.default_target = self.config.default_target.clone();
        Network::new(description, extern_data, &self.config.network_config())
            .with_resolver(self.resolver.clone())
            .with_activations(self.activations.clone())
    }

    /// Build every layer of `description`.
    pub fn build(&self, description: NetworkDescription, extern_data: ExternData) -> Result<Network> {
        let mut net = self.network(description, extern_data);
        net.construct()?;
        Ok(net)
    }

    /// Build a [`GraphDocument`]; its own config replaces this builder's.
    pub fn build_document(self, document: GraphDocument) -> Result<Network> {
        let extern_data = ExternData::from_opts(&document.extern_data)?;
        let builder = GraphBuilder {
            config: document.config,
            ..self
        };
        let net = builder.build(document.network, extern_data)?;
        info!(seed = builder.config.seed, "graph document built");
        Ok(net)
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new(BuildConfig::default())
    }
}

/// Build a network from a JSON [`GraphDocument`].
pub fn build_from_json(text: &str) -> Result<Network> {
    GraphBuilder::default().build_document(GraphDocument::from_json(text)?)
}
