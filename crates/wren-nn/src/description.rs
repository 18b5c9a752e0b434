// Graph description — What the user declares: layer name → options
//
// A network is described as an ORDERED mapping from layer name to a
// LayerDescription:
//
//   {
//     "fw":     {"class": "rec", "unit": "lstm", "n_out": 64, "dropout": 0.1},
//     "output": {"class": "softmax", "from": ["fw"], "loss": "ce"}
//   }
//
// The universal options every layer understands are typed fields of
// LayerDescription. Everything else is kept in `options` and handed to the
// layer class, which deserializes it into its own option struct and
// rejects what it does not understand.
//
// Source names: "data" is the default extern input, "data:KEY" the extern
// input KEY, "none" stands for "no source". Without `from`, a layer reads
// from "data".

use std::fmt;

use serde::de::{self, DeserializeOwned, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use wren_core::{DataOpts, Error, Result};

use crate::batchnorm::BatchNormOpts;

/// `from` accepts a single name or a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceNames {
    One(String),
    Many(Vec<String>),
}

/// `batch_norm` accepts a flag or an options object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BatchNormSetting {
    Flag(bool),
    Opts(BatchNormOpts),
}

impl Default for BatchNormSetting {
    fn default() -> Self {
        BatchNormSetting::Flag(false)
    }
}

impl BatchNormSetting {
    /// Options to apply, if batch norm is enabled.
    pub fn enabled(&self) -> Option<BatchNormOpts> {
        match self {
            BatchNormSetting::Flag(false) => None,
            BatchNormSetting::Flag(true) => Some(BatchNormOpts::default()),
            BatchNormSetting::Opts(opts) => Some(opts.clone()),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Options of one layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerDescription {
    pub class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<SourceNames>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub loss_opts: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_out: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_type: Option<DataOpts>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_output_layer: Option<bool>,
    #[serde(default = "default_true")]
    pub trainable: bool,
    #[serde(default, rename = "L2", skip_serializing_if = "Option::is_none")]
    pub l2: Option<f64>,
    #[serde(default)]
    pub dropout: f64,
    #[serde(default)]
    pub spatial_smoothing: f64,
    #[serde(default)]
    pub batch_norm: BatchNormSetting,
    /// Class-specific options.
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

impl LayerDescription {
    pub fn new(class: impl Into<String>) -> Self {
        LayerDescription {
            class: class.into(),
            from: None,
            target: None,
            loss: None,
            loss_opts: Map::new(),
            n_out: None,
            out_type: None,
            is_output_layer: None,
            trainable: true,
            l2: None,
            dropout: 0.0,
            spatial_smoothing: 0.0,
            batch_norm: BatchNormSetting::default(),
            options: Map::new(),
        }
    }

    /// The implicit layer exposing extern data `key`.
    pub fn source(key: &str) -> Self {
        let mut desc = LayerDescription::new("source").with_from(Vec::<String>::new());
        desc.options
            .insert("data_key".to_string(), Value::String(key.to_string()));
        desc
    }

    pub fn with_from<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.from = Some(SourceNames::Many(names.into_iter().map(Into::into).collect()));
        self
    }

    pub fn with_n_out(mut self, n_out: usize) -> Self {
        self.n_out = Some(n_out);
        self
    }

    pub fn with_loss(mut self, loss: impl Into<String>) -> Self {
        self.loss = Some(loss.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// Source layer names, with "none" removed.
    pub fn source_names(&self) -> Vec<String> {
        let names = match &self.from {
            None if self.class == "source" => Vec::new(),
            None => vec!["data".to_string()],
            Some(SourceNames::One(name)) => vec![name.clone()],
            Some(SourceNames::Many(names)) => names.clone(),
        };
        names.into_iter().filter(|n| n != "none").collect()
    }

    /// Deserialize the class-specific options.
    pub fn class_options<T: DeserializeOwned>(&self, layer: &str) -> Result<T> {
        serde_json::from_value(Value::Object(self.options.clone()))
            .map_err(|e| Error::invalid_option(layer, &self.class, e.to_string()))
    }
}

/// Insertion-ordered mapping from layer name to options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkDescription {
    layers: Vec<(String, LayerDescription)>,
}

impl NetworkDescription {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a layer; names must be unique.
    pub fn push(&mut self, name: impl Into<String>, desc: LayerDescription) -> Result<()> {
        let name = name.into();
        if self.get(&name).is_some() {
            return Err(Error::DuplicateLayer { name });
        }
        self.layers.push((name, desc));
        Ok(())
    }

    /// Builder form of [`push`](Self::push).
    pub fn with_layer(mut self, name: impl Into<String>, desc: LayerDescription) -> Result<Self> {
        self.push(name, desc)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&LayerDescription> {
        self.layers.iter().find(|(n, _)| n == name).map(|(_, d)| d)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.layers.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &LayerDescription)> {
        self.layers.iter().map(|(n, d)| (n.as_str(), d))
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Parse a JSON object value.
    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

impl Serialize for NetworkDescription {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.layers.len()))?;
        for (name, desc) in &self.layers {
            map.serialize_entry(name, desc)?;
        }
        map.end()
    }
}

struct DescriptionVisitor;

impl<'de> Visitor<'de> for DescriptionVisitor {
    type Value = NetworkDescription;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a map from layer name to layer options")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Self::Value, A::Error> {
        let mut out = NetworkDescription::new();
        while let Some((name, desc)) = access.next_entry::<String, LayerDescription>()? {
            out.push(name, desc).map_err(de::Error::custom)?;
        }
        Ok(out)
    }
}

impl<'de> Deserialize<'de> for NetworkDescription {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_map(DescriptionVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_universal_and_class_options() {
        let desc: LayerDescription = serde_json::from_value(json!({
            "class": "linear", "activation": "tanh", "from": "fw", "n_out": 3, "L2": 0.01
        }))
        .unwrap();
        assert_eq!(desc.source_names(), vec!["fw"]);
        assert_eq!(desc.n_out, Some(3));
        assert_eq!(desc.l2, Some(0.01));
        assert!(desc.trainable);
        assert_eq!(desc.options.get("activation"), Some(&json!("tanh")));
        assert!(desc.batch_norm.enabled().is_none());
    }

    #[test]
    fn test_default_and_none_sources() {
        let desc = LayerDescription::new("copy");
        assert_eq!(desc.source_names(), vec!["data"]);
        let desc = LayerDescription::new("copy").with_from(["none"]);
        assert!(desc.source_names().is_empty());
    }

    #[test]
    fn test_order_is_preserved() {
        let text = r#"{"z": {"class": "copy"}, "a": {"class": "copy", "from": ["z"]}, "m": {"class": "copy"}}"#;
        let net: NetworkDescription = serde_json::from_str(text).unwrap();
        assert_eq!(net.names().collect::<Vec<_>>(), vec!["z", "a", "m"]);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut net = NetworkDescription::new();
        net.push("a", LayerDescription::new("copy")).unwrap();
        assert!(matches!(
            net.push("a", LayerDescription::new("copy")),
            Err(Error::DuplicateLayer { .. })
        ));
    }

    #[test]
    fn test_unknown_class_option() {
        #[derive(Debug, Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Opts {
            #[allow(dead_code)]
            activation: Option<String>,
        }
        let desc = LayerDescription::new("linear").with_option("activaton", json!("tanh"));
        let err = desc.class_options::<Opts>("out").unwrap_err();
        assert!(matches!(err, Error::InvalidOption { .. }));
        assert!(err.to_string().contains("activaton"));
    }
}
