// Integration tests for network construction
//
// These tests build whole networks from JSON descriptions and check the
// recorded op graph: parameters and their shapes, the objective, source
// resolution and the fatal errors of a bad description.

use serde_json::json;
use wren::prelude::*;
use wren::BinaryOp;

fn extern_data() -> ExternData {
    ExternData::new()
        .with_data("data", TensorDescriptor::dense("data", vec![Dim::Dynamic, Dim::Static(5)]))
        .with_data("classes", TensorDescriptor::sparse("classes", vec![Dim::Dynamic], 3))
}

fn build_with(config: BuildConfig, description: serde_json::Value) -> wren::Result<Network> {
    GraphBuilder::new(config).build(NetworkDescription::from_value(description)?, extern_data())
}

fn build(description: serde_json::Value) -> wren::Result<Network> {
    build_with(BuildConfig::default(), description)
}

fn param_shape(net: &Network, name: &str) -> Option<Vec<usize>> {
    net.graph()
        .params()
        .into_iter()
        .find(|(n, _, _)| n == name)
        .map(|(_, shape, _)| shape)
}

// Parameters and shapes

#[test]
fn test_softmax_output_from_target() -> wren::Result<()> {
    let net = build(json!({"output": {"class": "softmax", "loss": "ce"}}))?;
    assert_eq!(param_shape(&net, "output/W"), Some(vec![5, 3]));
    assert_eq!(param_shape(&net, "output/b"), Some(vec![3]));

    let output = net.layer("output").expect("output layer");
    let out = &output.base().output;
    assert_eq!(out.shape, vec![Dim::Dynamic, Dim::Static(3)]);
    assert_eq!(out.dim, Some(3));
    assert!(out.sequence_lengths().is_some());
    assert!(output.base().is_output_layer());
    assert!(net.extern_data().is_used("data"));
    assert!(net.extern_data().is_used("classes"));

    assert!(net.total_loss()?.is_some());
    let fused = net.graph().count_ops(|op| matches!(op, Op::SoftmaxCrossEntropy { sparse: true }));
    assert_eq!(fused, 1);
    Ok(())
}

#[test]
fn test_layers_built_after_their_sources() -> wren::Result<()> {
    let net = build(json!({
        "output": {"class": "softmax", "from": ["hidden"], "loss": "ce"},
        "hidden": {"class": "linear", "activation": "relu", "n_out": 7}
    }))?;
    // "output" is described first but needs "hidden" (and "data") before it.
    assert_eq!(net.layer_names(), vec!["data", "hidden", "output"]);
    assert_eq!(param_shape(&net, "hidden/W"), Some(vec![5, 7]));
    assert_eq!(param_shape(&net, "output/W"), Some(vec![7, 3]));
    assert_eq!(net.params().len(), 4);
    Ok(())
}

#[test]
fn test_extern_key_as_source() -> wren::Result<()> {
    let data = ExternData::new()
        .with_data("feats", TensorDescriptor::dense("feats", vec![Dim::Dynamic, Dim::Static(4)]))
        .with_data("orth", TensorDescriptor::sparse("orth", vec![Dim::Dynamic], 9));
    let description = NetworkDescription::from_value(json!({
        "output": {"class": "linear", "from": ["data:feats"], "n_out": 2}
    }))?;
    let net = GraphBuilder::default().build(description, data)?;
    assert!(net.layer("data:feats").is_some());
    assert_eq!(param_shape(&net, "output/W"), Some(vec![4, 2]));
    assert_eq!(net.extern_data().unused_keys(), vec!["orth".to_string()]);
    Ok(())
}

#[test]
fn test_same_seed_same_graph() -> wren::Result<()> {
    let description = json!({"output": {"class": "softmax", "loss": "ce", "dropout": 0.2}});
    let a = build_with(BuildConfig::default().with_seed(3), description.clone())?;
    let b = build_with(BuildConfig::default().with_seed(3), description)?;
    let ops_a: Vec<Op> = a.graph().nodes().iter().map(|n| n.op.clone()).collect();
    let ops_b: Vec<Op> = b.graph().nodes().iter().map(|n| n.op.clone()).collect();
    assert_eq!(ops_a, ops_b);
    Ok(())
}

// Dropout and the train flag

#[test]
fn test_dropout_not_recorded_without_training() -> wren::Result<()> {
    let net = build_with(
        BuildConfig::default().with_training(false),
        json!({"output": {"class": "copy", "dropout": 0.3}}),
    )?;
    assert_eq!(net.graph().count_ops(|op| matches!(op, Op::Dropout { .. })), 0);
    assert_eq!(net.graph().count_ops(|op| matches!(op, Op::Cond)), 0);
    Ok(())
}

#[test]
fn test_dropout_while_training() -> wren::Result<()> {
    let net = build_with(
        BuildConfig::default().with_training(true),
        json!({"output": {"class": "copy", "dropout": 0.3}}),
    )?;
    let dropouts: Vec<Op> = net
        .graph()
        .nodes()
        .iter()
        .filter(|n| matches!(n.op, Op::Dropout { .. }))
        .map(|n| n.op.clone())
        .collect();
    assert_eq!(dropouts.len(), 1);
    match &dropouts[0] {
        Op::Dropout {
            keep_prob,
            noise_shape,
            ..
        } => {
            assert!((keep_prob - 0.7).abs() < 1e-12);
            assert_eq!(noise_shape, &vec![1, 1, 5]);
        }
        other => panic!("expected dropout, got {other:?}"),
    }
    assert_eq!(net.graph().count_ops(|op| matches!(op, Op::Cond)), 0);
    Ok(())
}

#[test]
fn test_dynamic_train_flag_records_cond() -> wren::Result<()> {
    let net = build(json!({"output": {"class": "copy", "dropout": 0.3}}))?;
    assert!(matches!(net.train_flag(), TrainFlag::Dynamic(_)));
    assert_eq!(net.graph().count_ops(|op| matches!(op, Op::Dropout { .. })), 1);
    assert_eq!(net.graph().count_ops(|op| matches!(op, Op::Cond)), 1);
    Ok(())
}

#[test]
fn test_dropout_mask_shared_by_rate() -> wren::Result<()> {
    let net = build_with(
        BuildConfig::default().with_training(true),
        json!({
            "a": {"class": "copy", "dropout": 0.3},
            "b": {"class": "copy", "dropout": 0.3},
            "c": {"class": "copy", "dropout": 0.5}
        }),
    )?;
    assert_eq!(net.graph().count_ops(|op| matches!(op, Op::Dropout { .. })), 2);
    let a = net.layer("a").expect("a").base().output.placeholder.clone();
    let b = net.layer("b").expect("b").base().output.placeholder.clone();
    assert_eq!(a.map(|t| t.id()), b.map(|t| t.id()));
    Ok(())
}

#[test]
fn test_bad_dropout_rate() {
    let err = build(json!({"output": {"class": "copy", "dropout": 1.0}})).unwrap_err();
    assert!(matches!(err, Error::InvalidOption { option, .. } if option == "dropout"));
}

// Objective

#[test]
fn test_objective_totals() -> wren::Result<()> {
    let net = build(json!({
        "hidden": {"class": "linear", "activation": "tanh", "n_out": 4, "L2": 0.01},
        "output": {"class": "softmax", "from": ["hidden"], "loss": "ce"}
    }))?;
    let objective = net.construct_objective()?;
    assert_eq!(objective.losses.keys().collect::<Vec<_>>(), vec!["output"]);
    assert_eq!(objective.errors.keys().collect::<Vec<_>>(), vec!["output"]);
    assert_eq!(objective.constraints.keys().collect::<Vec<_>>(), vec!["hidden"]);
    assert!(objective.total_loss.is_some());
    assert!(objective.total_constraints.is_some());

    let total = net.total_objective()?.expect("total objective");
    assert_eq!(total.op(), Op::Binary(BinaryOp::Add));
    Ok(())
}

#[test]
fn test_objective_without_regularization() -> wren::Result<()> {
    let net = build(json!({"output": {"class": "softmax", "loss": "ce"}}))?;
    assert!(net.total_constraints()?.is_none());
    let loss = net.total_loss()?.expect("loss");
    let total = net.total_objective()?.expect("objective");
    assert_eq!(loss.id(), total.id());
    Ok(())
}

#[test]
fn test_layer_without_loss_has_no_objective() -> wren::Result<()> {
    let net = build(json!({"output": {"class": "linear", "n_out": 2}}))?;
    assert!(net.total_loss()?.is_none());
    assert!(net.total_objective()?.is_none());
    Ok(())
}

// Fatal description errors

#[test]
fn test_cycle_is_fatal() {
    let err = build(json!({
        "a": {"class": "copy", "from": ["b"]},
        "b": {"class": "copy", "from": ["a"]}
    }))
    .unwrap_err();
    match err {
        Error::CyclicOrMissingSource { source_name, reason, .. } => {
            assert_eq!(source_name, "a");
            assert!(reason.contains("cycle"));
        }
        other => panic!("expected a cycle, got {other}"),
    }
}

#[test]
fn test_missing_source_is_fatal() {
    let err = build(json!({"output": {"class": "copy", "from": ["encoder"]}})).unwrap_err();
    assert!(matches!(
        err,
        Error::CyclicOrMissingSource { layer, source_name, .. } if layer == "output" && source_name == "encoder"
    ));
}

#[test]
fn test_unknown_class_and_loss() {
    let err = build(json!({"output": {"class": "lienar", "n_out": 2}})).unwrap_err();
    assert!(matches!(err, Error::UnknownLayerKind { name } if name == "lienar"));
    let err = build(json!({"output": {"class": "softmax", "loss": "mse"}})).unwrap_err();
    assert!(matches!(err, Error::UnknownLossKind { name } if name == "mse"));
}

#[test]
fn test_unknown_target_and_activation() {
    let err = build(json!({"output": {"class": "softmax", "loss": "ce", "target": "phones"}})).unwrap_err();
    assert!(matches!(err, Error::UnknownTarget { target, .. } if target == "phones"));
    let err = build(json!({"output": {"class": "linear", "n_out": 2, "activation": "swish2"}})).unwrap_err();
    assert!(matches!(err, Error::UnknownActivation { .. }));
}

#[test]
fn test_missing_output_shape() {
    let err = build(json!({"output": {"class": "linear"}})).unwrap_err();
    assert!(matches!(err, Error::MissingShape { layer, .. } if layer == "output"));
}

#[test]
fn test_unknown_option_rejected() {
    let err = build(json!({"output": {"class": "linear", "n_out": 2, "bias": false}})).unwrap_err();
    assert!(matches!(err, Error::InvalidOption { layer, .. } if layer == "output"));
}

#[test]
fn test_duplicate_layer_name() {
    let mut description = NetworkDescription::new();
    description.push("output", LayerDescription::new("copy")).unwrap();
    let err = description.push("output", LayerDescription::new("copy")).unwrap_err();
    assert!(matches!(err, Error::DuplicateLayer { name } if name == "output"));
}

// Whole documents

#[test]
fn test_build_from_json_document() -> wren::Result<()> {
    let net = build_from_json(
        r#"{
            "config": {"seed": 1, "train_flag": false},
            "extern_data": {
                "data": {"shape": [null, 5]},
                "classes": {"dim": 3, "sparse": true}
            },
            "network": {
                "hidden": {"class": "linear", "activation": "relu", "n_out": 8, "dropout": 0.1},
                "output": {"class": "softmax", "from": ["hidden"], "loss": "ce"}
            }
        }"#,
    )?;
    assert!(matches!(net.train_flag(), TrainFlag::Static(false)));
    assert_eq!(param_shape(&net, "hidden/W"), Some(vec![5, 8]));
    assert_eq!(param_shape(&net, "output/W"), Some(vec![8, 3]));
    assert_eq!(net.graph().count_ops(|op| matches!(op, Op::Dropout { .. })), 0);
    Ok(())
}

#[test]
fn test_document_with_other_default_target() -> wren::Result<()> {
    let doc = GraphDocument::from_json(
        r#"{
            "config": {"default_target": "orth"},
            "extern_data": {
                "data": {"shape": [null, 5]},
                "orth": {"dim": 30, "sparse": true}
            },
            "network": {"output": {"class": "softmax", "loss": "ce"}}
        }"#,
    )?;
    let net = GraphBuilder::default().build_document(doc)?;
    assert_eq!(param_shape(&net, "output/W"), Some(vec![5, 30]));
    assert_eq!(net.layer("output").expect("output").base().target.as_deref(), Some("orth"));
    Ok(())
}

#[test]
fn test_description_built_in_code() -> wren::Result<()> {
    let description = NetworkDescription::new()
        .with_layer(
            "hidden",
            LayerDescription::new("linear")
                .with_n_out(6)
                .with_option("activation", json!("tanh")),
        )?
        .with_layer(
            "output",
            LayerDescription::new("softmax")
                .with_from(["hidden"])
                .with_loss("ce")
                .with_target("classes"),
        )?;
    let extern_data = ExternData::new()
        .with_data("feats", TensorDescriptor::dense("feats", vec![Dim::Dynamic, Dim::Static(7)]))
        .with_data("classes", TensorDescriptor::sparse("classes", vec![Dim::Dynamic], 3));
    let config = BuildConfig::default().with_default_input("feats");
    let net = GraphBuilder::new(config).build(description, extern_data)?;

    assert_eq!(param_shape(&net, "hidden/W"), Some(vec![7, 6]));
    assert_eq!(param_shape(&net, "output/W"), Some(vec![6, 3]));
    assert!(net.extern_data().is_used("feats"));
    assert!(net.total_loss()?.is_some());
    Ok(())
}
