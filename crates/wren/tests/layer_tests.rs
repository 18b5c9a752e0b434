// Integration tests for the layer classes
//
// Source concatenation; shape inference and the per-example lengths of
// slicing, reduction, convolution and pooling; combination, batch norm,
// nested subnetworks; the sequence losses and the statistics sink.

use serde_json::json;
use wren::prelude::*;

fn extern_data() -> ExternData {
    ExternData::new()
        .with_data("data", TensorDescriptor::dense("data", vec![Dim::Dynamic, Dim::Static(5)]))
        .with_data("classes", TensorDescriptor::sparse("classes", vec![Dim::Dynamic], 3))
        .with_data(
            "spec",
            TensorDescriptor::dense("spec", vec![Dim::Dynamic, Dim::Dynamic, Dim::Static(40)]),
        )
}

fn build_with(config: BuildConfig, description: serde_json::Value) -> wren::Result<Network> {
    GraphBuilder::new(config).build(NetworkDescription::from_value(description)?, extern_data())
}

fn build(description: serde_json::Value) -> wren::Result<Network> {
    build_with(BuildConfig::default(), description)
}

fn output_of(net: &Network, layer: &str) -> TensorDescriptor {
    net.layer(layer)
        .unwrap_or_else(|| panic!("layer '{layer}' was not built"))
        .base()
        .output
        .clone()
}

fn param_shape(net: &Network, name: &str) -> Option<Vec<usize>> {
    net.graph()
        .params()
        .into_iter()
        .find(|(n, _, _)| n == name)
        .map(|(_, shape, _)| shape)
}

fn folded_lengths(net: &Network, data: &TensorDescriptor, feeds: &LengthFeeds) -> wren::Result<Vec<i64>> {
    let lengths = data.sequence_lengths().expect("sequence lengths");
    net.graph().fold_lengths(lengths, feeds)
}

// Source concatenation

fn build_mixed(config: BuildConfig, description: serde_json::Value) -> wren::Result<Network> {
    let mut untimed = TensorDescriptor::dense("untimed", vec![Dim::Dynamic, Dim::Static(5)]);
    untimed.time_axis = None;
    let extern_data = extern_data()
        .with_data(
            "ints",
            TensorDescriptor::new("ints", vec![Dim::Dynamic, Dim::Static(5)], Some(5), false, DType::I32),
        )
        .with_data("untimed", untimed);
    GraphBuilder::new(config).build(NetworkDescription::from_value(description)?, extern_data)
}

fn concats(net: &Network) -> usize {
    net.graph().count_ops(|op| matches!(op, Op::Concat { .. }))
}

#[test]
fn test_concat_sums_feature_dims() -> wren::Result<()> {
    let net = build(json!({
        "a": {"class": "linear", "n_out": 3},
        "b": {"class": "linear", "n_out": 4},
        "c": {"class": "copy", "from": ["a", "b"]},
        "d": {"class": "linear", "from": ["a", "b"], "n_out": 2}
    }))?;
    let out = output_of(&net, "c");
    assert_eq!(out.dim, Some(7));
    assert_eq!(out.shape, vec![Dim::Dynamic, Dim::Static(7)]);
    assert!(out.sequence_lengths().is_some());
    assert_eq!(param_shape(&net, "d/W"), Some(vec![7, 2]));
    // "d" reuses the concatenation built for "c"
    assert_eq!(concats(&net), 1);
    Ok(())
}

#[test]
fn test_concat_dropout_shared_per_sources() -> wren::Result<()> {
    let net = build_with(
        BuildConfig::default().with_training(true),
        json!({
            "a": {"class": "linear", "n_out": 3},
            "b": {"class": "linear", "n_out": 4},
            "c": {"class": "copy", "from": ["a", "b"], "dropout": 0.2},
            "d": {"class": "linear", "from": ["a", "b"], "n_out": 2, "dropout": 0.2}
        }),
    )?;
    assert_eq!(concats(&net), 1);
    assert_eq!(net.graph().count_ops(|op| matches!(op, Op::Dropout { .. })), 1);
    assert_eq!(output_of(&net, "c").dim, Some(7));
    Ok(())
}

#[test]
fn test_single_source_passes_through() -> wren::Result<()> {
    let net = build(json!({"c": {"class": "copy", "from": ["data"]}}))?;
    let out = output_of(&net, "c");
    let data = output_of(&net, "data");
    assert!(out.placeholder.is_some());
    assert_eq!(out.placeholder, data.placeholder);
    assert_eq!(out.shape, data.shape);
    assert_eq!(concats(&net), 0);
    Ok(())
}

#[test]
fn test_concat_mismatches_are_fatal() {
    for other in ["spec", "ints", "untimed"] {
        let err = build_mixed(
            BuildConfig::default(),
            json!({"x": {"class": "copy", "from": ["data", format!("data:{other}")]}}),
        )
        .unwrap_err();
        assert!(
            matches!(&err, Error::ShapeMismatch { layer, .. } if layer == "x"),
            "data + {other}: {err:?}"
        );
    }
}

// Slice

#[test]
fn test_slice_time_folds_lengths() -> wren::Result<()> {
    let net = build(json!({
        "s": {"class": "slice", "axis_kind": "T", "slice_start": 1, "slice_step": 2}
    }))?;
    let out = output_of(&net, "s");
    assert_eq!(out.shape, vec![Dim::Dynamic, Dim::Static(5)]);
    let feeds = LengthFeeds::new().with_lengths("data:size0", vec![5, 1, 8]);
    // ceil(max(len - 1, 0) / 2)
    assert_eq!(folded_lengths(&net, &out, &feeds)?, vec![2, 0, 4]);
    Ok(())
}

#[test]
fn test_slice_start_past_length() -> wren::Result<()> {
    let net = build(json!({"s": {"class": "slice", "axis": 1, "slice_start": 7}}))?;
    let feeds = LengthFeeds::new().with_lengths("data:size0", vec![5, 9, 12]);
    assert_eq!(folded_lengths(&net, &output_of(&net, "s"), &feeds)?, vec![0, 2, 5]);
    Ok(())
}

#[test]
fn test_slice_feature_axis() -> wren::Result<()> {
    let net = build(json!({
        "f": {"class": "slice", "axis_kind": "F", "slice_end": 3},
        "proj": {"class": "linear", "from": ["f"], "n_out": 2}
    }))?;
    let out = output_of(&net, "f");
    assert_eq!(out.shape, vec![Dim::Dynamic, Dim::Static(3)]);
    assert_eq!(out.dim, Some(3));
    assert_eq!(param_shape(&net, "proj/W"), Some(vec![3, 2]));
    Ok(())
}

#[test]
fn test_slice_bad_options() {
    let err = build(json!({"s": {"class": "slice", "axis": 1, "slice_start": -1}})).unwrap_err();
    assert!(matches!(err, Error::InvalidOption { option, .. } if option == "slice_start"));
    let err = build(json!({"s": {"class": "slice", "slice_end": 2}})).unwrap_err();
    assert!(matches!(err, Error::InvalidOption { option, .. } if option == "axis"));
}

// Reduce

#[test]
fn test_reduce_time_renumbers_lengths() -> wren::Result<()> {
    let net = build(json!({
        "r": {"class": "reduce", "from": ["data:spec"], "mode": "max", "axis": "T"}
    }))?;
    let out = output_of(&net, "r");
    assert_eq!(out.shape, vec![Dim::Dynamic, Dim::Static(40)]);
    assert_eq!(out.time_axis, None);
    let lengths = out.dynamic_lengths.get(&0).expect("lengths of the remaining axis");
    let feeds = LengthFeeds::new()
        .with_lengths("spec:size0", vec![9, 4])
        .with_lengths("spec:size1", vec![3, 7]);
    assert_eq!(net.graph().fold_lengths(lengths, &feeds)?, vec![3, 7]);
    Ok(())
}

#[test]
fn test_reduce_keep_dims() -> wren::Result<()> {
    let net = build(json!({
        "r": {"class": "reduce", "from": ["data:spec"], "mode": "avg", "axis": "spatial", "keep_dims": true}
    }))?;
    let out = output_of(&net, "r");
    assert_eq!(out.shape, vec![Dim::Dynamic, Dim::Dynamic, Dim::Static(40)]);
    let feeds = LengthFeeds::new()
        .with_lengths("spec:size0", vec![9, 4])
        .with_lengths("spec:size1", vec![3, 7]);
    for axis in [0, 1] {
        assert_eq!(net.graph().fold_lengths(&out.dynamic_lengths[&axis], &feeds)?, vec![1, 1]);
    }
    Ok(())
}

#[test]
fn test_reduce_feature_then_linear() -> wren::Result<()> {
    let net = build(json!({
        "r": {"class": "reduce", "mode": "sum", "axis": "F", "keep_dims": true},
        "out": {"class": "linear", "from": ["r"], "n_out": 2}
    }))?;
    assert_eq!(output_of(&net, "r").dim, Some(1));
    assert_eq!(param_shape(&net, "out/W"), Some(vec![1, 2]));
    Ok(())
}

#[test]
fn test_reduce_rejects_bad_options() {
    let err = build(json!({"r": {"class": "reduce", "mode": "median", "axis": "T"}})).unwrap_err();
    assert!(matches!(err, Error::InvalidOption { option, .. } if option == "mode"));
    let err = build(json!({"r": {"class": "reduce", "mode": "sum", "axis": "T", "n_out": 5}})).unwrap_err();
    assert!(matches!(err, Error::InvalidOption { option, .. } if option == "n_out"));
    let err = build(json!({
        "r": {"class": "reduce", "mode": "sum", "axis": "T", "enforce_batch_dim_axis": 1}
    }))
    .unwrap_err();
    assert!(matches!(err, Error::InvalidOption { option, .. } if option == "enforce_batch_dim_axis"));
}

// Convolution and pooling

#[test]
fn test_conv_valid_padding() -> wren::Result<()> {
    let net = build(json!({
        "conv": {
            "class": "conv", "filter_size": [3, 3], "padding": "valid",
            "input_add_feature_dim": true, "n_out": 8, "activation": "relu"
        }
    }))?;
    assert_eq!(param_shape(&net, "conv/W"), Some(vec![3, 3, 1, 8]));
    assert_eq!(param_shape(&net, "conv/bias"), None);
    let out = output_of(&net, "conv");
    assert_eq!(out.shape, vec![Dim::Dynamic, Dim::Static(3), Dim::Static(8)]);
    let feeds = LengthFeeds::new().with_lengths("data:size0", vec![10, 1]);
    assert_eq!(folded_lengths(&net, &out, &feeds)?, vec![8, 0]);
    Ok(())
}

#[test]
fn test_conv_window_must_match_spatial_axes() {
    let err = build(json!({"conv": {"class": "conv", "filter_size": [3, 3], "n_out": 4}})).unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { layer, .. } if layer == "conv"));
}

#[test]
fn test_pool_strides_default_to_window() -> wren::Result<()> {
    let net = build(json!({"pool": {"class": "pool", "mode": "max", "pool_size": [2]}}))?;
    assert!(net.graph().params().is_empty());
    let out = output_of(&net, "pool");
    assert_eq!(out.shape, vec![Dim::Dynamic, Dim::Static(5)]);
    let feeds = LengthFeeds::new().with_lengths("data:size0", vec![5, 1]);
    assert_eq!(folded_lengths(&net, &out, &feeds)?, vec![2, 0]);
    Ok(())
}

// Combine and batch norm

#[test]
fn test_combine_aligns_batch_axes() -> wren::Result<()> {
    let net = build(json!({
        "a": {"class": "linear", "n_out": 4},
        "b": {"class": "rec", "unit": "gru", "n_out": 4},
        "sum": {"class": "combine", "kind": "add", "from": ["a", "b"], "with_bias": true}
    }))?;
    assert_eq!(param_shape(&net, "sum/b"), Some(vec![4]));
    let sum = output_of(&net, "sum");
    assert!(sum.is_batch_major());
    let added = sum.placeholder()?.inputs()[0].clone();
    assert_eq!(added.op(), Op::AddN);
    assert!(matches!(added.inputs()[1].op(), Op::Transpose { .. }));
    Ok(())
}

#[test]
fn test_combine_width_mismatch() {
    let err = build(json!({
        "a": {"class": "linear", "n_out": 4},
        "b": {"class": "linear", "n_out": 3},
        "sum": {"class": "combine", "kind": "average", "from": ["a", "b"]}
    }))
    .unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { layer, .. } if layer == "sum"));
}

#[test]
fn test_batch_norm_params() -> wren::Result<()> {
    let net = build_with(
        BuildConfig::default().with_training(false),
        json!({"bn": {"class": "linear", "n_out": 4, "batch_norm": true}}),
    )?;
    let layer = net.layer("bn").expect("bn");
    // W, b, mean, variance, gamma, beta
    assert_eq!(layer.base().params.len(), 6);
    let stats: Vec<(String, Vec<usize>, bool)> = net
        .graph()
        .params()
        .into_iter()
        .filter(|(name, _, _)| name.ends_with("_mean") || name.ends_with("_variance"))
        .collect();
    assert_eq!(stats.len(), 2);
    assert!(stats.iter().all(|(_, shape, trainable)| shape == &vec![4] && !trainable));
    assert_eq!(net.graph().count_ops(|op| matches!(op, Op::AssignAdd)), 2);
    Ok(())
}

// Subnetwork

#[test]
fn test_subnetwork_param_names() -> wren::Result<()> {
    let net = build(json!({
        "sub": {
            "class": "subnetwork",
            "subnetwork": {
                "hidden": {"class": "linear", "activation": "tanh", "n_out": 4},
                "output": {"class": "linear", "from": ["hidden"], "n_out": 2}
            }
        }
    }))?;
    assert_eq!(param_shape(&net, "sub/hidden/W"), Some(vec![5, 4]));
    assert_eq!(param_shape(&net, "sub/output/W"), Some(vec![4, 2]));
    let params = net.params();
    assert!(params.contains_key("sub/hidden/b"));
    assert!(params.contains_key("sub/output/W"));
    assert_eq!(output_of(&net, "sub").dim, Some(2));
    Ok(())
}

#[test]
fn test_subnetwork_loss_reaches_parent() -> wren::Result<()> {
    let net = build(json!({
        "sub": {
            "class": "subnetwork",
            "from": ["data", "data:classes"],
            "concat_sources": false,
            "subnetwork": {
                "output": {"class": "softmax", "loss": "ce", "target": "data:classes"}
            }
        }
    }))?;
    assert_eq!(param_shape(&net, "sub/output/W"), Some(vec![5, 3]));
    let objective = net.construct_objective()?;
    assert!(objective.losses.contains_key("sub"));
    assert!(objective.errors.contains_key("sub"));
    Ok(())
}

#[test]
fn test_subnetwork_needs_output() {
    let err = build(json!({
        "sub": {"class": "subnetwork", "subnetwork": {"hidden": {"class": "linear", "n_out": 4}}}
    }))
    .unwrap_err();
    assert!(matches!(err, Error::InvalidOption { option, .. } if option == "subnetwork"));
}

// Losses

#[test]
fn test_ctc_adds_blank_label() -> wren::Result<()> {
    let net = build(json!({"output": {"class": "softmax", "loss": "ctc"}}))?;
    assert_eq!(param_shape(&net, "output/W"), Some(vec![5, 4]));
    assert!(net.layer("output").expect("output").base().recurrent);
    net.construct_objective()?;
    let g = net.graph();
    assert_eq!(g.count_ops(|op| matches!(op, Op::SparseLabels { .. })), 1);
    assert_eq!(g.count_ops(|op| matches!(op, Op::CtcLoss { time_major: false })), 1);
    assert_eq!(g.count_ops(|op| matches!(op, Op::CtcGreedyDecode)), 1);
    Ok(())
}

#[test]
fn test_ctc_needs_sparse_target() {
    let err = build(json!({"output": {"class": "softmax", "loss": "ctc", "target": "data"}})).unwrap_err();
    assert!(matches!(err, Error::UnsupportedCombination { layer, .. } if layer == "output"));
}

#[test]
fn test_generic_ce_needs_custom_gradient() -> wren::Result<()> {
    let net = build(json!({"output": {"class": "linear", "activation": "sigmoid", "loss": "generic_ce"}}))?;
    assert!(!net.graph().requires_custom_gradients());
    assert!(net.total_loss()?.is_some());
    assert!(net.graph().requires_custom_gradients());
    Ok(())
}

// Statistics

#[test]
fn test_framewise_statistics() -> wren::Result<()> {
    let net = build(json!({
        "output": {"class": "softmax", "loss": "ce"},
        "stats": {"class": "framewise_statistics", "from": ["output"], "sil_label_idx": 0}
    }))?;
    let stats = net.stats();
    for key in [
        "stats/batch_seq_length",
        "stats/accumulated_seq_length_no_sil",
        "stats/batch_loss_ce",
        "stats/batch_loss_perplexity_sil",
        "stats/accumulated_frame_error_no_sil",
        "stats/accumulated_true_label_prob_histogram",
    ] {
        assert!(stats.contains_key(key), "missing {key}");
    }
    let counter = net
        .graph()
        .params()
        .into_iter()
        .find(|(name, _, _)| name == "stats/accumulated_seq_len")
        .expect("frame counter");
    assert!(!counter.2);
    assert!(output_of(&net, "stats").placeholder.is_some());
    Ok(())
}

#[test]
fn test_framewise_statistics_needs_softmax() {
    let err = build(json!({
        "stats": {"class": "framewise_statistics", "sil_label_idx": 0}
    }))
    .unwrap_err();
    assert!(matches!(err, Error::UnsupportedCombination { layer, .. } if layer == "stats"));
}
