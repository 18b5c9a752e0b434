// Source concatenation and input dropout
//
// Most layers consume "the concatenation of their sources along the feature
// axis". With a single source that is the source's output itself; with
// several, all of them must agree on everything except the feature width:
//
//   a: (batch, time, 3)   b: (time, batch, 5)
//   → b is swapped to a's batch axis, then (batch, time, 8)
//
// Lengths are taken from the first source.
//
// DROPOUT:
//   A layer's `dropout` option applies inverted dropout to this
//   concatenation. The noise is shared over the batch and the dynamic axes
//   (noise shape = the static extents with 1 elsewhere). Without training
//   the input is returned untouched; with a runtime train flag both
//   branches are recorded under a cond.
//
//   Results are cached per network on (source names, rate), so layers
//   reading the same sources with the same rate share one dropout mask.
//   Plain multi-source concatenations are cached under rate 0.

use tracing::trace;

use wren_core::{Dim, Error, Overrides, Result, Tensor, TensorDescriptor};

use crate::init;
use crate::layer::LayerRef;
use crate::network::{Network, TrainFlag};

/// Cache key: source names and the dropout rate bits.
pub(crate) type ConcatKey = (Vec<String>, u64);

/// Shape of the concatenation of `sources`, without a placeholder.
pub fn concat_template(layer: &str, sources: &[LayerRef]) -> Result<TensorDescriptor> {
    let (first, rest) = match sources {
        [] => return Err(Error::invalid_option(layer, "from", "needs at least one source")),
        [only] => return Ok(only.base().output.template(only.base().output.name.clone())),
        [first, rest @ ..] => (&first.base().output, rest),
    };
    let mut total = feature_width(layer, first)?;
    for src in rest {
        let data = &src.base().output;
        if data.dtype != first.dtype {
            return Err(Error::shape_mismatch(
                layer,
                format!("dtype {} like {}", first.dtype, first.name),
                format!("dtype {} of {}", data.dtype, data.name),
            ));
        }
        if non_feature(data) != non_feature(first)
            || data.time_axis_excluding_batch() != first.time_axis_excluding_batch()
        {
            return Err(Error::shape_mismatch(layer, first.description(), data.description()));
        }
        total += feature_width(layer, data)?;
    }
    let mut shape = first.shape.clone();
    if let Some(last) = shape.last_mut() {
        *last = Dim::Static(total);
    }
    let names: Vec<&str> = sources.iter().map(|s| s.base().name.as_str()).collect();
    let mut out = first.derive(
        Overrides::default()
            .name(format!("concat_{}", names.join("_")))
            .shape(shape)
            .dim(Some(total)),
    );
    out.dynamic_lengths = first.dynamic_lengths.clone();
    Ok(out)
}

fn feature_width(layer: &str, data: &TensorDescriptor) -> Result<usize> {
    if data.sparse {
        return Err(Error::unsupported(
            layer,
            format!("cannot concatenate sparse source {}", data.name),
        ));
    }
    match data.shape.last() {
        Some(Dim::Static(n)) => Ok(*n),
        _ => Err(Error::shape_mismatch(
            layer,
            "static feature axis",
            data.description(),
        )),
    }
}

fn non_feature(data: &TensorDescriptor) -> &[Dim] {
    &data.shape[..data.shape.len().saturating_sub(1)]
}

/// The concatenation of `sources`, placeholder attached.
pub fn concat_sources(net: &mut Network, layer: &str, sources: &[LayerRef]) -> Result<TensorDescriptor> {
    if let [only] = sources {
        return Ok(only.base().output.clone());
    }
    let key = cache_key(sources, 0.0);
    if let Some(cached) = net.concat_cache.get(&key) {
        trace!(layer, sources = ?key.0, "reusing concatenation of sources");
        return Ok(cached.clone());
    }
    let mut out = concat_template(layer, sources)?;
    let batch_axis = out.batch_axis;
    let rank = out.batch_ndim();
    let mut parts = Vec::with_capacity(sources.len());
    for src in sources {
        let data = &src.base().output;
        let x = data.placeholder()?;
        parts.push(match (data.batch_axis, batch_axis) {
            (Some(b), Some(common)) if b != common => x.swap_axes(rank, b, common),
            _ => x.clone(),
        });
    }
    out.placeholder = Tensor::cat(&parts, rank - 1);
    net.concat_cache.insert(key, out.clone());
    Ok(out)
}

fn cache_key(sources: &[LayerRef], rate: f64) -> ConcatKey {
    (
        sources.iter().map(|s| s.base().name.clone()).collect(),
        rate.to_bits(),
    )
}

/// [`concat_sources`] followed by dropout with `rate` while training.
pub fn concat_sources_with_dropout(
    net: &mut Network,
    layer: &str,
    sources: &[LayerRef],
    rate: f64,
) -> Result<TensorDescriptor> {
    if rate == 0.0 {
        return concat_sources(net, layer, sources);
    }
    if !(rate > 0.0 && rate < 1.0) {
        return Err(Error::invalid_option(
            layer,
            "dropout",
            format!("rate must be in (0, 1), got {rate}"),
        ));
    }
    if matches!(net.train_flag(), TrainFlag::Static(false)) {
        return concat_sources(net, layer, sources);
    }
    let key = cache_key(sources, rate);
    if let Some(cached) = net.concat_cache.get(&key) {
        trace!(layer, sources = ?key.0, rate, "reusing dropout of sources");
        return Ok(cached.clone());
    }
    let mut data = concat_sources(net, layer, sources)?;
    let x = data.placeholder()?.clone();
    let noise_shape = data.non_dynamic_batch_shape();
    let seed = init::seed(net.rng());
    let keep_prob = 1.0 - rate;
    let y = net.cond_on_train(|| x.dropout(keep_prob, noise_shape, seed), || x.clone());
    data.placeholder = Some(y);
    net.concat_cache.insert(key, data.clone());
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_width_needs_static_dense_axis() {
        let data = TensorDescriptor::dense("a", vec![Dim::Dynamic, Dim::Static(3)]);
        assert_eq!(feature_width("x", &data).unwrap(), 3);
        assert_eq!(non_feature(&data), &[Dim::Dynamic]);

        let sparse = TensorDescriptor::sparse("i", vec![Dim::Dynamic], 4);
        assert!(matches!(
            feature_width("x", &sparse),
            Err(Error::UnsupportedCombination { layer, .. }) if layer == "x"
        ));
        let open = TensorDescriptor::dense("o", vec![Dim::Dynamic, Dim::Dynamic]);
        assert!(matches!(feature_width("x", &open), Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn test_no_sources() {
        assert!(matches!(
            concat_template("x", &[]),
            Err(Error::InvalidOption { option, .. }) if option == "from"
        ));
    }
}
