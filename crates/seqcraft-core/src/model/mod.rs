//! # Models
//!
//! The sentence language model used to answer completion questions and the
//! S2VT encoder/decoder used to caption videos.

pub mod language;
pub mod s2vt;

pub use language::SentenceLm;
pub use s2vt::S2vt;

use candle_core::Tensor;
use candle_nn::Init;

use crate::error::Result;

pub(crate) fn uniform(init_scale: f64) -> Init {
    Init::Uniform {
        lo: -init_scale,
        up: init_scale,
    }
}

/// Look up `[batch, steps]` ids in a `[vocab, dim]` table, giving `[batch, steps, dim]`.
pub(crate) fn embed(table: &Tensor, ids: &Tensor) -> Result<Tensor> {
    let (batch, steps) = ids.dims2()?;
    let flat = ids.flatten_all()?;
    let rows = table.index_select(&flat, 0)?;
    Ok(rows.reshape((batch, steps, table.dim(1)?))?)
}

/// Apply `x w + b` to every step output and stack into `[batch, steps, out]`.
pub(crate) fn project_steps(outputs: &[Tensor], w: &Tensor, b: &Tensor) -> Result<Tensor> {
    let stacked = Tensor::stack(outputs, 1)?;
    let (batch, steps, hidden) = stacked.dims3()?;
    let logits = stacked
        .reshape((batch * steps, hidden))?
        .matmul(w)?
        .broadcast_add(b)?;
    Ok(logits.reshape((batch, steps, w.dim(1)?))?)
}

/// Split `[batch, steps, dim]` into per-step `[batch, dim]` slices.
pub(crate) fn steps_of(xs: &Tensor) -> Result<Vec<Tensor>> {
    let steps = xs.dim(1)?;
    (0..steps)
        .map(|t| -> Result<Tensor> { Ok(xs.narrow(1, t, 1)?.squeeze(1)?) })
        .collect()
}

/// Dropout with keep probability `keep_prob`, only while training.
pub(crate) fn maybe_dropout(xs: &Tensor, keep_prob: f64, train: bool) -> Result<Tensor> {
    if train && keep_prob < 1.0 {
        Ok(candle_nn::ops::dropout(xs, (1.0 - keep_prob) as f32)?)
    } else {
        Ok(xs.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_maybe_dropout_only_while_training() {
        let xs = Tensor::ones((8, 32), candle_core::DType::F32, &Device::Cpu).unwrap();

        let eval = maybe_dropout(&xs, 0.5, false).unwrap();
        assert_eq!(
            eval.to_vec2::<f32>().unwrap(),
            xs.to_vec2::<f32>().unwrap()
        );

        let train: Vec<f32> = maybe_dropout(&xs, 0.5, true)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let dropped = train.iter().filter(|v| **v == 0.0).count();
        assert!(dropped > 0 && dropped < train.len());
        assert!(train.iter().all(|v| *v == 0.0 || (v - 2.0).abs() < 1e-6));

        let kept = maybe_dropout(&xs, 1.0, true).unwrap();
        assert_eq!(kept.to_vec2::<f32>().unwrap(), xs.to_vec2::<f32>().unwrap());
    }
}
