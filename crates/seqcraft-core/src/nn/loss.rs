//! Sequence losses over padded batches.

use candle_core::{D, DType, Tensor};

use crate::error::{Result, SeqcraftError};

/// Log-probability of each target id: `[batch, steps]` from `[batch, steps, vocab]` logits.
pub fn target_log_probs(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let (batch, steps, _vocab) = logits.dims3()?;
    if targets.dims() != [batch, steps] {
        return Err(SeqcraftError::Shape(format!(
            "targets {:?} do not match logits {:?}",
            targets.dims(),
            logits.dims()
        )));
    }
    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    let index = targets.to_dtype(DType::U32)?.contiguous()?.unsqueeze(D::Minus1)?;
    Ok(log_probs.gather(&index, D::Minus1)?.squeeze(D::Minus1)?)
}

/// Mean cross-entropy over positions where `mask` is 1.
///
/// Returns a scalar; an all-zero mask yields 0 rather than NaN.
pub fn sequence_loss(logits: &Tensor, targets: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let picked = target_log_probs(logits, targets)?;
    let mask = mask.to_dtype(picked.dtype())?;
    let total = (picked * &mask)?.sum_all()?.neg()?;
    let count = mask.sum_all()?.to_scalar::<f32>()?;
    Ok(total.affine(1.0 / f64::from(count.max(1.0)), 0.0)?)
}

/// Per-row sum of target log-probabilities over valid positions.
pub fn sequence_log_likelihood(logits: &Tensor, targets: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let picked = target_log_probs(logits, targets)?;
    let mask = mask.to_dtype(picked.dtype())?;
    Ok((picked * mask)?.sum(D::Minus1)?)
}

/// Perplexity from a mean per-token cost.
pub fn perplexity(mean_cost: f64) -> f64 {
    mean_cost.exp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn uniform_logits(batch: usize, steps: usize, vocab: usize) -> Tensor {
        Tensor::zeros((batch, steps, vocab), DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_uniform_logits_give_log_vocab() {
        let logits = uniform_logits(2, 3, 4);
        let targets = Tensor::new(&[[0u32, 1, 2], [3, 0, 0]], &Device::Cpu).unwrap();
        let mask = Tensor::new(&[[1f32, 1., 1.], [1., 0., 0.]], &Device::Cpu).unwrap();
        let loss = sequence_loss(&logits, &targets, &mask)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((loss - 4f32.ln()).abs() < 1e-5);
        assert!((perplexity(loss as f64) - 4.0).abs() < 1e-4);
    }

    #[test]
    fn test_masked_positions_do_not_contribute() {
        // Row 0 predicts its target confidently; row 1's only positions are masked out.
        let logits = Tensor::new(
            &[[[10f32, 0., 0.]], [[0., 0., 10.]]],
            &Device::Cpu,
        )
        .unwrap();
        let targets = Tensor::new(&[[0u32], [0]], &Device::Cpu).unwrap();
        let mask = Tensor::new(&[[1f32], [0.]], &Device::Cpu).unwrap();
        let loss = sequence_loss(&logits, &targets, &mask)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(loss < 1e-3);
    }

    #[test]
    fn test_empty_mask_is_zero() {
        let logits = uniform_logits(1, 2, 3);
        let targets = Tensor::new(&[[0u32, 1]], &Device::Cpu).unwrap();
        let mask = Tensor::zeros((1, 2), DType::F32, &Device::Cpu).unwrap();
        let loss = sequence_loss(&logits, &targets, &mask).unwrap();
        assert_eq!(loss.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn test_log_likelihood_prefers_likely_row() {
        let logits = Tensor::new(
            &[[[5f32, 0.], [5., 0.]], [[0., 5.], [5., 0.]]],
            &Device::Cpu,
        )
        .unwrap();
        let targets = Tensor::new(&[[0u32, 0], [0, 0]], &Device::Cpu).unwrap();
        let mask = Tensor::ones((2, 2), DType::F32, &Device::Cpu).unwrap();
        let scores = sequence_log_likelihood(&logits, &targets, &mask)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!(scores[0] > scores[1]);
    }

    #[test]
    fn test_shape_mismatch() {
        let logits = uniform_logits(1, 2, 3);
        let targets = Tensor::new(&[[0u32]], &Device::Cpu).unwrap();
        let mask = Tensor::ones((1, 1), DType::F32, &Device::Cpu).unwrap();
        assert!(sequence_loss(&logits, &targets, &mask).is_err());
    }
}
