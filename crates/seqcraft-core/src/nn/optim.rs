//! # Optimizers
//!
//! Gradient descent, Adadelta, Adagrad, momentum, Adam and RMSProp behind one
//! selector, plus global-norm gradient clipping. Plain SGD and Adam come from
//! `candle_nn`; the others implement `candle_nn::Optimizer` here.

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::Result;

/// Optimizer selector, numbered as on the command line (0..=5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    GradientDescent,
    Adadelta,
    Adagrad,
    Momentum,
    Adam,
    RmsProp,
}

impl OptimizerKind {
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Self::GradientDescent),
            1 => Some(Self::Adadelta),
            2 => Some(Self::Adagrad),
            3 => Some(Self::Momentum),
            4 => Some(Self::Adam),
            5 => Some(Self::RmsProp),
            _ => None,
        }
    }
}

fn slot_like(var: &Var, fill: f64) -> candle_core::Result<Var> {
    let t = (var.ones_like()? * fill)?;
    Var::from_tensor(&t)
}

/// Adagrad with a 0.1 initial accumulator.
pub struct Adagrad {
    vars: Vec<(Var, Var)>,
    lr: f64,
}

impl Optimizer for Adagrad {
    type Config = f64;

    fn new(vars: Vec<Var>, lr: f64) -> candle_core::Result<Self> {
        let mut slots = Vec::with_capacity(vars.len());
        for var in vars.into_iter().filter(|v| v.dtype().is_float()) {
            let acc = slot_like(&var, 0.1)?;
            slots.push((var, acc));
        }
        Ok(Self { vars: slots, lr })
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        for (var, acc) in &self.vars {
            if let Some(g) = grads.get(var) {
                let acc_next = (acc.as_tensor() + g.sqr()?)?;
                let update = (g / acc_next.sqrt()?)?.affine(self.lr, 0.0)?;
                acc.set(&acc_next)?;
                var.set(&var.sub(&update)?)?;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }
}

/// Adadelta (rho 0.95, eps 1e-8) scaled by the learning rate.
pub struct Adadelta {
    vars: Vec<(Var, Var, Var)>,
    lr: f64,
    rho: f64,
    eps: f64,
}

impl Optimizer for Adadelta {
    type Config = f64;

    fn new(vars: Vec<Var>, lr: f64) -> candle_core::Result<Self> {
        let mut slots = Vec::with_capacity(vars.len());
        for var in vars.into_iter().filter(|v| v.dtype().is_float()) {
            let accum = slot_like(&var, 0.0)?;
            let accum_update = slot_like(&var, 0.0)?;
            slots.push((var, accum, accum_update));
        }
        Ok(Self {
            vars: slots,
            lr,
            rho: 0.95,
            eps: 1e-8,
        })
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        let (rho, eps) = (self.rho, self.eps);
        for (var, accum, accum_update) in &self.vars {
            if let Some(g) = grads.get(var) {
                let accum_next = (accum.affine(rho, 0.0)? + g.sqr()?.affine(1.0 - rho, 0.0)?)?;
                let ratio = ((accum_update.as_tensor() + eps)?.sqrt()?
                    / (&accum_next + eps)?.sqrt()?)?;
                let update = (ratio * g)?;
                let update_sq = update.sqr()?.affine(1.0 - rho, 0.0)?;
                accum_update.set(&(accum_update.affine(rho, 0.0)? + update_sq)?)?;
                accum.set(&accum_next)?;
                var.set(&var.sub(&update.affine(self.lr, 0.0)?)?)?;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }
}

/// Heavy-ball momentum: `a = m * a + g; w -= lr * a`.
pub struct Momentum {
    vars: Vec<(Var, Var)>,
    lr: f64,
    momentum: f64,
}

/// Learning rate and momentum coefficient.
#[derive(Debug, Clone, Copy)]
pub struct MomentumConfig {
    pub lr: f64,
    pub momentum: f64,
}

impl Optimizer for Momentum {
    type Config = MomentumConfig;

    fn new(vars: Vec<Var>, config: MomentumConfig) -> candle_core::Result<Self> {
        let mut slots = Vec::with_capacity(vars.len());
        for var in vars.into_iter().filter(|v| v.dtype().is_float()) {
            let accum = slot_like(&var, 0.0)?;
            slots.push((var, accum));
        }
        Ok(Self {
            vars: slots,
            lr: config.lr,
            momentum: config.momentum,
        })
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        for (var, accum) in &self.vars {
            if let Some(g) = grads.get(var) {
                let accum_next = (accum.affine(self.momentum, 0.0)? + g)?;
                var.set(&var.sub(&accum_next.affine(self.lr, 0.0)?)?)?;
                accum.set(&accum_next)?;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }
}

/// RMSProp with decay 0.9, no momentum, eps 1e-10; the mean square starts at 1.
pub struct RmsProp {
    vars: Vec<(Var, Var)>,
    lr: f64,
    decay: f64,
    eps: f64,
}

impl Optimizer for RmsProp {
    type Config = f64;

    fn new(vars: Vec<Var>, lr: f64) -> candle_core::Result<Self> {
        let mut slots = Vec::with_capacity(vars.len());
        for var in vars.into_iter().filter(|v| v.dtype().is_float()) {
            let ms = slot_like(&var, 1.0)?;
            slots.push((var, ms));
        }
        Ok(Self {
            vars: slots,
            lr,
            decay: 0.9,
            eps: 1e-10,
        })
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        for (var, ms) in &self.vars {
            if let Some(g) = grads.get(var) {
                let ms_next =
                    (ms.affine(self.decay, 0.0)? + g.sqr()?.affine(1.0 - self.decay, 0.0)?)?;
                let update = (g / (&ms_next + self.eps)?.sqrt()?)?.affine(self.lr, 0.0)?;
                ms.set(&ms_next)?;
                var.set(&var.sub(&update)?)?;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }
}

/// Scale all gradients so their joint L2 norm is at most `max_norm`.
///
/// Each gradient becomes `g * max_norm / max(global_norm, max_norm)`.
/// Returns the global norm before clipping.
pub fn clip_by_global_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let mut sum_sq = 0f64;
    for var in vars {
        if let Some(g) = grads.get(var) {
            sum_sq += g
                .sqr()?
                .sum_all()?
                .to_dtype(DType::F64)?
                .to_scalar::<f64>()?;
        }
    }
    let norm = sum_sq.sqrt();
    if norm.is_finite() && norm > max_norm {
        let scale = max_norm / norm;
        for var in vars {
            if let Some(g) = grads.remove(var) {
                grads.insert(var, g.affine(scale, 0.0)?);
            }
        }
    }
    Ok(norm)
}

/// Any of the supported optimizers.
pub enum SeqOptimizer {
    GradientDescent(SGD),
    Adadelta(Adadelta),
    Adagrad(Adagrad),
    Momentum(Momentum),
    Adam(AdamW),
    RmsProp(RmsProp),
}

impl SeqOptimizer {
    /// Momentum coefficient used for `OptimizerKind::Momentum`.
    pub const MOMENTUM: f64 = 0.9;

    pub fn new(kind: OptimizerKind, vars: Vec<Var>, lr: f64) -> Result<Self> {
        let opt = match kind {
            OptimizerKind::GradientDescent => Self::GradientDescent(SGD::new(vars, lr)?),
            OptimizerKind::Adadelta => Self::Adadelta(Adadelta::new(vars, lr)?),
            OptimizerKind::Adagrad => Self::Adagrad(Adagrad::new(vars, lr)?),
            OptimizerKind::Momentum => Self::Momentum(Momentum::new(
                vars,
                MomentumConfig {
                    lr,
                    momentum: Self::MOMENTUM,
                },
            )?),
            OptimizerKind::Adam => Self::Adam(AdamW::new(
                vars,
                ParamsAdamW {
                    lr,
                    beta1: 0.9,
                    beta2: 0.999,
                    eps: 1e-8,
                    weight_decay: 0.0,
                },
            )?),
            OptimizerKind::RmsProp => Self::RmsProp(RmsProp::new(vars, lr)?),
        };
        Ok(opt)
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        match self {
            Self::GradientDescent(o) => o.step(grads)?,
            Self::Adadelta(o) => o.step(grads)?,
            Self::Adagrad(o) => o.step(grads)?,
            Self::Momentum(o) => o.step(grads)?,
            Self::Adam(o) => o.step(grads)?,
            Self::RmsProp(o) => o.step(grads)?,
        }
        Ok(())
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            Self::GradientDescent(o) => o.learning_rate(),
            Self::Adadelta(o) => o.learning_rate(),
            Self::Adagrad(o) => o.learning_rate(),
            Self::Momentum(o) => o.learning_rate(),
            Self::Adam(o) => o.learning_rate(),
            Self::RmsProp(o) => o.learning_rate(),
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            Self::GradientDescent(o) => o.set_learning_rate(lr),
            Self::Adadelta(o) => o.set_learning_rate(lr),
            Self::Adagrad(o) => o.set_learning_rate(lr),
            Self::Momentum(o) => o.set_learning_rate(lr),
            Self::Adam(o) => o.set_learning_rate(lr),
            Self::RmsProp(o) => o.set_learning_rate(lr),
        }
    }

    /// Backpropagate `loss`, clip to `max_norm`, apply one update.
    /// Returns the pre-clip gradient norm.
    pub fn minimize(&mut self, loss: &Tensor, vars: &[Var], max_norm: f64) -> Result<f64> {
        let mut grads = loss.backward()?;
        let norm = clip_by_global_norm(&mut grads, vars, max_norm)?;
        trace!(norm, "gradient norm");
        self.step(&grads)?;
        Ok(norm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    /// Minimize (w - 3)^2 from w = 0 and report the final w.
    fn descend(kind: OptimizerKind, lr: f64, steps: usize) -> f32 {
        let w = Var::zeros(1, DType::F32, &Device::Cpu).unwrap();
        let mut opt = SeqOptimizer::new(kind, vec![w.clone()], lr).unwrap();
        for _ in 0..steps {
            let loss = (w.as_tensor() - 3.0).unwrap().sqr().unwrap().sum_all().unwrap();
            opt.minimize(&loss, &[w.clone()], 100.0).unwrap();
        }
        w.as_tensor().to_vec1::<f32>().unwrap()[0]
    }

    #[test]
    fn test_every_optimizer_moves_toward_minimum() {
        for (kind, lr) in [
            (OptimizerKind::GradientDescent, 0.1),
            (OptimizerKind::Adadelta, 1.0),
            (OptimizerKind::Adagrad, 0.5),
            (OptimizerKind::Momentum, 0.05),
            (OptimizerKind::Adam, 0.1),
            (OptimizerKind::RmsProp, 0.05),
        ] {
            let w = descend(kind, lr, 50);
            assert!(w > 0.0, "{kind:?} did not move toward 3: {w}");
            assert!(w < 6.0, "{kind:?} diverged: {w}");
        }
    }

    #[test]
    fn test_gradient_descent_converges() {
        let w = descend(OptimizerKind::GradientDescent, 0.1, 200);
        assert!((w - 3.0).abs() < 1e-3);
    }

    #[test]
    fn test_clip_by_global_norm_scales_jointly() {
        let a = Var::from_tensor(&Tensor::new(&[1f32, 1.], &Device::Cpu).unwrap()).unwrap();
        let b = Var::from_tensor(&Tensor::new(&[1f32], &Device::Cpu).unwrap()).unwrap();
        // d/da sum(3a) = 3, d/db sum(4b) = 4 -> global norm sqrt(9 + 9 + 16) = sqrt(34)
        let loss = ((a.as_tensor() * 3.0).unwrap().sum_all().unwrap()
            + (b.as_tensor() * 4.0).unwrap().sum_all().unwrap())
        .unwrap();
        let mut grads = loss.backward().unwrap();
        let vars = vec![a.clone(), b.clone()];
        let norm = clip_by_global_norm(&mut grads, &vars, 1.0).unwrap();
        assert!((norm - 34f64.sqrt()).abs() < 1e-5);

        let ga = grads.get(&a).unwrap().to_vec1::<f32>().unwrap();
        let gb = grads.get(&b).unwrap().to_vec1::<f32>().unwrap();
        let clipped = (ga.iter().map(|v| v * v).sum::<f32>() + gb[0] * gb[0]).sqrt();
        assert!((clipped - 1.0).abs() < 1e-5);
        assert!((ga[0] / gb[0] - 0.75).abs() < 1e-5);
    }

    #[test]
    fn test_clip_leaves_small_gradients() {
        let a = Var::from_tensor(&Tensor::new(&[2f32], &Device::Cpu).unwrap()).unwrap();
        let loss = (a.as_tensor() * 0.5).unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        clip_by_global_norm(&mut grads, &[a.clone()], 5.0).unwrap();
        assert_eq!(grads.get(&a).unwrap().to_vec1::<f32>().unwrap(), vec![0.5]);
    }

    #[test]
    fn test_learning_rate_is_adjustable() {
        let w = Var::zeros(2, DType::F32, &Device::Cpu).unwrap();
        let mut opt = SeqOptimizer::new(OptimizerKind::RmsProp, vec![w], 0.01).unwrap();
        opt.set_learning_rate(opt.learning_rate() * 0.5);
        assert!((opt.learning_rate() - 0.005).abs() < 1e-12);
        assert_eq!(OptimizerKind::from_index(4), Some(OptimizerKind::Adam));
        assert_eq!(OptimizerKind::from_index(6), None);
    }
}
