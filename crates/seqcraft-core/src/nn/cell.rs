//! # Recurrent cells
//!
//! Basic tanh RNN, basic LSTM, peephole LSTM and GRU cells over candle
//! tensors, a stacked multi-layer cell with output dropout, and dynamic
//! unrolling that respects per-row sequence lengths.

use candle_core::{DType, Module, Tensor};
use candle_nn::{Init, Linear, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SeqcraftError};

/// Which recurrent cell to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellKind {
    /// `h' = tanh(W [x, h] + b)`
    Basic,
    /// LSTM with forget bias 0 and no peepholes.
    BasicLstm,
    /// LSTM with peephole connections.
    FullLstm,
    /// Gated recurrent unit.
    Gru,
}

impl CellKind {
    /// Map the numeric selector used on the command line (0..=3).
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Self::Basic),
            1 => Some(Self::BasicLstm),
            2 => Some(Self::FullLstm),
            3 => Some(Self::Gru),
            _ => None,
        }
    }

    pub fn has_cell_state(self) -> bool {
        matches!(self, Self::BasicLstm | Self::FullLstm)
    }
}

/// Recurrent state of one cell.
#[derive(Debug, Clone)]
pub enum CellState {
    /// Hidden vector only (basic RNN, GRU).
    Hidden(Tensor),
    /// LSTM hidden and memory vectors.
    Lstm { h: Tensor, c: Tensor },
}

impl CellState {
    /// The output-facing hidden vector.
    pub fn h(&self) -> &Tensor {
        match self {
            Self::Hidden(h) => h,
            Self::Lstm { h, .. } => h,
        }
    }

    /// Keep `self` where `keep` is 1 and `other` where it is 0; `keep` is `[batch, 1]`.
    pub fn select(&self, other: &CellState, keep: &Tensor) -> Result<CellState> {
        let blend = |a: &Tensor, b: &Tensor| -> Result<Tensor> {
            let kept = a.broadcast_mul(keep)?;
            let rest = b.broadcast_mul(&keep.affine(-1.0, 1.0)?)?;
            Ok((kept + rest)?)
        };
        match (self, other) {
            (Self::Hidden(a), Self::Hidden(b)) => Ok(Self::Hidden(blend(a, b)?)),
            (Self::Lstm { h: ha, c: ca }, Self::Lstm { h: hb, c: cb }) => Ok(Self::Lstm {
                h: blend(ha, hb)?,
                c: blend(ca, cb)?,
            }),
            _ => Err(SeqcraftError::Shape("mismatched cell state kinds".into())),
        }
    }
}

/// One step of a recurrent computation.
pub trait RecurrentCell {
    /// All-zero state for `batch` rows.
    fn zero_state(&self, batch: usize) -> Result<CellState>;

    /// Advance one position; returns the step output and the next state.
    fn step(&self, input: &Tensor, state: &CellState) -> Result<(Tensor, CellState)>;

    /// Width of the step output.
    fn output_size(&self) -> usize;
}

fn sigmoid(xs: &Tensor) -> Result<Tensor> {
    Ok(candle_nn::ops::sigmoid(xs)?)
}

fn uniform(init_scale: f64) -> Init {
    Init::Uniform {
        lo: -init_scale,
        up: init_scale,
    }
}

/// Affine map `[x, h] -> gates * hidden` with a single fused weight.
fn fused_linear(
    in_dim: usize,
    out_dim: usize,
    init_scale: f64,
    vb: &VarBuilder,
) -> Result<Linear> {
    let weight = vb.get_with_hints((out_dim, in_dim), "weight", uniform(init_scale))?;
    let bias = vb.get_with_hints(out_dim, "bias", Init::Const(0.0))?;
    Ok(Linear::new(weight, Some(bias)))
}

/// A single-layer cell of any supported kind.
#[derive(Debug, Clone)]
pub struct Cell {
    kind: CellKind,
    hidden: usize,
    gates: Linear,
    /// GRU candidate transform, applied to `[x, r * h]`.
    candidate: Option<Linear>,
    /// Peephole weights `(w_i, w_f, w_o)` for the full LSTM.
    peepholes: Option<(Tensor, Tensor, Tensor)>,
    dtype: DType,
}

impl Cell {
    pub fn new(
        kind: CellKind,
        input_size: usize,
        hidden: usize,
        init_scale: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let concat = input_size + hidden;
        let (gates, candidate, peepholes) = match kind {
            CellKind::Basic => (fused_linear(concat, hidden, init_scale, &vb.pp("gates"))?, None, None),
            CellKind::BasicLstm => (
                fused_linear(concat, 4 * hidden, init_scale, &vb.pp("gates"))?,
                None,
                None,
            ),
            CellKind::FullLstm => {
                let gates = fused_linear(concat, 4 * hidden, init_scale, &vb.pp("gates"))?;
                let peep = vb.pp("peephole");
                let w_i = peep.get_with_hints(hidden, "w_i", uniform(init_scale))?;
                let w_f = peep.get_with_hints(hidden, "w_f", uniform(init_scale))?;
                let w_o = peep.get_with_hints(hidden, "w_o", uniform(init_scale))?;
                (gates, None, Some((w_i, w_f, w_o)))
            }
            CellKind::Gru => {
                let gates = fused_linear(concat, 2 * hidden, init_scale, &vb.pp("gates"))?;
                let candidate = fused_linear(concat, hidden, init_scale, &vb.pp("candidate"))?;
                (gates, Some(candidate), None)
            }
        };
        Ok(Self {
            kind,
            hidden,
            gates,
            candidate,
            peepholes,
            dtype: vb.dtype(),
        })
    }

    pub fn kind(&self) -> CellKind {
        self.kind
    }

    fn zeros(&self, batch: usize, like: &Tensor) -> Result<Tensor> {
        Ok(Tensor::zeros((batch, self.hidden), self.dtype, like.device())?)
    }

    fn lstm_step(&self, input: &Tensor, h: &Tensor, c: &Tensor) -> Result<(Tensor, CellState)> {
        let xh = Tensor::cat(&[input, h], 1)?;
        let z = self.gates.forward(&xh)?;
        let chunks = z.chunk(4, 1)?;
        let (zi, zj, zf, zo) = (&chunks[0], &chunks[1], &chunks[2], &chunks[3]);

        let (i, f) = match &self.peepholes {
            Some((w_i, w_f, _)) => (
                sigmoid(&(zi + c.broadcast_mul(w_i)?)?)?,
                sigmoid(&(zf + c.broadcast_mul(w_f)?)?)?,
            ),
            None => (sigmoid(zi)?, sigmoid(zf)?),
        };
        let c_next = ((c * f)? + (i * zj.tanh()?)?)?;
        let o = match &self.peepholes {
            Some((_, _, w_o)) => sigmoid(&(zo + c_next.broadcast_mul(w_o)?)?)?,
            None => sigmoid(zo)?,
        };
        let h_next = (o * c_next.tanh()?)?;
        Ok((
            h_next.clone(),
            CellState::Lstm {
                h: h_next,
                c: c_next,
            },
        ))
    }

    fn gru_step(&self, input: &Tensor, h: &Tensor) -> Result<(Tensor, CellState)> {
        let candidate = self
            .candidate
            .as_ref()
            .ok_or_else(|| SeqcraftError::Shape("GRU cell without candidate weights".into()))?;
        let xh = Tensor::cat(&[input, h], 1)?;
        let gates = sigmoid(&self.gates.forward(&xh)?)?;
        let r = gates.narrow(1, 0, self.hidden)?;
        let u = gates.narrow(1, self.hidden, self.hidden)?;
        let xrh = Tensor::cat(&[input, &(r * h)?], 1)?;
        let c = candidate.forward(&xrh)?.tanh()?;
        // h' = u * h + (1 - u) * c
        let h_next = ((&u * h)? + (u.affine(-1.0, 1.0)? * c)?)?;
        Ok((h_next.clone(), CellState::Hidden(h_next)))
    }
}

impl RecurrentCell for Cell {
    fn zero_state(&self, batch: usize) -> Result<CellState> {
        let h = Tensor::zeros((batch, self.hidden), self.dtype, self.gates.weight().device())?;
        if self.kind.has_cell_state() {
            let c = self.zeros(batch, &h)?;
            Ok(CellState::Lstm { h, c })
        } else {
            Ok(CellState::Hidden(h))
        }
    }

    fn step(&self, input: &Tensor, state: &CellState) -> Result<(Tensor, CellState)> {
        match (self.kind, state) {
            (CellKind::Basic, CellState::Hidden(h)) => {
                let xh = Tensor::cat(&[input, h], 1)?;
                let h_next = self.gates.forward(&xh)?.tanh()?;
                Ok((h_next.clone(), CellState::Hidden(h_next)))
            }
            (CellKind::Gru, CellState::Hidden(h)) => self.gru_step(input, h),
            (CellKind::BasicLstm | CellKind::FullLstm, CellState::Lstm { h, c }) => {
                self.lstm_step(input, h, c)
            }
            _ => Err(SeqcraftError::Shape(format!(
                "state does not match {:?} cell",
                self.kind
            ))),
        }
    }

    fn output_size(&self) -> usize {
        self.hidden
    }
}

/// Several cells applied bottom-up at each position.
#[derive(Debug, Clone)]
pub struct StackedCell {
    layers: Vec<Cell>,
    /// Dropout applied to each layer's output while training.
    drop_prob: f32,
}

/// State of a stacked cell, one entry per layer.
pub type StackedState = Vec<CellState>;

impl StackedCell {
    /// Build `layers` cells named `layer_0..` under `vb`.
    pub fn new(
        kind: CellKind,
        input_size: usize,
        hidden: usize,
        layers: usize,
        init_scale: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        if layers == 0 {
            return Err(SeqcraftError::InvalidConfig(
                "a stacked cell needs at least one layer".into(),
            ));
        }
        let cells = (0..layers)
            .map(|l| {
                let in_dim = if l == 0 { input_size } else { hidden };
                Cell::new(kind, in_dim, hidden, init_scale, vb.pp(format!("layer_{l}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            layers: cells,
            drop_prob: 0.0,
        })
    }

    /// Enable output dropout with the given keep probability.
    pub fn with_keep_prob(mut self, keep_prob: f64) -> Self {
        self.drop_prob = (1.0 - keep_prob).clamp(0.0, 1.0) as f32;
        self
    }

    pub fn zero_state(&self, batch: usize) -> Result<StackedState> {
        self.layers.iter().map(|c| c.zero_state(batch)).collect()
    }

    /// One position through every layer. Dropout is only applied when `train`.
    pub fn step(
        &self,
        input: &Tensor,
        state: &StackedState,
        train: bool,
    ) -> Result<(Tensor, StackedState)> {
        let mut x = input.clone();
        let mut next = Vec::with_capacity(self.layers.len());
        for (cell, s) in self.layers.iter().zip(state) {
            let (out, s_next) = cell.step(&x, s)?;
            x = if train && self.drop_prob > 0.0 {
                candle_nn::ops::dropout(&out, self.drop_prob)?
            } else {
                out
            };
            next.push(s_next);
        }
        Ok((x, next))
    }

    pub fn output_size(&self) -> usize {
        self.layers
            .last()
            .map(|c| c.output_size())
            .unwrap_or_default()
    }
}

/// Run `cell` over `inputs` (one `[batch, in]` tensor per position).
///
/// A row stops advancing once `t >= lengths[row]`: its output is zero and its
/// state is carried unchanged. Returns per-step outputs and the final state.
pub fn unroll(
    cell: &StackedCell,
    inputs: &[Tensor],
    lengths: &[usize],
    initial: StackedState,
    train: bool,
) -> Result<(Vec<Tensor>, StackedState)> {
    let batch = lengths.len();
    let mut state = initial;
    let mut outputs = Vec::with_capacity(inputs.len());
    let all_full = lengths.iter().all(|&l| l >= inputs.len());

    for (t, x) in inputs.iter().enumerate() {
        let (out, next) = cell.step(x, &state, train)?;
        if all_full {
            outputs.push(out);
            state = next;
            continue;
        }
        let keep: Vec<f32> = lengths
            .iter()
            .map(|&l| if t < l { 1.0 } else { 0.0 })
            .collect();
        let keep = Tensor::from_vec(keep, (batch, 1), x.device())?.to_dtype(out.dtype())?;
        outputs.push(out.broadcast_mul(&keep)?);
        state = next
            .iter()
            .zip(&state)
            .map(|(n, old)| n.select(old, &keep))
            .collect::<Result<Vec<_>>>()?;
    }
    Ok((outputs, state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn build(kind: CellKind, layers: usize) -> (VarMap, StackedCell) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cell = StackedCell::new(kind, 3, 4, layers, 0.1, vb.pp("rnn")).unwrap();
        (varmap, cell)
    }

    fn inputs(steps: usize, batch: usize) -> Vec<Tensor> {
        (0..steps)
            .map(|t| {
                Tensor::full(0.1 * (t as f32 + 1.0), (batch, 3), &Device::Cpu).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_every_kind_steps_with_expected_shapes() {
        for kind in [
            CellKind::Basic,
            CellKind::BasicLstm,
            CellKind::FullLstm,
            CellKind::Gru,
        ] {
            let (_vm, cell) = build(kind, 2);
            let state = cell.zero_state(5).unwrap();
            let (out, next) = cell.step(&inputs(1, 5)[0], &state, false).unwrap();
            assert_eq!(out.dims(), &[5, 4], "{kind:?}");
            assert_eq!(next.len(), 2);
            assert_eq!(
                matches!(next[0], CellState::Lstm { .. }),
                kind.has_cell_state()
            );
        }
    }

    #[test]
    fn test_variable_counts_per_kind() {
        let count = |kind| {
            let (vm, _) = build(kind, 1);
            vm.all_vars().len()
        };
        assert_eq!(count(CellKind::Basic), 2);
        assert_eq!(count(CellKind::BasicLstm), 2);
        assert_eq!(count(CellKind::FullLstm), 5);
        assert_eq!(count(CellKind::Gru), 4);
    }

    #[test]
    fn test_unroll_freezes_finished_rows() {
        let (_vm, cell) = build(CellKind::BasicLstm, 1);
        let xs = inputs(4, 2);
        let (outputs, final_state) =
            unroll(&cell, &xs, &[4, 2], cell.zero_state(2).unwrap(), false).unwrap();
        assert_eq!(outputs.len(), 4);

        // Row 1 stops after two steps: zero output, state equal to step-2 state.
        let late = outputs[3].to_vec2::<f32>().unwrap();
        assert!(late[1].iter().all(|v| *v == 0.0));
        assert!(late[0].iter().any(|v| *v != 0.0));

        let (_, short_state) =
            unroll(&cell, &xs[..2], &[2, 2], cell.zero_state(2).unwrap(), false).unwrap();
        let a = final_state[0].h().to_vec2::<f32>().unwrap();
        let b = short_state[0].h().to_vec2::<f32>().unwrap();
        assert_eq!(a[1], b[1]);
    }

    #[test]
    fn test_dropout_only_while_training() {
        let (_vm, cell) = build(CellKind::Basic, 1);
        let cell = cell.with_keep_prob(0.5);
        let x = &inputs(1, 3)[0];
        let state = cell.zero_state(3).unwrap();
        let (a, _) = cell.step(x, &state, false).unwrap();
        let (b, _) = cell.step(x, &state, false).unwrap();
        assert_eq!(a.to_vec2::<f32>().unwrap(), b.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn test_training_step_drops_and_rescales_outputs() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cell = StackedCell::new(CellKind::Basic, 3, 64, 1, 0.1, vb)
            .unwrap()
            .with_keep_prob(0.5);
        let x = &inputs(1, 4)[0];
        let state = cell.zero_state(4).unwrap();
        let eval = cell.step(x, &state, false).unwrap().0;
        let train = cell.step(x, &state, true).unwrap().0;

        let eval: Vec<f32> = eval.flatten_all().unwrap().to_vec1().unwrap();
        let train: Vec<f32> = train.flatten_all().unwrap().to_vec1().unwrap();
        let dropped = train.iter().filter(|v| **v == 0.0).count();
        assert!(dropped > 0 && dropped < train.len());
        for (t, e) in train.iter().zip(&eval) {
            if *t != 0.0 {
                assert!((t - 2.0 * e).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_rejects_zero_layers() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(StackedCell::new(CellKind::Gru, 3, 4, 0, 0.1, vb).is_err());
    }
}
