//! Stacked LSTM with recurrent state carried across calls.
//!
//! State lives inside the stack so consecutive truncated-BPTT windows continue
//! where the previous one stopped. [`LstmStack::detach_state`] severs the graph
//! at a window boundary; [`LstmStack::reset_state`] zeroes it.

use candle_core::{Result, Tensor};
use candle_nn::rnn::{lstm, LSTMConfig, LSTMState, LSTM, RNN};
use candle_nn::{Init, VarBuilder};

/// Uniform(-0.1, 0.1), the usual initialisation for word-level LSTM LMs.
pub(crate) const PARAM_INIT: Init = Init::Uniform {
    lo: -0.1,
    up: 0.1,
};

pub struct LstmStack {
    layers: Vec<LSTM>,
    /// One entry per layer; `None` means zero state, created lazily for the
    /// batch width of the next input.
    states: Vec<Option<LSTMState>>,
    dropout: f32,
}

impl LstmStack {
    pub fn new(n_units: usize, n_layers: usize, dropout: f64, vb: VarBuilder) -> Result<Self> {
        let mut layers = Vec::with_capacity(n_layers);
        for i in 0..n_layers {
            let config = LSTMConfig {
                w_ih_init: PARAM_INIT,
                w_hh_init: PARAM_INIT,
                ..Default::default()
            };
            layers.push(lstm(n_units, n_units, config, vb.pp(format!("l{i}")))?);
        }
        Ok(Self {
            layers,
            states: vec![None; n_layers],
            dropout: dropout as f32,
        })
    }

    /// Advance every layer by one time step. `x` is `(batch, n_units)`; returns
    /// the top layer's hidden state.
    pub fn step(&mut self, x: &Tensor, train: bool) -> Result<Tensor> {
        let batch = x.dim(0)?;
        let mut h = x.clone();
        for (i, (layer, slot)) in self.layers.iter().zip(self.states.iter_mut()).enumerate() {
            if i > 0 {
                h = dropout(&h, self.dropout, train)?;
            }
            let prev = match slot.take() {
                Some(state) if state.h().dims()[0] == batch => state,
                _ => layer.zero_state(batch)?,
            };
            let next = layer.step(&h, &prev)?;
            h = next.h().clone();
            *slot = Some(next);
        }
        Ok(h)
    }

    pub fn reset_state(&mut self) {
        self.states.iter_mut().for_each(|s| *s = None);
    }

    /// Replace the carried state by graph-free copies of the same values.
    pub fn detach_state(&mut self) {
        for state in self.states.iter_mut().flatten() {
            *state = LSTMState::new(state.h().detach(), state.c().detach());
        }
    }

    /// Detached copy of the carried state, for building an independent model.
    pub(crate) fn detached_states(&self) -> Vec<Option<LSTMState>> {
        self.states
            .iter()
            .map(|s| {
                s.as_ref()
                    .map(|s| LSTMState::new(s.h().detach(), s.c().detach()))
            })
            .collect()
    }

    pub(crate) fn set_states(&mut self, states: Vec<Option<LSTMState>>) {
        self.states = states;
    }

    /// Whether any layer currently carries non-zero state.
    pub fn has_state(&self) -> bool {
        self.states.iter().any(Option::is_some)
    }
}

/// Inverted dropout, identity outside training.
pub(crate) fn dropout(x: &Tensor, p: f32, train: bool) -> Result<Tensor> {
    if train && p > 0.0 {
        candle_nn::ops::dropout(x, p)
    } else {
        Ok(x.clone())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn stack(layers: usize) -> LstmStack {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        LstmStack::new(8, layers, 0.0, vb).unwrap()
    }

    #[test]
    fn state_carries_and_resets() {
        let mut s = stack(2);
        let x = Tensor::ones((3, 8), DType::F32, &Device::Cpu).unwrap();
        let fresh: Vec<f32> = s.step(&x, false).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(s.has_state());
        let carried: Vec<f32> = s.step(&x, false).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_ne!(fresh, carried);

        s.reset_state();
        assert!(!s.has_state());
        let again: Vec<f32> = s.step(&x, false).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(fresh, again);
    }

    #[test]
    fn batch_width_change_restarts_from_zero() {
        let mut s = stack(1);
        let wide = Tensor::ones((4, 8), DType::F32, &Device::Cpu).unwrap();
        let narrow = Tensor::ones((1, 8), DType::F32, &Device::Cpu).unwrap();
        s.step(&wide, false).unwrap();
        let h = s.step(&narrow, false).unwrap();
        assert_eq!(h.dims(), &[1, 8]);
    }
}
