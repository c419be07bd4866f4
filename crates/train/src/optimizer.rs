//! Optimisers and the learning-rate capability the decay schedule drives.

use candle_core::{backprop::GradStore, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD};
use clap::ValueEnum;

// ── LearningRate ────────────────────────────────────────────────────────────

/// A single adjustable step-size scalar, whatever the optimiser calls it
/// (Adam's alpha, SGD's lr).
pub trait LearningRate {
    fn rate(&self) -> f64;
    fn set_rate(&mut self, rate: f64);
}

impl LearningRate for AdamW {
    fn rate(&self) -> f64 {
        self.learning_rate()
    }

    fn set_rate(&mut self, rate: f64) {
        self.set_learning_rate(rate);
    }
}

impl LearningRate for SGD {
    fn rate(&self) -> f64 {
        self.learning_rate()
    }

    fn set_rate(&mut self, rate: f64) {
        self.set_learning_rate(rate);
    }
}

// ── Selection ───────────────────────────────────────────────────────────────

/// Which optimiser to build.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerChoice {
    Adam,
    Sgd,
}

impl OptimizerChoice {
    /// Adam's alpha 1e-3; SGD's lr 1.0.
    pub fn default_rate(self) -> f64 {
        match self {
            Self::Adam => 1e-3,
            Self::Sgd => 1.0,
        }
    }
}

// ── OptimizerKind ───────────────────────────────────────────────────────────

pub enum OptimizerKind {
    Adam(AdamW),
    Sgd(SGD),
}

impl OptimizerKind {
    pub fn new(choice: OptimizerChoice, vars: Vec<Var>, rate: f64) -> anyhow::Result<Self> {
        Ok(match choice {
            OptimizerChoice::Adam => Self::Adam(AdamW::new(
                vars,
                ParamsAdamW {
                    lr: rate,
                    beta1: 0.9,
                    beta2: 0.999,
                    eps: 1e-8,
                    weight_decay: 0.0,
                },
            )?),
            OptimizerChoice::Sgd => Self::Sgd(SGD::new(vars, rate)?),
        })
    }

    pub fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        match self {
            Self::Adam(opt) => opt.step(grads),
            Self::Sgd(opt) => opt.step(grads),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Adam(_) => "Adam",
            Self::Sgd(_) => "SGD",
        }
    }
}

impl LearningRate for OptimizerKind {
    fn rate(&self) -> f64 {
        match self {
            Self::Adam(opt) => opt.rate(),
            Self::Sgd(opt) => opt.rate(),
        }
    }

    fn set_rate(&mut self, rate: f64) {
        match self {
            Self::Adam(opt) => opt.set_rate(rate),
            Self::Sgd(opt) => opt.set_rate(rate),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn rate_round_trips_through_both_optimizers() {
        for choice in [OptimizerChoice::Adam, OptimizerChoice::Sgd] {
            let var = Var::zeros(3, DType::F32, &Device::Cpu).unwrap();
            let mut opt = OptimizerKind::new(choice, vec![var], choice.default_rate()).unwrap();
            assert_eq!(opt.rate(), choice.default_rate());
            opt.set_rate(0.25);
            assert_eq!(opt.rate(), 0.25);
        }
    }

    #[test]
    fn sgd_step_moves_against_gradient() {
        let var = Var::new(&[1.0f32, -1.0], &Device::Cpu).unwrap();
        let mut opt = OptimizerKind::new(OptimizerChoice::Sgd, vec![var.clone()], 0.5).unwrap();
        let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        opt.step(&grads).unwrap();
        // x - 0.5 * 2x = 0
        let after: Vec<f32> = var.as_tensor().to_vec1().unwrap();
        assert_eq!(after, vec![0.0, 0.0]);
    }

    #[test]
    fn parses_choice() {
        assert_eq!(OptimizerChoice::from_str("adam", false).unwrap(), OptimizerChoice::Adam);
        assert_eq!(OptimizerChoice::from_str("sgd", false).unwrap(), OptimizerChoice::Sgd);
        assert!(OptimizerChoice::from_str("rmsprop", false).is_err());
    }
}
