//! Output layers: hidden states → summed negative log-likelihood.
//!
//! | Variant | Training loss | Inference loss |
//! |---------|---------------|----------------|
//! | [`OutputLayer::FullSoftmax`] | exact softmax NLL | same |
//! | [`OutputLayer::BlackOut`] | target vs sampled negatives | exact softmax NLL |
//! | [`OutputLayer::Adaptive`] | exact clustered NLL | same |
//!
//! Every variant returns a scalar *sum* over rows; normalisation is the
//! caller's business.

use candle_core::{Result, Tensor};
use candle_nn::{ops, Embedding, Init, Linear, Module, VarBuilder};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use rnnlm_common::{OutputKind, RnnLmConfig};

use crate::lstm::PARAM_INIT;

/// Linear layer with the model-wide initialisation.
pub(crate) fn linear(in_dim: usize, out_dim: usize, bias: bool, vb: VarBuilder) -> Result<Linear> {
    let w = vb.get_with_hints((out_dim, in_dim), "weight", PARAM_INIT)?;
    let b = if bias {
        Some(vb.get_with_hints(out_dim, "bias", Init::Const(0.))?)
    } else {
        None
    };
    Ok(Linear::new(w, b))
}

/// `-Σ log_probs[i, targets[i]]`.
fn nll_sum(log_probs: &Tensor, targets: &Tensor) -> Result<Tensor> {
    log_probs
        .gather(&targets.unsqueeze(1)?, 1)?
        .sum_all()?
        .neg()
}

// ── OutputLayer ─────────────────────────────────────────────────────────────

pub enum OutputLayer {
    FullSoftmax(Linear),
    BlackOut(BlackOut),
    Adaptive(AdaptiveSoftmax),
}

impl OutputLayer {
    /// Build the configured variant. `embedding` supplies the tied weight when
    /// `share_embedding` is set; `counts` is required for BlackOut.
    pub fn new(
        config: &RnnLmConfig,
        embedding: &Embedding,
        counts: Option<&[u32]>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let (v, h) = (config.vocab_size, config.n_units);
        let projection = |vb: VarBuilder| -> Result<Linear> {
            if config.share_embedding {
                let b = vb.get_with_hints(v, "bias", Init::Const(0.))?;
                Ok(Linear::new(embedding.embeddings().clone(), Some(b)))
            } else {
                linear(h, v, true, vb)
            }
        };
        match &config.output {
            OutputKind::FullSoftmax => Ok(Self::FullSoftmax(projection(vb)?)),
            OutputKind::BlackOut { samples } => {
                let counts = counts.ok_or_else(|| {
                    candle_core::Error::Msg("blackout output needs word counts".to_string())
                })?;
                Ok(Self::BlackOut(BlackOut::new(projection(vb)?, counts, *samples)?))
            }
            OutputKind::AdaptiveSoftmax { cutoffs } => Ok(Self::Adaptive(AdaptiveSoftmax::new(
                h, v, cutoffs, vb,
            )?)),
        }
    }

    /// Summed NLL of `targets` (`(n,)` u32) given hidden rows `h` (`(n, n_units)`).
    pub fn loss(&mut self, h: &Tensor, targets: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Self::FullSoftmax(proj) => nll_sum(&ops::log_softmax(&proj.forward(h)?, 1)?, targets),
            Self::BlackOut(b) if train => b.sampled_loss(h, targets),
            Self::BlackOut(b) => nll_sum(&ops::log_softmax(&b.proj.forward(h)?, 1)?, targets),
            Self::Adaptive(a) => nll_sum(&a.log_probs(h)?, targets),
        }
    }

    /// Log-probabilities over the full vocabulary, `(n, vocab)`.
    pub fn log_probs(&self, h: &Tensor) -> Result<Tensor> {
        match self {
            Self::FullSoftmax(proj) => ops::log_softmax(&proj.forward(h)?, 1),
            Self::BlackOut(b) => ops::log_softmax(&b.proj.forward(h)?, 1),
            Self::Adaptive(a) => a.log_probs(h),
        }
    }

    /// Restart the negative sampler from `seed`. Only BlackOut samples.
    pub fn reseed(&mut self, seed: u64) {
        if let Self::BlackOut(b) = self {
            b.rng = StdRng::seed_from_u64(seed);
        }
    }
}

// ── BlackOut ────────────────────────────────────────────────────────────────

/// BlackOut output: during training each window scores the target against
/// `samples` negatives drawn from the unigram distribution and maximises
/// `log p(target) + Σ log(1 - p(negative))` under a softmax over that small set.
pub struct BlackOut {
    proj: Linear,
    sampler: WeightedIndex<f64>,
    samples: usize,
    rng: StdRng,
}

impl BlackOut {
    pub fn new(proj: Linear, counts: &[u32], samples: usize) -> Result<Self> {
        let sampler = WeightedIndex::new(counts.iter().map(|&c| c as f64))
            .map_err(|e| candle_core::Error::Msg(format!("blackout sampler: {e}")))?;
        Ok(Self {
            proj,
            sampler,
            samples,
            rng: StdRng::seed_from_u64(0),
        })
    }

    fn sample_negatives(&mut self, device: &candle_core::Device) -> Result<Tensor> {
        let ids: Vec<u32> = (0..self.samples)
            .map(|_| self.sampler.sample(&mut self.rng) as u32)
            .collect();
        Tensor::new(ids.as_slice(), device)
    }

    fn sampled_loss(&mut self, h: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let negatives = self.sample_negatives(h.device())?;
        let w = self.proj.weight();
        let b = self
            .proj
            .bias()
            .ok_or_else(|| candle_core::Error::Msg("blackout projection has no bias".into()))?;

        // Negatives are shared across rows: (n, k).
        let w_neg = w.index_select(&negatives, 0)?;
        let b_neg = b.index_select(&negatives, 0)?;
        let s_neg = h.matmul(&w_neg.t()?)?.broadcast_add(&b_neg)?;

        // Target score per row: (n, 1).
        let w_tgt = w.index_select(targets, 0)?;
        let b_tgt = b.index_select(targets, 0)?;
        let s_tgt = ((h * w_tgt)?.sum_keepdim(1)? + b_tgt.unsqueeze(1)?)?;

        let lp = ops::log_softmax(&Tensor::cat(&[&s_tgt, &s_neg], 1)?, 1)?;
        let lp_tgt = lp.narrow(1, 0, 1)?.sum_all()?;
        let log_not_neg = lp
            .narrow(1, 1, self.samples)?
            .exp()?
            .affine(-1.0, 1.0)?
            .clamp(1e-7f32, 1.0f32)?
            .log()?
            .sum_all()?;
        (lp_tgt + log_not_neg)?.neg()
    }
}

// ── Adaptive softmax ────────────────────────────────────────────────────────

/// Adaptive softmax (Grave et al.): a head over the shortlist `0..cutoffs[0]`
/// plus one logit per tail cluster; tail `i` covers `cutoffs[i]..cutoffs[i+1]`
/// and projects the hidden state down by `4^(i+1)` before its classifier.
///
/// `log p(w) = log p_head(cluster(w)) + log p_tail(w | cluster)`.
pub struct AdaptiveSoftmax {
    head: Linear,
    tails: Vec<(Linear, Linear)>,
    shortlist: usize,
}

impl AdaptiveSoftmax {
    pub fn new(n_units: usize, vocab_size: usize, cutoffs: &[usize], vb: VarBuilder) -> Result<Self> {
        let shortlist = cutoffs[0];
        let mut bounds = cutoffs.to_vec();
        bounds.push(vocab_size);
        let n_tails = bounds.len() - 1;
        let head = linear(n_units, shortlist + n_tails, true, vb.pp("head"))?;

        let mut tails = Vec::with_capacity(n_tails);
        for i in 0..n_tails {
            let size = bounds[i + 1] - bounds[i];
            let reduced = (n_units / 4usize.pow(i as u32 + 1)).max(1);
            let vb = vb.pp(format!("tail{i}"));
            let proj = linear(n_units, reduced, false, vb.pp("proj"))?;
            let out = linear(reduced, size, true, vb.pp("out"))?;
            tails.push((proj, out));
        }
        Ok(Self {
            head,
            tails,
            shortlist,
        })
    }

    pub fn log_probs(&self, h: &Tensor) -> Result<Tensor> {
        let head = ops::log_softmax(&self.head.forward(h)?, 1)?;
        let mut parts = Vec::with_capacity(self.tails.len() + 1);
        parts.push(head.narrow(1, 0, self.shortlist)?);
        for (i, (proj, out)) in self.tails.iter().enumerate() {
            let cluster = head.narrow(1, self.shortlist + i, 1)?;
            let tail = ops::log_softmax(&out.forward(&proj.forward(h)?)?, 1)?;
            parts.push(tail.broadcast_add(&cluster)?);
        }
        Tensor::cat(&parts, 1)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn build(config: &RnnLmConfig, counts: Option<&[u32]>) -> (VarMap, OutputLayer) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let emb_w = vb
            .pp("embed")
            .get_with_hints((config.vocab_size, config.n_units), "weight", PARAM_INIT)
            .unwrap();
        let embedding = Embedding::new(emb_w, config.n_units);
        let out = OutputLayer::new(config, &embedding, counts, vb.pp("output")).unwrap();
        (varmap, out)
    }

    fn hidden(n: usize, units: usize) -> Tensor {
        Tensor::randn(0f32, 1f32, (n, units), &Device::Cpu).unwrap()
    }

    #[test]
    fn adaptive_log_probs_normalise() {
        let config = RnnLmConfig {
            vocab_size: 50,
            n_units: 16,
            output: OutputKind::AdaptiveSoftmax {
                cutoffs: vec![10, 30],
            },
            ..Default::default()
        };
        let (_vm, out) = build(&config, None);
        let lp = out.log_probs(&hidden(4, 16)).unwrap();
        assert_eq!(lp.dims(), &[4, 50]);
        let totals: Vec<f32> = lp.exp().unwrap().sum(1).unwrap().to_vec1().unwrap();
        for t in totals {
            assert!((t - 1.0).abs() < 1e-4, "row sums to {t}");
        }
    }

    #[test]
    fn full_softmax_loss_matches_log_probs() {
        let config = RnnLmConfig {
            vocab_size: 12,
            n_units: 8,
            share_embedding: true,
            ..Default::default()
        };
        let (_vm, mut out) = build(&config, None);
        let h = hidden(3, 8);
        let targets = Tensor::new(&[1u32, 5, 11], &Device::Cpu).unwrap();
        let loss = out.loss(&h, &targets, true).unwrap().to_scalar::<f32>().unwrap();
        let lp: Vec<Vec<f32>> = out.log_probs(&h).unwrap().to_vec2().unwrap();
        let expected = -(lp[0][1] + lp[1][5] + lp[2][11]);
        assert!((loss - expected).abs() < 1e-4);
    }

    #[test]
    fn blackout_trains_sampled_and_evaluates_exactly() {
        let config = RnnLmConfig {
            vocab_size: 20,
            n_units: 8,
            output: OutputKind::BlackOut { samples: 5 },
            ..Default::default()
        };
        let counts: Vec<u32> = (1..=20).collect();
        let (_vm, mut out) = build(&config, Some(&counts));
        let h = hidden(6, 8);
        let targets = Tensor::new(&[0u32, 3, 7, 7, 19, 2], &Device::Cpu).unwrap();

        let sampled = out.loss(&h, &targets, true).unwrap().to_scalar::<f32>().unwrap();
        assert!(sampled.is_finite() && sampled > 0.0);

        let exact = out.loss(&h, &targets, false).unwrap().to_scalar::<f32>().unwrap();
        let lp: Vec<Vec<f32>> = out.log_probs(&h).unwrap().to_vec2().unwrap();
        let expected: f32 = [0usize, 3, 7, 7, 19, 2]
            .iter()
            .enumerate()
            .map(|(i, &t)| -lp[i][t])
            .sum();
        assert!((exact - expected).abs() < 1e-3);
    }

    #[test]
    fn blackout_negatives_follow_the_seed() {
        let config = RnnLmConfig {
            vocab_size: 40,
            n_units: 8,
            output: OutputKind::BlackOut { samples: 3 },
            ..Default::default()
        };
        let counts: Vec<u32> = (1..=40).collect();
        let (_vm, mut out) = build(&config, Some(&counts));
        let h = hidden(4, 8);
        let targets = Tensor::new(&[0u32, 9, 21, 39], &Device::Cpu).unwrap();

        let mut draw = |seed: u64| -> Vec<f32> {
            out.reseed(seed);
            (0..4)
                .map(|_| out.loss(&h, &targets, true).unwrap().to_scalar::<f32>().unwrap())
                .collect()
        };
        let first = draw(17);
        let again = draw(17);
        assert_eq!(first, again);
    }

    #[test]
    fn blackout_without_counts_is_rejected() {
        let config = RnnLmConfig {
            vocab_size: 20,
            n_units: 8,
            output: OutputKind::BlackOut { samples: 5 },
            ..Default::default()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let emb = Embedding::new(Tensor::zeros((20, 8), DType::F32, &Device::Cpu).unwrap(), 8);
        assert!(OutputLayer::new(&config, &emb, None, vb).is_err());
    }
}
