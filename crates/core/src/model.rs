//! Recurrent language model: embedding → stacked LSTM → output layer.
//!
//! [`LanguageModel`] is the capability the training loop drives; [`RnnLm`] is
//! the concrete candle implementation.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Result, Tensor, Var};
use candle_nn::{Embedding, Module, VarBuilder, VarMap};

use rnnlm_common::{RnnLmConfig, SequenceBatch};

use crate::lstm::{dropout, LstmStack, PARAM_INIT};
use crate::output::OutputLayer;

// ── Capability ──────────────────────────────────────────────────────────────

/// What the trainer and evaluator need from a stateful sequence model.
///
/// Per training window the caller runs forward → backward →
/// [`truncate_history`](Self::truncate_history) → optimiser update. After
/// truncation the model must not reference any computation from earlier
/// windows, or memory grows without bound.
pub trait LanguageModel {
    /// Summed NLL over every target in `batch`, divided by `normalize`.
    /// Recurrent state carries over from the previous call.
    fn forward_sequence_batch(&mut self, batch: &SequenceBatch, normalize: f64) -> Result<Tensor>;

    /// Zero the recurrent state.
    fn reset_state(&mut self);

    /// Keep the recurrent state values but drop their history.
    fn truncate_history(&mut self);

    /// Independent model sharing parameter values but no recurrent state and
    /// no autodiff graph. The copy exposes no trainable variables.
    fn detached_copy(&self) -> Result<Self>
    where
        Self: Sized;

    /// Toggle training behaviour (dropout, sampled losses).
    fn set_training(&mut self, training: bool);

    fn trainable_vars(&self) -> Vec<Var>;

    /// Write parameters to a safetensors file.
    fn save(&self, path: &Path) -> Result<()>;

    /// Overwrite parameters from a safetensors file.
    fn load(&mut self, path: &Path) -> Result<()>;

    fn device(&self) -> &Device;
}

// ── Parameters ──────────────────────────────────────────────────────────────

enum Params {
    /// Owned, trainable variables.
    Trainable(VarMap),
    /// Graph-free views of another model's variables.
    Frozen(HashMap<String, Tensor>),
}

impl Params {
    fn detached_tensors(&self) -> Result<HashMap<String, Tensor>> {
        match self {
            Self::Trainable(varmap) => {
                let data = varmap
                    .data()
                    .lock()
                    .map_err(|_| candle_core::Error::Msg("parameter map lock poisoned".into()))?;
                Ok(data
                    .iter()
                    .map(|(name, var)| (name.clone(), var.as_tensor().detach()))
                    .collect())
            }
            Self::Frozen(tensors) => Ok(tensors.clone()),
        }
    }
}

// ── RnnLm ───────────────────────────────────────────────────────────────────

/// LSTM language model.
///
/// Hidden states of every time step are concatenated time-major before the
/// output layer, so row `k * batch + i` predicts `batch.targets[k][i]`.
pub struct RnnLm {
    embed: Embedding,
    encoder: LstmStack,
    output: OutputLayer,
    params: Params,
    config: RnnLmConfig,
    counts: Option<Vec<u32>>,
    device: Device,
    training: bool,
}

impl RnnLm {
    /// Fresh, randomly initialised model. `counts` (word frequencies indexed by
    /// id) is needed only by the BlackOut output.
    pub fn new(config: &RnnLmConfig, counts: Option<&[u32]>, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = Self::build(config, counts, vb, Params::Trainable(varmap), device)?;
        tracing::debug!(
            params = model.num_parameters(),
            layers = config.n_layers,
            units = config.n_units,
            "RnnLm initialised"
        );
        Ok(model)
    }

    fn build(
        config: &RnnLmConfig,
        counts: Option<&[u32]>,
        vb: VarBuilder,
        params: Params,
        device: &Device,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        let embed_w =
            vb.pp("embed")
                .get_with_hints((config.vocab_size, config.n_units), "weight", PARAM_INIT)?;
        let embed = Embedding::new(embed_w, config.n_units);
        let encoder = LstmStack::new(
            config.n_units,
            config.n_layers,
            config.dropout,
            vb.pp("lstm"),
        )?;
        let output = OutputLayer::new(config, &embed, counts, vb.pp("output"))?;
        Ok(Self {
            embed,
            encoder,
            output,
            params,
            config: config.clone(),
            counts: counts.map(<[u32]>::to_vec),
            device: device.clone(),
            training: true,
        })
    }

    pub fn config(&self) -> &RnnLmConfig {
        &self.config
    }

    /// Restart the BlackOut negative sampler so sampled losses are
    /// reproducible for a given seed.
    pub fn reseed_sampler(&mut self, seed: u64) {
        self.output.reseed(seed);
    }

    /// Number of scalar parameters (tied weights counted once).
    pub fn num_parameters(&self) -> usize {
        match &self.params {
            Params::Trainable(varmap) => varmap.all_vars().iter().map(|v| v.elem_count()).sum(),
            Params::Frozen(tensors) => tensors.values().map(Tensor::elem_count).sum(),
        }
    }

    /// Run the encoder over the window; returns `(len * batch, n_units)`.
    fn encode(&mut self, batch: &SequenceBatch) -> Result<Tensor> {
        let p = self.config.dropout as f32;
        let mut hs = Vec::with_capacity(batch.len());
        for x in batch.input_tensors(&self.device)? {
            let e = dropout(&self.embed.forward(&x)?, p, self.training)?;
            hs.push(self.encoder.step(&e, self.training)?);
        }
        Tensor::cat(&hs, 0)
    }
}

impl LanguageModel for RnnLm {
    fn forward_sequence_batch(&mut self, batch: &SequenceBatch, normalize: f64) -> Result<Tensor> {
        if batch.is_empty() {
            return Tensor::new(0f32, &self.device);
        }
        let h = self.encode(batch)?;
        let h = dropout(&h, self.config.dropout as f32, self.training)?;
        let targets = batch.target_tensor(&self.device)?;
        self.output
            .loss(&h, &targets, self.training)?
            .affine(1.0 / normalize, 0.0)
    }

    fn reset_state(&mut self) {
        self.encoder.reset_state();
    }

    fn truncate_history(&mut self) {
        self.encoder.detach_state();
    }

    fn detached_copy(&self) -> Result<Self> {
        let tensors = self.params.detached_tensors()?;
        let vb = VarBuilder::from_tensors(tensors.clone(), DType::F32, &self.device);
        let mut copy = Self::build(
            &self.config,
            self.counts.as_deref(),
            vb,
            Params::Frozen(tensors),
            &self.device,
        )?;
        copy.encoder.set_states(self.encoder.detached_states());
        copy.training = self.training;
        Ok(copy)
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn trainable_vars(&self) -> Vec<Var> {
        match &self.params {
            Params::Trainable(varmap) => varmap.all_vars(),
            Params::Frozen(_) => Vec::new(),
        }
    }

    fn save(&self, path: &Path) -> Result<()> {
        match &self.params {
            Params::Trainable(varmap) => varmap.save(path),
            Params::Frozen(tensors) => candle_core::safetensors::save(tensors, path),
        }
    }

    fn load(&mut self, path: &Path) -> Result<()> {
        match &mut self.params {
            Params::Trainable(varmap) => varmap.load(path),
            Params::Frozen(_) => Err(candle_core::Error::Msg(
                "cannot load parameters into a detached copy".into(),
            )),
        }
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
