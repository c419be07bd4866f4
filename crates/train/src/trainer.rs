//! Trainer: the truncated-BPTT training loop.
//!
//! One outer iteration maybe resets the recurrent state, collects a
//! `bproplen`-step window, runs forward with `normalize = batch_size`, then
//! backward → truncate history → clip → optimiser update. Every
//! `log_interval` iterations the running perplexity is logged; every
//! `validation_interval` iterations the model is evaluated on held-out data,
//! the best checkpoint is refreshed and the learning rate decays.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use candle_core::{backprop::GradStore, Var};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use rnnlm_common::{collect_window, Corpus, ParallelSequentialIterator};
use rnnlm_core::LanguageModel;

use crate::checkpoint::{CheckpointStore, ValidationRecord};
use crate::evaluator::{evaluate, pack_steps};
use crate::optimizer::{OptimizerChoice, OptimizerKind};
use crate::scheduler::{DecayPolicy, DecaySchedule};

// ── Config ──────────────────────────────────────────────────────────────────

/// Training-loop knobs (CLI-level).
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub batch_size: usize,
    pub bproplen: usize,
    pub epochs: usize,
    pub grad_clip_max_norm: f64,
    pub log_interval: usize,
    pub validation_interval: usize,
    pub decay_if_fail: bool,
    /// Chance per outer iteration of zeroing the recurrent state.
    pub state_reset_prob: f64,
    pub seed: u64,
    pub output_dir: PathBuf,
    pub show_eval_progress: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            bproplen: 35,
            epochs: 39,
            grad_clip_max_norm: 5.0,
            log_interval: 500,
            validation_interval: 30_000,
            decay_if_fail: false,
            state_reset_prob: 0.01,
            seed: 0,
            output_dir: PathBuf::from("result"),
            show_eval_progress: false,
        }
    }
}

impl TrainerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.batch_size > 0, "batch size must be positive");
        anyhow::ensure!(self.bproplen > 0, "bproplen must be positive");
        anyhow::ensure!(self.log_interval > 0, "log interval must be positive");
        anyhow::ensure!(
            self.validation_interval > 0,
            "validation interval must be positive"
        );
        anyhow::ensure!(
            self.grad_clip_max_norm > 0.0,
            "gradient clip threshold must be positive"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.state_reset_prob),
            "state reset probability must be in [0, 1], got {}",
            self.state_reset_prob
        );
        Ok(())
    }
}

// ── Bookkeeping ─────────────────────────────────────────────────────────────

/// Summed loss and token count since the last report.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningStat {
    sum: f64,
    count: usize,
}

impl RunningStat {
    pub fn add(&mut self, sum: f64, count: usize) {
        self.sum += sum;
        self.count += count;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// `exp(sum / count)`; NaN when empty.
    pub fn perplexity(&self) -> f64 {
        (self.sum / self.count as f64).exp()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Counters and best-so-far bookkeeping mutated by the loop.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingState {
    pub iteration: usize,
    pub best_val_perplexity: f64,
    pub best_epoch: usize,
    /// Epoch boundaries crossed since the last validation.
    pub new_epochs: usize,
    pub lr: f64,
    /// Whether this run has written the best checkpoint. A file left in the
    /// output directory by an earlier run does not count.
    pub best_saved: bool,
}

impl TrainingState {
    pub fn new(lr: f64) -> Self {
        Self {
            iteration: 0,
            best_val_perplexity: f64::INFINITY,
            best_epoch: 0,
            new_epochs: 0,
            lr,
            best_saved: false,
        }
    }

    /// Record a validation result; returns whether it is a new best.
    pub fn record_validation(&mut self, perplexity: f64, epoch: usize) -> bool {
        if perplexity < self.best_val_perplexity {
            self.best_val_perplexity = perplexity;
            self.best_epoch = epoch;
            true
        } else {
            false
        }
    }
}

/// Iterations and wall-clock time since the last throughput report.
#[derive(Debug, Clone, Copy)]
pub struct ThroughputTimer {
    start: Instant,
    iterations: usize,
}

impl Default for ThroughputTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl ThroughputTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            iterations: 0,
        }
    }

    pub fn tick(&mut self) {
        self.iterations += 1;
    }

    pub fn started_at(&self) -> Instant {
        self.start
    }

    /// Leave `pause` out of the measured interval.
    pub fn exclude(&mut self, pause: Duration) {
        self.start += pause;
    }

    /// Iterations and seconds since the last restart; then restart.
    pub fn lap(&mut self) -> (usize, f64) {
        let secs = self.start.elapsed().as_secs_f64().max(1e-9);
        let iterations = self.iterations;
        *self = Self::new();
        (iterations, secs)
    }
}

/// Returned by [`Trainer::step`].
#[derive(Debug, Clone, Copy)]
pub struct StepMetrics {
    pub iteration: usize,
    /// Mean NLL per token over the window.
    pub loss: f64,
    /// Global gradient norm before clipping.
    pub grad_norm: f64,
    pub state_reset: bool,
}

/// Outcome of a full run.
#[derive(Debug, Clone, Copy)]
pub struct TrainingSummary {
    /// `None` when no validation ever ran.
    pub best_val_perplexity: Option<f64>,
    pub best_epoch: usize,
    pub test_perplexity: f64,
    pub iterations: usize,
    pub final_lr: f64,
}

// ── Trainer ─────────────────────────────────────────────────────────────────

/// Owns the model, optimiser, iterators and schedule for one run.
pub struct Trainer<'a, M: LanguageModel> {
    model: M,
    vars: Vec<Var>,
    optimizer: OptimizerKind,
    schedule: DecaySchedule,
    store: CheckpointStore,
    train_iter: ParallelSequentialIterator<'a>,
    val_iter: ParallelSequentialIterator<'a>,
    test_iter: ParallelSequentialIterator<'a>,
    stat: RunningStat,
    state: TrainingState,
    rng: StdRng,
    config: TrainerConfig,
}

impl<'a, M: LanguageModel> Trainer<'a, M> {
    /// Validates the configuration and creates the output directory; both
    /// failures are fatal before any training happens.
    pub fn new(
        model: M,
        corpus: &'a Corpus,
        optimizer: OptimizerChoice,
        lr: f64,
        config: TrainerConfig,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let store = CheckpointStore::create(&config.output_dir)?;
        store.reset_metrics()?;

        let train_iter = ParallelSequentialIterator::new(&corpus.train, config.batch_size, true)?;
        let val_iter = ParallelSequentialIterator::new(&corpus.valid, 1, false)?;
        let test_iter = ParallelSequentialIterator::new(&corpus.test, 1, false)?;

        let vars = model.trainable_vars();
        let total_params: usize = vars.iter().map(|v| v.elem_count()).sum();
        let optimizer = OptimizerKind::new(optimizer, vars.clone(), lr)?;
        let schedule = DecaySchedule::new(DecayPolicy::from_decay_if_fail(config.decay_if_fail));
        tracing::info!(
            total_params,
            optimizer = optimizer.name(),
            lr,
            decay = ?schedule.policy(),
            "Model and optimizer ready"
        );

        Ok(Self {
            model,
            vars,
            optimizer,
            schedule,
            store,
            train_iter,
            val_iter,
            test_iter,
            stat: RunningStat::default(),
            state: TrainingState::new(lr),
            rng: StdRng::seed_from_u64(config.seed),
            config,
        })
    }

    /// Load model parameters from a previous run before training.
    pub fn resume_from(&mut self, path: &Path) -> anyhow::Result<()> {
        self.model.load(path)?;
        tracing::info!(path = %path.display(), "Resumed model parameters");
        Ok(())
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn epoch(&self) -> usize {
        self.train_iter.epoch()
    }

    /// Loss and token count accumulated since the last train log line.
    pub fn running_stat(&self) -> &RunningStat {
        &self.stat
    }

    pub fn into_model(self) -> M {
        self.model
    }

    /// Train until the iterator has completed `epochs` sweeps, then reload the
    /// best checkpoint and report test perplexity.
    pub fn run(&mut self) -> anyhow::Result<TrainingSummary> {
        tracing::info!(
            iters_per_epoch = self.train_iter.steps_per_epoch() / self.config.bproplen,
            epochs = self.config.epochs,
            "Training start"
        );

        let mut timer = ThroughputTimer::new();
        while self.train_iter.epoch() < self.config.epochs {
            self.iterate(&mut timer)?;
        }

        self.finish()
    }

    /// One step plus the log and validation that fall due after it.
    pub fn iterate(&mut self, timer: &mut ThroughputTimer) -> anyhow::Result<()> {
        self.step()?;
        timer.tick();

        if self.state.iteration % self.config.log_interval == 0 {
            let tokens = self.stat.count();
            let (iterations, secs) = timer.lap();
            tracing::info!(
                iteration = self.state.iteration,
                epoch = format!("{:.3}", self.train_iter.epoch_detail()),
                perplexity = format!("{:.3}", self.stat.perplexity()),
                iters_per_sec = format!("{:.3}", iterations as f64 / secs),
                tokens_per_sec = format!("{:.1}", tokens as f64 / secs),
                "train"
            );
            self.stat.reset();
        }

        if self.state.iteration % self.config.validation_interval == 0 {
            let t = Instant::now();
            self.validate()?;
            timer.exclude(t.elapsed());
        }
        Ok(())
    }

    /// One outer iteration: forward, backward, truncate, clip, update.
    pub fn step(&mut self) -> anyhow::Result<StepMetrics> {
        self.state.iteration += 1;
        let state_reset = self.rng.gen::<f64>() < self.config.state_reset_prob;
        if state_reset {
            self.model.reset_state();
        }

        let (batch, new_epochs) = collect_window(&mut self.train_iter, self.config.bproplen);
        self.state.new_epochs += new_epochs;

        let normalize = self.config.batch_size as f64;
        let loss = self.model.forward_sequence_batch(&batch, normalize)?;
        let loss_val = loss.to_scalar::<f32>()? as f64;
        if !loss_val.is_finite() {
            anyhow::bail!(
                "training loss became non-finite ({loss_val}) at iteration {}",
                self.state.iteration
            );
        }
        let tokens = batch.num_tokens();
        self.stat.add(loss_val * normalize, tokens);

        let mut grads = loss.backward()?;
        self.model.truncate_history();
        let grad_norm = clip_grad_norm(&mut grads, &self.vars, self.config.grad_clip_max_norm)?;
        self.optimizer.step(&grads)?;

        Ok(StepMetrics {
            iteration: self.state.iteration,
            loss: loss_val * normalize / tokens as f64,
            grad_norm,
            state_reset,
        })
    }

    /// Evaluate on validation data, keep the best checkpoint, decay the rate.
    pub fn validate(&mut self) -> anyhow::Result<ValidationRecord> {
        let t = Instant::now();
        let eval = evaluate(
            &self.model,
            &self.val_iter,
            pack_steps(self.config.batch_size, self.config.bproplen),
            self.config.show_eval_progress,
        )?;
        let epoch = self.train_iter.epoch();
        let improved = self.state.record_validation(eval.perplexity, epoch);
        if improved {
            self.store.save_best(&self.model)?;
            self.state.best_saved = true;
        }
        tracing::info!(
            epoch,
            new_epochs = self.state.new_epochs,
            val_perplexity = format!("{:.3}", eval.perplexity),
            improved,
            secs = format!("{:.3}", t.elapsed().as_secs_f64()),
            "validation"
        );

        self.state.lr = self.schedule.apply(&mut self.optimizer, improved);
        tracing::info!(lr = format!("{:.8}", self.state.lr), "learning rate");
        self.state.new_epochs = 0;

        let record = ValidationRecord {
            iteration: self.state.iteration,
            epoch,
            val_perplexity: eval.perplexity,
            best_perplexity: self.state.best_val_perplexity,
            lr: self.state.lr,
            improved,
        };
        self.store.append_metrics(&record)?;
        Ok(record)
    }

    /// Reload the best checkpoint and evaluate on the test split.
    pub fn finish(&mut self) -> anyhow::Result<TrainingSummary> {
        if !self.state.best_saved {
            tracing::warn!("No validation improvement was recorded; saving current parameters as best");
            self.store.save_best(&self.model)?;
            self.state.best_saved = true;
        }
        let best = self
            .state
            .best_val_perplexity
            .is_finite()
            .then_some(self.state.best_val_perplexity);
        tracing::info!(
            best_epoch = self.state.best_epoch,
            val_perplexity = ?best,
            "Loading best model"
        );
        self.store.load_best(&mut self.model)?;

        let test = evaluate(
            &self.model,
            &self.test_iter,
            pack_steps(self.config.batch_size, self.config.bproplen),
            self.config.show_eval_progress,
        )?;
        tracing::info!(test_perplexity = format!("{:.3}", test.perplexity), "test");

        Ok(TrainingSummary {
            best_val_perplexity: best,
            best_epoch: self.state.best_epoch,
            test_perplexity: test.perplexity,
            iterations: self.state.iteration,
            final_lr: self.state.lr,
        })
    }
}

// ── Gradient utilities ──────────────────────────────────────────────────────

/// Rescale gradients so their global L2 norm is at most `max_norm`.
/// Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> anyhow::Result<f64> {
    let mut total = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    let norm = total.sqrt();
    if norm > max_norm {
        let scale = max_norm / norm;
        for var in vars {
            if let Some(g) = grads.remove(var.as_tensor()) {
                grads.insert(var.as_tensor(), g.affine(scale, 0.0)?);
            }
        }
    }
    Ok(norm)
}

// ── Tests ───────────────────────────────────────────────────────────────────
