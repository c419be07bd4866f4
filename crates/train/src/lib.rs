//! # rnnlm-train — Training Loop
//!
//! Truncated-BPTT training, evaluation and checkpointing for `rnnlm-core`
//! models:
//!
//! * **[`Trainer`]** — owns model + optimiser + iterators. [`Trainer::run`]
//!   trains for a number of epochs, validates on a fixed cadence and reports
//!   test perplexity from the best checkpoint.
//! * **[`evaluate`]** — held-out perplexity on a detached model copy.
//! * **[`DecaySchedule`]** — validation-driven learning-rate decay.
//! * **[`CheckpointStore`]** — `best.safetensors`, `config.json`, `metrics.csv`.
//! * **[`OptimizerKind`]** — Adam or SGD behind the [`LearningRate`] capability.

pub mod checkpoint;
pub mod evaluator;
pub mod optimizer;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{
    CheckpointStore, ValidationRecord, BEST_CHECKPOINT, CONFIG_FILE, METRICS_FILE,
};
pub use evaluator::{evaluate, pack_steps, Evaluation};
pub use optimizer::{LearningRate, OptimizerChoice, OptimizerKind};
pub use scheduler::{DecayPolicy, DecaySchedule};
pub use trainer::{
    clip_grad_norm, RunningStat, StepMetrics, ThroughputTimer, Trainer, TrainerConfig,
    TrainingState, TrainingSummary,
};
