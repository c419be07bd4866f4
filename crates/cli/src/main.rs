use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

use rnnlm_common::{
    count_words, fit_cutoffs, Corpus, DatasetKind, OutputKind, ParallelSequentialIterator,
    RnnLmConfig, Vocab,
};
use rnnlm_core::{LanguageModel, RnnLm};
use rnnlm_train::{
    evaluate, CheckpointStore, OptimizerChoice, Trainer, TrainerConfig, BEST_CHECKPOINT,
    CONFIG_FILE,
};

/// Tokens kept per split with `--test`.
const QUICK_TEST_TOKENS: usize = 100;

#[derive(Parser, Debug)]
#[command(name = "rnnlm", about = "Word-level LSTM language model training")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train an LSTM language model with truncated BPTT.
    Train(TrainArgs),
    /// Report perplexity of a saved model on one split.
    Evaluate(EvaluateArgs),
    /// Convert a word-level dataset into binary token files plus vocab.json.
    Tokenize(TokenizeArgs),
}

// ── Train ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug, Serialize)]
struct TrainArgs {
    /// Number of parallel sequences in each mini-batch.
    #[arg(long = "batchsize", short = 'b', default_value_t = 20)]
    batchsize: usize,
    /// Words per mini-batch row (truncated BPTT length).
    #[arg(long, short = 'l', default_value_t = 35)]
    bproplen: usize,
    /// Number of sweeps over the training data.
    #[arg(long, short = 'e', default_value_t = 39)]
    epoch: usize,
    /// GPU id (negative runs on CPU).
    #[arg(long, short = 'g', default_value_t = -1, allow_negative_numbers = true)]
    gpu: i32,
    /// Gradient norm threshold.
    #[arg(long, short = 'c', default_value_t = 5.0)]
    gradclip: f64,
    /// Output directory.
    #[arg(long, short = 'o', default_value = "result")]
    out: PathBuf,
    /// Load model parameters from this checkpoint before training.
    #[arg(long, short = 'r')]
    resume: Option<PathBuf>,
    /// Use tiny datasets for quick tests.
    #[arg(long)]
    test: bool,
    /// LSTM units per layer.
    #[arg(long, short = 'u', default_value_t = 650)]
    unit: usize,
    #[arg(long, default_value_t = 2)]
    layer: usize,
    #[arg(long, default_value_t = 0.5)]
    dropout: f64,
    #[arg(long)]
    share_embedding: bool,
    #[arg(long, conflicts_with = "adaptive_softmax")]
    blackout: bool,
    #[arg(long)]
    adaptive_softmax: bool,
    /// Negatives drawn per window for BlackOut.
    #[arg(long, default_value_t = 200)]
    blackout_samples: usize,
    /// Adaptive-softmax cluster boundaries; those not below the vocabulary
    /// size are dropped.
    #[arg(long, value_delimiter = ',', default_value = "2000,10000")]
    adaptive_cutoffs: Vec<usize>,
    #[arg(long, value_enum, default_value_t = DatasetKind::Ptb)]
    dataset: DatasetKind,
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,
    /// JSON word → id mapping to use instead of growing one from train.
    #[arg(long)]
    vocab: Option<PathBuf>,
    #[arg(long, default_value_t = 500)]
    log_interval: usize,
    #[arg(long, visible_alias = "val-interval", default_value_t = 30000)]
    validation_interval: usize,
    /// Halve the learning rate only when validation fails to improve.
    #[arg(long)]
    decay_if_fail: bool,
    #[arg(long, value_enum, default_value_t = OptimizerChoice::Adam)]
    optimizer: OptimizerChoice,
    /// Initial learning rate (Adam alpha 1e-3, SGD 1.0 when omitted).
    #[arg(long)]
    lr: Option<f64>,
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Chance per iteration of zeroing the recurrent state.
    #[arg(long, default_value_t = 0.01)]
    state_reset_prob: f64,
    /// Show a progress bar during evaluation passes.
    #[arg(long)]
    eval_progress: bool,
}

// ── Evaluate ───────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct EvaluateArgs {
    /// Directory written by `train` (config.json, best.safetensors).
    #[arg(long)]
    model_dir: PathBuf,
    /// Checkpoint to load; defaults to the best checkpoint in `model_dir`.
    #[arg(long)]
    checkpoint: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = DatasetKind::Ptb)]
    dataset: DatasetKind,
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,
    /// Vocabulary; defaults to `model_dir/vocab.json` when present.
    #[arg(long)]
    vocab: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = Split::Test)]
    split: Split,
    /// Steps per forward call.
    #[arg(long, default_value_t = 1400)]
    pack_steps: usize,
    #[arg(long, short = 'g', default_value_t = -1, allow_negative_numbers = true)]
    gpu: i32,
    #[arg(long)]
    test: bool,
    #[arg(long)]
    eval_progress: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Split {
    Valid,
    Test,
}

impl Split {
    fn name(self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Test => "test",
        }
    }
}

// ── Tokenize ───────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct TokenizeArgs {
    /// Word-level dataset to convert (`tokenized` is rejected).
    #[arg(long, value_enum, default_value_t = DatasetKind::Ptb)]
    dataset: DatasetKind,
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,
    #[arg(long)]
    vocab: Option<PathBuf>,
    #[arg(long)]
    output: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Train(args) => cmd_train(args),
        Command::Evaluate(args) => cmd_evaluate(args),
        Command::Tokenize(args) => cmd_tokenize(args),
    }
}

// ── Command implementations ────────────────────────────────────────────────────

fn cmd_train(args: TrainArgs) -> Result<()> {
    tracing::info!(
        options = %serde_json::to_string_pretty(&args)?,
        "Resolved options"
    );
    let store = CheckpointStore::create(&args.out)?;

    let vocab = args.vocab.as_deref().map(Vocab::load).transpose()?;
    let mut corpus = Corpus::load(args.dataset, &args.data_dir, vocab)?;
    if args.test {
        corpus.truncate(QUICK_TEST_TOKENS);
    }
    log_corpus(&corpus);

    let output = if args.blackout {
        OutputKind::BlackOut {
            samples: args.blackout_samples,
        }
    } else if args.adaptive_softmax {
        OutputKind::AdaptiveSoftmax {
            cutoffs: fit_cutoffs(&args.adaptive_cutoffs, corpus.n_vocab)?,
        }
    } else {
        OutputKind::FullSoftmax
    };
    let config = RnnLmConfig {
        vocab_size: corpus.n_vocab,
        n_units: args.unit,
        n_layers: args.layer,
        dropout: args.dropout,
        share_embedding: args.share_embedding,
        output,
    };
    config.validate()?;
    let counts = blackout_counts(&config, &corpus)?;

    store.save_config(&config)?;
    if let Some(vocab) = &corpus.vocab {
        vocab.save(&store.dir().join("vocab.json"))?;
    }

    let device = select_device(args.gpu)?;
    let mut model = RnnLm::new(&config, counts.as_deref(), &device)?;
    model.reseed_sampler(args.seed);
    let choice = args.optimizer;
    let lr = args.lr.unwrap_or_else(|| choice.default_rate());

    let trainer_config = TrainerConfig {
        batch_size: args.batchsize,
        bproplen: args.bproplen,
        epochs: args.epoch,
        grad_clip_max_norm: args.gradclip,
        log_interval: args.log_interval,
        validation_interval: args.validation_interval,
        decay_if_fail: args.decay_if_fail,
        state_reset_prob: args.state_reset_prob,
        seed: args.seed,
        output_dir: args.out.clone(),
        show_eval_progress: args.eval_progress,
    };
    let mut trainer = Trainer::new(model, &corpus, choice, lr, trainer_config)?;
    if let Some(path) = &args.resume {
        trainer.resume_from(path)?;
    }

    let summary = trainer.run()?;
    tracing::info!(
        best_epoch = summary.best_epoch,
        best_val_perplexity = ?summary.best_val_perplexity,
        test_perplexity = summary.test_perplexity,
        iterations = summary.iterations,
        final_lr = summary.final_lr,
        "Training finished"
    );
    Ok(())
}

fn cmd_evaluate(args: EvaluateArgs) -> Result<()> {
    let config = RnnLmConfig::load(&args.model_dir.join(CONFIG_FILE))?;
    config.validate()?;

    let vocab_path = args.vocab.clone().or_else(|| {
        let p = args.model_dir.join("vocab.json");
        p.is_file().then_some(p)
    });
    let vocab = vocab_path.as_deref().map(Vocab::load).transpose()?;
    let mut corpus = Corpus::load(args.dataset, &args.data_dir, vocab)?;
    if args.test {
        corpus.truncate(QUICK_TEST_TOKENS);
    }
    anyhow::ensure!(
        corpus.n_vocab <= config.vocab_size,
        "corpus vocabulary ({}) is larger than the model's ({})",
        corpus.n_vocab,
        config.vocab_size
    );
    // The sampler is unused at inference; counts only need the right length.
    let counts = matches!(config.output, OutputKind::BlackOut { .. }).then(|| {
        let mut counts = count_words(&corpus.train);
        counts.resize(config.vocab_size, 0);
        counts
    });

    let device = select_device(args.gpu)?;
    let mut model = RnnLm::new(&config, counts.as_deref(), &device)?;
    let checkpoint = args
        .checkpoint
        .clone()
        .unwrap_or_else(|| args.model_dir.join(BEST_CHECKPOINT));
    model
        .load(&checkpoint)
        .with_context(|| format!("cannot load checkpoint {}", checkpoint.display()))?;

    let tokens = match args.split {
        Split::Valid => &corpus.valid,
        Split::Test => &corpus.test,
    };
    let iter = ParallelSequentialIterator::new(tokens, 1, false)?;
    let eval = evaluate(&model, &iter, args.pack_steps, args.eval_progress)?;
    tracing::info!(
        split = args.split.name(),
        tokens = eval.tokens,
        perplexity = format!("{:.3}", eval.perplexity),
        "Evaluation"
    );
    println!("{} perplexity: {}", args.split.name(), eval.perplexity);
    Ok(())
}

fn cmd_tokenize(args: TokenizeArgs) -> Result<()> {
    let vocab = args.vocab.as_deref().map(Vocab::load).transpose()?;
    anyhow::ensure!(
        args.dataset != DatasetKind::Tokenized,
        "dataset is already tokenized"
    );
    let corpus = Corpus::load(args.dataset, &args.data_dir, vocab)?;
    log_corpus(&corpus);
    corpus.write_tokenized(&args.output)?;
    tracing::info!(output = %args.output.display(), "Wrote tokenized dataset");
    Ok(())
}

// ── Helpers ────────────────────────────────────────────────────────────────────

fn select_device(gpu: i32) -> Result<Device> {
    if gpu < 0 {
        return Ok(Device::Cpu);
    }
    Device::new_cuda(gpu as usize).with_context(|| format!("cannot open CUDA device {gpu}"))
}

fn log_corpus(corpus: &Corpus) {
    tracing::info!(
        train_tokens = corpus.train.len(),
        valid_tokens = corpus.valid.len(),
        test_tokens = corpus.test.len(),
        n_vocab = corpus.n_vocab,
        "Corpus loaded"
    );
}

/// Word counts over train, for the BlackOut sampler.
fn blackout_counts(config: &RnnLmConfig, corpus: &Corpus) -> Result<Option<Vec<u32>>> {
    if !matches!(config.output, OutputKind::BlackOut { .. }) {
        return Ok(None);
    }
    let counts = count_words(&corpus.train);
    anyhow::ensure!(
        counts.len() == config.vocab_size,
        "word-count table has {} entries but the vocabulary has {}",
        counts.len(),
        config.vocab_size
    );
    Ok(Some(counts))
}
