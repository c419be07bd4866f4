//! Model configuration for the recurrent language model.
//!
//! Serialised as JSON next to the checkpoint so `evaluate` can rebuild the
//! exact architecture. Every optional field has a serde default so older
//! `config.json` files keep loading.

use serde::{Deserialize, Serialize};

/// Hyper-parameters of the LSTM language model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RnnLmConfig {
    // ── Core dimensions ─────────────────────────────────────────────────────
    /// Vocabulary size (`max(train) + 1`, or the size of a supplied vocabulary).
    pub vocab_size: usize,
    /// LSTM units per layer; also the embedding width.
    #[serde(default = "default_units")]
    pub n_units: usize,
    /// Number of stacked LSTM layers.
    #[serde(default = "default_layers")]
    pub n_layers: usize,
    /// Dropout ratio applied to embeddings, between layers and before the output.
    #[serde(default = "default_dropout")]
    pub dropout: f64,

    // ── Output layer ────────────────────────────────────────────────────────
    /// Tie the output projection to the input embedding matrix.
    #[serde(default)]
    pub share_embedding: bool,
    /// Which output layer turns hidden states into a loss.
    #[serde(default)]
    pub output: OutputKind,
}

/// Output-layer strategy. The training loop only ever sees the resulting loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputKind {
    /// Exact softmax over the whole vocabulary.
    #[default]
    FullSoftmax,
    /// BlackOut: discriminative loss against negatives sampled from word counts.
    BlackOut {
        #[serde(default = "default_blackout_samples")]
        samples: usize,
    },
    /// Frequency-clustered softmax. `cutoffs` are increasing word-id boundaries;
    /// ids below the first cutoff form the head shortlist.
    AdaptiveSoftmax {
        #[serde(default = "default_cutoffs")]
        cutoffs: Vec<usize>,
    },
}

// ── Default value functions ─────────────────────────────────────────────────

fn default_units() -> usize {
    650
}
fn default_layers() -> usize {
    2
}
fn default_dropout() -> f64 {
    0.5
}
fn default_blackout_samples() -> usize {
    200
}
fn default_cutoffs() -> Vec<usize> {
    vec![2000, 10000]
}

/// Drop adaptive-softmax cutoffs that do not fall inside the vocabulary.
///
/// The default boundaries target WikiText-sized vocabularies; on PTB (10k
/// words) the `10000` boundary would leave an empty tail cluster.
pub fn fit_cutoffs(cutoffs: &[usize], vocab_size: usize) -> anyhow::Result<Vec<usize>> {
    let (kept, dropped): (Vec<usize>, Vec<usize>) =
        cutoffs.iter().copied().partition(|&c| c < vocab_size);
    if !dropped.is_empty() {
        tracing::warn!(
            ?dropped,
            vocab_size,
            "Ignoring adaptive softmax cutoffs outside the vocabulary"
        );
    }
    if kept.is_empty() {
        anyhow::bail!(
            "no adaptive softmax cutoff {:?} is below the vocabulary size {}",
            cutoffs,
            vocab_size
        );
    }
    Ok(kept)
}

// ── Impl ────────────────────────────────────────────────────────────────────

impl Default for RnnLmConfig {
    fn default() -> Self {
        Self {
            vocab_size: 10000, // PTB
            n_units: default_units(),
            n_layers: default_layers(),
            dropout: default_dropout(),
            share_embedding: false,
            output: OutputKind::FullSoftmax,
        }
    }
}

impl RnnLmConfig {
    /// Reject combinations the model cannot be built from.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.vocab_size == 0 {
            anyhow::bail!("vocab_size must be positive");
        }
        if self.n_units == 0 || self.n_layers == 0 {
            anyhow::bail!(
                "n_units ({}) and n_layers ({}) must be positive",
                self.n_units,
                self.n_layers
            );
        }
        if !(0.0..1.0).contains(&self.dropout) {
            anyhow::bail!("dropout must be in [0, 1), got {}", self.dropout);
        }
        match &self.output {
            OutputKind::FullSoftmax => {}
            OutputKind::BlackOut { samples } => {
                if *samples == 0 {
                    anyhow::bail!("blackout needs at least one negative sample");
                }
            }
            OutputKind::AdaptiveSoftmax { cutoffs } => {
                if self.share_embedding {
                    anyhow::bail!("share_embedding is not supported with adaptive softmax");
                }
                if cutoffs.is_empty() {
                    anyhow::bail!("adaptive softmax needs at least one cutoff");
                }
                let mut prev = 0;
                for &c in cutoffs {
                    if c <= prev || c >= self.vocab_size {
                        anyhow::bail!(
                            "adaptive softmax cutoffs must increase strictly inside (0, {}): {:?}",
                            self.vocab_size,
                            cutoffs
                        );
                    }
                    prev = c;
                }
            }
        }
        Ok(())
    }

    /// Save config to a JSON file.
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
