//! Held-out perplexity.
//!
//! Evaluation runs on a detached copy of the model so the trainer's recurrent
//! state is never touched, and on a clone of the iterator so the same held-out
//! iterator can be evaluated again later.

use indicatif::{ProgressBar, ProgressStyle};

use rnnlm_common::{collect_window, ParallelSequentialIterator};
use rnnlm_core::LanguageModel;

/// Result of one full pass over a held-out stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    /// Summed negative log-likelihood (nats).
    pub sum_loss: f64,
    /// Predicted tokens.
    pub tokens: usize,
    pub perplexity: f64,
}

/// Steps per forward call during evaluation: `batch_size * bproplen * 2`.
pub fn pack_steps(batch_size: usize, bproplen: usize) -> usize {
    batch_size * bproplen * 2
}

/// Perplexity of `model` over one sweep of a non-repeating iterator.
///
/// The stream is fed in packs of `pack_steps` steps with `normalize = 1`, plus
/// one final partial pack. Recurrent state carries across packs, so the result
/// does not depend on the pack size.
pub fn evaluate<M: LanguageModel>(
    model: &M,
    iter: &ParallelSequentialIterator<'_>,
    pack_steps: usize,
    show_progress: bool,
) -> anyhow::Result<Evaluation> {
    anyhow::ensure!(pack_steps > 0, "evaluation pack size must be positive");
    anyhow::ensure!(
        !iter.is_repeating(),
        "evaluation needs a non-repeating iterator"
    );

    let mut model = model.detached_copy()?;
    model.set_training(false);
    model.reset_state();

    let mut iter = iter.clone();
    let pb = if show_progress {
        ProgressBar::new(iter.steps_per_epoch() as u64)
    } else {
        ProgressBar::hidden()
    };
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} steps")?
            .progress_chars("=>-"),
    );

    let mut sum_loss = 0.0f64;
    let mut tokens = 0usize;
    loop {
        let (pack, _) = collect_window(&mut iter, pack_steps);
        if pack.is_empty() {
            break;
        }
        let loss = model.forward_sequence_batch(&pack, 1.0)?;
        sum_loss += loss.to_scalar::<f32>()? as f64;
        tokens += pack.num_tokens();
        pb.inc(pack.len() as u64);
        if pack.len() < pack_steps {
            break;
        }
    }
    pb.finish_and_clear();

    anyhow::ensure!(tokens > 0, "evaluation stream produced no tokens");
    let perplexity = (sum_loss / tokens as f64).exp();
    tracing::debug!(tokens, sum_loss, perplexity, "Evaluation pass complete");
    Ok(Evaluation {
        sum_loss,
        tokens,
        perplexity,
    })
}

// ── Tests ───────────────────────────────────────────────────────────────────
