//! # rnnlm-core — Model
//!
//! The recurrent language model trained by `rnnlm-train`:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`lstm`] | `LstmStack`: stacked LSTM cells with carried, truncatable state |
//! | [`output`] | `OutputLayer`: full softmax, BlackOut, adaptive softmax |
//! | [`model`] | `LanguageModel` capability and the `RnnLm` implementation |
//!
//! Everything goes through `candle-core`/`candle-nn`, so the same code runs on
//! CPU and CUDA.

pub mod lstm;
pub mod model;
pub mod output;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use lstm::LstmStack;
pub use model::{LanguageModel, RnnLm};
pub use output::{AdaptiveSoftmax, BlackOut, OutputLayer};
