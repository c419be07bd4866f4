//! # rnnlm-common — Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`RnnLmConfig`]** — model hyper-parameters (serialised as JSON).
//! * **[`Corpus`]** / **[`Vocab`]** — word-level corpus and vocabulary loading.
//! * **[`ParallelSequentialIterator`]** — parallel cursors over one token stream.
//! * **[`SequenceBatch`]** — one truncated-BPTT window of input/target rows.

pub mod batch;
pub mod config;
pub mod data;
pub mod iterator;

pub use batch::{collect_window, SequenceBatch};
pub use config::{fit_cutoffs, OutputKind, RnnLmConfig};
pub use data::{
    count_words, load_words, read_tokenized_file, write_tokenized_file, Corpus, DatasetKind,
    Vocab,
};
pub use iterator::{ParallelSequentialIterator, TimeStep};
