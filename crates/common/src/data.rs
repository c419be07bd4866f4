//! Corpus loading: word-level text, vocabularies and pre-tokenised token files.
//!
//! Word corpora (PTB, WikiText) are whitespace-tokenised with `<eos>` appended
//! after every line. The vocabulary assigns ids in order of first appearance in
//! the training split; validation and test words missing from it map to
//! `<unk>`.
//!
//! * **[`Vocab`]** — word → id mapping, stored as a flat JSON object.
//! * **[`Corpus`]** — the three token streams plus the vocabulary size.
//! * **[`write_tokenized_file`]** / **[`read_tokenized_file`]** — `TKN2` binary
//!   token files, read through `memmap2`.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::ValueEnum;
use memmap2::Mmap;
use serde::{Deserialize, Serialize};

pub const EOS: &str = "<eos>";
pub const UNK: &str = "<unk>";

// ── Tokenized binary format ──────────────────────────────────────────────────

/// Magic bytes for the tokenized binary format (version 2).
const TOKENIZED_MAGIC: &[u8; 4] = b"TKN2";
/// Header size: magic (4) + num_tokens (8).
const TOKENIZED_HEADER_LEN: usize = 4 + 8;

/// Write a token stream to a binary file.
///
/// Format: magic "TKN2" (4 bytes), `num_tokens` as u64 LE (8 bytes), then
/// `num_tokens` × u32 LE.
pub fn write_tokenized_file(path: &Path, token_ids: &[u32]) -> Result<()> {
    let f = File::create(path).context("create tokenized file")?;
    let mut w = BufWriter::new(f);
    w.write_all(TOKENIZED_MAGIC)?;
    w.write_all(&(token_ids.len() as u64).to_le_bytes())?;
    for &id in token_ids {
        w.write_all(&id.to_le_bytes())?;
    }
    let f = w.into_inner().context("flush tokenized file")?;
    f.sync_all().context("sync tokenized file")?;
    Ok(())
}

/// Read a `TKN2` file written by [`write_tokenized_file`].
pub fn read_tokenized_file(path: &Path) -> Result<Vec<u32>> {
    let file = File::open(path)
        .with_context(|| format!("open tokenized file {}", path.display()))?;
    let mmap = unsafe { Mmap::map(&file).context("mmap tokenized file")? };
    if mmap.len() < TOKENIZED_HEADER_LEN {
        anyhow::bail!("tokenized file too short: {}", path.display());
    }
    if &mmap[0..4] != TOKENIZED_MAGIC {
        anyhow::bail!("invalid tokenized file: bad magic in {}", path.display());
    }
    let mut count = [0u8; 8];
    count.copy_from_slice(&mmap[4..TOKENIZED_HEADER_LEN]);
    let num_tokens = usize::try_from(u64::from_le_bytes(count))
        .context("tokenized file header: token count does not fit in memory")?;
    let expected_len = num_tokens
        .checked_mul(4)
        .and_then(|n| n.checked_add(TOKENIZED_HEADER_LEN))
        .with_context(|| {
            format!(
                "tokenized file header claims {num_tokens} tokens in {}",
                path.display()
            )
        })?;
    if mmap.len() < expected_len {
        anyhow::bail!(
            "tokenized file truncated: expected {} bytes, got {}",
            expected_len,
            mmap.len()
        );
    }
    Ok(mmap[TOKENIZED_HEADER_LEN..expected_len]
        .chunks_exact(4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

// ── Vocab ───────────────────────────────────────────────────────────────────

/// Word → id mapping with dense ids `0..len`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Vocab {
    ids: HashMap<String, u32>,
    words: Vec<String>,
}

impl Vocab {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn get(&self, word: &str) -> Option<u32> {
        self.ids.get(word).copied()
    }

    /// Id of `word`, assigning the next free id if it is new.
    pub fn insert(&mut self, word: &str) -> u32 {
        if let Some(&id) = self.ids.get(word) {
            return id;
        }
        let id = self.words.len() as u32;
        self.ids.insert(word.to_string(), id);
        self.words.push(word.to_string());
        id
    }

    /// Build from an explicit mapping. Ids must be exactly `0..len`.
    pub fn from_map(map: HashMap<String, u32>) -> Result<Self> {
        let mut words = vec![None; map.len()];
        for (word, &id) in &map {
            let slot = words.get_mut(id as usize).with_context(|| {
                format!("vocabulary id {id} for {word:?} is out of range 0..{}", map.len())
            })?;
            if slot.is_some() {
                anyhow::bail!("vocabulary id {id} is assigned twice");
            }
            *slot = Some(word.clone());
        }
        let words = words.into_iter().flatten().collect();
        Ok(Self { ids: map, words })
    }

    /// Load a JSON object mapping words to ids.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("read vocabulary {}", path.display()))?;
        let map: HashMap<String, u32> = serde_json::from_str(&json)
            .with_context(|| format!("parse vocabulary {}", path.display()))?;
        Self::from_map(map)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string(&self.ids)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Read whitespace-separated words, appending `<eos>` after every line.
///
/// With `grow`, unseen words get new ids; otherwise they map to `<unk>`, which
/// must then exist in the vocabulary.
pub fn load_words(path: &Path, vocab: &mut Vocab, grow: bool) -> Result<Vec<u32>> {
    let reader = BufReader::new(
        File::open(path).with_context(|| format!("open corpus file {}", path.display()))?,
    );
    let unk = vocab.get(UNK);
    let mut ids = Vec::new();
    for line in reader.lines() {
        let line = line?;
        for word in line.split_whitespace().chain(std::iter::once(EOS)) {
            let id = match vocab.get(word) {
                Some(id) => id,
                None if grow => vocab.insert(word),
                None => unk.with_context(|| {
                    format!(
                        "word {word:?} in {} is not in the vocabulary and there is no {UNK}",
                        path.display()
                    )
                })?,
            };
            ids.push(id);
        }
    }
    tracing::debug!(path = %path.display(), tokens = ids.len(), vocab = vocab.len(), "Loaded words");
    Ok(ids)
}

/// Frequency of each id, indexed by id. Length is `max(id) + 1`.
pub fn count_words(tokens: &[u32]) -> Vec<u32> {
    let len = tokens.iter().max().map_or(0, |&m| m as usize + 1);
    let mut counts = vec![0u32; len];
    for &t in tokens {
        counts[t as usize] += 1;
    }
    counts
}

// ── Corpus ──────────────────────────────────────────────────────────────────

/// Which dataset layout to read from the data directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum DatasetKind {
    /// `ptb.{train,valid,test}.txt`
    #[serde(rename = "ptb")]
    #[value(name = "ptb")]
    Ptb,
    /// `wiki.{train,valid,test}.tokens` from WikiText-2.
    #[serde(rename = "wikitext-2")]
    #[value(name = "wikitext-2")]
    WikiText2,
    /// `wiki.{train,valid,test}.tokens` from WikiText-103.
    #[serde(rename = "wikitext-103")]
    #[value(name = "wikitext-103")]
    WikiText103,
    /// `{train,valid,test}.tokens` in `TKN2` format plus `vocab.json`.
    #[serde(rename = "tokenized")]
    #[value(name = "tokenized")]
    Tokenized,
}

impl DatasetKind {
    fn split_file(&self, dir: &Path, split: &str) -> PathBuf {
        match self {
            Self::Ptb => dir.join(format!("ptb.{split}.txt")),
            Self::WikiText2 | Self::WikiText103 => dir.join(format!("wiki.{split}.tokens")),
            Self::Tokenized => dir.join(format!("{split}.tokens")),
        }
    }
}

/// Train/validation/test token streams over one vocabulary.
#[derive(Debug, Clone)]
pub struct Corpus {
    pub train: Vec<u32>,
    pub valid: Vec<u32>,
    pub test: Vec<u32>,
    pub n_vocab: usize,
    pub vocab: Option<Vocab>,
}

impl Corpus {
    /// Load a dataset from `dir`, optionally over a precomputed vocabulary.
    pub fn load(kind: DatasetKind, dir: &Path, vocab: Option<Vocab>) -> Result<Self> {
        if kind == DatasetKind::Tokenized {
            let vocab = match vocab {
                Some(v) => v,
                None => Vocab::load(&dir.join("vocab.json"))?,
            };
            let [train, valid, test] = ["train", "valid", "test"]
                .map(|split| read_tokenized_file(&kind.split_file(dir, split)));
            return Ok(Self {
                train: train?,
                valid: valid?,
                test: test?,
                n_vocab: vocab.len(),
                vocab: Some(vocab),
            });
        }

        let supplied = vocab.is_some();
        let mut vocab = vocab.unwrap_or_default();
        let train = load_words(&kind.split_file(dir, "train"), &mut vocab, !supplied)?;
        let valid = load_words(&kind.split_file(dir, "valid"), &mut vocab, false)?;
        let test = load_words(&kind.split_file(dir, "test"), &mut vocab, false)?;

        let n_vocab = if kind == DatasetKind::Ptb && !supplied {
            train.iter().max().map_or(0, |&m| m as usize + 1)
        } else {
            vocab.len()
        };
        Ok(Self {
            train,
            valid,
            test,
            n_vocab,
            vocab: Some(vocab),
        })
    }

    /// Keep only the first `n` tokens of every split (quick-test mode).
    pub fn truncate(&mut self, n: usize) {
        self.train.truncate(n);
        self.valid.truncate(n);
        self.test.truncate(n);
    }

    /// Write all three splits and the vocabulary in the `tokenized` layout.
    pub fn write_tokenized(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create output directory {}", dir.display()))?;
        let kind = DatasetKind::Tokenized;
        write_tokenized_file(&kind.split_file(dir, "train"), &self.train)?;
        write_tokenized_file(&kind.split_file(dir, "valid"), &self.valid)?;
        write_tokenized_file(&kind.split_file(dir, "test"), &self.test)?;
        if let Some(vocab) = &self.vocab {
            vocab.save(&dir.join("vocab.json"))?;
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, text: &str) {
        std::fs::write(dir.join(name), text).unwrap();
    }

    fn ptb_fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "ptb.train.txt", " the cat sat \n the <unk> ran \n");
        write(dir.path(), "ptb.valid.txt", " the dog sat \n");
        write(dir.path(), "ptb.test.txt", " cat ran \n");
        dir
    }

    #[test]
    fn ptb_ids_follow_first_appearance() {
        let dir = ptb_fixture();
        let corpus = Corpus::load(DatasetKind::Ptb, dir.path(), None).unwrap();
        // the=0 cat=1 sat=2 <eos>=3 <unk>=4 ran=5
        assert_eq!(corpus.train, vec![0, 1, 2, 3, 0, 4, 5, 3]);
        // "dog" is unseen → <unk>
        assert_eq!(corpus.valid, vec![0, 4, 2, 3]);
        assert_eq!(corpus.test, vec![1, 5, 3]);
        assert_eq!(corpus.n_vocab, 6);
    }

    #[test]
    fn frozen_vocab_without_unk_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "wiki.train.tokens", "a b\n");
        write(dir.path(), "wiki.valid.tokens", "a c\n");
        write(dir.path(), "wiki.test.tokens", "b\n");
        let err = Corpus::load(DatasetKind::WikiText2, dir.path(), None).unwrap_err();
        assert!(err.to_string().contains("not in the vocabulary"));
    }

    #[test]
    fn tokenized_layout_round_trip() {
        let src = ptb_fixture();
        let corpus = Corpus::load(DatasetKind::Ptb, src.path(), None).unwrap();
        let out = tempfile::tempdir().unwrap();
        corpus.write_tokenized(out.path()).unwrap();

        let loaded = Corpus::load(DatasetKind::Tokenized, out.path(), None).unwrap();
        assert_eq!(loaded.train, corpus.train);
        assert_eq!(loaded.valid, corpus.valid);
        assert_eq!(loaded.test, corpus.test);
        assert_eq!(loaded.vocab, corpus.vocab);
        assert_eq!(loaded.n_vocab, 6);
    }

    #[test]
    fn truncated_token_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.tokens");
        write_tokenized_file(&path, &[1, 2, 3]).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 2]).unwrap();
        assert!(read_tokenized_file(&path).is_err());
    }

    #[test]
    fn oversized_token_count_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.tokens");
        let mut bytes = TOKENIZED_MAGIC.to_vec();
        bytes.extend_from_slice(&u64::MAX.to_le_bytes());
        bytes.extend_from_slice(&7u32.to_le_bytes());
        std::fs::write(&path, bytes).unwrap();
        assert!(read_tokenized_file(&path).is_err());
    }

    #[test]
    fn dataset_names_parse() {
        assert_eq!(DatasetKind::from_str("ptb", false).unwrap(), DatasetKind::Ptb);
        assert_eq!(
            DatasetKind::from_str("wikitext-103", false).unwrap(),
            DatasetKind::WikiText103
        );
        assert!(DatasetKind::from_str("imdb", false).is_err());
    }

    #[test]
    fn vocab_map_must_be_dense() {
        let map: HashMap<String, u32> = [("a".to_string(), 0), ("b".to_string(), 2)].into();
        assert!(Vocab::from_map(map).is_err());
    }

    #[test]
    fn counts_cover_max_id() {
        assert_eq!(count_words(&[0, 2, 2, 5]), vec![1, 0, 2, 0, 0, 1]);
        assert!(count_words(&[]).is_empty());
    }

    #[test]
    fn quick_test_truncation() {
        let dir = ptb_fixture();
        let mut corpus = Corpus::load(DatasetKind::Ptb, dir.path(), None).unwrap();
        corpus.truncate(2);
        assert_eq!(corpus.train.len(), 2);
        assert_eq!(corpus.valid.len(), 2);
        assert_eq!(corpus.test.len(), 2);
    }
}
