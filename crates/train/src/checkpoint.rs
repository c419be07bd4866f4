//! Run directory: best checkpoint, model config and validation metrics.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;

use rnnlm_common::RnnLmConfig;
use rnnlm_core::LanguageModel;

pub const BEST_CHECKPOINT: &str = "best.safetensors";
pub const CONFIG_FILE: &str = "config.json";
pub const METRICS_FILE: &str = "metrics.csv";

const METRICS_HEADER: &str = "iteration,epoch,val_perplexity,best_perplexity,lr,improved";

/// One validation event, as written to `metrics.csv`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationRecord {
    pub iteration: usize,
    pub epoch: usize,
    pub val_perplexity: f64,
    pub best_perplexity: f64,
    pub lr: f64,
    pub improved: bool,
}

/// Files a training run keeps in its output directory.
///
/// There is exactly one checkpoint per run; each improvement overwrites it.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Create the output directory (and parents) if needed.
    pub fn create(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("cannot create output directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn best_path(&self) -> PathBuf {
        self.dir.join(BEST_CHECKPOINT)
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE)
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.dir.join(METRICS_FILE)
    }

    pub fn has_best(&self) -> bool {
        self.best_path().is_file()
    }

    /// Overwrite the best checkpoint. Writes to a sibling file first so an
    /// interrupted save never leaves a truncated checkpoint behind.
    pub fn save_best<M: LanguageModel>(&self, model: &M) -> anyhow::Result<PathBuf> {
        let path = self.best_path();
        let tmp = self.dir.join(format!("{BEST_CHECKPOINT}.tmp"));
        model
            .save(&tmp)
            .with_context(|| format!("cannot write checkpoint {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("cannot move checkpoint into {}", path.display()))?;
        Ok(path)
    }

    pub fn load_best<M: LanguageModel>(&self, model: &mut M) -> anyhow::Result<()> {
        let path = self.best_path();
        model
            .load(&path)
            .with_context(|| format!("cannot load checkpoint {}", path.display()))
    }

    pub fn save_config(&self, config: &RnnLmConfig) -> anyhow::Result<()> {
        config.save(&self.config_path())
    }

    /// Start a fresh `metrics.csv` containing only the header.
    pub fn reset_metrics(&self) -> anyhow::Result<()> {
        let path = self.metrics_path();
        let mut f = fs::File::create(&path)
            .with_context(|| format!("cannot create {}", path.display()))?;
        writeln!(f, "{METRICS_HEADER}")?;
        Ok(())
    }

    pub fn append_metrics(&self, r: &ValidationRecord) -> anyhow::Result<()> {
        let path = self.metrics_path();
        if !path.exists() {
            self.reset_metrics()?;
        }
        let mut f = OpenOptions::new()
            .append(true)
            .open(&path)
            .with_context(|| format!("cannot open {}", path.display()))?;
        writeln!(
            f,
            "{},{},{:.6},{:.6},{:.8e},{}",
            r.iteration, r.epoch, r.val_perplexity, r.best_perplexity, r.lr, r.improved
        )?;
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use rnnlm_core::RnnLm;

    #[test]
    fn creates_nested_directory() {
        let root = tempfile::tempdir().unwrap();
        let store = CheckpointStore::create(root.path().join("a/b/run")).unwrap();
        assert!(store.dir().is_dir());
        assert!(!store.has_best());
    }

    #[test]
    fn uncreatable_directory_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let file = root.path().join("not-a-dir");
        fs::write(&file, b"x").unwrap();
        assert!(CheckpointStore::create(file.join("run")).is_err());
    }

    #[test]
    fn best_checkpoint_is_overwritten_in_place() {
        let root = tempfile::tempdir().unwrap();
        let store = CheckpointStore::create(root.path()).unwrap();
        let config = RnnLmConfig {
            vocab_size: 10,
            n_units: 4,
            n_layers: 1,
            ..Default::default()
        };
        let model = RnnLm::new(&config, None, &Device::Cpu).unwrap();
        store.save_best(&model).unwrap();
        store.save_best(&model).unwrap();
        assert!(store.has_best());
        let names: Vec<_> = fs::read_dir(store.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from(BEST_CHECKPOINT)]);

        let mut other = RnnLm::new(&config, None, &Device::Cpu).unwrap();
        store.load_best(&mut other).unwrap();
    }

    #[test]
    fn metrics_rows_follow_header() {
        let root = tempfile::tempdir().unwrap();
        let store = CheckpointStore::create(root.path()).unwrap();
        store.reset_metrics().unwrap();
        store
            .append_metrics(&ValidationRecord {
                iteration: 30,
                epoch: 1,
                val_perplexity: 120.5,
                best_perplexity: 120.5,
                lr: 8.5e-4,
                improved: true,
            })
            .unwrap();
        let text = fs::read_to_string(store.metrics_path()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], METRICS_HEADER);
        assert!(lines[1].starts_with("30,1,120.500000,120.500000,"));
        assert!(lines[1].ends_with(",true"));
    }
}
