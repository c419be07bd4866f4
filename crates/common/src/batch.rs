//! Truncated-BPTT window assembly.
//!
//! A [`SequenceBatch`] is `bproplen` consecutive [`TimeStep`]s transposed into
//! two time-major lists of rows: `inputs[k]` and `targets[k]` each hold one
//! token per cursor. Because every step's target column is the next step's
//! input column, `targets[k] == inputs[k + 1]` inside a window.

use candle_core::{Device, Result, Tensor};

use crate::iterator::{ParallelSequentialIterator, TimeStep};

/// Input/target rows for one truncated-BPTT window, time-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceBatch {
    pub inputs: Vec<Vec<u32>>,
    pub targets: Vec<Vec<u32>>,
}

impl SequenceBatch {
    /// Transpose a run of time steps. Pure; the steps are left untouched.
    pub fn from_steps(steps: &[TimeStep]) -> Self {
        let inputs = steps.iter().map(|s| s.current.clone()).collect();
        let targets = steps.iter().map(|s| s.next.clone()).collect();
        Self { inputs, targets }
    }

    /// Number of time steps in the window.
    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Cursors per step (0 for an empty window).
    pub fn batch_size(&self) -> usize {
        self.inputs.first().map_or(0, Vec::len)
    }

    /// Total target tokens in the window.
    pub fn num_tokens(&self) -> usize {
        self.targets.iter().map(Vec::len).sum()
    }

    /// One `(batch,)` u32 tensor per time step for the inputs.
    pub fn input_tensors(&self, device: &Device) -> Result<Vec<Tensor>> {
        self.inputs
            .iter()
            .map(|row| Tensor::new(row.as_slice(), device))
            .collect()
    }

    /// All targets flattened time-major into one `(len * batch,)` u32 tensor,
    /// matching the row order of concatenated per-step hidden states.
    pub fn target_tensor(&self, device: &Device) -> Result<Tensor> {
        let flat: Vec<u32> = self.targets.iter().flatten().copied().collect();
        Tensor::new(flat.as_slice(), device)
    }
}

/// Pull up to `bproplen` steps from `iter` into one window.
///
/// Also returns how many epoch boundaries were crossed while collecting. The
/// window is shorter than `bproplen` only when a non-repeating iterator runs
/// dry.
pub fn collect_window(
    iter: &mut ParallelSequentialIterator<'_>,
    bproplen: usize,
) -> (SequenceBatch, usize) {
    let mut steps = Vec::with_capacity(bproplen);
    let mut new_epochs = 0;
    for _ in 0..bproplen {
        match iter.advance() {
            Some(step) => {
                new_epochs += usize::from(iter.is_new_epoch());
                steps.push(step);
            }
            None => break,
        }
    }
    (SequenceBatch::from_steps(&steps), new_epochs)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_are_inputs_shifted_by_one() {
        let tokens: Vec<u32> = (0..200).map(|i| (i * 7 % 31) as u32).collect();
        let mut it = ParallelSequentialIterator::new(&tokens, 5, true).unwrap();
        for bproplen in [1usize, 2, 35] {
            let (batch, _) = collect_window(&mut it, bproplen);
            assert_eq!(batch.len(), bproplen);
            assert_eq!(batch.batch_size(), 5);
            for k in 0..batch.len() - 1 {
                assert_eq!(batch.targets[k], batch.inputs[k + 1]);
            }
        }
    }

    #[test]
    fn window_counts_epoch_boundaries() {
        let tokens: Vec<u32> = (0..20).collect();
        let mut it = ParallelSequentialIterator::new(&tokens, 2, true).unwrap();
        let (_, crossed) = collect_window(&mut it, 9);
        assert_eq!(crossed, 0);
        let (_, crossed) = collect_window(&mut it, 25);
        assert_eq!(crossed, 3);
        assert_eq!(it.epoch(), 3);
    }

    #[test]
    fn short_final_window_when_not_repeating() {
        let tokens: Vec<u32> = (0..10).collect();
        let mut it = ParallelSequentialIterator::new(&tokens, 1, false).unwrap();
        let (full, _) = collect_window(&mut it, 7);
        let (rest, _) = collect_window(&mut it, 7);
        let (empty, _) = collect_window(&mut it, 7);
        assert_eq!(full.len(), 7);
        assert_eq!(rest.len(), 3);
        assert!(empty.is_empty());
        assert_eq!(full.num_tokens() + rest.num_tokens(), 10);
    }

    #[test]
    fn target_tensor_is_time_major() {
        let batch = SequenceBatch {
            inputs: vec![vec![1, 2], vec![3, 4]],
            targets: vec![vec![3, 4], vec![5, 6]],
        };
        let t = batch.target_tensor(&Device::Cpu).unwrap();
        assert_eq!(t.to_vec1::<u32>().unwrap(), vec![3, 4, 5, 6]);
        let xs = batch.input_tensors(&Device::Cpu).unwrap();
        assert_eq!(xs.len(), 2);
        assert_eq!(xs[1].to_vec1::<u32>().unwrap(), vec![3, 4]);
    }
}
