//! Parallel sequential iterator over one flat token stream.
//!
//! The stream is split into `batch_size` equal spans of `len / batch_size`
//! tokens. One cursor starts at the head of each span and all cursors step
//! together, so column `i` of consecutive [`TimeStep`]s is a contiguous run of
//! text. Cursors read with wraparound (`(offset + iteration) % len`), which keeps
//! a cursor that leaves its span reading the text that follows it.
//!
//! An epoch is one sweep of a span: the counter increments once every
//! `len / batch_size` calls, never once per cursor.

/// One synchronised read across all cursors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeStep {
    /// Token under each cursor.
    pub current: Vec<u32>,
    /// Token one position ahead of each cursor (the prediction target).
    pub next: Vec<u32>,
}

/// Yields one [`TimeStep`] per call; see the module docs for the layout.
#[derive(Debug, Clone)]
pub struct ParallelSequentialIterator<'a> {
    tokens: &'a [u32],
    offsets: Vec<usize>,
    span: usize,
    repeat: bool,
    iteration: usize,
    epoch: usize,
    is_new_epoch: bool,
}

impl<'a> ParallelSequentialIterator<'a> {
    /// Build an iterator with `batch_size` cursors.
    ///
    /// With `repeat = false` the iterator ends after one sweep (one epoch), which
    /// is how evaluation passes consume held-out data.
    pub fn new(tokens: &'a [u32], batch_size: usize, repeat: bool) -> anyhow::Result<Self> {
        if batch_size == 0 {
            anyhow::bail!("batch size must be positive");
        }
        if tokens.len() < batch_size {
            anyhow::bail!(
                "token stream of length {} is shorter than batch size {}",
                tokens.len(),
                batch_size
            );
        }
        let span = tokens.len() / batch_size;
        let offsets = (0..batch_size).map(|i| i * span).collect();
        Ok(Self {
            tokens,
            offsets,
            span,
            repeat,
            iteration: 0,
            epoch: 0,
            is_new_epoch: false,
        })
    }

    /// Number of parallel cursors.
    pub fn batch_size(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_repeating(&self) -> bool {
        self.repeat
    }

    /// Starting position of each cursor.
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    /// Calls per epoch (`len / batch_size`).
    pub fn steps_per_epoch(&self) -> usize {
        self.span
    }

    /// Completed sweeps. Never decreases.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Whether the most recent [`advance`](Self::advance) completed an epoch.
    pub fn is_new_epoch(&self) -> bool {
        self.is_new_epoch
    }

    /// Fractional progress, e.g. `1.5` halfway through the second epoch.
    pub fn epoch_detail(&self) -> f64 {
        self.iteration as f64 / self.span as f64
    }

    /// Read the next column of tokens and step every cursor by one.
    ///
    /// Returns `None` once a non-repeating iterator has finished its sweep.
    pub fn advance(&mut self) -> Option<TimeStep> {
        if !self.repeat && self.iteration >= self.span {
            return None;
        }
        let current = self.words_at(self.iteration);
        self.iteration += 1;
        let next = self.words_at(self.iteration);

        let epoch = self.iteration / self.span;
        self.is_new_epoch = self.epoch < epoch;
        if self.is_new_epoch {
            self.epoch = epoch;
        }
        Some(TimeStep { current, next })
    }

    fn words_at(&self, iteration: usize) -> Vec<u32> {
        let len = self.tokens.len();
        self.offsets
            .iter()
            .map(|&offset| self.tokens[(offset + iteration) % len])
            .collect()
    }
}

impl Iterator for ParallelSequentialIterator<'_> {
    type Item = TimeStep;

    fn next(&mut self) -> Option<TimeStep> {
        self.advance()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(n: u32) -> Vec<u32> {
        (0..n).collect()
    }

    #[test]
    fn hundred_tokens_four_cursors() {
        let tokens = stream(100);
        let mut it = ParallelSequentialIterator::new(&tokens, 4, true).unwrap();
        assert_eq!(it.offsets(), &[0, 25, 50, 75]);

        let first = it.advance().unwrap();
        assert_eq!(first.current, vec![0, 25, 50, 75]);
        assert_eq!(first.next, vec![1, 26, 51, 76]);

        for _ in 1..24 {
            it.advance().unwrap();
            assert_eq!(it.epoch(), 0);
        }
        let last = it.advance().unwrap();
        assert_eq!(last.current, vec![24, 49, 74, 99]);
        assert_eq!(last.next, vec![25, 50, 75, 0]);
        assert_eq!(it.epoch(), 1);
        assert!(it.is_new_epoch());

        it.advance().unwrap();
        assert!(!it.is_new_epoch());
        assert_eq!(it.epoch(), 1);
    }

    #[test]
    fn epoch_increments_once_per_span_with_remainder() {
        // 103 tokens, 4 cursors: span 25, remainder 3.
        let tokens = stream(103);
        let mut it = ParallelSequentialIterator::new(&tokens, 4, true).unwrap();
        let mut increments = 0;
        for call in 1..=100 {
            it.advance().unwrap();
            if it.is_new_epoch() {
                increments += 1;
                assert_eq!(call % 25, 0);
            }
        }
        assert_eq!(increments, 4);
        assert_eq!(it.epoch(), 4);
    }

    #[test]
    fn non_repeating_stops_after_one_sweep() {
        let tokens = stream(10);
        let it = ParallelSequentialIterator::new(&tokens, 1, false).unwrap();
        let steps: Vec<TimeStep> = it.collect();
        assert_eq!(steps.len(), 10);
        assert_eq!(steps[0].current, vec![0]);
        assert_eq!(steps[9].current, vec![9]);
        assert_eq!(steps[9].next, vec![0]);
    }

    #[test]
    fn target_is_next_current() {
        let tokens = stream(37);
        let mut it = ParallelSequentialIterator::new(&tokens, 3, true).unwrap();
        let mut prev = it.advance().unwrap();
        for _ in 0..50 {
            let step = it.advance().unwrap();
            assert_eq!(prev.next, step.current);
            prev = step;
        }
    }

    #[test]
    fn rejects_stream_shorter_than_batch() {
        let tokens = stream(3);
        assert!(ParallelSequentialIterator::new(&tokens, 4, true).is_err());
        assert!(ParallelSequentialIterator::new(&tokens, 0, true).is_err());
    }
}
