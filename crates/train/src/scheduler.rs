//! Validation-driven learning-rate decay.

use crate::optimizer::LearningRate;

/// Multiplier applied after every validation event under [`DecayPolicy::Steady`].
pub const STEADY_DECAY: f64 = 0.85;
/// Multiplier applied after a non-improving validation under [`DecayPolicy::OnFailure`].
pub const FAILURE_DECAY: f64 = 0.5;
/// The rate never decays below this.
pub const MIN_RATE: f64 = 1e-7;

// ── Policy ──────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecayPolicy {
    /// ×0.85 after every validation, improving or not.
    Steady,
    /// ×0.5 only when validation fails to improve; unchanged otherwise.
    OnFailure,
}

impl DecayPolicy {
    pub fn from_decay_if_fail(decay_if_fail: bool) -> Self {
        if decay_if_fail {
            Self::OnFailure
        } else {
            Self::Steady
        }
    }
}

// ── DecaySchedule ───────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug)]
pub struct DecaySchedule {
    policy: DecayPolicy,
}

impl DecaySchedule {
    pub fn new(policy: DecayPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> DecayPolicy {
        self.policy
    }

    /// Rate to use after a validation event with the given outcome.
    pub fn next_rate(&self, rate: f64, improved: bool) -> f64 {
        let factor = match (self.policy, improved) {
            (DecayPolicy::Steady, _) => STEADY_DECAY,
            (DecayPolicy::OnFailure, false) => FAILURE_DECAY,
            (DecayPolicy::OnFailure, true) => return rate,
        };
        (rate * factor).max(MIN_RATE)
    }

    /// Apply the decay to an optimiser; returns the new rate.
    pub fn apply<O: LearningRate + ?Sized>(&self, optimizer: &mut O, improved: bool) -> f64 {
        let rate = self.next_rate(optimizer.rate(), improved);
        optimizer.set_rate(rate);
        rate
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(f64);

    impl LearningRate for Fixed {
        fn rate(&self) -> f64 {
            self.0
        }
        fn set_rate(&mut self, rate: f64) {
            self.0 = rate;
        }
    }

    #[test]
    fn steady_decay_ignores_outcome() {
        let sched = DecaySchedule::new(DecayPolicy::Steady);
        let mut opt = Fixed(1e-3);
        for improved in [true, false, true] {
            sched.apply(&mut opt, improved);
        }
        // 1e-3 * 0.85^3
        assert!((opt.rate() - 6.141_25e-4).abs() < 1e-10);
    }

    #[test]
    fn decay_if_fail_halves_only_on_failure() {
        let sched = DecaySchedule::new(DecayPolicy::from_decay_if_fail(true));
        let mut opt = Fixed(1e-3);
        sched.apply(&mut opt, true);
        assert_eq!(opt.rate(), 1e-3);
        sched.apply(&mut opt, false);
        sched.apply(&mut opt, false);
        assert!((opt.rate() - 2.5e-4).abs() < 1e-12);
    }

    #[test]
    fn rate_is_monotone_and_floored() {
        for policy in [DecayPolicy::Steady, DecayPolicy::OnFailure] {
            let sched = DecaySchedule::new(policy);
            let mut rate = 1e-3;
            for _ in 0..200 {
                let next = sched.next_rate(rate, false);
                assert!(next <= rate);
                assert!(next >= MIN_RATE);
                rate = next;
            }
            assert_eq!(rate, MIN_RATE);
        }
    }
}
