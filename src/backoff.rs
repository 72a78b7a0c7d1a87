use std::time::Duration;

use rand::Rng;

/// Saturating cap on the backoff exponent. Spin iteration `n` waits a
/// pseudo-random number of base units in `[0, 2^min(n, BACKOFF_SATURATE))`.
pub const BACKOFF_SATURATE: u32 = 12;

/// One backoff base unit.
const BASE_UNIT: Duration = Duration::from_micros(1);

/// Randomized exponential backoff for try-lock spin loops.
///
/// Every `try_acquire` spin in the crate waits through one of these
/// between attempts. The counter must be reset between distinct
/// acquisitions so a fresh acquisition starts with short waits.
pub struct RandExpBackoff {
    saturate: u32,
    attempt: u32,
}

impl RandExpBackoff {
    pub fn new(saturate: u32) -> Self {
        Self {
            saturate,
            attempt: 0,
        }
    }

    /// Wait out the current step's randomized delay and advance the step.
    pub fn wait(&mut self) {
        let exp = self.attempt.min(self.saturate);
        let max_units = 1u64 << exp;
        let units = rand::thread_rng().gen_range(0..max_units);
        if units > 0 {
            std::thread::sleep(BASE_UNIT * units as u32);
        } else {
            std::thread::yield_now();
        }
        self.attempt = self.attempt.saturating_add(1);
    }

    /// Reset the step counter for a new acquisition.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    fn max_units(&self) -> u64 {
        1u64 << self.attempt.min(self.saturate)
    }
}

impl Default for RandExpBackoff {
    fn default() -> Self {
        Self::new(BACKOFF_SATURATE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponent_grows_then_saturates() {
        let mut backoff = RandExpBackoff::new(3);

        assert_eq!(backoff.max_units(), 1);
        backoff.wait();
        assert_eq!(backoff.max_units(), 2);
        backoff.wait();
        assert_eq!(backoff.max_units(), 4);
        backoff.wait();
        assert_eq!(backoff.max_units(), 8);

        // Saturated: further waits keep the same bound.
        backoff.wait();
        backoff.wait();
        assert_eq!(backoff.max_units(), 8);
    }

    #[test]
    fn test_reset_restarts_the_ramp() {
        let mut backoff = RandExpBackoff::default();
        for _ in 0..5 {
            backoff.wait();
        }
        assert!(backoff.max_units() > 1);

        backoff.reset();
        assert_eq!(backoff.max_units(), 1);
    }

    #[test]
    fn test_saturation_cap_is_contractual() {
        let mut backoff = RandExpBackoff::default();
        for _ in 0..100 {
            backoff.wait();
        }
        assert_eq!(backoff.max_units(), 1u64 << BACKOFF_SATURATE);
    }
}
