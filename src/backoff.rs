use crate::settings::RetryConfig;

/// Retry delay schedule for a request's attempts.
///
/// Delays are indexed by the number of failed attempts so far (1-based);
/// past the end of the list the last entry repeats.
#[derive(Debug, Clone)]
pub struct BackoffSchedule {
    delays_ms: Vec<i64>,
    randomize: bool,
}

impl BackoffSchedule {
    /// `delays_ms` must be non-empty; settings validation guarantees this
    /// for configured schedules.
    pub fn new(delays_ms: Vec<i64>, randomize: bool) -> Self {
        assert!(!delays_ms.is_empty(), "backoff schedule requires at least one delay");
        Self {
            delays_ms,
            randomize,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.delays_after_failure_ms.clone(),
            config.randomize_delays,
        )
    }

    /// Delay before the next attempt, given `failures_so_far` failed
    /// attempts (>= 1) and the time of the last failure.
    ///
    /// When randomization is on, applies a deterministic pseudo-random
    /// multiplier in [1.0, 2.0) derived from the failure time and attempt
    /// count, so identical inputs always produce identical schedules.
    pub fn delay_after_failure_ms(&self, failures_so_far: u32, failure_time_ms: i64) -> i64 {
        let idx = (failures_so_far.max(1) as usize - 1).min(self.delays_ms.len() - 1);
        let mut delay = self.delays_ms[idx];
        if self.randomize {
            let mut seed = (failure_time_ms as u64) ^ ((failures_so_far as u64) << 32);
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
            let frac = ((seed >> 32) as f64) / (u32::MAX as f64); // [0,1)
            delay = (delay as f64 * (1.0 + frac)).round() as i64;
        }
        delay
    }
}
