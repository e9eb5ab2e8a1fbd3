use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Millisecond wall-clock with an optional virtual-time factor.
///
/// Every timestamp and every sleep in the pipeline goes through a `Clock`
/// so that tests can compress multi-second schedules into milliseconds
/// without touching the code under test. A factor of 2.0 means virtual
/// time advances twice as fast as real time; `None` means real time.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    factor: Option<f64>,
    anchor: Instant,
    anchor_wall_ms: i64,
}

fn wall_now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as i64
}

impl Clock {
    /// Real-time clock (factor disabled).
    pub fn wall() -> Self {
        Self::new(None)
    }

    /// Clock with an optional time factor. The factor must be positive;
    /// settings validation enforces this before construction.
    pub fn new(factor: Option<f64>) -> Self {
        Self {
            factor,
            anchor: Instant::now(),
            anchor_wall_ms: wall_now_ms(),
        }
    }

    pub fn time_factor(&self) -> Option<f64> {
        self.factor
    }

    /// Current virtual wall time in epoch milliseconds.
    pub fn now_ms(&self) -> i64 {
        match self.factor {
            None => wall_now_ms(),
            Some(f) => {
                let real_ms = self.anchor.elapsed().as_secs_f64() * 1000.0;
                self.anchor_wall_ms + (real_ms * f).round() as i64
            }
        }
    }

    /// Virtual milliseconds between two real instants.
    ///
    /// Returns zero iff the endpoints are equal; otherwise rounds away
    /// from zero, so a caller can always distinguish "no time passed"
    /// from "less than one virtual unit passed".
    pub fn virtual_between(&self, start: Instant, end: Instant) -> i64 {
        if start == end {
            return 0;
        }
        let (real, sign) = match end.checked_duration_since(start) {
            Some(d) => (d, 1),
            None => (start.duration_since(end), -1),
        };
        let scaled = real.as_secs_f64() * 1000.0 * self.factor.unwrap_or(1.0);
        let ms = (scaled.ceil() as i64).max(1);
        sign * ms
    }

    /// Real sleep duration for a virtual interval.
    ///
    /// The inverse of the factor: never yields a zero duration unless the
    /// interval itself is zero (or negative), so a scheduled wakeup is
    /// never collapsed onto the current instant.
    pub fn real_duration_for_virtual(&self, virtual_ms: i64) -> Duration {
        if virtual_ms <= 0 {
            return Duration::ZERO;
        }
        let real_ms = virtual_ms as f64 / self.factor.unwrap_or(1.0);
        let dur = Duration::from_secs_f64(real_ms / 1000.0);
        dur.max(Duration::from_micros(1))
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::wall()
    }
}
