use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{error, warn};

use crate::clock::Clock;
use crate::entry::{AttemptError, Entry};
use crate::events::RetryEventListener;

/// Message kinds the listener logs, each throttled independently.
#[derive(Debug, Clone, Copy)]
enum LogKind {
    AttemptFailed = 0,
    FinalFailure = 1,
    FinalTimeout = 2,
    Rejected = 3,
    SpiPanic = 4,
    ListenerPanic = 5,
    Assertion = 6,
    Unexpected = 7,
}

const KIND_COUNT: usize = 8;

/// Per-severity totals since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogStats {
    pub warnings: u64,
    pub errors: u64,
    pub suppressed: u64,
}

/// Outcome of a throttling check.
struct ThrottleVerdict {
    allowed: bool,
    /// Messages suppressed in the window that just closed; non-zero only
    /// on the first allowed message of a new window.
    rolled_over_suppressed: u32,
}

/// Event listener that forwards noteworthy pipeline events to `tracing`,
/// throttled per message kind.
///
/// The throttle state for each kind is one atomic cell packing an
/// immutable window (window id in the high half, count in the low half);
/// writers CAS in a fresh window when the current one's age exceeds the
/// throttle interval. No locks are taken on the logging path.
pub struct LoggingEventListener {
    clock: Clock,
    interval_ms: i64,
    max_per_interval: u32,
    windows: [AtomicU64; KIND_COUNT],
    warnings: AtomicU64,
    errors: AtomicU64,
    suppressed: AtomicU64,
}

impl LoggingEventListener {
    pub fn new(clock: Clock, interval_ms: i64, max_per_interval: u32) -> Self {
        Self {
            clock,
            interval_ms: interval_ms.max(1),
            max_per_interval: max_per_interval.max(1),
            windows: Default::default(),
            warnings: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Default throttle: at most 10 messages per kind per 10 seconds.
    pub fn with_defaults(clock: Clock) -> Self {
        Self::new(clock, 10_000, 10)
    }

    pub fn stats(&self) -> LogStats {
        LogStats {
            warnings: self.warnings.load(Ordering::Acquire),
            errors: self.errors.load(Ordering::Acquire),
            suppressed: self.suppressed.load(Ordering::Acquire),
        }
    }

    fn check(&self, kind: LogKind) -> ThrottleVerdict {
        let cell = &self.windows[kind as usize];
        let window_id = (self.clock.now_ms() / self.interval_ms) as u32;
        loop {
            let current = cell.load(Ordering::Acquire);
            let current_id = (current >> 32) as u32;
            let count = current as u32;
            if current_id != window_id {
                let fresh = ((window_id as u64) << 32) | 1;
                if cell
                    .compare_exchange(current, fresh, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    let rolled = count.saturating_sub(self.max_per_interval);
                    return ThrottleVerdict {
                        allowed: true,
                        rolled_over_suppressed: rolled,
                    };
                }
                continue;
            }
            let next = current + 1;
            if cell
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            return ThrottleVerdict {
                allowed: count < self.max_per_interval,
                rolled_over_suppressed: 0,
            };
        }
    }

    /// Returns true when the message should be logged; accounts for
    /// suppression either way.
    fn admit(&self, kind: LogKind, is_error: bool) -> bool {
        let verdict = self.check(kind);
        if verdict.rolled_over_suppressed > 0 {
            self.suppressed
                .fetch_add(verdict.rolled_over_suppressed as u64, Ordering::AcqRel);
            warn!(
                kind = ?kind,
                suppressed = verdict.rolled_over_suppressed,
                "log messages were suppressed by throttling"
            );
        }
        if !verdict.allowed {
            self.suppressed.fetch_add(1, Ordering::AcqRel);
            return false;
        }
        if is_error {
            self.errors.fetch_add(1, Ordering::AcqRel);
        } else {
            self.warnings.fetch_add(1, Ordering::AcqRel);
        }
        true
    }
}

impl<I, O> RetryEventListener<I, O> for LoggingEventListener {
    fn request_attempt_failed(
        &self,
        entry: &Entry<I, O>,
        error: &AttemptError,
        attempt: u32,
        duration_ms: i64,
    ) {
        if self.admit(LogKind::AttemptFailed, false) {
            warn!(
                request = %entry.id(),
                attempt,
                duration_ms,
                error = %error,
                "request attempt failed"
            );
        }
    }

    fn request_final_failure(&self, entry: &Entry<I, O>, cause: Option<&AttemptError>) {
        if self.admit(LogKind::FinalFailure, true) {
            match cause {
                Some(cause) => error!(
                    request = %entry.id(),
                    attempts = entry.attempt_number(),
                    error = %cause,
                    "request failed terminally"
                ),
                None => error!(
                    request = %entry.id(),
                    attempts = entry.attempt_number(),
                    "request failed terminally with no recorded cause"
                ),
            }
        }
    }

    fn request_final_timeout(&self, entry: &Entry<I, O>, remaining_validity_ms: i64) {
        if self.admit(LogKind::FinalTimeout, false) {
            warn!(
                request = %entry.id(),
                attempts = entry.attempt_number(),
                remaining_validity_ms,
                "request timed out"
            );
        }
    }

    fn error_request_rejected(
        &self,
        _input: &I,
        time_limit_ms: i64,
        delay_before_first_attempt_ms: i64,
        message: &str,
    ) {
        if self.admit(LogKind::Rejected, true) {
            error!(
                time_limit_ms,
                delay_before_first_attempt_ms, message, "request rejected"
            );
        }
    }

    fn error_spi_panic(&self, entry: Option<&Entry<I, O>>, message: &str) {
        if self.admit(LogKind::SpiPanic, true) {
            error!(request = ?entry.map(|e| e.id()), message, "decision policy panicked");
        }
    }

    fn error_listener_panic(&self, message: &str) {
        if self.admit(LogKind::ListenerPanic, true) {
            error!(message, "event listener panicked");
        }
    }

    fn error_assertion(&self, entry: Option<&Entry<I, O>>, message: &str) {
        if self.admit(LogKind::Assertion, true) {
            error!(request = ?entry.map(|e| e.id()), message, "internal invariant broken");
        }
    }

    fn error_unexpected(&self, message: &str) {
        if self.admit(LogKind::Unexpected, true) {
            error!(message, "unexpected runtime condition");
        }
    }
}
