use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::backoff::BackoffSchedule;
use crate::entry::{AttemptError, Entry};
use crate::events::panic_message;
use crate::settings::RetryConfig;

/// Verdict for an entry at the head of the main queue.
///
/// Consulted repeatedly: after dequeue, after worker-slot acquisition, and
/// after every ticket acquisition attempt, since each waited-on step may
/// have consumed enough time to change the answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MainQueueDecision {
    ProcessNow,
    DelayFor(i64),
    FinalTimeout,
    FinalFailure,
}

/// Verdict after a failed attempt. Elided on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterAttemptDecision {
    Retry { delay_ms: i64 },
    FinalFailure,
    FinalTimeout,
}

/// Verdict for the head entry of a delay queue, consulted before and
/// potentially many times during its residence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayStepDecision {
    /// Sleep the whole remaining delay in one step.
    SleepFully,
    /// Sleep at most this long, then re-poll the decision.
    SleepStep(i64),
    /// Hand the entry to the main queue now.
    Promote,
    /// Terminate the entry (Cancelled or TimedOut per its flags).
    Drop,
}

/// Pluggable policy around every branch point of the pipeline.
///
/// Hooks are synchronous and called from the dispatcher and drainer
/// tasks; they must not block. A panicking hook is caught, reported via
/// the listener's SPI error channel, and treated as FinalFailure for the
/// entry being decided.
pub trait DecisionPolicy<I, O>: Send + Sync {
    fn main_queue_decision(
        &self,
        entry: &Entry<I, O>,
        now_ms: i64,
        has_worker: bool,
        has_ticket: bool,
    ) -> MainQueueDecision;

    fn after_attempt_decision(
        &self,
        entry: &Entry<I, O>,
        now_ms: i64,
        error: &AttemptError,
    ) -> AfterAttemptDecision;

    fn delay_queue_decision(
        &self,
        entry: &Entry<I, O>,
        now_ms: i64,
        remaining_delay_ms: i64,
    ) -> DelayStepDecision;
}

/// Default policy: retry on the configured backoff schedule, never past
/// the entry's deadline or the attempt ceiling.
#[derive(Debug, Clone)]
pub struct DefaultDecisionPolicy {
    max_attempts: u32,
    max_sleep_step_ms: i64,
    schedule: BackoffSchedule,
}

impl DefaultDecisionPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            max_sleep_step_ms: config.max_sleep_step_ms,
            schedule: BackoffSchedule::from_config(config),
        }
    }
}

impl<I, O> DecisionPolicy<I, O> for DefaultDecisionPolicy {
    fn main_queue_decision(
        &self,
        entry: &Entry<I, O>,
        now_ms: i64,
        _has_worker: bool,
        _has_ticket: bool,
    ) -> MainQueueDecision {
        if entry.remaining_validity_ms(now_ms) <= 0 {
            return MainQueueDecision::FinalTimeout;
        }
        MainQueueDecision::ProcessNow
    }

    fn after_attempt_decision(
        &self,
        entry: &Entry<I, O>,
        now_ms: i64,
        _error: &AttemptError,
    ) -> AfterAttemptDecision {
        let failures = entry.attempt_number();
        if failures >= self.max_attempts {
            return AfterAttemptDecision::FinalFailure;
        }
        let remaining = entry.remaining_validity_ms(now_ms);
        if remaining <= 0 {
            return AfterAttemptDecision::FinalTimeout;
        }
        // Cap the delay at the deadline: the retry then sits out the rest
        // of its validity and times out at promotion rather than being
        // failed early.
        let delay = self
            .schedule
            .delay_after_failure_ms(failures, now_ms)
            .min(remaining);
        AfterAttemptDecision::Retry { delay_ms: delay }
    }

    fn delay_queue_decision(
        &self,
        entry: &Entry<I, O>,
        now_ms: i64,
        remaining_delay_ms: i64,
    ) -> DelayStepDecision {
        if entry.cancellation_requested() {
            return DelayStepDecision::Drop;
        }
        if entry.remaining_validity_ms(now_ms) <= 0 {
            return DelayStepDecision::Drop;
        }
        if remaining_delay_ms <= 0 {
            return DelayStepDecision::Promote;
        }
        if remaining_delay_ms > self.max_sleep_step_ms {
            DelayStepDecision::SleepStep(self.max_sleep_step_ms)
        } else {
            DelayStepDecision::SleepFully
        }
    }
}

/// Run a policy hook, converting a panic into an error message for the
/// SPI error channel.
pub(crate) fn call_guarded<R>(hook: impl FnOnce() -> R) -> Result<R, String> {
    catch_unwind(AssertUnwindSafe(hook)).map_err(panic_message)
}
