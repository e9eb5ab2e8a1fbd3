use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::error;

use crate::entry::{AttemptError, Entry};
use crate::policy::{AfterAttemptDecision, DelayStepDecision, MainQueueDecision};

/// Notification callbacks invoked synchronously by every pipeline stage.
///
/// Implementations must not block for long; they run on the emitting
/// stage's task. Panics raised by a listener are caught by the pipeline,
/// reported through [`error_listener_panic`](Self::error_listener_panic)
/// and `tracing`, and never propagate.
///
/// For a single entry, notifications are totally ordered:
/// `request_added` precedes all per-attempt events, which precede the
/// final event, which precedes `request_removed`.
#[allow(unused_variables)]
pub trait RetryEventListener<I, O>: Send + Sync {
    /// Entry accepted into processing.
    fn request_added(&self, entry: &Entry<I, O>) {}

    /// An attempt is about to run.
    fn request_executing(&self, entry: &Entry<I, O>, attempt: u32, remaining_validity_ms: i64) {}

    /// Request succeeded.
    fn request_success(&self, entry: &Entry<I, O>, result: &O, attempt: u32, duration_ms: i64) {}

    /// An attempt failed (the request may still be retried).
    fn request_attempt_failed(
        &self,
        entry: &Entry<I, O>,
        error: &AttemptError,
        attempt: u32,
        duration_ms: i64,
    ) {
    }

    /// Policy verdict after a failed attempt.
    fn request_attempt_failed_decision(&self, entry: &Entry<I, O>, decision: &AfterAttemptDecision) {
    }

    /// Request ended in terminal failure. `cause` is absent when policy
    /// decided FinalFailure with no recorded attempt error; that is a
    /// normal outcome, not an assertion failure.
    fn request_final_failure(&self, entry: &Entry<I, O>, cause: Option<&AttemptError>) {}

    /// Request ran out of validity. `remaining_validity_ms` is usually
    /// zero or negative at this point.
    fn request_final_timeout(&self, entry: &Entry<I, O>, remaining_validity_ms: i64) {}

    /// Entry left processing, whatever the reason. Emitted exactly once
    /// per entry, after the terminal event.
    fn request_removed(&self, entry: &Entry<I, O>) {}

    // Stage diagnostics.

    /// A main-queue decision was made; potentially several per entry, one
    /// after each step that may have taken time.
    fn main_queue_processing_decision(
        &self,
        entry: &Entry<I, O>,
        decision: &MainQueueDecision,
        processing_since_ms: i64,
    ) {
    }

    /// A worker slot was obtained for the entry.
    fn main_queue_thread_obtained(
        &self,
        entry: &Entry<I, O>,
        processing_since_ms: i64,
        time_taken_ms: i64,
    ) {
    }

    /// A ticket acquisition attempt finished.
    fn main_queue_ticket_obtain_attempt(
        &self,
        entry: &Entry<I, O>,
        processing_since_ms: i64,
        obtained: bool,
        time_taken_ms: i64,
    ) {
    }

    /// The dispatcher finished its handling of the entry (either handed it
    /// to a worker or routed it elsewhere).
    fn main_queue_processing_completed(
        &self,
        entry: &Entry<I, O>,
        processing_since_ms: i64,
        time_taken_ms: i64,
    ) {
    }

    /// A delay-queue drainer is about to decide what to do with its head
    /// entry.
    fn delay_queue_item_before_delay_step(
        &self,
        entry: &Entry<I, O>,
        queue_delay_ms: i64,
        remaining_delay_ms: i64,
    ) {
    }

    /// A delay-queue drainer applied a decision for a single step.
    fn delay_queue_decision_after_delay_step(
        &self,
        entry: &Entry<I, O>,
        queue_delay_ms: i64,
        decision: &DelayStepDecision,
        slept_for_ms: i64,
        remaining_delay_ms: i64,
    ) {
    }

    // Error channels. These never feed back into the pipeline.

    /// Broken internal invariant.
    fn error_assertion(&self, entry: Option<&Entry<I, O>>, message: &str) {}

    /// A submission was refused (back-pressure or invalid schedule).
    fn error_request_rejected(
        &self,
        input: &I,
        time_limit_ms: i64,
        delay_before_first_attempt_ms: i64,
        message: &str,
    ) {
    }

    /// A decision-policy hook panicked.
    fn error_spi_panic(&self, entry: Option<&Entry<I, O>>, message: &str) {}

    /// A listener callback panicked.
    fn error_listener_panic(&self, message: &str) {}

    /// Unexpected runtime condition (e.g. an internal channel closed while
    /// the service was running).
    fn error_unexpected(&self, message: &str) {}
}

/// Listener that ignores everything.
pub struct NoopEventListener;

impl<I, O> RetryEventListener<I, O> for NoopEventListener {}

pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Guard around the configured listener: every invocation is wrapped in
/// `catch_unwind`, so a panicking listener is reported instead of taking a
/// pipeline task down with it.
pub(crate) struct EventDispatcher<I, O> {
    listener: Arc<dyn RetryEventListener<I, O>>,
}

impl<I, O> Clone for EventDispatcher<I, O> {
    fn clone(&self) -> Self {
        Self {
            listener: Arc::clone(&self.listener),
        }
    }
}

impl<I, O> EventDispatcher<I, O> {
    pub fn new(listener: Arc<dyn RetryEventListener<I, O>>) -> Self {
        Self { listener }
    }

    pub fn emit(&self, notify: impl FnOnce(&dyn RetryEventListener<I, O>)) {
        let result = catch_unwind(AssertUnwindSafe(|| notify(self.listener.as_ref())));
        if let Err(payload) = result {
            let message = panic_message(payload);
            error!(panic = %message, "event listener panicked");
            // Report through the listener's own error channel, guarded so a
            // panic there cannot recurse.
            let _ = catch_unwind(AssertUnwindSafe(|| {
                self.listener.error_listener_panic(&message);
            }));
        }
    }
}
