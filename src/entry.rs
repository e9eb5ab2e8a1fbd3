use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Opaque cause of a failed attempt, shared between the entry's last-error
/// slot, listener callbacks, and the final future outcome.
pub type AttemptError = Arc<anyhow::Error>;

/// Completion lifecycle of a request entry.
///
/// `Succeeded`, `FailedTerminal`, `TimedOut`, and `Cancelled` are terminal;
/// an entry reaches exactly one of them, exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionState {
    Pending,
    Running,
    Succeeded,
    FailedTerminal,
    TimedOut,
    Cancelled,
}

impl CompletionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CompletionState::Succeeded
                | CompletionState::FailedTerminal
                | CompletionState::TimedOut
                | CompletionState::Cancelled
        )
    }
}

/// Terminal outcome of a request.
#[derive(Debug, Clone)]
pub enum Outcome<O> {
    Success(O),
    /// Terminal failure; `None` when policy decided FinalFailure without a
    /// recorded attempt error.
    Failure(Option<AttemptError>),
    TimedOut,
    Cancelled,
}

struct CompletionSlot<O> {
    state: CompletionState,
    outcome: Option<Outcome<O>>,
}

/// Per-request scheduler record: the value moved through the pipeline and
/// the value observed by listener callbacks.
///
/// Mutation discipline: `not_before`/`attempt_number` are written only by
/// the stage that currently owns the entry; the terminal transition is
/// serialized through the completion slot, whose first writer wins.
pub struct Entry<I, O> {
    id: Uuid,
    input: I,
    created_at_ms: i64,
    valid_until_ms: i64,
    not_before_ms: AtomicI64,
    attempt_number: AtomicU32,
    cancel_requested: AtomicBool,
    cancel_token: CancellationToken,
    last_error: Mutex<Option<AttemptError>>,
    completion: Mutex<CompletionSlot<O>>,
    done_tx: watch::Sender<bool>,
}

impl<I, O> Entry<I, O> {
    pub(crate) fn new(
        input: I,
        created_at_ms: i64,
        not_before_ms: i64,
        valid_until_ms: i64,
        service_token: &CancellationToken,
    ) -> Arc<Self> {
        let (done_tx, _done_rx) = watch::channel(false);
        Arc::new(Self {
            id: Uuid::new_v4(),
            input,
            created_at_ms,
            valid_until_ms,
            not_before_ms: AtomicI64::new(not_before_ms),
            attempt_number: AtomicU32::new(0),
            cancel_requested: AtomicBool::new(false),
            cancel_token: service_token.child_token(),
            last_error: Mutex::new(None),
            completion: Mutex::new(CompletionSlot {
                state: CompletionState::Pending,
                outcome: None,
            }),
            done_tx,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The caller-provided request payload.
    pub fn task(&self) -> &I {
        &self.input
    }

    pub fn created_at_ms(&self) -> i64 {
        self.created_at_ms
    }

    pub fn valid_until_ms(&self) -> i64 {
        self.valid_until_ms
    }

    pub fn not_before_ms(&self) -> i64 {
        self.not_before_ms.load(Ordering::Acquire)
    }

    pub(crate) fn set_not_before_ms(&self, at_ms: i64) {
        self.not_before_ms.store(at_ms, Ordering::Release);
    }

    /// 1-based number of the latest attempt; 0 before the first attempt.
    pub fn attempt_number(&self) -> u32 {
        self.attempt_number.load(Ordering::Acquire)
    }

    /// Advance the attempt counter and return the new attempt number.
    pub(crate) fn begin_attempt(&self) -> u32 {
        let n = self.attempt_number.fetch_add(1, Ordering::AcqRel) + 1;
        let mut slot = self.completion.lock().unwrap();
        if !slot.state.is_terminal() {
            slot.state = CompletionState::Running;
        }
        n
    }

    /// Called when an attempt failed but the entry will be retried.
    pub(crate) fn attempt_settled(&self) {
        let mut slot = self.completion.lock().unwrap();
        if slot.state == CompletionState::Running {
            slot.state = CompletionState::Pending;
        }
    }

    pub fn remaining_validity_ms(&self, now_ms: i64) -> i64 {
        self.valid_until_ms - now_ms
    }

    pub fn last_error(&self) -> Option<AttemptError> {
        self.last_error.lock().unwrap().clone()
    }

    pub(crate) fn set_last_error(&self, error: AttemptError) {
        *self.last_error.lock().unwrap() = Some(error);
    }

    pub fn cancellation_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    /// Request best-effort cancellation. Takes effect at the next decision
    /// point; a running attempt is not pre-empted. Returns true iff this
    /// call is the one that registered the request.
    pub fn request_cancellation(&self) -> bool {
        if self.is_done() {
            return false;
        }
        if self.cancel_requested.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel_token.cancel();
        true
    }

    /// Token cancelled on entry cancellation and on service shutdown;
    /// every blocking acquisition in the pipeline waits on it.
    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    pub fn state(&self) -> CompletionState {
        self.completion.lock().unwrap().state
    }

    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn is_successful(&self) -> bool {
        self.state() == CompletionState::Succeeded
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == CompletionState::Cancelled
    }

    /// Move the entry into a terminal state and signal the future.
    ///
    /// The first terminal write wins; later calls are no-ops returning
    /// false. The outcome (and with it, the result of a success) is
    /// written exactly once.
    pub(crate) fn complete(&self, outcome: Outcome<O>) -> bool {
        {
            let mut slot = self.completion.lock().unwrap();
            if slot.state.is_terminal() {
                return false;
            }
            slot.state = match &outcome {
                Outcome::Success(_) => CompletionState::Succeeded,
                Outcome::Failure(_) => CompletionState::FailedTerminal,
                Outcome::TimedOut => CompletionState::TimedOut,
                Outcome::Cancelled => CompletionState::Cancelled,
            };
            slot.outcome = Some(outcome);
        }
        // Wake waiters outside the lock; send_replace works with or
        // without live receivers.
        self.done_tx.send_replace(true);
        true
    }

    pub(crate) fn subscribe_done(&self) -> watch::Receiver<bool> {
        self.done_tx.subscribe()
    }
}

impl<I, O: Clone> Entry<I, O> {
    pub(crate) fn outcome(&self) -> Option<Outcome<O>> {
        self.completion.lock().unwrap().outcome.clone()
    }
}

impl<I, O> std::fmt::Debug for Entry<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("id", &self.id)
            .field("created_at_ms", &self.created_at_ms)
            .field("not_before_ms", &self.not_before_ms())
            .field("valid_until_ms", &self.valid_until_ms)
            .field("attempt_number", &self.attempt_number())
            .field("state", &self.state())
            .finish()
    }
}
