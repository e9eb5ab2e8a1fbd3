use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::entry::{AttemptError, Entry};
use crate::events::{panic_message, EventDispatcher};

/// User-supplied attempt function: one invocation per attempt.
///
/// An `Err` marks the attempt failed and eligible for a retry decision; a
/// panic is caught and treated the same way, with the panic payload as the
/// cause.
#[async_trait]
pub trait RequestProcessor<I, O>: Send + Sync {
    async fn process(&self, input: &I, attempt_number: u32) -> anyhow::Result<O>;
}

/// Outcome of one attempt, posted back to the dispatcher.
pub(crate) struct AttemptCompletion<I, O> {
    pub entry: Arc<Entry<I, O>>,
    pub attempt: u32,
    pub duration_ms: i64,
    pub result: Result<O, AttemptError>,
}

/// Bounded attempt runner: a semaphore of `worker_count` slots gates how
/// many attempts run concurrently; each accepted attempt runs on its own
/// task holding a slot permit.
pub(crate) struct AttemptExecutor<I, O> {
    slots: Arc<Semaphore>,
    pool_size: usize,
    processor: Arc<dyn RequestProcessor<I, O>>,
    completion_tx: mpsc::UnboundedSender<AttemptCompletion<I, O>>,
    events: EventDispatcher<I, O>,
    clock: Clock,
}

impl<I, O> AttemptExecutor<I, O>
where
    I: Send + Sync + 'static,
    O: Send + 'static,
{
    pub fn new(
        pool_size: usize,
        processor: Arc<dyn RequestProcessor<I, O>>,
        completion_tx: mpsc::UnboundedSender<AttemptCompletion<I, O>>,
        events: EventDispatcher<I, O>,
        clock: Clock,
    ) -> Arc<Self> {
        Arc::new(Self {
            slots: Arc::new(Semaphore::new(pool_size)),
            pool_size,
            processor,
            completion_tx,
            events,
            clock,
        })
    }

    /// Attempts currently holding a worker slot.
    pub fn active_workers(&self) -> usize {
        self.pool_size - self.slots.available_permits()
    }

    /// Block until a worker slot is free. Returns `None` when the given
    /// cancellation signal fires first.
    pub async fn acquire_slot(&self, cancel: &CancellationToken) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            _ = cancel.cancelled() => None,
            permit = Arc::clone(&self.slots).acquire_owned() => permit.ok(),
        }
    }

    /// Run one attempt on its own task, transferring the slot permit to
    /// it. Returns false when the completion channel is gone (shutdown);
    /// the caller then owns the entry again.
    pub fn submit(
        &self,
        entry: Arc<Entry<I, O>>,
        attempt: u32,
        permit: OwnedSemaphorePermit,
    ) -> bool {
        if self.completion_tx.is_closed() {
            return false;
        }
        let processor = Arc::clone(&self.processor);
        let tx = self.completion_tx.clone();
        let events = self.events.clone();
        let clock = self.clock;
        tokio::spawn(async move {
            let _permit = permit;
            let started_at_ms = clock.now_ms();
            let remaining = entry.remaining_validity_ms(started_at_ms);
            events.emit(|l| l.request_executing(&entry, attempt, remaining));

            let start = Instant::now();
            let outcome = AssertUnwindSafe(processor.process(entry.task(), attempt))
                .catch_unwind()
                .await;
            let duration_ms = clock.virtual_between(start, Instant::now());

            let result = match outcome {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(error)) => Err(Arc::new(error)),
                Err(payload) => Err(Arc::new(anyhow::anyhow!(
                    "attempt panicked: {}",
                    panic_message(payload)
                ))),
            };
            // Dispatcher gone means shutdown is terminating every entry;
            // dropping the completion is fine then.
            let _ = tx.send(AttemptCompletion {
                entry,
                attempt,
                duration_ms,
                result,
            });
        });
        true
    }
}
