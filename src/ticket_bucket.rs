use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::clock::Clock;
use crate::settings::RetryConfig;

/// Result of a ticket acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketAcquireOutcome {
    Acquired,
    /// No ticket became available within the allowed wait.
    WouldBlock,
    /// The waiter's cancellation signal fired.
    Cancelled,
    /// The service is shutting down.
    Shutdown,
}

/// Blocking, cancellable rate-limit gate.
///
/// Tickets are a counter, not objects: acquisition decrements, a
/// replenisher task adds tokens on a fixed schedule up to the burst
/// capacity. No partial acquire, no overdraft; parameters are fixed at
/// construction.
pub struct TicketBucket {
    capacity: u64,
    tokens_per_tick: u64,
    tick_virtual_ms: i64,
    available: Mutex<u64>,
    replenished: Notify,
    clock: Clock,
    shutdown: CancellationToken,
}

impl TicketBucket {
    pub fn new(config: &RetryConfig, clock: Clock, shutdown: CancellationToken) -> Arc<Self> {
        let tokens = config.rate_limit.tokens;
        let per_ms = config.rate_limit.per_ms;
        // Replenish one token at a time where the rate allows, so grants
        // spread evenly across the interval instead of arriving in bursts.
        let tick_virtual_ms = (per_ms / tokens as i64).max(1);
        let tokens_per_tick = ((tokens as i64 * tick_virtual_ms) / per_ms).max(1) as u64;
        let capacity = config.effective_burst();
        Arc::new(Self {
            capacity,
            tokens_per_tick,
            tick_virtual_ms,
            available: Mutex::new(capacity),
            replenished: Notify::new(),
            clock,
            shutdown,
        })
    }

    /// Tokens currently available; for status snapshots and tests.
    pub fn available(&self) -> u64 {
        *self.available.lock().unwrap()
    }

    /// Non-blocking acquisition of a single ticket.
    pub fn try_acquire(&self) -> bool {
        let mut available = self.available.lock().unwrap();
        if *available > 0 {
            *available -= 1;
            true
        } else {
            false
        }
    }

    /// Acquire one ticket, waiting up to `max_wait_virtual_ms` (virtual
    /// time). `max_wait_virtual_ms <= 0` means a non-blocking try.
    ///
    /// Returns promptly when `cancel` fires (entry cancellation) or when
    /// the service shuts down.
    pub async fn acquire(
        &self,
        max_wait_virtual_ms: i64,
        cancel: &CancellationToken,
    ) -> TicketAcquireOutcome {
        if self.try_acquire() {
            return TicketAcquireOutcome::Acquired;
        }
        if max_wait_virtual_ms <= 0 {
            return TicketAcquireOutcome::WouldBlock;
        }

        let deadline = Instant::now() + self.clock.real_duration_for_virtual(max_wait_virtual_ms);
        loop {
            // Register for the replenish signal before re-checking, so a
            // token granted in between is not missed.
            let notified = self.replenished.notified();
            tokio::pin!(notified);
            if self.try_acquire() {
                return TicketAcquireOutcome::Acquired;
            }
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return TicketAcquireOutcome::Shutdown,
                _ = cancel.cancelled() => return TicketAcquireOutcome::Cancelled,
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline.into()) => {
                    return if self.try_acquire() {
                        TicketAcquireOutcome::Acquired
                    } else {
                        TicketAcquireOutcome::WouldBlock
                    };
                }
            }
        }
    }

    /// Spawn the replenisher task. Runs until the shutdown token fires.
    pub fn start_replenisher(self: &Arc<Self>) -> JoinHandle<()> {
        let bucket = Arc::clone(self);
        tokio::spawn(async move {
            let tick = bucket.clock.real_duration_for_virtual(bucket.tick_virtual_ms);
            loop {
                tokio::select! {
                    _ = bucket.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(tick) => {}
                }
                {
                    let mut available = bucket.available.lock().unwrap();
                    *available = (*available + bucket.tokens_per_tick).min(bucket.capacity);
                }
                bucket.replenished.notify_waiters();
            }
            debug!("ticket replenisher stopped");
        })
    }
}
