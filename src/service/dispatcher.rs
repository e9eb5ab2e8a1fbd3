use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::debug;

use crate::entry::Entry;
use crate::executor::AttemptCompletion;
use crate::policy::{call_guarded, AfterAttemptDecision, MainQueueDecision};
use crate::service::Core;
use crate::ticket_bucket::TicketAcquireOutcome;

/// Main-queue dispatcher: drains the FIFO, stages worker-slot and ticket
/// acquisition with a fresh decision after every waited-on step, hands
/// attempts to the executor, and interprets attempt outcomes.
///
/// Attempt completions are serviced even while an entry is waiting for a
/// worker slot, so a full pool never stalls retry scheduling.
pub(crate) async fn run<I, O>(
    core: Arc<Core<I, O>>,
    mut main_rx: mpsc::UnboundedReceiver<Arc<Entry<I, O>>>,
    mut completion_rx: mpsc::UnboundedReceiver<AttemptCompletion<I, O>>,
) where
    I: Send + Sync + 'static,
    O: Clone + Send + 'static,
{
    loop {
        tokio::select! {
            biased;
            _ = core.token.cancelled() => break,
            Some(done) = completion_rx.recv() => {
                handle_completion(&core, done);
            }
            Some(entry) = main_rx.recv() => {
                core.main_depth.fetch_sub(1, Ordering::AcqRel);
                process_entry(&core, entry, &mut completion_rx).await;
            }
            else => {
                core.events.emit(|l| l.error_unexpected("dispatcher channels closed while running"));
                break;
            }
        }
    }
    debug!("dispatcher stopped");
}

/// Outcome of consulting the main-queue decision: whether the entry is
/// still the dispatcher's to process.
enum Consult {
    Proceed,
    Routed,
}

fn consult<I, O>(
    core: &Arc<Core<I, O>>,
    entry: &Arc<Entry<I, O>>,
    has_worker: bool,
    has_ticket: bool,
    processing_since_ms: i64,
) -> Consult
where
    I: Send + Sync + 'static,
    O: Clone + Send + 'static,
{
    let now = core.now();
    let decided = call_guarded(|| {
        core.policy
            .main_queue_decision(entry, now, has_worker, has_ticket)
    });
    let decision = match decided {
        Ok(d) => d,
        Err(panic_msg) => {
            core.events
                .emit(|l| l.error_spi_panic(Some(entry), &panic_msg));
            core.finish_failure(
                entry,
                Some(Arc::new(anyhow::anyhow!(
                    "main-queue decision panicked: {panic_msg}"
                ))),
            );
            return Consult::Routed;
        }
    };
    core.events
        .emit(|l| l.main_queue_processing_decision(entry, &decision, processing_since_ms));

    match decision {
        MainQueueDecision::ProcessNow => Consult::Proceed,
        MainQueueDecision::DelayFor(delay_ms) => {
            let not_before = now + delay_ms.max(0);
            if not_before > entry.valid_until_ms() {
                core.finish_timeout(entry);
            } else {
                entry.set_not_before_ms(not_before);
                core.route(Arc::clone(entry), now);
            }
            Consult::Routed
        }
        MainQueueDecision::FinalTimeout => {
            core.finish_timeout(entry);
            Consult::Routed
        }
        MainQueueDecision::FinalFailure => {
            core.finish_failure(entry, entry.last_error());
            Consult::Routed
        }
    }
}

async fn process_entry<I, O>(
    core: &Arc<Core<I, O>>,
    entry: Arc<Entry<I, O>>,
    completion_rx: &mut mpsc::UnboundedReceiver<AttemptCompletion<I, O>>,
) where
    I: Send + Sync + 'static,
    O: Clone + Send + 'static,
{
    // Entries terminated while queued (shutdown sweep, cancellation race)
    // just fall out here.
    if entry.is_done() {
        return;
    }
    let processing_since = core.now();

    if entry.cancellation_requested() {
        core.finish_cancelled(&entry);
        return;
    }
    if let Consult::Routed = consult(core, &entry, false, false, processing_since) {
        return;
    }

    // Worker slot. Completions keep flowing while we wait so a saturated
    // pool cannot hold back retry decisions.
    let slot_wait_start = Instant::now();
    let permit = loop {
        tokio::select! {
            biased;
            _ = core.token.cancelled() => {
                core.finish_cancelled(&entry);
                return;
            }
            Some(done) = completion_rx.recv() => {
                handle_completion(core, done);
            }
            maybe_permit = core.executor.acquire_slot(entry.cancel_token()) => {
                match maybe_permit {
                    Some(permit) => break permit,
                    None => {
                        core.finish_cancelled(&entry);
                        return;
                    }
                }
            }
        }
    };
    let slot_wait_ms = core.clock.virtual_between(slot_wait_start, Instant::now());
    core.events
        .emit(|l| l.main_queue_thread_obtained(&entry, processing_since, slot_wait_ms));

    if entry.cancellation_requested() {
        core.finish_cancelled(&entry);
        return;
    }
    if let Consult::Routed = consult(core, &entry, true, false, processing_since) {
        return;
    }

    // Ticket. The wait is bounded by the entry's remaining validity, so a
    // starved acquisition resolves into a timeout decision rather than
    // blocking the dispatcher forever. Completions are serviced here too.
    loop {
        let now = core.now();
        let max_wait = entry.remaining_validity_ms(now);
        let acquire_start = Instant::now();
        let outcome = loop {
            tokio::select! {
                biased;
                _ = core.token.cancelled() => break TicketAcquireOutcome::Shutdown,
                Some(done) = completion_rx.recv() => {
                    handle_completion(core, done);
                }
                outcome = core.tickets.acquire(max_wait, entry.cancel_token()) => break outcome,
            }
        };
        let acquire_ms = core.clock.virtual_between(acquire_start, Instant::now());
        let obtained = outcome == TicketAcquireOutcome::Acquired;
        core.events.emit(|l| {
            l.main_queue_ticket_obtain_attempt(&entry, processing_since, obtained, acquire_ms)
        });

        match outcome {
            TicketAcquireOutcome::Cancelled | TicketAcquireOutcome::Shutdown => {
                core.finish_cancelled(&entry);
                return;
            }
            TicketAcquireOutcome::Acquired | TicketAcquireOutcome::WouldBlock => {}
        }
        if let Consult::Routed = consult(core, &entry, true, obtained, processing_since) {
            return;
        }
        if obtained {
            break;
        }
        // Decision said ProcessNow without a ticket: try the bucket again.
    }

    let attempt = entry.begin_attempt();
    if !core.executor.submit(Arc::clone(&entry), attempt, permit) {
        core.finish_cancelled(&entry);
        return;
    }
    let total_ms = core.now() - processing_since;
    core.events
        .emit(|l| l.main_queue_processing_completed(&entry, processing_since, total_ms));
}

pub(crate) fn handle_completion<I, O>(core: &Arc<Core<I, O>>, done: AttemptCompletion<I, O>)
where
    I: Send + Sync + 'static,
    O: Clone + Send + 'static,
{
    let AttemptCompletion {
        entry,
        attempt,
        duration_ms,
        result,
    } = done;

    let cause = match result {
        Ok(value) => {
            // A success beats a pending cancellation request: cancellation
            // only prevents further retries, it never discards a result.
            core.finish_success(&entry, value, attempt, duration_ms);
            return;
        }
        Err(cause) => cause,
    };

    core.events
        .emit(|l| l.request_attempt_failed(&entry, &cause, attempt, duration_ms));
    entry.set_last_error(Arc::clone(&cause));
    entry.attempt_settled();

    if entry.cancellation_requested() {
        core.finish_cancelled(&entry);
        return;
    }

    let now = core.now();
    let decided = call_guarded(|| core.policy.after_attempt_decision(&entry, now, &cause));
    let decision = match decided {
        Ok(d) => d,
        Err(panic_msg) => {
            core.events
                .emit(|l| l.error_spi_panic(Some(&entry), &panic_msg));
            core.finish_failure(
                &entry,
                Some(Arc::new(anyhow::anyhow!(
                    "after-attempt decision panicked: {panic_msg}"
                ))),
            );
            return;
        }
    };
    core.events
        .emit(|l| l.request_attempt_failed_decision(&entry, &decision));

    match decision {
        AfterAttemptDecision::Retry { delay_ms } => {
            let not_before = now + delay_ms.max(0);
            if not_before > entry.valid_until_ms() {
                // The delay would outlive the validity window; retrying is
                // pointless.
                core.finish_timeout(&entry);
            } else {
                entry.set_not_before_ms(not_before);
                core.route(entry, now);
            }
        }
        AfterAttemptDecision::FinalFailure => {
            core.finish_failure(&entry, Some(cause));
        }
        AfterAttemptDecision::FinalTimeout => {
            core.finish_timeout(&entry);
        }
    }
}
