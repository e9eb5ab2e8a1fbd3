use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::policy::{call_guarded, DelayStepDecision};
use crate::service::Core;

/// Delay-queue drainer: one per queue. Repeatedly takes the earliest
/// entry, consults the delay-queue decision, and either sleeps a bounded
/// step, promotes the entry to the main queue, or drops it.
///
/// Sleeps wake early when an earlier entry is inserted or the service
/// shuts down; entry cancellation is observed at the next decision poll,
/// at most `max_sleep_step` away.
pub(crate) async fn run<I, O>(core: Arc<Core<I, O>>, queue_idx: usize)
where
    I: Send + Sync + 'static,
    O: Clone + Send + 'static,
{
    let queue = Arc::clone(core.delay_pool.queue(queue_idx));
    loop {
        if core.token.is_cancelled() {
            break;
        }
        let Some(head) = queue.peek_head() else {
            tokio::select! {
                _ = core.token.cancelled() => break,
                _ = queue.changed.notified() => {}
            }
            continue;
        };

        let now = core.now();
        let remaining = head.not_before_ms - now;
        let queue_delay = head.not_before_ms - head.enqueued_at_ms;
        core.events.emit(|l| {
            l.delay_queue_item_before_delay_step(&head.entry, queue_delay, remaining)
        });

        let decided =
            call_guarded(|| core.policy.delay_queue_decision(&head.entry, now, remaining));
        let decision = match decided {
            Ok(d) => d,
            Err(panic_msg) => {
                core.events
                    .emit(|l| l.error_spi_panic(Some(&head.entry), &panic_msg));
                if let Some(entry) = queue.pop_if_head(head.entry.id()) {
                    core.finish_failure(
                        &entry,
                        Some(Arc::new(anyhow::anyhow!(
                            "delay-queue decision panicked: {panic_msg}"
                        ))),
                    );
                }
                continue;
            }
        };

        match decision {
            DelayStepDecision::Promote => {
                // The head may have changed while deciding; if so, just
                // re-run the loop against the new head.
                if let Some(entry) = queue.pop_if_head(head.entry.id()) {
                    core.enqueue_main(entry);
                }
                core.events.emit(|l| {
                    l.delay_queue_decision_after_delay_step(
                        &head.entry,
                        queue_delay,
                        &decision,
                        0,
                        remaining,
                    )
                });
            }
            DelayStepDecision::Drop => {
                if let Some(entry) = queue.pop_if_head(head.entry.id()) {
                    if entry.cancellation_requested() {
                        core.finish_cancelled(&entry);
                    } else {
                        core.finish_timeout(&entry);
                    }
                }
                core.events.emit(|l| {
                    l.delay_queue_decision_after_delay_step(
                        &head.entry,
                        queue_delay,
                        &decision,
                        0,
                        remaining,
                    )
                });
            }
            DelayStepDecision::SleepFully | DelayStepDecision::SleepStep(_) => {
                let step = match decision {
                    DelayStepDecision::SleepStep(ms) => ms.min(remaining),
                    _ => remaining,
                };
                if step <= 0 {
                    continue;
                }
                let sleep_for = core.clock.real_duration_for_virtual(step);
                let slept_start = Instant::now();
                tokio::select! {
                    _ = core.token.cancelled() => break,
                    _ = queue.changed.notified() => {}
                    _ = tokio::time::sleep(sleep_for) => {}
                }
                let slept_ms = core.clock.virtual_between(slept_start, Instant::now());
                let remaining_after = head.not_before_ms - core.now();
                core.events.emit(|l| {
                    l.delay_queue_decision_after_delay_step(
                        &head.entry,
                        queue_delay,
                        &decision,
                        slept_ms,
                        remaining_after,
                    )
                });
            }
        }
    }
    debug!(queue = queue_idx, "delay drainer stopped");
}
