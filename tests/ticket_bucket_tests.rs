
use std::time::Instant;

use ratchet::clock::Clock;
use ratchet::settings::{RateLimitSettings, RetryConfig};
use ratchet::ticket_bucket::{TicketAcquireOutcome, TicketBucket};
use tokio_util::sync::CancellationToken;

fn bucket_config(tokens: u64, per_ms: i64, burst: u64) -> RetryConfig {
    RetryConfig {
        rate_limit: RateLimitSettings { tokens, per_ms },
        rate_limit_burst: burst,
        ..test_helpers::test_config()
    }
}

#[tokio::test]
async fn burst_drains_then_refuses_nonblocking() {
    let shutdown = CancellationToken::new();
    let bucket = TicketBucket::new(&bucket_config(10, 10_000, 3), Clock::wall(), shutdown.clone());

    assert_eq!(bucket.available(), 3);
    assert!(bucket.try_acquire());
    assert!(bucket.try_acquire());
    assert!(bucket.try_acquire());
    assert!(!bucket.try_acquire());

    // max_wait <= 0 means non-blocking try-acquire.
    let outcome = bucket.acquire(0, &shutdown.child_token()).await;
    assert_eq!(outcome, TicketAcquireOutcome::WouldBlock);
}

#[tokio::test]
async fn replenisher_wakes_a_blocked_acquirer() {
    let shutdown = CancellationToken::new();
    // 100 tokens per second: one token every 10ms.
    let bucket = TicketBucket::new(&bucket_config(100, 1_000, 1), Clock::wall(), shutdown.clone());
    let _replenisher = bucket.start_replenisher();

    assert!(bucket.try_acquire());

    let start = Instant::now();
    let outcome = bucket.acquire(500, &shutdown.child_token()).await;
    assert_eq!(outcome, TicketAcquireOutcome::Acquired);
    assert!(
        start.elapsed().as_millis() < 300,
        "replenishment should arrive within a few ticks"
    );

    shutdown.cancel();
}

#[tokio::test]
async fn deadline_elapses_into_would_block() {
    let shutdown = CancellationToken::new();
    let bucket = TicketBucket::new(&bucket_config(10, 60_000, 1), Clock::wall(), shutdown.clone());
    assert!(bucket.try_acquire());

    let start = Instant::now();
    let outcome = bucket.acquire(50, &shutdown.child_token()).await;
    assert_eq!(outcome, TicketAcquireOutcome::WouldBlock);
    assert!(start.elapsed().as_millis() >= 50);
}

#[tokio::test]
async fn cancellation_signal_interrupts_the_wait() {
    let shutdown = CancellationToken::new();
    let bucket = TicketBucket::new(&bucket_config(10, 60_000, 1), Clock::wall(), shutdown.clone());
    assert!(bucket.try_acquire());

    let cancel = shutdown.child_token();
    cancel.cancel();
    let outcome = bucket.acquire(5_000, &cancel).await;
    assert_eq!(outcome, TicketAcquireOutcome::Cancelled);
}

#[tokio::test]
async fn shutdown_interrupts_the_wait() {
    let shutdown = CancellationToken::new();
    let bucket = TicketBucket::new(&bucket_config(10, 60_000, 1), Clock::wall(), shutdown.clone());
    assert!(bucket.try_acquire());

    let waiter_cancel = CancellationToken::new();
    shutdown.cancel();
    let outcome = bucket.acquire(5_000, &waiter_cancel).await;
    assert_eq!(outcome, TicketAcquireOutcome::Shutdown);
}

#[tokio::test]
async fn replenishment_never_exceeds_burst_capacity() {
    let shutdown = CancellationToken::new();
    let bucket = TicketBucket::new(&bucket_config(100, 1_000, 2), Clock::wall(), shutdown.clone());
    let _replenisher = bucket.start_replenisher();

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(bucket.available() <= 2);

    shutdown.cancel();
}
