//! End-to-end scenarios: retry schedules, deadlines, delayed starts, the
//! grace window, and back-pressure. Timing assertions use the same bounds
//! as the attempt records they check (attempts sleep 20ms before
//! recording).


use ratchet::future::RetryError;
use ratchet::service::SubmitError;
use test_helpers::*;

#[tokio::test(flavor = "multi_thread")]
async fn success_after_two_failed_attempts() {
    let processor = ScriptedProcessor::new(3);
    let service = start_service(processor.clone());

    let start = now_ms();
    let future = service.submit_for("request".to_string(), 5_000).expect("submit");

    let result = {
        let pending = &future;
        with_timeout!(3_000, { pending.result_opt(2_000).await })
    };
    assert_eq!(result.expect("no failure").as_deref(), Some("success: request"));

    let attempts = processor.attempts();
    assert_eq!(attempts.len(), 3, "expected exactly three attempts");
    check_attempt(attempts.first(), 1, "request", None, start, start + 100);
    check_attempt(attempts.get(1), 2, "request", None, start + 120, start + 220);
    check_attempt(
        attempts.get(2),
        3,
        "request",
        Some("success: request"),
        start + 940,
        start + 1_140,
    );

    assert!(future.is_done());
    assert!(future.is_successful());
    assert!(!future.is_cancelled());

    service.shutdown(0).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_budget_exhausted_fails_with_last_cause() {
    let processor = ScriptedProcessor::new(u32::MAX);
    let service = start_service(processor.clone());

    let start = now_ms();
    let future = service.submit_for("failure".to_string(), 5_000).expect("submit");

    let error = with_timeout!(3_000, { future.result(2_000).await })
        .expect_err("all attempts fail");
    match &error {
        RetryError::AttemptFailed(cause) => {
            assert!(
                cause.to_string().contains("attempt: 3"),
                "cause should name the last attempt, got: {cause}"
            );
        }
        other => panic!("expected AttemptFailed, got {other:?}"),
    }
    let duration = now_ms() - start;
    assert_between(duration, 940, 1_400, "failure duration");

    let attempts = processor.attempts();
    assert_eq!(attempts.len(), 3);
    check_attempt(attempts.first(), 1, "failure", None, start, start + 100);
    check_attempt(attempts.get(1), 2, "failure", None, start + 120, start + 220);
    check_attempt(attempts.get(2), 3, "failure", None, start + 940, start + 1_140);

    service.shutdown(0).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn deadline_hit_mid_retry_times_out_without_third_attempt() {
    let processor = ScriptedProcessor::new(u32::MAX);
    let service = start_service(processor.clone());

    let start = now_ms();
    let future = service.submit_for("timeout".to_string(), 300).expect("submit");

    let error = with_timeout!(2_000, { future.result(1_500).await })
        .expect_err("request must time out");
    assert!(matches!(error, RetryError::TimedOut), "got {error:?}");

    let duration = now_ms() - start;
    assert_between(duration, 300, 450, "timeout duration");

    let attempts = processor.attempts();
    assert_eq!(attempts.len(), 2, "no attempt may start after the deadline");
    check_attempt(attempts.first(), 1, "timeout", None, start, start + 100);
    check_attempt(attempts.get(1), 2, "timeout", None, start + 120, start + 220);

    service.shutdown(0).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn delayed_start_runs_single_attempt_at_not_before() {
    let processor = ScriptedProcessor::new(0);
    let service = start_service(processor.clone());

    let start = now_ms();
    let delay_until = service
        .submit_until_with_delay_until("delayUntil".to_string(), start + 2_000, start + 300)
        .expect("submit");
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let delay_for = service
        .submit_for_with_delay("delayFor".to_string(), 2_000, 200)
        .expect("submit");

    let first = with_timeout!(2_000, { delay_until.result_opt(1_500).await });
    assert_eq!(first.expect("no failure").as_deref(), Some("success: delayUntil"));
    let second = with_timeout!(2_000, { delay_for.result_opt(1_500).await });
    assert_eq!(second.expect("no failure").as_deref(), Some("success: delayFor"));

    let attempts = processor.attempts();
    assert_eq!(attempts.len(), 2);
    // Both entries were scheduled for ~start+300; each runs exactly once,
    // no earlier than its own not-before.
    for record in &attempts {
        assert_eq!(record.attempt_number, 1);
        assert_between(record.at_ms, start + 300, start + 450, "delayed attempt at");
    }

    service.shutdown(0).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn grace_window_splits_direct_and_delayed_admission() {
    let processor = ScriptedProcessor::new(0);
    let service = start_service(processor.clone());

    let start = now_ms();
    let delay70 = service
        .submit_for_with_delay("delay70".to_string(), 2_000, 70)
        .expect("submit");
    let delay40 = service
        .submit_for_with_delay("delay40".to_string(), 2_000, 40)
        .expect("submit");

    let fast = with_timeout!(1_000, { delay40.result_opt(500).await });
    assert_eq!(fast.expect("no failure").as_deref(), Some("success: delay40"));
    let slow = with_timeout!(1_000, { delay70.result_opt(500).await });
    assert_eq!(slow.expect("no failure").as_deref(), Some("success: delay70"));

    let attempts = processor.attempts();
    assert_eq!(attempts.len(), 2);
    // delay40 is inside the 50ms grace window: dispatched directly.
    check_attempt(
        attempts.first(),
        1,
        "delay40",
        Some("success: delay40"),
        start,
        start + 80,
    );
    // delay70 goes through a delay queue and starts no earlier than 70ms in.
    check_attempt(
        attempts.get(1),
        1,
        "delay70",
        Some("success: delay70"),
        start + 90,
        start + 180,
    );

    service.shutdown(0).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn back_pressure_rejects_submission_past_the_ceiling() {
    let processor = ScriptedProcessor::new(0);
    let service = start_service(processor.clone());

    for i in 0..100 {
        service
            .submit_for_with_delay(format!("request {i}"), 1_000, 500)
            .expect("submission under the ceiling");
    }

    let rejected = service.submit_for("request too many".to_string(), 1_000);
    match rejected {
        Err(SubmitError::TooManyPending { limit }) => assert_eq!(limit, 100),
        other => panic!("expected TooManyPending, got {other:?}"),
    }

    service.shutdown(0).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn status_reflects_lifecycle_and_caches() {
    let processor = ScriptedProcessor::new(0);
    let service =
        ratchet::service::RetryService::new(test_config(), processor.clone()).expect("config");

    let before_start = service.status(0);
    assert!(!before_start.everything_alive());
    assert!(!before_start.dispatcher_alive);
    assert!(!before_start.delay_drainers_alive);
    assert!(before_start.executor_usable);

    service.start();

    // Within the cache window the pre-start snapshot is still served.
    let cached = service.status(2_000);
    assert_eq!(cached, before_start);

    // A tight cache bound forces regeneration.
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    let fresh = service.status(5);
    assert_ne!(fresh, before_start);
    assert!(fresh.everything_alive());
    assert!(fresh.dispatcher_alive);
    assert!(fresh.delay_drainers_alive);
    assert!(fresh.replenisher_alive);
    assert_eq!(fresh.main_queue_size, 0);
    assert_eq!(fresh.live_requests, 0);
    assert_eq!(fresh.active_workers, 0);
    assert_eq!(fresh.delay_queue_depths, vec![0, 0]);

    // Drive one request through and verify the counters return to idle.
    let future = service.submit_for("status".to_string(), 1_000).expect("submit");
    let result = with_timeout!(1_000, { future.result_opt(800).await });
    assert_eq!(result.expect("no failure").as_deref(), Some("success: status"));

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let after = service.status(0);
    assert_eq!(after.main_queue_size, 0);
    assert_eq!(after.live_requests, 0);
    assert_eq!(after.active_workers, 0);

    service.shutdown(0).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn status_refresher_keeps_the_cache_fresh() {
    let processor = ScriptedProcessor::new(0);
    let config = ratchet::settings::RetryConfig {
        status_cache_time_ms: 50,
        ..test_config()
    };
    let service = ratchet::service::RetryService::new(config, processor).expect("config");
    service.start();

    let first = service.status(10_000);
    assert!(first.status_refresher_alive);

    // The caller tolerates 10s of staleness, so without the refresher this
    // second read would return the identical cached snapshot.
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    let second = service.status(10_000);
    assert!(
        second.status_created_at_ms > first.status_created_at_ms,
        "refresher should have replaced the cached snapshot"
    );
    assert!(second.status_refresher_alive);

    service.shutdown(0).await;
}
