use ratchet::backoff::BackoffSchedule;

#[test]
fn schedule_indexes_by_failure_count_and_repeats_last() {
    let schedule = BackoffSchedule::new(vec![100, 800], false);
    assert_eq!(schedule.delay_after_failure_ms(1, 1_000_000), 100);
    assert_eq!(schedule.delay_after_failure_ms(2, 1_000_000), 800);
    // Past the end of the list the last delay repeats.
    assert_eq!(schedule.delay_after_failure_ms(3, 1_000_000), 800);
    assert_eq!(schedule.delay_after_failure_ms(17, 1_000_000), 800);
}

#[test]
fn randomized_delay_is_deterministic_for_given_inputs() {
    let schedule = BackoffSchedule::new(vec![10, 20, 40], true);
    let a = schedule.delay_after_failure_ms(2, 1_234_567);
    let b = schedule.delay_after_failure_ms(2, 1_234_567);
    assert_eq!(
        a, b,
        "randomized delay should be deterministic for same inputs"
    );
}

#[test]
fn randomized_delay_stays_within_one_to_two_times_base() {
    let schedule = BackoffSchedule::new(vec![1_000], true);
    for failure_time in [0i64, 17, 1_000_003, 987_654_321] {
        for failures in 1..6 {
            let delay = schedule.delay_after_failure_ms(failures, failure_time);
            assert!(
                (1_000..2_001).contains(&delay),
                "delay {delay} out of [1000, 2000] for failures={failures} t={failure_time}"
            );
        }
    }
}

#[test]
fn unrandomized_delay_ignores_failure_time() {
    let schedule = BackoffSchedule::new(vec![250], false);
    assert_eq!(schedule.delay_after_failure_ms(1, 5), 250);
    assert_eq!(schedule.delay_after_failure_ms(1, 999_999), 250);
}
