use ratchet::settings::{parse_duration_ms, RetryConfig, SettingsError};

#[test]
fn defaults_are_valid() {
    let config = RetryConfig::load(None).expect("defaults load");
    assert_eq!(config.service_name, "ratchet");
    assert_eq!(config.status_cache_time_ms, 0);
    assert_eq!(config.max_attempts, 3);
    assert_eq!(config.delay_queue_count, 2);
    assert_eq!(config.max_sleep_step_ms, 100);
    assert_eq!(config.early_processing_grace_ms, 20);
    assert_eq!(config.worker_count, 4);
    assert_eq!(config.delays_after_failure_ms, vec![100, 800]);
    assert!(config.time_factor.is_none());
    assert!(!config.randomize_delays);
}

#[test]
fn duration_literals_accept_ms_s_m_suffixes() {
    assert_eq!(parse_duration_ms("250ms").unwrap(), 250);
    assert_eq!(parse_duration_ms("5s").unwrap(), 5_000);
    assert_eq!(parse_duration_ms("2m").unwrap(), 120_000);
    assert_eq!(parse_duration_ms("42").unwrap(), 42);
    assert_eq!(parse_duration_ms(" 10 s ").unwrap(), 10_000);
    assert!(parse_duration_ms("fast").is_err());
    assert!(parse_duration_ms("1h").is_err());
}

#[test]
fn full_toml_config_parses() {
    let toml = r#"
        service_name = "orders"
        status_cache_time_ms = "1s"
        max_pending_requests = 500
        max_attempts = 5
        delay_queue_count = 4
        max_sleep_step_ms = "250ms"
        early_processing_grace_ms = 50
        worker_count = 8
        rate_limit = { tokens = 20, per_ms = "1s" }
        rate_limit_burst = 40
        time_factor = 2.5
        delays_after_failure_ms = ["100ms", "800ms", "5s"]
        randomize_delays = true
    "#;
    let config: RetryConfig = toml::from_str(toml).expect("parse");
    config.validate().expect("valid");
    assert_eq!(config.service_name, "orders");
    assert_eq!(config.status_cache_time_ms, 1_000);
    assert_eq!(config.max_pending_requests, 500);
    assert_eq!(config.max_sleep_step_ms, 250);
    assert_eq!(config.rate_limit.tokens, 20);
    assert_eq!(config.rate_limit.per_ms, 1_000);
    assert_eq!(config.rate_limit_burst, 40);
    assert_eq!(config.effective_burst(), 40);
    assert_eq!(config.time_factor, Some(2.5));
    assert_eq!(config.delays_after_failure_ms, vec![100, 800, 5_000]);
    assert!(config.randomize_delays);
}

#[test]
fn time_factor_accepts_the_none_literal() {
    let config: RetryConfig = toml::from_str(r#"time_factor = "none""#).expect("parse");
    assert!(config.time_factor.is_none());

    let config: RetryConfig = toml::from_str(r#"time_factor = "4.0""#).expect("parse");
    assert_eq!(config.time_factor, Some(4.0));
}

#[test]
fn burst_defaults_to_the_rate_grant() {
    let config = RetryConfig::load(None).expect("defaults");
    assert_eq!(config.rate_limit_burst, 0);
    assert_eq!(config.effective_burst(), config.rate_limit.tokens);
}

#[test]
fn validation_rejects_out_of_range_values() {
    let mut config = RetryConfig::load(None).expect("defaults");
    config.worker_count = 0;
    assert!(matches!(
        config.validate(),
        Err(SettingsError::WorkerCountTooSmall)
    ));

    let mut config = RetryConfig::load(None).expect("defaults");
    config.max_attempts = 0;
    assert!(matches!(
        config.validate(),
        Err(SettingsError::MaxAttemptsTooSmall)
    ));

    let mut config = RetryConfig::load(None).expect("defaults");
    config.delay_queue_count = 0;
    assert!(matches!(
        config.validate(),
        Err(SettingsError::DelayQueueCountTooSmall)
    ));

    let mut config = RetryConfig::load(None).expect("defaults");
    config.time_factor = Some(0.0);
    assert!(matches!(
        config.validate(),
        Err(SettingsError::TimeFactorNotPositive(_))
    ));

    let mut config = RetryConfig::load(None).expect("defaults");
    config.delays_after_failure_ms = vec![];
    assert!(matches!(
        config.validate(),
        Err(SettingsError::NoRetryDelays)
    ));

    let mut config = RetryConfig::load(None).expect("defaults");
    config.rate_limit.per_ms = 0;
    assert!(matches!(
        config.validate(),
        Err(SettingsError::RateIntervalNotPositive(0))
    ));
}
