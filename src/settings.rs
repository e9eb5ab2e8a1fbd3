use std::fs;
use std::path::Path;

use serde::{Deserialize, Deserializer};
use thiserror::Error;

/// Service configuration. Parsed once, immutable at runtime.
#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    /// Name used in logs and task labels.
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// How long a generated status snapshot stays valid, and the refresh
    /// interval of the background status refresher that keeps the cache
    /// warm. Zero disables the refresher; `status()` callers then pay for
    /// regeneration whenever their own cache bound is exceeded.
    #[serde(default, deserialize_with = "de_duration_ms")]
    pub status_cache_time_ms: i64,

    /// Global ceiling on live (not yet terminal) requests across the main
    /// queue, the delay queues, and in-flight attempts.
    #[serde(default = "default_max_pending")]
    pub max_pending_requests: usize,

    /// Maximum number of attempts per request, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Number of delay queues, each with its own drainer task.
    #[serde(default = "default_delay_queue_count")]
    pub delay_queue_count: usize,

    /// Upper bound on a single delay-queue sleep before the processing
    /// decision is re-polled.
    #[serde(
        default = "default_max_sleep_step_ms",
        deserialize_with = "de_duration_ms"
    )]
    pub max_sleep_step_ms: i64,

    /// Requests whose `not_before` is at most this far in the future are
    /// admitted to the main queue directly, skipping the delay queues.
    #[serde(default = "default_grace_ms", deserialize_with = "de_duration_ms")]
    pub early_processing_grace_ms: i64,

    /// Number of concurrent attempt workers.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Ticket replenishment rate.
    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    /// Bucket capacity. Zero means "same as rate_limit.tokens".
    #[serde(default)]
    pub rate_limit_burst: u64,

    /// Virtual-time factor, or none for real time.
    #[serde(default, deserialize_with = "de_time_factor")]
    pub time_factor: Option<f64>,

    /// Delay before retry N is scheduled, indexed by the number of failed
    /// attempts so far; the last entry repeats for later attempts.
    #[serde(
        default = "default_delays_after_failure",
        deserialize_with = "de_duration_list"
    )]
    pub delays_after_failure_ms: Vec<i64>,

    /// Apply deterministic jitter to retry delays.
    #[serde(default)]
    pub randomize_delays: bool,
}

/// Ticket replenishment rate: `tokens` per `per` interval.
#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitSettings {
    pub tokens: u64,
    #[serde(deserialize_with = "de_duration_ms")]
    pub per_ms: i64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            tokens: 100,
            per_ms: 1_000,
        }
    }
}

fn default_service_name() -> String {
    "ratchet".to_string()
}

fn default_max_pending() -> usize {
    1_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_delay_queue_count() -> usize {
    2
}

fn default_max_sleep_step_ms() -> i64 {
    100
}

fn default_grace_ms() -> i64 {
    20
}

fn default_worker_count() -> usize {
    4
}

fn default_delays_after_failure() -> Vec<i64> {
    vec![100, 800]
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("max_pending_requests must be >= 1")]
    MaxPendingTooSmall,
    #[error("max_attempts must be >= 1")]
    MaxAttemptsTooSmall,
    #[error("delay_queue_count must be >= 1")]
    DelayQueueCountTooSmall,
    #[error("worker_count must be >= 1")]
    WorkerCountTooSmall,
    #[error("max_sleep_step must be positive, got {0}ms")]
    MaxSleepStepNotPositive(i64),
    #[error("early_processing_grace must be >= 0, got {0}ms")]
    GraceNegative(i64),
    #[error("status_cache_time must be >= 0, got {0}ms")]
    StatusCacheNegative(i64),
    #[error("rate_limit must grant at least one token per interval")]
    RateLimitZero,
    #[error("rate_limit interval must be positive, got {0}ms")]
    RateIntervalNotPositive(i64),
    #[error("time_factor must be positive, got {0}")]
    TimeFactorNotPositive(f64),
    #[error("delays_after_failure must not be empty")]
    NoRetryDelays,
    #[error("delays_after_failure entries must be >= 0, got {0}ms")]
    NegativeRetryDelay(i64),
}

impl RetryConfig {
    /// Load configuration from a TOML file, or the defaults when no path
    /// is given. The result is validated.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let cfg: Self = match path {
            Some(p) => {
                let data = fs::read_to_string(p)?;
                toml::from_str(&data)?
            }
            None => toml::from_str("")?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.max_pending_requests < 1 {
            return Err(SettingsError::MaxPendingTooSmall);
        }
        if self.max_attempts < 1 {
            return Err(SettingsError::MaxAttemptsTooSmall);
        }
        if self.delay_queue_count < 1 {
            return Err(SettingsError::DelayQueueCountTooSmall);
        }
        if self.worker_count < 1 {
            return Err(SettingsError::WorkerCountTooSmall);
        }
        if self.max_sleep_step_ms <= 0 {
            return Err(SettingsError::MaxSleepStepNotPositive(
                self.max_sleep_step_ms,
            ));
        }
        if self.early_processing_grace_ms < 0 {
            return Err(SettingsError::GraceNegative(self.early_processing_grace_ms));
        }
        if self.status_cache_time_ms < 0 {
            return Err(SettingsError::StatusCacheNegative(self.status_cache_time_ms));
        }
        if self.rate_limit.tokens == 0 {
            return Err(SettingsError::RateLimitZero);
        }
        if self.rate_limit.per_ms <= 0 {
            return Err(SettingsError::RateIntervalNotPositive(
                self.rate_limit.per_ms,
            ));
        }
        if let Some(f) = self.time_factor {
            if f <= 0.0 {
                return Err(SettingsError::TimeFactorNotPositive(f));
            }
        }
        if self.delays_after_failure_ms.is_empty() {
            return Err(SettingsError::NoRetryDelays);
        }
        for &d in &self.delays_after_failure_ms {
            if d < 0 {
                return Err(SettingsError::NegativeRetryDelay(d));
            }
        }
        Ok(())
    }

    /// Effective bucket capacity: the configured burst, or the per-interval
    /// token grant when no burst is set.
    pub fn effective_burst(&self) -> u64 {
        if self.rate_limit_burst > 0 {
            self.rate_limit_burst
        } else {
            self.rate_limit.tokens
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        toml::from_str("").expect("defaults deserialize")
    }
}

/// Parse a duration literal: a bare integer means milliseconds, a string
/// accepts `ms`, `s`, and `m` suffixes (`"250ms"`, `"5s"`, `"2m"`).
pub fn parse_duration_ms(raw: &str) -> Result<i64, String> {
    let s = raw.trim();
    let (digits, scale) = if let Some(d) = s.strip_suffix("ms") {
        (d, 1)
    } else if let Some(d) = s.strip_suffix('s') {
        (d, 1_000)
    } else if let Some(d) = s.strip_suffix('m') {
        (d, 60_000)
    } else {
        (s, 1)
    };
    let n: i64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration literal: {raw:?}"))?;
    n.checked_mul(scale)
        .ok_or_else(|| format!("duration overflows: {raw:?}"))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DurationRepr {
    Millis(i64),
    Literal(String),
}

impl DurationRepr {
    fn into_ms<E: serde::de::Error>(self) -> Result<i64, E> {
        match self {
            DurationRepr::Millis(n) => Ok(n),
            DurationRepr::Literal(s) => parse_duration_ms(&s).map_err(E::custom),
        }
    }
}

fn de_duration_ms<'de, D: Deserializer<'de>>(de: D) -> Result<i64, D::Error> {
    DurationRepr::deserialize(de)?.into_ms()
}

fn de_duration_list<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<i64>, D::Error> {
    let raw = Vec::<DurationRepr>::deserialize(de)?;
    raw.into_iter().map(DurationRepr::into_ms).collect()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TimeFactorRepr {
    Factor(f64),
    Literal(String),
}

fn de_time_factor<'de, D: Deserializer<'de>>(de: D) -> Result<Option<f64>, D::Error> {
    match Option::<TimeFactorRepr>::deserialize(de)? {
        None => Ok(None),
        Some(TimeFactorRepr::Factor(f)) => Ok(Some(f)),
        Some(TimeFactorRepr::Literal(s)) if s.eq_ignore_ascii_case("none") => Ok(None),
        Some(TimeFactorRepr::Literal(s)) => {
            s.parse::<f64>().map(Some).map_err(serde::de::Error::custom)
        }
    }
}
