//! Retry/backoff strategies for CloudSync transport operations.
//!
//! Transport calls (§4.1 of the engine) can fail transiently. This crate
//! provides the backoff math the engine uses to retry
//! `TransportFailure::Retryable` errors with a capped exponential delay,
//! while leaving `TransportFailure::Permanent` errors to abort immediately.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Strategy for calculating delay between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategyType {
    /// No delay between retries.
    Immediate,
    /// Delay doubles each attempt, capped at `max_delay` (default).
    #[default]
    Exponential,
    /// Delay increases linearly with attempt number.
    Linear,
    /// Same delay every attempt.
    Constant,
}

/// Which kind of error a retry decision is being made for.
///
/// CloudSync's error taxonomy (see `cloudsync::error::CloudSyncError`)
/// splits `TransportFailure` into retryable and permanent subtypes; this is
/// the only axis retry policy needs to reason about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Permanent,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Retryable => write!(f, "retryable"),
            ErrorClass::Permanent => write!(f, "permanent"),
        }
    }
}

/// Configuration for a single retry strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryStrategyConfig {
    #[serde(default)]
    pub strategy: RetryStrategyType,
    /// Maximum number of attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_base_delay"
    )]
    pub base_delay: Duration,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_max_delay"
    )]
    pub max_delay: Duration,
    /// Jitter factor (0.0 = no jitter, 1.0 = full jitter).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(300)
}

fn default_jitter() -> f64 {
    0.3
}

impl Default for RetryStrategyConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategyType::Exponential,
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: default_jitter(),
        }
    }
}

/// The default transport retry policy named in the spec: 3 attempts, base
/// 5s, cap 5 minutes.
pub fn default_transport_policy() -> RetryStrategyConfig {
    RetryStrategyConfig::default()
}

/// Calculate the delay before the given attempt (1-indexed).
pub fn calculate_delay(config: &RetryStrategyConfig, attempt: u32) -> Duration {
    let delay = match config.strategy {
        RetryStrategyType::Immediate => Duration::ZERO,
        RetryStrategyType::Exponential => {
            let pow = attempt.saturating_sub(1).min(16);
            config.base_delay.saturating_mul(2_u32.saturating_pow(pow))
        }
        RetryStrategyType::Linear => config.base_delay.saturating_mul(attempt),
        RetryStrategyType::Constant => config.base_delay,
    };

    let capped = delay.min(config.max_delay);

    if config.jitter > 0.0 {
        apply_jitter(capped, config.jitter)
    } else {
        capped
    }
}

/// Apply jitter to a delay. Jitter factor 0.5 means delay * (0.5..1.5).
fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    let jitter_range = 2.0 * jitter;
    let random_factor = 1.0 - jitter + (rand::random::<f64>() * jitter_range);
    let millis = (delay.as_millis() as f64 * random_factor).round() as u64;
    Duration::from_millis(millis)
}

/// Run `op` up to `config.max_attempts` times, sleeping between attempts
/// per `calculate_delay`. Stops immediately if `classify` reports
/// `ErrorClass::Permanent`.
pub fn retry_with_backoff<T, E>(
    config: &RetryStrategyConfig,
    mut op: impl FnMut(u32) -> Result<T, E>,
    classify: impl Fn(&E) -> ErrorClass,
) -> Result<T, E> {
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt >= config.max_attempts || classify(&e) == ErrorClass::Permanent {
                    return Err(e);
                }
                std::thread::sleep(calculate_delay(config, attempt));
                attempt += 1;
            }
        }
    }
}

/// Deserialize a `Duration` from either a humantime string (`"5s"`) or a
/// plain integer number of milliseconds.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationForm {
        Human(String),
        Millis(u64),
    }

    match DurationForm::deserialize(deserializer)? {
        DurationForm::Human(s) => humantime::parse_duration(&s).map_err(D::Error::custom),
        DurationForm::Millis(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// Serialize a `Duration` as a humantime string.
pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&humantime::format_duration(*duration).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_matches_spec_defaults() {
        let config = default_transport_policy();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.base_delay, Duration::from_secs(5));
        assert_eq!(config.max_delay, Duration::from_secs(300));
    }

    #[test]
    fn calculate_delay_exponential_without_jitter() {
        let config = RetryStrategyConfig {
            strategy: RetryStrategyType::Exponential,
            max_attempts: 5,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            jitter: 0.0,
        };
        assert_eq!(calculate_delay(&config, 1), Duration::from_secs(5));
        assert_eq!(calculate_delay(&config, 2), Duration::from_secs(10));
        assert_eq!(calculate_delay(&config, 3), Duration::from_secs(20));
        // 5 * 2^5 = 160s, still under the 300s cap.
        assert_eq!(calculate_delay(&config, 6), Duration::from_secs(160));
    }

    #[test]
    fn calculate_delay_caps_at_max() {
        let config = RetryStrategyConfig {
            strategy: RetryStrategyType::Exponential,
            max_attempts: 10,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            jitter: 0.0,
        };
        // 5 * 2^9 far exceeds 300s.
        assert_eq!(calculate_delay(&config, 10), Duration::from_secs(300));
    }

    #[test]
    fn retry_with_backoff_stops_on_permanent() {
        let config = RetryStrategyConfig {
            strategy: RetryStrategyType::Immediate,
            max_attempts: 5,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        };
        let mut calls = 0;
        let result: Result<(), &str> = retry_with_backoff(
            &config,
            |_attempt| {
                calls += 1;
                Err("permission denied")
            },
            |_e| ErrorClass::Permanent,
        );
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn retry_with_backoff_exhausts_retryable_attempts() {
        let config = RetryStrategyConfig {
            strategy: RetryStrategyType::Immediate,
            max_attempts: 3,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        };
        let mut calls = 0;
        let result: Result<(), &str> = retry_with_backoff(
            &config,
            |_attempt| {
                calls += 1;
                Err("connection reset")
            },
            |_e| ErrorClass::Retryable,
        );
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn retry_with_backoff_succeeds_eventually() {
        let config = RetryStrategyConfig {
            strategy: RetryStrategyType::Immediate,
            max_attempts: 5,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        };
        let mut calls = 0;
        let result = retry_with_backoff(
            &config,
            |attempt| {
                calls += 1;
                if attempt < 3 {
                    Err("connection reset")
                } else {
                    Ok(42)
                }
            },
            |_e| ErrorClass::Retryable,
        );
        assert_eq!(result, Ok(42));
        assert_eq!(calls, 3);
    }

    #[test]
    fn duration_deserializes_from_human_string_or_millis() {
        #[derive(Deserialize)]
        struct Wrapper {
            #[serde(deserialize_with = "deserialize_duration")]
            d: Duration,
        }
        let from_human: Wrapper = serde_json::from_str(r#"{"d":"5s"}"#).unwrap();
        assert_eq!(from_human.d, Duration::from_secs(5));

        let from_millis: Wrapper = serde_json::from_str(r#"{"d":5000}"#).unwrap();
        assert_eq!(from_millis.d, Duration::from_secs(5));
    }

    proptest::proptest! {
        /// Property: delay with no jitter is always bounded by `max_delay`,
        /// for any base/max/attempt combination.
        #[test]
        fn delay_bounded_no_jitter(
            base_ms in 1u64..10_000,
            max_ms in 100u64..300_000,
            attempt in 1u32..100,
        ) {
            let config = RetryStrategyConfig {
                strategy: RetryStrategyType::Exponential,
                max_attempts: 100,
                base_delay: Duration::from_millis(base_ms.min(max_ms)),
                max_delay: Duration::from_millis(max_ms),
                jitter: 0.0,
            };

            let delay = calculate_delay(&config, attempt);
            proptest::prop_assert!(delay <= config.max_delay);
        }

        /// Property: full jitter never pushes the delay above 2x the
        /// unjittered value, nor does it ever produce a negative delay
        /// (not representable, but it must not panic or overflow either).
        #[test]
        fn delay_with_jitter_stays_within_double_bound(
            base_ms in 1u64..10_000,
            max_ms in 100u64..300_000,
            attempt in 1u32..20,
            jitter in 0.0f64..1.0,
        ) {
            let config = RetryStrategyConfig {
                strategy: RetryStrategyType::Constant,
                max_attempts: 100,
                base_delay: Duration::from_millis(base_ms.min(max_ms)),
                max_delay: Duration::from_millis(max_ms),
                jitter,
            };

            let delay = calculate_delay(&config, attempt);
            proptest::prop_assert!(delay <= config.max_delay * 2);
        }
    }

    #[test]
    fn retry_strategy_config_serde_roundtrip() {
        let config = RetryStrategyConfig {
            strategy: RetryStrategyType::Linear,
            max_attempts: 4,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: RetryStrategyConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.strategy, RetryStrategyType::Linear);
        assert_eq!(parsed.max_attempts, 4);
        assert_eq!(parsed.base_delay, Duration::from_secs(2));
    }
}
