#![no_main]

use cloudsync_retry::{RetryStrategyConfig, RetryStrategyType, calculate_delay};
use libfuzzer_sys::fuzz_target;
use std::time::Duration;

fuzz_target!(|data: (u32, u8, u64, u64, u8)| {
    let (attempt, strategy_type, base_ms, max_ms, jitter_byte) = data;

    let attempt = attempt % 100 + 1;
    let strategy = match strategy_type % 4 {
        0 => RetryStrategyType::Immediate,
        1 => RetryStrategyType::Exponential,
        2 => RetryStrategyType::Linear,
        _ => RetryStrategyType::Constant,
    };
    let base_delay = Duration::from_millis(base_ms % 10000 + 1);
    let max_delay = Duration::from_millis(max_ms % 300000 + 100);
    let jitter = (jitter_byte as f64) / 255.0;

    let config = RetryStrategyConfig {
        strategy,
        max_attempts: 100,
        base_delay,
        max_delay,
        jitter,
    };

    let delay = calculate_delay(&config, attempt);

    // Jitter is applied after capping at `max_delay`, and can scale the
    // capped value up to `1 + jitter` (<= 2x), not just down.
    assert!(delay <= max_delay * 2 || strategy == RetryStrategyType::Immediate);

    if strategy == RetryStrategyType::Immediate {
        assert_eq!(delay, Duration::ZERO);
    }

    if strategy == RetryStrategyType::Constant && jitter == 0.0 {
        assert_eq!(delay, base_delay.min(max_delay));
    }
});
