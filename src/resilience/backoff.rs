//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Delay before retry number `attempt` (1-based). Attempt 0 never waits.
pub fn retry_delay(attempt: u32, config: &RetryConfig) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let capped = config
        .base_delay_ms
        .saturating_mul(2u64.saturating_pow(attempt - 1))
        .min(config.max_delay_ms);

    // Up to 10% jitter so retries from many clients spread out.
    let jitter_range = capped / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped + jitter)
}
