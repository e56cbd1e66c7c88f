//! Retry utilities: backoff builders for broker (re)connects.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff for direct broker connection attempts.
///
/// - Min delay: 100ms
/// - Max delay: 10s
/// - Max attempts: `max_attempts` retries after the first try
/// - Jitter enabled
pub fn connection_backoff(max_attempts: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(10))
        .with_max_times(max_attempts)
        .with_jitter()
}
