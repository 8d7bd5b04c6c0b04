use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Delay before the `retries`-th reconnect attempt (1-based)
///
/// Exponential: `min(base * 2^(retries - 1), max)`. Otherwise always `base`.
pub fn retry_delay(retries: u32, base: Duration, max: Duration, exponential: bool) -> Duration {
    if !exponential {
        return base;
    }
    let exponent = retries.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent)
        .map_or(max, |delay| delay.min(max))
}

/// Sleeps for `delay` unless `cancel` fires first
///
/// # Returns
///
/// `false` if the sleep was interrupted
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
