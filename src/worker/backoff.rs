//! Exponential backoff policy for transient send failures.

use std::time::Duration;

/// Delay before the next attempt after `attempt` failed.
///
/// `base * 2^(attempt - 1)`, floored at `base` and capped at `max`.
/// `attempt` is the post-increment attempt count from the lease step,
/// so the first retry waits `base`, the second `2 * base`, and so on.
#[must_use]
pub fn retry_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let attempt = attempt.max(1);
    let factor = 2u32.saturating_pow(attempt - 1);
    let delay = base.saturating_mul(factor);
    delay.max(base).min(max)
}
