//! The fixed retry-delay schedule used by the queue store.
//!
//! The specification fixes the curve rather than leaving it configurable, so
//! unlike a general-purpose `RetryPolicy` with a coefficient and a ceiling,
//! this is just a lookup table indexed by the number of attempts already
//! made at the moment of failure.

use chrono::Duration;

/// Delay before a job becomes claimable again, indexed by `attempts - 1`
/// (the zero-indexed count of attempts already completed). The last entry
/// repeats for any attempt count beyond the table's length.
const SCHEDULE_SECONDS: &[i64] = &[30, 60, 120, 300, 600];

/// Compute the backoff delay for a job that has just failed after
/// `prior_attempts` completed attempts.
pub fn delay_for(prior_attempts: i32) -> Duration {
    let index = (prior_attempts.max(0) as usize).min(SCHEDULE_SECONDS.len() - 1);
    Duration::seconds(SCHEDULE_SECONDS[index])
}
