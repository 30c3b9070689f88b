//! Reconnect backoff and relay status classification

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// How hard a voice swap tries to reach the new session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Wait before the first retry
    pub base_delay: Duration,
    /// Longest wait between two attempts
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

/// Waits between reconnect attempts under a [`RetryPolicy`]
///
/// Yields one delay per retry the policy allows, so `n` attempts give `n - 1`
/// delays. Each wait doubles the one before, up to `max_delay`, plus up to a
/// quarter of itself as jitter so clients that lost the same relay spread out.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    step: Duration,
    ceiling: Duration,
    retries_left: u32,
}

impl ReconnectBackoff {
    #[must_use]
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            step: policy.base_delay.min(policy.max_delay),
            ceiling: policy.max_delay,
            retries_left: policy.max_attempts.saturating_sub(1),
        }
    }
}

impl Iterator for ReconnectBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        self.retries_left = self.retries_left.checked_sub(1)?;
        let step = self.step;
        self.step = step.saturating_mul(2).min(self.ceiling);
        Some((step + jitter(step)).min(self.ceiling))
    }
}

/// Clock-seeded share of `step`, below a quarter of it
fn jitter(step: Duration) -> Duration {
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.subsec_micros());
    step / 4 * (seed % 100) / 100
}

/// Whether an HTTP status from the relay is worth retrying
///
/// Rate limits (429) and server errors (5xx) are transient; other client
/// errors mean the request itself is rejected.
#[must_use]
pub fn is_recoverable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32, base_ms: u64, max_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
        }
    }

    #[test]
    fn one_wait_between_each_pair_of_attempts() {
        assert_eq!(ReconnectBackoff::new(&policy(4, 10, 1000)).count(), 3);
        assert_eq!(ReconnectBackoff::new(&policy(1, 10, 1000)).count(), 0);
        assert_eq!(ReconnectBackoff::new(&policy(0, 10, 1000)).count(), 0);
    }

    #[test]
    fn waits_double_then_hold_at_ceiling() {
        let waits: Vec<Duration> = ReconnectBackoff::new(&policy(5, 100, 350)).collect();

        let ms = |d: &Duration| d.as_millis();
        assert!((100..125).contains(&ms(&waits[0])), "first wait {:?}", waits[0]);
        assert!((200..250).contains(&ms(&waits[1])), "second wait {:?}", waits[1]);
        assert_eq!(waits[2], Duration::from_millis(350));
        assert_eq!(waits[3], Duration::from_millis(350));
    }

    #[test]
    fn base_above_ceiling_is_clamped() {
        let waits: Vec<Duration> = ReconnectBackoff::new(&policy(3, 5000, 40)).collect();
        assert_eq!(waits, vec![Duration::from_millis(40); 2]);
    }

    #[test]
    fn relay_statuses_worth_retrying() {
        for status in [429, 500, 502, 503, 599] {
            assert!(is_recoverable_status(status), "{status}");
        }
        for status in [200, 400, 401, 403, 404] {
            assert!(!is_recoverable_status(status), "{status}");
        }
    }
}
