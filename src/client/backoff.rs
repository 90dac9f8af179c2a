//! Reconnect backoff policy
//!
//! Delays grow as `base * 2^attempt`, capped at `cap`. After `max_attempts`
//! abnormal closures without a successful connection in between, the client
//! gives up until a fresh connection request starts a new [`Backoff`].

use std::time::Duration;

/// Reconnect timing and ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay unit doubled per attempt
    pub base: Duration,
    /// Upper bound on any single delay
    pub cap: Duration,
    /// Abnormal closures tolerated before giving up
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1_000),
            cap: Duration::from_millis(10_000),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
        }
    }

    /// `min(base * 2^attempt, cap)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }

    /// Start tracking attempts for a new connection request
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            attempts: 0,
        }
    }
}

/// What to do after an abnormal closure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Try again after the delay
    Retry { attempt: u32, delay: Duration },
    /// The attempt ceiling was reached
    GiveUp { attempts: u32 },
}

/// Attempt counter for one connection request
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempts: u32,
}

impl Backoff {
    /// Abnormal closures since the last successful connection
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record a successful connection
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Record an abnormal closure and decide whether to retry
    pub fn on_abnormal_close(&mut self) -> ReconnectDecision {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts >= self.policy.max_attempts {
            ReconnectDecision::GiveUp {
                attempts: self.attempts,
            }
        } else {
            ReconnectDecision::Retry {
                attempt: self.attempts,
                delay: self.policy.delay_for(self.attempts),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn test_delay_doubles_until_cap() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(0), ms(1_000));
        assert_eq!(policy.delay_for(1), ms(2_000));
        assert_eq!(policy.delay_for(2), ms(4_000));
        assert_eq!(policy.delay_for(3), ms(8_000));
        assert_eq!(policy.delay_for(4), ms(10_000));
        assert_eq!(policy.delay_for(20), ms(10_000));
    }

    #[test]
    fn test_delay_saturates_on_huge_attempts() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(64), ms(10_000));
        assert_eq!(policy.delay_for(u32::MAX), ms(10_000));

        let wide = ReconnectPolicy::new(Duration::from_secs(u64::MAX / 2), Duration::MAX, 5);
        assert_eq!(wide.delay_for(8), Duration::MAX);
    }

    #[test]
    fn test_retries_until_ceiling() {
        let mut backoff = ReconnectPolicy::default().backoff();
        let expected = [ms(2_000), ms(4_000), ms(8_000), ms(10_000)];

        for (i, delay) in expected.iter().enumerate() {
            assert_eq!(
                backoff.on_abnormal_close(),
                ReconnectDecision::Retry {
                    attempt: i as u32 + 1,
                    delay: *delay,
                }
            );
        }
        assert_eq!(
            backoff.on_abnormal_close(),
            ReconnectDecision::GiveUp { attempts: 5 }
        );
    }

    #[test]
    fn test_reset_on_success() {
        let mut backoff = ReconnectPolicy::default().backoff();
        let _ = backoff.on_abnormal_close();
        let _ = backoff.on_abnormal_close();
        assert_eq!(backoff.attempts(), 2);

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(
            backoff.on_abnormal_close(),
            ReconnectDecision::Retry {
                attempt: 1,
                delay: ms(2_000),
            }
        );
    }

    #[test]
    fn test_fresh_backoff_per_request() {
        let policy = ReconnectPolicy::new(ms(10), ms(40), 2);
        let mut first = policy.backoff();
        let _ = first.on_abnormal_close();
        assert!(matches!(
            first.on_abnormal_close(),
            ReconnectDecision::GiveUp { .. }
        ));

        let mut second = policy.backoff();
        assert!(matches!(
            second.on_abnormal_close(),
            ReconnectDecision::Retry { attempt: 1, .. }
        ));
    }

    #[test]
    fn test_delay_never_exceeds_cap() {
        let policy = ReconnectPolicy::new(ms(300), ms(1_000), 10);
        for attempt in 0..32 {
            assert!(policy.delay_for(attempt) <= policy.cap);
        }
    }
}
