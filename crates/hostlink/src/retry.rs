//! Reconnect policy

use hostlink_ssh::TransportError;
use std::time::Duration;

/// Wait between reconnect attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay before every attempt
    Fixed(Duration),
    /// `base * 2^(attempt-1)`, capped at `max`
    Exponential {
        /// Delay before the first attempt
        base: Duration,
        /// Upper bound
        max: Duration,
    },
}

/// What to do after an operation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Reconnect after `delay` and re-issue the operation
    Retry {
        /// Wait before reconnecting
        delay: Duration,
    },
    /// Budget exhausted
    GiveUp,
    /// Not a connection failure; hand the error to the caller
    Propagate,
}

/// Bounded reconnect policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum reconnect attempts per operation
    pub max_attempts: u32,
    /// Delay schedule
    pub backoff: Backoff,
    /// Bound on a single connect attempt
    pub connect_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Fixed(Duration::from_secs(1)),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Never reconnect
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Set the attempt budget
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Use a fixed delay
    pub fn with_fixed_delay(mut self, delay: Duration) -> Self {
        self.backoff = Backoff::Fixed(delay);
        self
    }

    /// Use exponential backoff
    pub fn with_exponential_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff = Backoff::Exponential { base, max };
        self
    }

    /// Set the per-attempt connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Delay before reconnect attempt `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                base.saturating_mul(factor).min(max)
            }
        }
    }

    /// Decide how to handle `error` after `attempts` reconnects have already been made
    pub fn decide(&self, attempts: u32, error: &TransportError) -> RetryDecision {
        if !error.is_transient() {
            return RetryDecision::Propagate;
        }
        if attempts >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry {
            delay: self.delay(attempts + 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostlink_proto::RemoteErrorKind;
    use proptest::prelude::*;

    #[test]
    fn test_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(3), Duration::from_secs(1));
        assert_eq!(policy.connect_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_exponential_delay() {
        let policy = RetryPolicy::default()
            .with_exponential_backoff(Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(4), Duration::from_millis(500));
        assert_eq!(policy.delay(64), Duration::from_millis(500));
    }

    #[test]
    fn test_decide() {
        let policy = RetryPolicy::default().with_fixed_delay(Duration::ZERO);
        let reset = TransportError::Connection("reset".into());

        assert_eq!(policy.decide(0, &reset), RetryDecision::Retry { delay: Duration::ZERO });
        assert_eq!(policy.decide(2, &reset), RetryDecision::Retry { delay: Duration::ZERO });
        assert_eq!(policy.decide(3, &reset), RetryDecision::GiveUp);

        let missing = TransportError::remote(RemoteErrorKind::NotFound, "/x");
        assert_eq!(policy.decide(0, &missing), RetryDecision::Propagate);
        assert_eq!(RetryPolicy::none().decide(0, &reset), RetryDecision::GiveUp);
    }

    proptest! {
        #[test]
        fn prop_retries_exactly_budget(budget in 0u32..10) {
            let policy = RetryPolicy::default().with_max_attempts(budget);
            let err = TransportError::Timeout;
            let retries = (0..20)
                .take_while(|attempts| matches!(policy.decide(*attempts, &err), RetryDecision::Retry { .. }))
                .count();
            prop_assert_eq!(retries as u32, budget);
        }
    }
}
