use std::time::Duration;

use crate::config::{BackoffKind, ExecutionConfig};

/// Delay schedule between placement attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// Doubles after every failure, capped at `max`
    Exponential { initial: Duration, max: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Fixed(Duration::from_secs(1)),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ExecutionConfig) -> Self {
        let initial = Duration::from_millis(config.backoff_ms);
        let backoff = match config.backoff {
            BackoffKind::Fixed => Backoff::Fixed(initial),
            BackoffKind::Exponential => Backoff::Exponential {
                initial,
                max: Duration::from_millis(config.max_backoff_ms),
            },
        };
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff,
        }
    }

    /// Wait before the attempt following failed attempt number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { initial, max } => {
                let exponent = attempt.saturating_sub(1).min(16);
                initial.saturating_mul(1 << exponent).min(max)
            }
        }
    }
}

/// How long to wait for an order to fill, and how often to ask
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillPolicy {
    pub max_wait: Duration,
    pub poll_interval: Duration,
}

impl Default for FillPolicy {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(5),
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl FillPolicy {
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self {
            max_wait: Duration::from_millis(config.max_fill_wait_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_backoff_is_constant() {
        let policy = RetryPolicy::default();
        for attempt in 1..=5 {
            assert_eq!(policy.delay(attempt), Duration::from_secs(1));
        }
    }

    #[test]
    fn test_exponential_backoff_doubles_until_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            backoff: Backoff::Exponential {
                initial: Duration::from_millis(100),
                max: Duration::from_millis(1_000),
            },
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(4), Duration::from_millis(800));
        assert_eq!(policy.delay(5), Duration::from_millis(1_000));
        assert_eq!(policy.delay(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_from_config() {
        let config = ExecutionConfig {
            backoff: BackoffKind::Exponential,
            backoff_ms: 250,
            ..Default::default()
        };
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(
            policy.backoff,
            Backoff::Exponential {
                initial: Duration::from_millis(250),
                max: Duration::from_secs(30),
            }
        );

        let fill = FillPolicy::from_config(&ExecutionConfig::default());
        assert_eq!(fill, FillPolicy::default());
    }
}
