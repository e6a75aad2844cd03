use std::time::Duration;

use rand::Rng;

pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Wait policy between failed connection attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Same interval before every retry.
    Fixed,
    /// Interval doubles per retry up to `max`, optionally scaled by a random
    /// factor in `[0.5, 1.0]`.
    Exponential { max: Duration, jitter: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub interval: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_MAX_RETRIES, DEFAULT_RETRY_INTERVAL)
    }
}

impl RetryPolicy {
    pub fn fixed(max_retries: u32, interval: Duration) -> Self {
        Self {
            max_retries,
            interval,
            backoff: Backoff::Fixed,
        }
    }

    pub fn exponential(max_retries: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_retries,
            interval: base,
            backoff: Backoff::Exponential { max, jitter: true },
        }
    }

    /// Delay before the `retry`-th retry (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.interval,
            Backoff::Exponential { max, jitter } => {
                let exponent = retry.saturating_sub(1).min(16);
                let delay = self.interval.saturating_mul(1u32 << exponent).min(max);
                if jitter {
                    delay.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
                } else {
                    delay
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_policy_never_grows() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 5);
        for retry in 1..=5 {
            assert_eq!(policy.delay_for(retry), Duration::from_secs(5));
        }
    }

    #[test]
    fn exponential_policy_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            interval: Duration::from_millis(500),
            backoff: Backoff::Exponential {
                max: Duration::from_secs(4),
                jitter: false,
            },
        };
        let delays: Vec<_> = (1..=6).map(|retry| policy.delay_for(retry)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(4),
                Duration::from_secs(4),
            ]
        );
    }

    #[test]
    fn jitter_stays_within_half_to_full_delay() {
        let policy = RetryPolicy::exponential(5, Duration::from_secs(2), Duration::from_secs(60));
        for _ in 0..32 {
            let delay = policy.delay_for(3);
            assert!(delay >= Duration::from_secs(4), "{delay:?}");
            assert!(delay <= Duration::from_secs(8), "{delay:?}");
        }
    }
}
