//! Retry policies for activity invocations.
//!
//! Retries are evaluated entirely inside replay: backoff delays are durable
//! timers and the optional per-attempt timeout is a select race between the
//! activity and a timer, so the whole schedule is reconstructible from
//! history. The activity executor itself always reports a single attempt.

use std::time::Duration;

use crate::{DurableOutput, OrchestrationContext};

/// Delay progression between attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffStrategy {
    Fixed { delay: Duration },
    Linear { base: Duration, max: Duration },
    Exponential { base: Duration, multiplier: f64, max: Duration },
}

impl BackoffStrategy {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed { delay } => *delay,
            BackoffStrategy::Linear { base, max } => base.saturating_mul(attempt).min(*max),
            BackoffStrategy::Exponential { base, multiplier, max } => {
                let factor = multiplier.powi(attempt.saturating_sub(1) as i32);
                let ms = (base.as_millis() as f64 * factor).min(max.as_millis() as f64);
                Duration::from_millis(ms as u64)
            }
        }
    }
}

/// Caller-declared retry policy for an activity.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first; at least 1.
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    /// Per-attempt timeout; a timed-out attempt counts as a failure.
    pub timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::Exponential {
                base: Duration::from_millis(100),
                multiplier: 2.0,
                max: Duration::from_secs(30),
            },
            timeout: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        assert!(max_attempts >= 1, "max_attempts must be at least 1");
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }
}

impl OrchestrationContext {
    /// Schedule an activity under a retry policy. Returns the first success,
    /// or the last attempt's error once the policy is exhausted.
    pub async fn schedule_activity_with_retry(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        policy: RetryPolicy,
    ) -> Result<String, String> {
        let name = name.into();
        let input = input.into();
        let mut last_error = String::new();

        for attempt in 1..=policy.max_attempts {
            let outcome = match policy.timeout {
                Some(timeout) => {
                    let activity = self.schedule_activity(&name, &input);
                    let deadline = self.schedule_timer(timeout.as_millis() as u64);
                    let (winner, output) = self.select(vec![activity, deadline]).await;
                    match (winner, output) {
                        (0, DurableOutput::Activity(r)) => Some(r),
                        (1, DurableOutput::Timer) => None,
                        other => panic!("unexpected select outcome in retry race: {other:?}"),
                    }
                }
                None => Some(self.schedule_activity(&name, &input).into_activity().await),
            };

            match outcome {
                Some(Ok(result)) => return Ok(result),
                Some(Err(error)) => last_error = error,
                None => {
                    last_error = format!("timeout: activity '{name}' attempt {attempt} exceeded deadline");
                }
            }

            if attempt < policy.max_attempts {
                let delay = policy.backoff.delay_after_attempt(attempt);
                if !delay.is_zero() {
                    self.schedule_timer(delay.as_millis() as u64).into_timer().await;
                }
            }
        }

        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_backoff_is_constant() {
        let b = BackoffStrategy::Fixed {
            delay: Duration::from_millis(250),
        };
        assert_eq!(b.delay_after_attempt(1), Duration::from_millis(250));
        assert_eq!(b.delay_after_attempt(7), Duration::from_millis(250));
    }

    #[test]
    fn linear_backoff_caps_at_max() {
        let b = BackoffStrategy::Linear {
            base: Duration::from_millis(100),
            max: Duration::from_millis(350),
        };
        assert_eq!(b.delay_after_attempt(1), Duration::from_millis(100));
        assert_eq!(b.delay_after_attempt(3), Duration::from_millis(300));
        assert_eq!(b.delay_after_attempt(4), Duration::from_millis(350));
    }

    #[test]
    fn exponential_backoff_doubles_then_caps() {
        let b = BackoffStrategy::Exponential {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_secs(1),
        };
        assert_eq!(b.delay_after_attempt(1), Duration::from_millis(100));
        assert_eq!(b.delay_after_attempt(2), Duration::from_millis(200));
        assert_eq!(b.delay_after_attempt(3), Duration::from_millis(400));
        assert_eq!(b.delay_after_attempt(6), Duration::from_secs(1));
    }

    #[test]
    #[should_panic(expected = "max_attempts must be at least 1")]
    fn zero_attempts_rejected() {
        let _ = RetryPolicy::new(0);
    }

    #[test]
    fn builder_chain() {
        let p = RetryPolicy::new(5)
            .with_timeout(Duration::from_secs(60))
            .with_backoff(BackoffStrategy::Fixed {
                delay: Duration::from_secs(1),
            });
        assert_eq!(p.max_attempts, 5);
        assert_eq!(p.timeout, Some(Duration::from_secs(60)));
        assert!(matches!(p.backoff, BackoffStrategy::Fixed { .. }));
    }
}
