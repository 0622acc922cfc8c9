//! Retry policy module.
//!
//! Defines backoff strategies and a bounded retry loop shared by the update
//! orchestrator (flaky devserver retries) and the RPC bootstrapper (server
//! readiness polling).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::Clock;
use crate::config::humantime_serde;

/// Backoff configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffConfig {
    /// Fixed delay between attempts.
    Fixed {
        /// Delay duration.
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },

    /// Exponential backoff.
    Exponential {
        /// Initial delay.
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,

        /// Maximum delay.
        #[serde(with = "humantime_serde")]
        max_delay: Duration,

        /// Multiplier for each retry (default: 2.0).
        #[serde(default = "default_multiplier")]
        multiplier: f64,
    },

    /// Linear backoff.
    Linear {
        /// Initial delay.
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,

        /// Increment per retry.
        #[serde(with = "humantime_serde")]
        increment: Duration,

        /// Maximum delay.
        #[serde(with = "humantime_serde")]
        max_delay: Duration,
    },
}

const fn default_multiplier() -> f64 {
    2.0
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::Exponential {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// No delay between attempts.
    #[must_use]
    pub const fn immediate() -> Self {
        Self::Fixed {
            delay: Duration::ZERO,
        }
    }

    /// Calculate the delay after a given attempt number (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => {
                let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                let delay_secs = initial_delay.as_secs_f64() * multiplier.powi(exponent);
                if !delay_secs.is_finite() || delay_secs >= max_delay.as_secs_f64() {
                    return *max_delay;
                }
                Duration::from_secs_f64(delay_secs).min(*max_delay)
            },
            Self::Linear {
                initial_delay,
                increment,
                max_delay,
            } => {
                let delay = increment
                    .checked_mul(attempt - 1)
                    .and_then(|inc| initial_delay.checked_add(inc))
                    .unwrap_or(*max_delay);
                delay.min(*max_delay)
            },
        }
    }
}

/// What the retry loop should do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after the backoff delay.
    Retry,
    /// Stop and surface the error.
    Abort,
}

/// Why a retried operation ultimately failed.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The retry predicate refused to retry this error.
    Aborted(E),
    /// Every allowed attempt failed.
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last: E,
    },
    /// The overall deadline passed before an attempt succeeded.
    DeadlineExceeded {
        /// Time spent across all attempts.
        elapsed: Duration,
        /// Error from the final attempt.
        last: E,
    },
}

impl<E> RetryError<E> {
    /// Returns the error from the last attempt.
    pub fn into_inner(self) -> E {
        match self {
            Self::Aborted(err)
            | Self::Exhausted { last: err, .. }
            | Self::DeadlineExceeded { last: err, .. } => err,
        }
    }

    /// Returns true when the deadline, not the attempt budget, ended the loop.
    #[must_use]
    pub const fn is_deadline(&self) -> bool {
        matches!(self, Self::DeadlineExceeded { .. })
    }
}

/// Bounded retry: attempt budget, backoff between attempts and an optional
/// overall deadline.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay schedule between attempts.
    pub backoff: BackoffConfig,
    /// Overall deadline measured from the first attempt.
    pub timeout: Option<Duration>,
}

impl RetryPolicy {
    /// A policy that allows `max_attempts` attempts with no delay.
    #[must_use]
    pub const fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: BackoffConfig::immediate(),
            timeout: None,
        }
    }

    /// A policy bounded only by an overall deadline.
    #[must_use]
    pub fn deadline(timeout: Duration) -> Self {
        Self {
            max_attempts: u32::MAX,
            backoff: BackoffConfig::default(),
            timeout: Some(timeout),
        }
    }

    /// Sets the backoff schedule.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Runs `op` until it succeeds, the predicate aborts, attempts run out or
    /// the deadline passes.
    ///
    /// `op` receives the 1-based attempt number. `classify` is only consulted
    /// when another attempt is still allowed.
    pub fn run<T, E, Op, Classify>(
        &self,
        clock: &dyn Clock,
        mut op: Op,
        mut classify: Classify,
    ) -> Result<T, RetryError<E>>
    where
        Op: FnMut(u32) -> Result<T, E>,
        Classify: FnMut(&E) -> RetryDecision,
    {
        let start = clock.now();
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let err = match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if attempt >= max_attempts {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }

            let mut delay = self.backoff.delay_for_attempt(attempt);
            if let Some(timeout) = self.timeout {
                let elapsed = clock.since(start);
                if elapsed >= timeout {
                    return Err(RetryError::DeadlineExceeded { elapsed, last: err });
                }
                delay = delay.min(timeout - elapsed);
            }

            if classify(&err) == RetryDecision::Abort {
                return Err(RetryError::Aborted(err));
            }

            debug!(attempt, delay_ms = delay.as_millis(), "retrying after failure");
            if !delay.is_zero() {
                clock.sleep(delay);
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_exponential_backoff() {
        let backoff = BackoffConfig::Exponential {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        };

        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(backoff.delay_for_attempt(10), Duration::from_secs(60));
        assert_eq!(backoff.delay_for_attempt(5000), Duration::from_secs(60));
    }

    #[test]
    fn test_linear_backoff() {
        let backoff = BackoffConfig::Linear {
            initial_delay: Duration::from_secs(1),
            increment: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
        };

        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(3));
        assert_eq!(backoff.delay_for_attempt(10), Duration::from_secs(10));
    }

    #[test]
    fn test_attempt_budget_exhausted() {
        let clock = ManualClock::new();
        let mut calls = 0;
        let result: Result<(), _> = RetryPolicy::attempts(2).run(
            &clock,
            |_| {
                calls += 1;
                Err::<(), _>("flaky")
            },
            |_| RetryDecision::Retry,
        );

        assert_eq!(calls, 2);
        assert!(matches!(
            result,
            Err(RetryError::Exhausted {
                attempts: 2,
                last: "flaky"
            })
        ));
    }

    #[test]
    fn test_abort_stops_immediately() {
        let clock = ManualClock::new();
        let mut calls = 0;
        let result: Result<(), _> = RetryPolicy::attempts(5).run(
            &clock,
            |_| {
                calls += 1;
                Err::<(), _>("fatal")
            },
            |_| RetryDecision::Abort,
        );

        assert_eq!(calls, 1);
        assert_eq!(result.unwrap_err().into_inner(), "fatal");
    }

    #[test]
    fn test_deadline_bounds_total_wait() {
        let clock = ManualClock::new();
        let policy = RetryPolicy::deadline(Duration::from_secs(10)).with_backoff(
            BackoffConfig::Exponential {
                initial_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(4),
                multiplier: 2.0,
            },
        );

        let result: Result<(), _> =
            policy.run(&clock, |_| Err::<(), _>("refused"), |_| RetryDecision::Retry);

        let err = result.unwrap_err();
        assert!(err.is_deadline());
        assert_eq!(clock.elapsed(), Duration::from_secs(10));
    }

    #[test]
    fn test_success_after_retries() {
        let clock = ManualClock::new();
        let result = RetryPolicy::attempts(3).run(
            &clock,
            |attempt| if attempt < 3 { Err("nope") } else { Ok(attempt) },
            |_| RetryDecision::Retry,
        );

        assert_eq!(result.unwrap(), 3);
    }
}
