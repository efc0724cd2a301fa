//! Retry policy, outcome classification, and jittered backoff.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

/// Sentinel distinguishing a bounded retry budget from fire-and-forget mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Retries {
    /// Retry up to `n` additional times after the first attempt.
    Bounded(u32),
    /// Issue the request without awaiting its outcome; see spec §4.4.
    FireAndForget,
}

impl Default for Retries {
    fn default() -> Self {
        Retries::Bounded(3)
    }
}

/// Classification of a single attempt's outcome, used to drive the retry
/// state machine.
#[derive(Debug, Clone)]
pub enum Outcome {
    Ok,
    Network,
    Timeout,
    Tls,
    RateLimited { delay_hint: Option<Duration> },
    Transient { status: u16 },
    Permanent { status: u16 },
}

impl Outcome {
    pub fn from_status(status: u16, retry_on: &HashSet<u16>, retry_after: Option<Duration>) -> Self {
        if (200..300).contains(&status) {
            Outcome::Ok
        } else if status == 429 && retry_after.is_some() {
            Outcome::RateLimited {
                delay_hint: retry_after,
            }
        } else if retry_on.contains(&status) {
            Outcome::Transient { status }
        } else {
            Outcome::Permanent { status }
        }
    }

    fn is_retryable_by_class(&self) -> bool {
        matches!(
            self,
            Outcome::Network | Outcome::Timeout | Outcome::Tls | Outcome::Transient { .. } | Outcome::RateLimited { .. }
        )
    }
}

/// Caller-supplied override for the class-based retry decision. Takes
/// precedence over the default classification when present (spec §9).
pub type RetryPredicate = Arc<dyn Fn(&Outcome, u32) -> bool + Send + Sync>;

/// Retry/backoff policy for a run.
#[derive(Clone)]
pub struct RetryPolicy {
    pub retries: Retries,
    pub base_delay: Duration,
    pub timeout: Duration,
    pub retry_on: HashSet<u16>,
    pub static_delay: bool,
    pub retry_predicate: Option<RetryPredicate>,
}

const DECORRELATED_CAP: Duration = Duration::from_millis(30_000);
const RATE_LIMIT_CAP: Duration = Duration::from_secs(60);

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: Retries::default(),
            base_delay: Duration::from_millis(1000),
            timeout: Duration::from_millis(60_000),
            retry_on: default_retry_on(),
            static_delay: false,
            retry_predicate: None,
        }
    }
}

/// `{408, 429, 500, 502, 503, 504}` — the default retry-eligible status set.
pub fn default_retry_on() -> HashSet<u16> {
    [408, 429, 500, 502, 503, 504].into_iter().collect()
}

/// Decision returned by [`RetryPolicy::decide`].
pub enum Decision {
    /// Terminal success.
    Ok,
    /// Terminal, non-retryable failure.
    Failed,
    /// Retry budget exhausted.
    GivenUp,
    /// Wait `delay` then attempt again.
    Retry { delay: Duration },
}

impl RetryPolicy {
    /// Apply the retry state machine (spec §4.4) to a single outcome.
    ///
    /// `attempt_count` is the number of attempts already made (0-based,
    /// i.e. this outcome is for attempt `attempt_count`). `prev_delay` is
    /// the delay used for the previous retry, or `base_delay` if this is
    /// the first.
    pub fn decide(&self, outcome: &Outcome, attempt_count: u32, prev_delay: Duration) -> Decision {
        if let Outcome::Ok = outcome {
            return Decision::Ok;
        }

        if let Outcome::Permanent { .. } = outcome {
            // retry_predicate is consulted on "any non-OK outcome" per
            // spec §4.4, including permanent failures.
            if let Some(predicate) = &self.retry_predicate {
                if !predicate(outcome, attempt_count) {
                    return Decision::Failed;
                }
            } else {
                return Decision::Failed;
            }
        } else if let Some(predicate) = &self.retry_predicate {
            if !predicate(outcome, attempt_count) {
                return Decision::Failed;
            }
        } else if !outcome.is_retryable_by_class() {
            return Decision::Failed;
        }

        let max_retries = match self.retries {
            Retries::FireAndForget => return Decision::Ok,
            Retries::Bounded(n) => n,
        };

        if attempt_count >= max_retries {
            return Decision::GivenUp;
        }

        Decision::Retry {
            delay: self.next_delay(outcome, prev_delay),
        }
    }

    /// Compute the delay before the next attempt (spec §4.4).
    fn next_delay(&self, outcome: &Outcome, prev_delay: Duration) -> Duration {
        if let Outcome::RateLimited {
            delay_hint: Some(hint),
        } = outcome
        {
            return (*hint).min(RATE_LIMIT_CAP);
        }

        if self.static_delay {
            return self.base_delay;
        }

        decorrelated_jitter(self.base_delay, prev_delay)
    }
}

/// Decorrelated jitter: `min(cap, random_between(base, prev_delay * 3))`.
pub fn decorrelated_jitter(base: Duration, prev_delay: Duration) -> Duration {
    let lower = base.as_secs_f64();
    let upper = (prev_delay.as_secs_f64() * 3.0).max(lower);
    let sampled = if upper > lower {
        rand::thread_rng().gen_range(lower..=upper)
    } else {
        lower
    };
    Duration::from_secs_f64(sampled).min(DECORRELATED_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decorrelated_jitter_stays_in_bounds() {
        let base = Duration::from_millis(100);
        let mut prev = base;
        for _ in 0..20 {
            let delay = decorrelated_jitter(base, prev);
            assert!(delay >= base || delay.as_millis() == base.as_millis());
            assert!(delay <= DECORRELATED_CAP);
            prev = delay;
        }
    }

    #[test]
    fn rate_limited_hint_is_capped() {
        let policy = RetryPolicy::default();
        let delay = policy.next_delay(
            &Outcome::RateLimited {
                delay_hint: Some(Duration::from_secs(9999)),
            },
            Duration::from_millis(100),
        );
        assert_eq!(delay, RATE_LIMIT_CAP);
    }

    #[test]
    fn fire_and_forget_is_always_ok() {
        let policy = RetryPolicy {
            retries: Retries::FireAndForget,
            ..RetryPolicy::default()
        };
        let decision = policy.decide(&Outcome::Transient { status: 500 }, 0, policy.base_delay);
        assert!(matches!(decision, Decision::Ok));
    }

    #[test]
    fn gives_up_after_max_retries() {
        let policy = RetryPolicy {
            retries: Retries::Bounded(2),
            ..RetryPolicy::default()
        };
        assert!(matches!(
            policy.decide(&Outcome::Network, 0, policy.base_delay),
            Decision::Retry { .. }
        ));
        assert!(matches!(
            policy.decide(&Outcome::Network, 1, policy.base_delay),
            Decision::Retry { .. }
        ));
        assert!(matches!(
            policy.decide(&Outcome::Network, 2, policy.base_delay),
            Decision::GivenUp
        ));
    }

    #[test]
    fn predicate_overrides_class_based_decision() {
        let policy = RetryPolicy {
            retry_predicate: Some(Arc::new(|_, _| false)),
            ..RetryPolicy::default()
        };
        assert!(matches!(
            policy.decide(&Outcome::Network, 0, policy.base_delay),
            Decision::Failed
        ));
    }
}
