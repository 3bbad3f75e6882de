//! Backoff and failure classification shared by every fetch.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{ConfigError, FailureClass, FetchError};

/// Maps one failed attempt to transient or terminal.
pub type Classifier = fn(&FetchError) -> FailureClass;

/// Timeouts, connection drops, 408, 429 and 5xx are worth another attempt.
/// Any other 4xx, a bad URL or a wrong content type is not.
pub fn default_classifier(err: &FetchError) -> FailureClass {
    match err {
        FetchError::Timeout(_) | FetchError::Connection(_) | FetchError::LengthMismatch { .. } => {
            FailureClass::Transient
        }
        FetchError::Status(code) => match code {
            408 | 425 | 429 => FailureClass::Transient,
            500..=599 => FailureClass::Transient,
            _ => FailureClass::Terminal,
        },
        FetchError::UnexpectedContentType(_) | FetchError::InvalidUrl(_) => FailureClass::Terminal,
    }
}

/// Stateless retry configuration, shared read-only by all jobs.
///
/// The delay before attempt `n + 1` is
/// `min(base * multiplier^(n-1) * (1 + j), max_delay)` with `j` drawn from
/// `[jitter_min, jitter_max]`.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter_min: f64,
    pub jitter_max: f64,
    /// Ceiling for one attempt, independent of the backoff delay.
    pub attempt_timeout_secs: u64,
    #[serde(skip, default = "default_classifier_fn")]
    pub classifier: Classifier,
}

fn default_classifier_fn() -> Classifier {
    default_classifier
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter_min: 0.0,
            jitter_max: 0.25,
            attempt_timeout_secs: 30,
            classifier: default_classifier,
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay_ms", &self.base_delay_ms)
            .field("multiplier", &self.multiplier)
            .field("max_delay_ms", &self.max_delay_ms)
            .field("jitter", &(self.jitter_min..=self.jitter_max))
            .field("attempt_timeout_secs", &self.attempt_timeout_secs)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    pub fn classify(&self, err: &FetchError) -> FailureClass {
        (self.classifier)(err)
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    /// Delay without jitter before the attempt following `attempt` (1-based).
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let ms = self.base_delay_ms as f64 * self.multiplier.powi(exp);
        Duration::from_millis(ms.min(self.max_delay_ms as f64) as u64)
    }

    /// Delay for a given jitter fraction; split out so the formula is testable.
    pub fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let ms = self.base_delay_ms as f64 * self.multiplier.powi(exp) * (1.0 + jitter);
        Duration::from_millis(ms.min(self.max_delay_ms as f64) as u64)
    }

    /// Jittered delay before the attempt following `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter_max > self.jitter_min {
            rand::thread_rng().gen_range(self.jitter_min..=self.jitter_max)
        } else {
            self.jitter_min
        };
        self.delay_with_jitter(attempt, jitter)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.attempt_timeout_secs == 0 {
            return Err(ConfigError::Invalid("retry.attempt_timeout_secs must be positive".into()));
        }
        if self.jitter_min < 0.0 || self.jitter_min > self.jitter_max {
            return Err(ConfigError::Invalid(format!(
                "retry jitter bounds [{}, {}] are not an increasing non-negative range",
                self.jitter_min, self.jitter_max
            )));
        }
        // Keeps consecutive jittered delays non-decreasing.
        if self.multiplier < 1.0 + self.jitter_max {
            return Err(ConfigError::Invalid(format!(
                "retry.multiplier {} must be at least 1 + jitter_max ({})",
                self.multiplier,
                1.0 + self.jitter_max
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_statuses() {
        let p = RetryPolicy::default();
        assert_eq!(p.classify(&FetchError::Status(503)), FailureClass::Transient);
        assert_eq!(p.classify(&FetchError::Status(429)), FailureClass::Transient);
        assert_eq!(p.classify(&FetchError::Status(404)), FailureClass::Terminal);
        assert_eq!(p.classify(&FetchError::Status(410)), FailureClass::Terminal);
        assert_eq!(
            p.classify(&FetchError::Connection("reset".into())),
            FailureClass::Transient
        );
    }

    #[test]
    fn nominal_delays_grow_and_cap() {
        let p = RetryPolicy {
            base_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 1_000,
            ..RetryPolicy::default()
        };
        let delays: Vec<u64> = (1..=6).map(|a| p.nominal_delay(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn jittered_delays_never_decrease() {
        let p = RetryPolicy::default();
        p.validate().unwrap();
        for attempt in 1..12 {
            // Worst case: maximum jitter now, minimum jitter next time.
            let now = p.delay_with_jitter(attempt, p.jitter_max);
            let next = p.delay_with_jitter(attempt + 1, p.jitter_min);
            assert!(next >= now, "attempt {attempt}: {next:?} < {now:?}");
        }
    }

    #[test]
    fn rejects_multiplier_that_breaks_monotonic_backoff() {
        let p = RetryPolicy {
            multiplier: 1.1,
            jitter_max: 0.5,
            ..RetryPolicy::default()
        };
        assert!(p.validate().is_err());
    }

    #[test]
    fn custom_classifier_is_used() {
        fn everything_terminal(_: &FetchError) -> FailureClass {
            FailureClass::Terminal
        }
        let p = RetryPolicy::default().with_classifier(everything_terminal);
        assert_eq!(p.classify(&FetchError::Status(503)), FailureClass::Terminal);
    }
}
