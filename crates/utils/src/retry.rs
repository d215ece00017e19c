use std::time::Duration;

use backon::ExponentialBuilder;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Explicit retry configuration. Every retry loop in the codebase is driven
/// by one of these instead of local constants.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Multiplier applied to the delay after each attempt.
    pub factor: f64,
    /// Jitter fraction in `[0, 1]`; each delay is perturbed by up to
    /// `±jitter * delay`.
    pub jitter: f64,
    /// Maximum number of retry attempts (not counting the initial try).
    pub max_attempts: u32,
}

impl RetryConfig {
    /// Git push / fetch retries: 100ms * 2^n, 10% jitter, 5 attempts.
    pub fn remote_ops() -> Self {
        Self {
            initial: Duration::from_millis(100),
            factor: 2.0,
            jitter: 0.1,
            max_attempts: 5,
        }
    }

    /// Status update conflicts use the same envelope as remote operations.
    pub fn status_updates() -> Self {
        Self::remote_ops()
    }

    /// Iterator over the jittered delay sequence, one entry per retry.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + use<> {
        let initial = self.initial;
        let factor = self.factor;
        let jitter = self.jitter;
        (0..self.max_attempts).map(move |attempt| {
            let base = initial.as_secs_f64() * factor.powi(attempt as i32);
            let spread = if jitter > 0.0 {
                rand::rng().random_range(-jitter..=jitter)
            } else {
                0.0
            };
            Duration::from_secs_f64((base * (1.0 + spread)).max(0.0))
        })
    }

    /// Bridge to `backon` for async call sites using the retry combinator.
    pub fn backoff(&self) -> ExponentialBuilder {
        let mut builder = ExponentialBuilder::default()
            .with_min_delay(self.initial)
            .with_factor(self.factor as f32)
            .with_max_times(self.max_attempts as usize);
        if self.jitter > 0.0 {
            builder = builder.with_jitter();
        }
        builder
    }
}
