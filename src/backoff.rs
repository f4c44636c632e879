//! Reconnect delay generation
//!
//! [`ExponentialBackoff`] is an endless iterator of delays: the first value is
//! the configured minimum, every following one grows by a fixed factor plus a
//! little random jitter, and nothing ever exceeds the configured maximum.

use crate::constants::{BACKOFF_FACTOR, BACKOFF_JITTER};
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    min: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
    current: Option<Duration>,
}

impl ExponentialBackoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min: min.min(max),
            max,
            factor: BACKOFF_FACTOR,
            jitter: BACKOFF_JITTER,
            current: None,
        }
    }

    /// Growth factor applied to the previous delay (never below 1.0)
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = if factor.is_finite() { factor.max(1.0) } else { BACKOFF_FACTOR };
        self
    }

    /// Upper bound of the random jitter, as a fraction of the previous delay
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_finite() { jitter.clamp(0.0, 1.0) } else { 0.0 };
        self
    }

    /// Restart the sequence: the next produced delay is the minimum again.
    ///
    /// A delay that was already handed out (and is possibly being slept on)
    /// is not affected.
    pub fn reset(&mut self) {
        self.current = None;
    }

    pub fn min_delay(&self) -> Duration {
        self.min
    }

    pub fn max_delay(&self) -> Duration {
        self.max
    }

    fn grow(&self, previous: Duration) -> Duration {
        let previous_secs = previous.as_secs_f64();
        let jitter = if self.jitter > 0.0 && previous_secs > 0.0 {
            rand::rng().random_range(0.0..=self.jitter * previous_secs)
        } else {
            0.0
        };
        let next = (previous_secs * self.factor + jitter).min(self.max.as_secs_f64());
        Duration::from_secs_f64(next)
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let delay = match self.current {
            None => self.min,
            Some(previous) => self.grow(previous),
        };
        self.current = Some(delay);
        Some(delay)
    }
}
