//! Exponential backoff for storage read failures.
//!
//! When `retrieve` fails the pump does not crash; it waits and tries again,
//! doubling the wait after each consecutive failure up to a cap. A successful
//! retrieve resets the sequence.

use std::time::Duration;

/// Configuration for exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Delay after the first failure.
    pub initial_delay: Duration,

    /// Maximum delay between attempts (cap for exponential growth).
    pub max_delay: Duration,

    /// Multiplier applied per consecutive failure (typically 2.0).
    pub multiplier: f64,
}

impl Backoff {
    /// 100ms, 200ms, 400ms, ... capped at 30s.
    pub const DEFAULT: Self = Self {
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(30),
        multiplier: 2.0,
    };

    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
        }
    }

    /// Computes the delay after the given number of consecutive failures
    /// (0-indexed).
    ///
    /// The delay grows as `initial_delay * multiplier^failures`, capped at
    /// `max_delay`.
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        let exponent = i32::try_from(failures).unwrap_or(i32::MAX);
        let factor = self.multiplier.powi(exponent);
        let secs = self.initial_delay.as_secs_f64() * factor;
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::DEFAULT
    }
}
