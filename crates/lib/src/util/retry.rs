//! Exponential backoff for transient failures.

use std::time::Duration;

/// Backoff schedule: `initial_delay * multiplier^attempt`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
  /// Retry attempts allowed after the first try.
  pub max_retries: u32,
  pub initial_delay: Duration,
  pub max_delay: Duration,
  pub multiplier: f64,
}

impl Backoff {
  pub fn new(max_retries: u32, initial_delay: Duration) -> Self {
    Self {
      max_retries,
      initial_delay,
      max_delay: Duration::from_secs(60),
      multiplier: 2.0,
    }
  }

  /// Delay before the retry numbered `attempt` (0-indexed).
  pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
    let factor = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
    let secs = (self.initial_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64());
    Duration::from_secs_f64(secs)
  }

  /// Whether another retry is allowed after `attempt` retries have been made.
  pub fn allows(&self, attempt: u32) -> bool {
    attempt < self.max_retries
  }
}

impl Default for Backoff {
  fn default() -> Self {
    Self::new(3, Duration::from_millis(500))
  }
}
