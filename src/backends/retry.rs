//! Bounded exponential backoff around remote calls.

use std::sync::Arc;
use std::time::Duration;

use log::warn;

use super::clock::Clock;
use crate::error::ResolveError;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_SECS: f64 = 2.0;
const BACKOFF_CAP_SECS: f64 = 4.0;

/// Retries transient failures up to `max_attempts` total calls.
///
/// Each wrapped call gets its own attempt budget. Non-transient errors and the
/// final transient error are returned unchanged.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    clock: Arc<dyn Clock>,
}

impl RetryPolicy {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            clock,
        }
    }

    /// Delay slept after failed attempt number `attempt` (counted from 1).
    pub fn backoff_delay(attempt: u32) -> Duration {
        let exponent = attempt.min(16) as i32;
        Duration::from_secs_f64(BACKOFF_BASE_SECS.powi(exponent).min(BACKOFF_CAP_SECS))
    }

    pub fn run<T, F>(&self, label: &str, mut operation: F) -> Result<T, ResolveError>
    where
        F: FnMut() -> Result<T, ResolveError>,
    {
        let mut attempt = 1u32;
        loop {
            match operation() {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempt < self.max_attempts => {
                    let backoff = Self::backoff_delay(attempt);
                    warn!(
                        "{} attempt {} failed ({}), retrying in {:.1}s",
                        label,
                        attempt,
                        error,
                        backoff.as_secs_f64()
                    );
                    self.clock.sleep(backoff);
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
