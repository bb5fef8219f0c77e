//! Retryable unit of work.
//!
//! Every mutating engine operation runs through [`RetryPolicy::run`]: the
//! closure re-reads its inputs, builds one write batch and commits it. Only
//! transient store conflicts are retried; everything else is returned as-is.

use crate::error::EngineError;
use crate::primitives::{DEFAULT_BASE_BACKOFF_MS, DEFAULT_MAX_ATTEMPTS};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay before the next attempt, given the number of failed attempts so far.
pub trait BackoffPolicy {
    fn delay_for_attempt(&self, attempt: usize) -> Duration;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_backoff_ms: DEFAULT_BASE_BACKOFF_MS,
        }
    }
}

impl BackoffPolicy for RetryPolicy {
    fn delay_for_attempt(&self, attempt: usize) -> Duration {
        Duration::from_millis(self.base_backoff_ms.saturating_mul(attempt as u64))
    }
}

impl RetryPolicy {
    /// `max_attempts` tries with no sleeping in between.
    #[must_use]
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            base_backoff_ms: 0,
        }
    }

    /// Run `op` until it succeeds, fails terminally, or runs out of attempts.
    ///
    /// `op` receives the 1-based attempt number.
    pub fn run<T, F>(&self, op_name: &'static str, mut op: F) -> Result<T, EngineError>
    where
        F: FnMut(usize) -> Result<T, EngineError>,
    {
        let attempts = self.max_attempts.max(1);
        for attempt in 1..=attempts {
            match op(attempt) {
                Err(e) if e.is_transient() => {
                    if attempt == attempts {
                        tracing::warn!(
                            op = op_name,
                            attempts,
                            error = %e,
                            "giving up after repeated write conflicts"
                        );
                        break;
                    }
                    let delay = self.delay_for_attempt(attempt);
                    tracing::debug!(
                        op = op_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "write conflict, retrying"
                    );
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                }
                other => return other,
            }
        }
        Err(EngineError::ConcurrencyExhausted { attempts })
    }
}
