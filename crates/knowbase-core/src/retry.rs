//! Bounded retry policy shared by every caller of the embedding port
//! (spec §6: "Caller must tolerate transient failures with bounded retry").

use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::cancel::CancellationToken;
use crate::error::{KbError, KbResult};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

/// Runs `op` up to `policy.max_attempts` times, doubling the delay between
/// attempts. Stops early and returns `KbError::Cancelled` if `cancel` fires.
/// Only errors where `KbError::retryable()` is true (`Storage`,
/// `Embedding`) are retried; anything else propagates on the first
/// attempt.
pub fn with_bounded_retry<T>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut op: impl FnMut() -> KbResult<T>,
) -> KbResult<T> {
    let mut delay = policy.base_delay;
    let mut last_err = None;

    for attempt in 1..=policy.max_attempts.max(1) {
        cancel.check()?;

        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.retryable() && attempt < policy.max_attempts => {
                warn!(attempt, error = %err, "retrying after transient failure");
                last_err = Some(err);
                thread::sleep(delay);
                delay *= 2;
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_err.unwrap_or_else(|| KbError::embedding("retry budget exhausted")))
}
