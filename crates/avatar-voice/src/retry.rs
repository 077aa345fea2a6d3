//! Retry policy shared by recognizer construction and secret retrieval.

use crate::error::{VoiceError, VoiceResult};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Delay applied before the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Retry immediately.
    None,
    /// `initial * 2^(attempt - 1)`, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

/// `{ maxAttempts, backoff(attempt) -> delay }`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Backoff::None)
    }

    pub fn exponential(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self::new(max_attempts, Backoff::Exponential { initial, max })
    }

    /// Delay after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::None => Duration::ZERO,
            Backoff::Exponential { initial, max } => {
                let shift = attempt.saturating_sub(1).min(16);
                initial.saturating_mul(1u32 << shift).min(max)
            }
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. Non-retryable errors (rate limiting,
    /// invalid input, shutdown) are returned as-is; exhaustion becomes
    /// [`VoiceError::RetriesExhausted`].
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> VoiceResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = VoiceResult<T>>,
    {
        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(
                        "{}: attempt {}/{} failed: {}",
                        label, attempt, self.max_attempts, e
                    );
                    last_error = e.to_string();
                }
            }
            if attempt < self.max_attempts {
                let delay = self.delay_for(attempt);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
        Err(VoiceError::RetriesExhausted {
            attempts: self.max_attempts,
            last_error,
        })
    }
}
