//! Bounded retry with exponential backoff.

use crate::error::{Error, ErrorCode};
use crate::tasks::wait_done;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

/// Retry policy for transient failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,

    /// Initial backoff in milliseconds
    pub initial_backoff_ms: u64,

    /// Backoff cap in milliseconds
    pub max_backoff_ms: u64,

    /// Backoff multiplier
    pub multiplier: f64,

    /// Add up to 25% random jitter
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Calculate backoff duration for attempt number
    #[must_use]
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff_ms as f64 * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_backoff_ms as f64);

        let millis = if self.jitter {
            capped * (1.0 + rand::thread_rng().gen_range(0.0..0.25))
        } else {
            capped
        };

        Duration::from_millis(millis as u64)
    }

    /// Check the policy is usable
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid field.
    pub fn validate(&self) -> crate::Result<()> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(Error::Config(
                format!("retry multiplier must be >= 1.0, got {}", self.multiplier).into(),
            ));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(Error::Config(
                "retry initial backoff exceeds max backoff".into(),
            ));
        }
        Ok(())
    }
}

/// Why a retried operation ultimately failed
#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    /// Every attempt failed with a transient error
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        /// Attempts made, including the first
        attempts: u32,
        /// Error from the final attempt
        last: Error,
    },

    /// An attempt failed with an error that retrying cannot fix
    #[error("permanent failure: {0}")]
    Permanent(Error),

    /// The owner shut down while waiting to retry
    #[error("retry cancelled")]
    Cancelled,
}

impl RetryError {
    /// Collapse into the underlying error
    ///
    /// Cancellation maps to [`ErrorCode::EntityClosed`].
    #[must_use]
    pub fn into_error(self) -> Error {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Permanent(e) => e,
            RetryError::Cancelled => ErrorCode::EntityClosed.into(),
        }
    }
}

/// Run `op` until it succeeds, fails permanently, exhausts `config`, or
/// `cancel` turns true.
///
/// Errors are classified with [`Error::is_transient`].
///
/// # Errors
///
/// See [`RetryError`].
pub async fn retry<T, F, Fut>(
    config: &RetryConfig,
    mut cancel: watch::Receiver<bool>,
    operation: &str,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = crate::Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        if *cancel.borrow() {
            return Err(RetryError::Cancelled);
        }

        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(RetryError::Permanent(e)),
            Err(e) => e,
        };

        if attempt >= config.max_retries {
            return Err(RetryError::Exhausted {
                attempts: attempt + 1,
                last: err,
            });
        }

        let delay = config.backoff_duration(attempt);
        tracing::debug!(operation, attempt, ?delay, error = %err, "transient failure, retrying");
        attempt += 1;

        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = wait_done(&mut cancel) => return Err(RetryError::Cancelled),
        }
    }
}
