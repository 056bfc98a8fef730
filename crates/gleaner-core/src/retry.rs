//! Bounded retries with exponential backoff.
//!
//! The controller never decides what is retryable: callers pass a classifier
//! that maps each error to a [`FailureClass`].

use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, FailureClass};

/// Retry budget and backoff schedule.
///
/// Delay before retry `k` (0-indexed) is `base_delay * 2^k`, capped at
/// `max_delay`. A policy allows `max_retries + 1` attempts in total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Default::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// A successful value and how many attempts it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// Why [`run_with_retry`] gave up.
#[derive(Error, Debug)]
pub enum RetryError<E> {
    /// The operation reported a non-retryable failure.
    #[error("fatal after {attempts} attempt(s): {error}")]
    Fatal { attempts: u32, error: E },

    /// Every allowed attempt failed with a retryable error.
    #[error("exhausted after {attempts} attempt(s): {error}")]
    Exhausted { attempts: u32, error: E },

    /// Cancellation arrived before an attempt or during backoff.
    #[error("cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Fatal { attempts, .. }
            | RetryError::Exhausted { attempts, .. }
            | RetryError::Cancelled { attempts } => *attempts,
        }
    }
}

impl RetryError<AppError> {
    /// Flatten into the error reported for the record.
    ///
    /// A fatal failure is reported as-is; an exhausted budget becomes
    /// [`AppError::Exhausted`] carrying the last failure's message.
    pub fn into_app_error(self) -> AppError {
        match self {
            RetryError::Fatal { error, .. } => error,
            RetryError::Exhausted { attempts, error } => AppError::Exhausted {
                attempts,
                class: error.class(),
                message: error.to_string(),
            },
            RetryError::Cancelled { .. } => AppError::Cancelled,
        }
    }
}

/// Run `operation` until it succeeds, fails fatally, exhausts the policy or
/// is cancelled.
///
/// `operation` receives the 1-indexed attempt number.
pub async fn run_with_retry<T, E, Fut, Op, C>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    classify: C,
    mut operation: Op,
) -> Result<Attempted<T>, RetryError<E>>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> FailureClass,
    E: fmt::Display,
{
    let max_attempts = policy.max_attempts();
    let mut attempts = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled { attempts });
        }

        attempts += 1;
        let error = match operation(attempts).await {
            Ok(value) => return Ok(Attempted { value, attempts }),
            Err(e) => e,
        };

        if classify(&error) == FailureClass::Fatal {
            tracing::debug!(attempt = attempts, error = %error, "Fatal failure, not retrying");
            return Err(RetryError::Fatal { attempts, error });
        }
        if attempts >= max_attempts {
            tracing::debug!(attempt = attempts, error = %error, "Retry budget exhausted");
            return Err(RetryError::Exhausted { attempts, error });
        }

        let delay = policy.delay_for_attempt(attempts - 1);
        tracing::warn!(
            attempt = attempts,
            max_attempts,
            delay_ms = %delay.as_millis(),
            error = %error,
            "Retryable failure, backing off"
        );

        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = cancel.cancelled() => return Err(RetryError::Cancelled { attempts }),
        }
    }
}

/// Classifier for operations that fail with [`AppError`].
pub fn classify_app_error(error: &AppError) -> FailureClass {
    error.class()
}
