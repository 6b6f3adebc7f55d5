//! Retry configuration and backoff bookkeeping.
//!
//! Shared by [`Operation`](super::Operation), which retries a request a small
//! number of times, and by the change tracker, which reconnects until its
//! failure budget is spent. The delay grows linearly: `initial_backoff`,
//! then one `backoff_step` more per consecutive failure, up to `max_backoff`.

use crate::core::error::CouchError;
use std::time::Duration;

/// When and how often to try again.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    /// Failures tolerated before giving up; `None` never gives up.
    pub max_retries: Option<u32>,
    pub initial_backoff: Duration,
    pub backoff_step: Duration,
    pub max_backoff: Duration,
    /// Statuses an [`Operation`](super::Operation) retries. Transport
    /// errors and timeouts are always retryable.
    pub retry_on_status: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: None,
            initial_backoff: Duration::from_secs(1),
            backoff_step: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            retry_on_status: vec![502, 503, 504],
        }
    }
}

impl RetryConfig {
    pub fn with_max_retries(self, max: u32) -> Self {
        RetryConfig {
            max_retries: Some(max),
            ..self
        }
    }

    pub fn with_initial_backoff(self, initial_backoff: Duration) -> Self {
        RetryConfig {
            initial_backoff,
            ..self
        }
    }

    pub fn with_backoff_step(self, backoff_step: Duration) -> Self {
        RetryConfig {
            backoff_step,
            ..self
        }
    }

    pub fn with_max_backoff(self, max_backoff: Duration) -> Self {
        RetryConfig {
            max_backoff,
            ..self
        }
    }

    fn delay_after(&self, failures: u32) -> Duration {
        let grown = self
            .backoff_step
            .saturating_mul(failures.saturating_sub(1))
            .saturating_add(self.initial_backoff);
        grown.min(self.max_backoff)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Retry(Duration),
    DontRetry,
}

/// Consecutive-failure counter for one request or one tracker.
#[derive(Debug, Clone)]
pub struct RetryState {
    /// Failures since the last [`reset`](Self::reset).
    pub attempts: u32,
    config: RetryConfig,
}

impl RetryState {
    pub fn new(config: RetryConfig) -> Self {
        RetryState {
            attempts: 0,
            config,
        }
    }

    /// Delay the next retry would wait.
    pub fn current_backoff(&self) -> Duration {
        self.config.delay_after(self.attempts + 1)
    }

    /// Counts `error` if it is worth retrying. Cancellation never is, and a
    /// status error only when its code is listed in `retry_on_status`.
    pub fn should_retry_error(&mut self, error: &CouchError) -> RetryDecision {
        match error {
            CouchError::Cancelled => RetryDecision::DontRetry,
            CouchError::Status { status, .. } => self.should_retry_status(*status),
            e if e.is_retryable() => self.record_failure(),
            _ => RetryDecision::DontRetry,
        }
    }

    pub fn should_retry_status(&mut self, status: u16) -> RetryDecision {
        if self.config.retry_on_status.contains(&status) {
            self.record_failure()
        } else {
            RetryDecision::DontRetry
        }
    }

    /// Counts a failure whatever caused it.
    pub fn record_failure(&mut self) -> RetryDecision {
        self.attempts += 1;
        match self.config.max_retries {
            Some(max) if self.attempts > max => RetryDecision::DontRetry,
            _ => RetryDecision::Retry(self.config.delay_after(self.attempts)),
        }
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
