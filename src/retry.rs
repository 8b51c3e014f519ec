use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::OperationError;
use crate::interrupt::Interrupt;
use crate::wait::raised;

/// How a failed attempt should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Network or timing failure; another attempt may succeed.
    Transient,
    /// Retrying cannot help (bad input, permission denied, invalid state).
    Fatal,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Classification::Transient => write!(f, "transient"),
            Classification::Fatal => write!(f, "fatal"),
        }
    }
}

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// delay = step_ms * attempt
    Linear { step_ms: u64 },
    /// delay = min(base_ms * 2^(attempt - 1), max_ms)
    CappedExponential { base_ms: u64, max_ms: u64 },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::CappedExponential {
            base_ms: 1000,
            max_ms: 30_000,
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let ms = match *self {
            BackoffPolicy::Linear { step_ms } => step_ms.saturating_mul(u64::from(attempt.max(1))),
            BackoffPolicy::CappedExponential { base_ms, max_ms } => {
                let exp = attempt.saturating_sub(1).min(32);
                base_ms.saturating_mul(1u64 << exp).min(max_ms)
            }
        };
        Duration::from_millis(ms)
    }
}

/// Attempt bound and backoff shared by every retried call of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

fn default_max_attempts() -> u32 {
    5
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RetryPolicy {
    pub fn operation(&self, operation_id: impl Into<String>) -> RetryableOperation {
        RetryableOperation::new(operation_id, self.max_attempts, self.backoff)
    }
}

/// One failed attempt, as logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryAttempt {
    pub operation_id: String,
    pub attempt_number: u32,
    pub classification: Classification,
    pub backoff_ms: u64,
}

/// Bounded retry wrapper around a flaky external call.
#[derive(Debug, Clone)]
pub struct RetryableOperation {
    operation_id: String,
    max_attempts: u32,
    backoff: BackoffPolicy,
    interrupt: Option<Interrupt>,
}

impl RetryableOperation {
    pub fn new(operation_id: impl Into<String>, max_attempts: u32, backoff: BackoffPolicy) -> Self {
        Self {
            operation_id: operation_id.into(),
            max_attempts: max_attempts.max(1),
            backoff,
            interrupt: None,
        }
    }

    /// Stop starting new attempts once `interrupt` is raised.
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    /// Run `op` until it succeeds, fails fatally, or runs out of attempts.
    ///
    /// `op` receives the 1-based attempt number. The last allowed failure is
    /// returned immediately, without a trailing backoff sleep.
    pub async fn execute<T, E, F, Fut, C>(&self, mut op: F, classify: C) -> Result<T, OperationError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        C: Fn(&E) -> Classification,
    {
        let mut attempt = 1;
        loop {
            self.check_interrupt(attempt)?;

            let err = match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation = %self.operation_id, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            let classification = classify(&err);
            if classification == Classification::Fatal {
                warn!(
                    operation = %self.operation_id,
                    attempt,
                    %classification,
                    error = %err,
                    "attempt failed, not retrying"
                );
                return Err(OperationError::Fatal {
                    operation: self.operation_id.clone(),
                    attempt,
                    message: err.to_string(),
                });
            }

            if attempt >= self.max_attempts {
                warn!(
                    operation = %self.operation_id,
                    attempt,
                    %classification,
                    error = %err,
                    "attempt failed, no attempts left"
                );
                return Err(OperationError::Exhausted {
                    operation: self.operation_id.clone(),
                    attempts: attempt,
                    last_error: err.to_string(),
                });
            }

            let delay = self.backoff.delay_for_attempt(attempt);
            let record = RetryAttempt {
                operation_id: self.operation_id.clone(),
                attempt_number: attempt,
                classification,
                backoff_ms: delay.as_millis() as u64,
            };
            log_retry(&record, self.max_attempts, &err.to_string());

            // A raised interrupt cuts the backoff short; the next check reports it.
            tokio::select! {
                _ = sleep(delay) => {}
                _ = raised(self.interrupt.as_ref()) => {}
            }
            attempt += 1;
        }
    }

    fn check_interrupt(&self, next_attempt: u32) -> Result<(), OperationError> {
        match &self.interrupt {
            Some(flag) if flag.is_triggered() => Err(OperationError::Interrupted {
                operation: self.operation_id.clone(),
                next_attempt,
            }),
            _ => Ok(()),
        }
    }
}

fn log_retry(attempt: &RetryAttempt, max: u32, reason: &str) {
    warn!(
        operation = %attempt.operation_id,
        attempt = attempt.attempt_number,
        max_attempts = max,
        classification = %attempt.classification,
        backoff_ms = attempt.backoff_ms,
        error = reason,
        "retrying"
    );
}
