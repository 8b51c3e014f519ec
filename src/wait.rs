//! Bounded polling: wait until a condition holds or a timeout expires.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep, timeout};
use tracing::debug;

use crate::error::WaitError;
use crate::interrupt::Interrupt;

/// Poll every `interval` for at most `timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSpec {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollSpec {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    pub fn from_secs(interval_secs: u64, timeout_secs: u64) -> Self {
        Self::new(
            Duration::from_secs(interval_secs),
            Duration::from_secs(timeout_secs),
        )
    }
}

/// Call `check` until it yields `Some`, the timeout passes, or `interrupt` is raised.
///
/// Errors from `check` count as "not yet"; the most recent one is reported if
/// the wait times out. The check always runs at least once, and a single check
/// is cut off at the deadline (given at least one interval) so a hung call
/// cannot stretch the wait.
pub async fn wait_until<T, E, F, Fut>(
    what: &str,
    spec: PollSpec,
    interrupt: Option<&Interrupt>,
    mut check: F,
) -> Result<T, WaitError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
    E: fmt::Display,
{
    let started = Instant::now();
    let deadline = started + spec.timeout;
    let mut last_error = None;
    let interrupted = || WaitError::Interrupted {
        what: what.to_string(),
    };

    loop {
        if interrupt.is_some_and(Interrupt::is_triggered) {
            return Err(interrupted());
        }

        let budget = deadline.saturating_duration_since(Instant::now()).max(spec.interval);
        let outcome = tokio::select! {
            outcome = timeout(budget, check()) => outcome,
            _ = raised(interrupt) => return Err(interrupted()),
        };
        match outcome {
            Ok(Ok(Some(value))) => return Ok(value),
            Ok(Ok(None)) => debug!(what, "condition not met yet"),
            Ok(Err(e)) => {
                debug!(what, error = %e, "condition check failed");
                last_error = Some(e.to_string());
            }
            Err(_) => {
                debug!(what, budget_ms = budget.as_millis() as u64, "condition check hung");
                last_error = Some(format!("check gave no answer within {}ms", budget.as_millis()));
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(WaitError::TimedOut {
                what: what.to_string(),
                waited_ms: now.duration_since(started).as_millis() as u64,
                last_error,
            });
        }
        tokio::select! {
            _ = sleep(spec.interval.min(deadline - now)) => {}
            _ = raised(interrupt) => return Err(interrupted()),
        }
    }
}

/// Resolves when `interrupt` is raised; never without one.
pub(crate) async fn raised(interrupt: Option<&Interrupt>) {
    match interrupt {
        Some(flag) => flag.raised().await,
        None => std::future::pending().await,
    }
}
