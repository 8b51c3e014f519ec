//! Process interruption: a shared flag raised by Ctrl-C / SIGTERM.
//!
//! The flag never cancels a mutating attempt. Long-running loops (retries,
//! polls, the phase loop) check it at their own safe points; backoff sleeps and
//! read-only polls are cut as soon as it is raised, so cleanup runs through the
//! normal exit path. A second signal releases everything the guard holds and
//! exits at once, leaving a still-running child to the terminal's own signal.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;
use tracing::{error, warn};

use crate::error::EXIT_INTERRUPTED;
use crate::guard::ResourceGuard;

#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    raised: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Returns `true` only for the first call.
    pub fn trigger(&self) -> bool {
        let first = !self.raised.swap(true, Ordering::SeqCst);
        self.wake.notify_waiters();
        first
    }

    pub fn is_triggered(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    /// Resolves once the flag is raised.
    pub async fn raised(&self) {
        let notified = self.wake.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_triggered() {
            return;
        }
        notified.await;
    }

    /// Spawn a task that raises the flag on the first Ctrl-C or SIGTERM.
    ///
    /// The second signal does not wait for the current step: it runs every
    /// cleanup still registered on `guard` and exits with the interrupt code.
    pub fn listen(&self, guard: ResourceGuard) {
        let flag = self.clone();
        tokio::spawn(async move {
            loop {
                wait_for_signal().await;
                if flag.trigger() {
                    warn!("interrupt received; finishing the current step and cleaning up (again to abort now)");
                    continue;
                }
                error!("second interrupt, aborting the current step");
                let report = guard.run_all();
                if !report.is_clean() {
                    error!(failed = ?report.failed, "some resources could not be released");
                }
                std::process::exit(i32::from(EXIT_INTERRUPTED));
            }
        });
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM, only Ctrl-C will interrupt");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_reports_first_call_only() {
        let interrupt = Interrupt::new();
        assert!(!interrupt.is_triggered());
        assert!(interrupt.trigger());
        assert!(!interrupt.trigger());
        assert!(interrupt.is_triggered());
    }

    #[test]
    fn clones_share_the_flag() {
        let interrupt = Interrupt::new();
        let other = interrupt.clone();
        other.trigger();
        assert!(interrupt.is_triggered());
    }

    #[tokio::test]
    async fn raised_wakes_waiters() {
        let interrupt = Interrupt::new();
        let waiter = tokio::spawn({
            let interrupt = interrupt.clone();
            async move { interrupt.raised().await }
        });
        tokio::task::yield_now().await;
        interrupt.trigger();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter woken")
            .unwrap();

        // Already raised: resolves immediately.
        interrupt.raised().await;
    }
}
