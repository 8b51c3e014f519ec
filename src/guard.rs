//! LIFO cleanup stack guaranteeing release of acquired resources.
//!
//! Phases take a [`GuardMark`] on entry and unwind back to it on exit; the
//! top-level exit path (normal, error, or interrupt) drains whatever is left
//! with [`ResourceGuard::run_all`].

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use tracing::{debug, error};

type CleanupFn = Box<dyn FnOnce() -> Result<()> + Send>;

struct Entry {
    label: String,
    release: CleanupFn,
}

/// Stack depth captured by [`ResourceGuard::mark`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardMark(usize);

/// Outcome of draining (part of) the stack.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub ran: usize,
    pub failed: Vec<(String, String)>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    fn absorb(&mut self, other: CleanupReport) {
        self.ran += other.ran;
        self.failed.extend(other.failed);
    }
}

#[derive(Clone, Default)]
pub struct ResourceGuard {
    stack: Arc<Mutex<Vec<Entry>>>,
}

impl std::fmt::Debug for ResourceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGuard")
            .field("pending", &self.pending())
            .finish()
    }
}

impl ResourceGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a release function; it runs exactly once, after everything registered later.
    pub fn register<F>(&self, label: impl Into<String>, release: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let label = label.into();
        debug!(resource = %label, "registered cleanup");
        self.lock().push(Entry {
            label,
            release: Box::new(release),
        });
    }

    pub fn mark(&self) -> GuardMark {
        GuardMark(self.lock().len())
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Release everything registered since `mark`, newest first.
    pub fn unwind_to(&self, mark: GuardMark) -> CleanupReport {
        let mut report = CleanupReport::default();
        loop {
            // The lock is released before running the entry so cleanups may
            // register or inspect the guard themselves.
            let entry = {
                let mut stack = self.lock();
                if stack.len() <= mark.0 {
                    break;
                }
                stack.pop()
            };
            if let Some(entry) = entry {
                report.absorb(run_entry(entry));
            }
        }
        report
    }

    /// Release everything. Calling it again on a drained stack does nothing.
    pub fn run_all(&self) -> CleanupReport {
        self.unwind_to(GuardMark(0))
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.stack.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn run_entry(entry: Entry) -> CleanupReport {
    let Entry { label, release } = entry;
    let outcome = match catch_unwind(AssertUnwindSafe(release)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{e:#}")),
        Err(_) => Err("cleanup panicked".to_string()),
    };
    match outcome {
        Ok(()) => {
            debug!(resource = %label, "released");
            CleanupReport {
                ran: 1,
                failed: Vec::new(),
            }
        }
        Err(reason) => {
            error!(resource = %label, error = %reason, "cleanup failed, continuing with the rest");
            CleanupReport {
                ran: 1,
                failed: vec![(label, reason)],
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, ResourceGuard) {
        (Arc::new(Mutex::new(Vec::new())), ResourceGuard::new())
    }

    #[test]
    fn runs_in_lifo_order() {
        let (log, guard) = recorder();
        for name in ["tunnel", "workspace", "process"] {
            let log = log.clone();
            guard.register(name, move || {
                log.lock().unwrap().push(name.to_string());
                Ok(())
            });
        }
        let report = guard.run_all();
        assert_eq!(report.ran, 3);
        assert!(report.is_clean());
        assert_eq!(*log.lock().unwrap(), vec!["process", "workspace", "tunnel"]);
    }

    #[test]
    fn failures_do_not_block_the_rest() {
        let (log, guard) = recorder();
        let first = log.clone();
        guard.register("first", move || {
            first.lock().unwrap().push("first".into());
            Ok(())
        });
        guard.register("broken", || bail!("port-forward already gone"));
        guard.register("panicky", || panic!("boom"));
        let report = guard.run_all();
        assert_eq!(report.ran, 3);
        assert_eq!(report.failed.len(), 2);
        assert_eq!(report.failed[0].0, "panicky");
        assert_eq!(report.failed[1].1, "port-forward already gone");
        assert_eq!(*log.lock().unwrap(), vec!["first"]);
    }

    #[test]
    fn k_registrations_run_exactly_k_times() {
        let (log, guard) = recorder();
        for i in 0..7 {
            let log = log.clone();
            guard.register(format!("r{i}"), move || {
                log.lock().unwrap().push(format!("r{i}"));
                Ok(())
            });
        }
        assert_eq!(guard.run_all().ran, 7);
        assert_eq!(guard.run_all().ran, 0);
        assert_eq!(log.lock().unwrap().len(), 7);
    }

    #[test]
    fn unwind_to_mark_keeps_older_entries() {
        let (log, guard) = recorder();
        let outer = log.clone();
        guard.register("outer", move || {
            outer.lock().unwrap().push("outer".into());
            Ok(())
        });
        let mark = guard.mark();
        let inner = log.clone();
        guard.register("inner", move || {
            inner.lock().unwrap().push("inner".into());
            Ok(())
        });

        assert_eq!(guard.unwind_to(mark).ran, 1);
        assert_eq!(guard.pending(), 1);
        assert_eq!(*log.lock().unwrap(), vec!["inner"]);

        guard.run_all();
        assert_eq!(*log.lock().unwrap(), vec!["inner", "outer"]);
    }

    #[test]
    fn clones_share_one_stack() {
        let guard = ResourceGuard::new();
        let handle = guard.clone();
        handle.register("shared", || Ok(()));
        assert_eq!(guard.pending(), 1);
        assert_eq!(guard.run_all().ran, 1);
        assert_eq!(handle.pending(), 0);
    }
}
