use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::model::{Phase, PhaseContext, PhaseId, StopAfter, Subphase};
use super::state::{RunOutcome, RunRecord, RunTracker};
use crate::error::{BootstrapError, OrchestrationError};

/// Progress callbacks for the terminal UI. Every method defaults to a no-op.
pub trait RunObserver: Send + Sync {
    fn phase_started(&self, _phase: &Phase) {}
    fn phase_skipped(&self, _phase: &Phase, _reason: &str) {}
    fn subphase_started(&self, _phase: &Phase, _subphase: &Subphase) {}
    fn subphase_finished(&self, _phase: &Phase, _subphase: &Subphase) {}
    fn subphase_skipped(&self, _phase: &Phase, _subphase: &Subphase) {}
    fn phase_finished(&self, _phase: &Phase) {}
    fn phase_failed(&self, _phase: &Phase, _subphase: Option<&str>, _error: &BootstrapError) {}
}

/// Live view of one phase for `bootstrap status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseStatus {
    pub id: PhaseId,
    pub name: String,
    pub ready: bool,
    pub blocked_by: Option<String>,
    /// `None` when the phase has no completion check or it could not be evaluated.
    pub complete: Option<bool>,
}

/// Runs the fixed phase pipeline. Stateless across invocations: where to
/// resume is the operator's call, checked live through preconditions.
pub struct PhaseOrchestrator {
    phases: Vec<Phase>,
    ctx: PhaseContext,
    skip_validation: bool,
    observer: Option<Arc<dyn RunObserver>>,
    tracker: Mutex<Option<RunTracker>>,
}

impl PhaseOrchestrator {
    /// Phase ids must be strictly increasing and subphase ids unique per phase.
    pub fn new(phases: Vec<Phase>, ctx: PhaseContext) -> Result<Self, BootstrapError> {
        for pair in phases.windows(2) {
            if pair[0].id >= pair[1].id {
                return Err(BootstrapError::Config(format!(
                    "phase ids must increase: {} is followed by {}",
                    pair[0].id, pair[1].id
                )));
            }
        }
        for phase in &phases {
            let mut seen = BTreeSet::new();
            if let Some(dup) = phase.subphases.iter().find(|s| !seen.insert(s.id.as_str())) {
                return Err(BootstrapError::Config(format!(
                    "phase {} declares subphase `{}` twice",
                    phase.id, dup.id
                )));
            }
        }
        Ok(Self {
            phases,
            ctx,
            skip_validation: false,
            observer: None,
            tracker: Mutex::new(None),
        })
    }

    pub fn with_skip_validation(mut self, skip: bool) -> Self {
        self.skip_validation = skip;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn context(&self) -> &PhaseContext {
        &self.ctx
    }

    /// Record of the run so far, if one was started.
    pub fn record(&self) -> Option<RunRecord> {
        let interrupted = self.ctx.interrupt.is_triggered();
        self.lock_tracker().as_ref().map(|t| t.record(interrupted))
    }

    /// Execute phases from `start_phase` on, stopping early after `stop_after`.
    pub async fn run(
        &self,
        start_phase: PhaseId,
        stop_after: Option<&StopAfter>,
    ) -> Result<RunOutcome, OrchestrationError> {
        self.validate_request(start_phase, stop_after)
            .map_err(OrchestrationError::InvalidRequest)?;
        {
            let mut tracker = self.lock_tracker();
            if let Some(existing) = tracker.as_ref() {
                return Err(OrchestrationError::InvalidRequest(BootstrapError::Transition {
                    from: existing.state().to_string(),
                    to: "a second run".to_string(),
                }));
            }
            *tracker = Some(RunTracker::new(start_phase, stop_after.map(ToString::to_string)));
        }
        info!(start_phase, stop_after = ?stop_after.map(ToString::to_string), "bootstrap run started");

        for phase in self.phases.iter().filter(|p| p.id >= start_phase) {
            if let Some(outcome) = self.run_phase(phase, stop_after).await? {
                return Ok(outcome);
            }
        }

        let outcome = self
            .track(|t| t.complete())
            .map_err(OrchestrationError::InvalidRequest)?;
        info!("bootstrap run completed");
        Ok(outcome)
    }

    /// Evaluate every phase's preconditions and completion check without running anything.
    pub async fn status(&self) -> Vec<PhaseStatus> {
        let mut statuses = Vec::with_capacity(self.phases.len());
        for phase in &self.phases {
            let mut blocked_by = None;
            for check in &phase.preconditions {
                if let Err(e) = check.check(&self.ctx).await {
                    blocked_by = Some(format!("{}: {e}", check.name()));
                    break;
                }
            }
            let complete = match &phase.completion {
                Some(check) => check.is_complete(&self.ctx).await.ok(),
                None => None,
            };
            statuses.push(PhaseStatus {
                id: phase.id,
                name: phase.name.clone(),
                ready: blocked_by.is_none(),
                blocked_by,
                complete,
            });
        }
        statuses
    }

    fn validate_request(
        &self,
        start_phase: PhaseId,
        stop_after: Option<&StopAfter>,
    ) -> Result<(), BootstrapError> {
        if !self.phases.iter().any(|p| p.id == start_phase) {
            return Err(BootstrapError::UnknownPhase(start_phase));
        }
        if let Some(stop) = stop_after {
            let reachable = self
                .phases
                .iter()
                .filter(|p| p.id >= start_phase)
                .any(|p| p.subphases.iter().any(|s| stop.matches(p, &s.id)));
            if !reachable {
                return Err(BootstrapError::UnknownSubphase(stop.to_string()));
            }
        }
        Ok(())
    }

    async fn run_phase(
        &self,
        phase: &Phase,
        stop_after: Option<&StopAfter>,
    ) -> Result<Option<RunOutcome>, OrchestrationError> {
        self.ctx
            .check_interrupt()
            .map_err(|e| self.fail(phase, None, e))?;

        for check in &phase.preconditions {
            debug!(phase = phase.id, check = check.name(), "checking precondition");
            check
                .check(&self.ctx)
                .await
                .map_err(|e| self.fail(phase, None, e))?;
        }

        if let Some(done) = &phase.completion {
            let complete = done
                .is_complete(&self.ctx)
                .await
                .map_err(|e| self.fail(phase, None, e))?;
            if complete {
                self.track(|t| t.enter_phase(phase.id, false))
                    .map_err(|e| self.fail(phase, None, e))?;
                info!(phase = phase.id, name = %phase.name, reason = done.describe(), "phase already complete, skipping");
                self.notify(|o| o.phase_skipped(phase, done.describe()));
                return Ok(None);
            }
        }

        self.track(|t| t.enter_phase(phase.id, true))
            .map_err(|e| self.fail(phase, None, e))?;
        info!(phase = phase.id, name = %phase.name, "phase started");
        self.notify(|o| o.phase_started(phase));

        // Credentials opened in this phase never outlive it.
        let mark = self.ctx.guard.mark();
        let credentials = self.ctx.credentials.clone();
        let phase_id = phase.id;
        self.ctx
            .guard
            .register(format!("wipe credentials of phase {phase_id}"), move || {
                let wiped = credentials.wipe_all();
                debug!(phase = phase_id, scopes = wiped, "phase credentials wiped");
                Ok(())
            });

        let result = self.run_subphases(phase, stop_after).await;

        let report = self.ctx.guard.unwind_to(mark);
        if !report.is_clean() {
            warn!(phase = phase.id, failed = ?report.failed, "some phase resources were not released cleanly");
        }

        if matches!(result, Ok(None)) {
            info!(phase = phase.id, name = %phase.name, "phase finished");
            self.notify(|o| o.phase_finished(phase));
        }
        result
    }

    async fn run_subphases(
        &self,
        phase: &Phase,
        stop_after: Option<&StopAfter>,
    ) -> Result<Option<RunOutcome>, OrchestrationError> {
        for subphase in &phase.subphases {
            let id = subphase.id.as_str();
            self.ctx
                .check_interrupt()
                .map_err(|e| self.fail(phase, Some(id), e))?;

            if self.skip_validation && subphase.validation {
                info!(phase = phase.id, subphase = id, "validation subphase skipped");
                self.notify(|o| o.subphase_skipped(phase, subphase));
            } else {
                self.track(|t| t.run_subphase(phase.id, id))
                    .map_err(|e| self.fail(phase, Some(id), e))?;
                info!(phase = phase.id, subphase = id, "{}", subphase.description);
                self.notify(|o| o.subphase_started(phase, subphase));
                if let Err(e) = subphase.action.run(&self.ctx).await {
                    return Err(self.fail(phase, Some(id), e));
                }
                self.notify(|o| o.subphase_finished(phase, subphase));
            }

            if stop_after.is_some_and(|s| s.matches(phase, id)) {
                let outcome = self
                    .track(|t| t.stop(phase.id, id))
                    .map_err(|e| self.fail(phase, Some(id), e))?;
                info!(phase = phase.id, subphase = id, "stopped after requested subphase");
                return Ok(Some(outcome));
            }
        }
        Ok(None)
    }

    fn fail(&self, phase: &Phase, subphase: Option<&str>, error: BootstrapError) -> OrchestrationError {
        if let Some(tracker) = self.lock_tracker().as_mut() {
            tracker.fail(phase.id, subphase, &error);
        }
        error!(
            phase = phase.id,
            subphase = subphase.unwrap_or("-"),
            class = %error.class().surfaced(),
            error = %error,
            "phase failed"
        );
        self.notify(|o| o.phase_failed(phase, subphase, &error));
        OrchestrationError::PhaseFailed {
            phase: phase.id,
            phase_name: phase.name.clone(),
            subphase: subphase.map(String::from),
            source: error,
        }
    }

    fn track<T>(&self, f: impl FnOnce(&mut RunTracker) -> Result<T, BootstrapError>) -> Result<T, BootstrapError> {
        match self.lock_tracker().as_mut() {
            Some(tracker) => f(tracker),
            None => Err(BootstrapError::Transition {
                from: "no run".to_string(),
                to: "running".to_string(),
            }),
        }
    }

    fn notify(&self, f: impl FnOnce(&dyn RunObserver)) {
        if let Some(observer) = &self.observer {
            f(observer.as_ref());
        }
    }

    fn lock_tracker(&self) -> MutexGuard<'_, Option<RunTracker>> {
        self.tracker.lock().unwrap_or_else(|p| p.into_inner())
    }
}
