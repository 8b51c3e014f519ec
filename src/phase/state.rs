use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::model::PhaseId;
use crate::error::BootstrapError;

/// States of one bootstrap run.
///
/// NOT_STARTED → RUNNING(phase, subphase) → COMPLETED | STOPPED_AT | FAILED
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    Running { phase: PhaseId, subphase: String },
    Completed,
    StoppedAt { phase: PhaseId, subphase: String },
    Failed { phase: PhaseId, subphase: Option<String> },
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::StoppedAt { .. } | RunState::Failed { .. }
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::NotStarted => write!(f, "NOT_STARTED"),
            RunState::Running { phase, subphase } => write!(f, "RUNNING({phase}, {subphase})"),
            RunState::Completed => write!(f, "COMPLETED"),
            RunState::StoppedAt { phase, subphase } => write!(f, "STOPPED_AT({phase}, {subphase})"),
            RunState::Failed {
                phase,
                subphase: Some(subphase),
            } => write!(f, "FAILED({phase}, {subphase})"),
            RunState::Failed {
                phase,
                subphase: None,
            } => write!(f, "FAILED({phase})"),
        }
    }
}

/// Successful end of a run. Stopping where asked is not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    StoppedAt { phase: PhaseId, subphase: String },
}

/// Enforces legal transitions and remembers what ran.
#[derive(Debug, Clone)]
pub struct RunTracker {
    run_id: String,
    start_phase: PhaseId,
    stop_after: Option<String>,
    state: RunState,
    history: Vec<RunState>,
    entered: BTreeSet<PhaseId>,
    executed: Vec<PhaseId>,
    skipped: Vec<PhaseId>,
    error: Option<String>,
    started_at: DateTime<Utc>,
}

impl RunTracker {
    pub fn new(start_phase: PhaseId, stop_after: Option<String>) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            start_phase,
            stop_after,
            state: RunState::NotStarted,
            history: vec![RunState::NotStarted],
            entered: BTreeSet::new(),
            executed: Vec::new(),
            skipped: Vec::new(),
            error: None,
            started_at: Utc::now(),
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn history(&self) -> &[RunState] {
        &self.history
    }

    /// Claim `phase` for this run. Phases are entered once, in increasing order.
    pub fn enter_phase(&mut self, phase: PhaseId, executed: bool) -> Result<(), BootstrapError> {
        let out_of_order = self.entered.last().is_some_and(|last| *last >= phase);
        if self.state.is_terminal() || self.entered.contains(&phase) || out_of_order {
            return Err(BootstrapError::Transition {
                from: self.state.to_string(),
                to: format!("phase {phase}"),
            });
        }
        self.entered.insert(phase);
        if executed {
            self.executed.push(phase);
        } else {
            self.skipped.push(phase);
        }
        Ok(())
    }

    pub fn run_subphase(&mut self, phase: PhaseId, subphase: &str) -> Result<(), BootstrapError> {
        if !self.entered.contains(&phase) {
            return Err(BootstrapError::Transition {
                from: self.state.to_string(),
                to: format!("subphase {phase}:{subphase} of a phase not entered"),
            });
        }
        self.transition(RunState::Running {
            phase,
            subphase: subphase.to_string(),
        })
    }

    pub fn complete(&mut self) -> Result<RunOutcome, BootstrapError> {
        self.transition(RunState::Completed)?;
        Ok(RunOutcome::Completed)
    }

    pub fn stop(&mut self, phase: PhaseId, subphase: &str) -> Result<RunOutcome, BootstrapError> {
        self.transition(RunState::StoppedAt {
            phase,
            subphase: subphase.to_string(),
        })?;
        Ok(RunOutcome::StoppedAt {
            phase,
            subphase: subphase.to_string(),
        })
    }

    /// Record a failure. Always legal from a non-terminal state.
    pub fn fail(&mut self, phase: PhaseId, subphase: Option<&str>, error: &BootstrapError) {
        if self.state.is_terminal() {
            return;
        }
        self.error = Some(error.to_string());
        let failed = RunState::Failed {
            phase,
            subphase: subphase.map(String::from),
        };
        self.history.push(failed.clone());
        self.state = failed;
    }

    fn transition(&mut self, next: RunState) -> Result<(), BootstrapError> {
        if self.state.is_terminal() {
            return Err(BootstrapError::Transition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.history.push(next.clone());
        self.state = next;
        Ok(())
    }

    pub fn record(&self, interrupted: bool) -> RunRecord {
        RunRecord::from_tracker(self, interrupted)
    }
}

/// Structured summary of a run. Never holds secret material.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub run_id: String,
    pub start_phase: PhaseId,
    pub stop_after: Option<String>,
    pub state_transitions: Vec<RunState>,
    pub phases_executed: Vec<PhaseId>,
    pub phases_skipped: Vec<PhaseId>,
    pub outcome: String,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl RunRecord {
    fn from_tracker(tracker: &RunTracker, interrupted: bool) -> Self {
        let now = Utc::now();
        let outcome = match &tracker.state {
            RunState::Failed { .. } if interrupted => "interrupted",
            RunState::Failed { .. } => "failed",
            RunState::Completed => "completed",
            RunState::StoppedAt { .. } => "stopped",
            RunState::NotStarted | RunState::Running { .. } => "incomplete",
        };
        Self {
            run_id: tracker.run_id.clone(),
            start_phase: tracker.start_phase,
            stop_after: tracker.stop_after.clone(),
            state_transitions: tracker.history.clone(),
            phases_executed: tracker.executed.clone(),
            phases_skipped: tracker.skipped.clone(),
            outcome: outcome.to_string(),
            error: tracker.error.clone(),
            started_at: tracker.started_at,
            completed_at: now,
            duration_ms: (now - tracker.started_at).num_milliseconds(),
        }
    }
}
