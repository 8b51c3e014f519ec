//! Phase model, run state machine and the orchestrator that drives them.

mod model;
mod orchestrator;
mod state;

pub use model::{CompletionCheck, Phase, PhaseContext, PhaseId, Precondition, StopAfter, Subphase, SubphaseAction};
pub use orchestrator::{PhaseOrchestrator, PhaseStatus, RunObserver};
pub use state::{RunOutcome, RunRecord, RunState, RunTracker};
