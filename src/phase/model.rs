use std::fmt;

use async_trait::async_trait;

use crate::credentials::CredentialLifecycleManager;
use crate::error::BootstrapError;
use crate::guard::ResourceGuard;
use crate::interrupt::Interrupt;
use crate::platform::Platform;
use crate::retry::{RetryPolicy, RetryableOperation};

pub type PhaseId = u32;

/// Everything a subphase may touch. One per run, shared by every phase.
#[derive(Clone)]
pub struct PhaseContext {
    pub platform: Platform,
    pub credentials: CredentialLifecycleManager,
    pub guard: ResourceGuard,
    pub interrupt: Interrupt,
    pub retry: RetryPolicy,
}

impl PhaseContext {
    /// A retryable operation that honours the run's interrupt flag.
    pub fn operation(&self, id: impl Into<String>) -> RetryableOperation {
        self.retry.operation(id).with_interrupt(self.interrupt.clone())
    }

    pub fn check_interrupt(&self) -> Result<(), BootstrapError> {
        if self.interrupt.is_triggered() {
            return Err(BootstrapError::Interrupted);
        }
        Ok(())
    }
}

/// The work of one subphase.
#[async_trait]
pub trait SubphaseAction: Send + Sync {
    async fn run(&self, ctx: &PhaseContext) -> Result<(), BootstrapError>;
}

/// A live check against external state that must pass before a phase runs.
#[async_trait]
pub trait Precondition: Send + Sync {
    fn name(&self) -> &str;

    /// `Err(BootstrapError::Precondition)` when the check fails.
    async fn check(&self, ctx: &PhaseContext) -> Result<(), BootstrapError>;
}

/// Detects that a phase's effects are already present downstream.
#[async_trait]
pub trait CompletionCheck: Send + Sync {
    fn describe(&self) -> &str;

    async fn is_complete(&self, ctx: &PhaseContext) -> Result<bool, BootstrapError>;
}

pub struct Subphase {
    pub id: String,
    pub description: String,
    /// Pure verification; skipped by `--skip-validation`.
    pub validation: bool,
    pub action: Box<dyn SubphaseAction>,
}

impl Subphase {
    pub fn new(id: &str, description: &str, action: impl SubphaseAction + 'static) -> Self {
        Self {
            id: id.to_string(),
            description: description.to_string(),
            validation: false,
            action: Box::new(action),
        }
    }

    pub fn validation(mut self) -> Self {
        self.validation = true;
        self
    }
}

impl fmt::Debug for Subphase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subphase")
            .field("id", &self.id)
            .field("validation", &self.validation)
            .finish_non_exhaustive()
    }
}

pub struct Phase {
    pub id: PhaseId,
    pub name: String,
    pub description: String,
    pub subphases: Vec<Subphase>,
    pub preconditions: Vec<Box<dyn Precondition>>,
    /// Re-running against completed external state is a safe re-assertion.
    pub idempotent: bool,
    pub completion: Option<Box<dyn CompletionCheck>>,
}

impl Phase {
    pub fn new(id: PhaseId, name: &str, description: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            description: description.to_string(),
            subphases: Vec::new(),
            preconditions: Vec::new(),
            idempotent: true,
            completion: None,
        }
    }

    pub fn requires(mut self, check: impl Precondition + 'static) -> Self {
        self.preconditions.push(Box::new(check));
        self
    }

    pub fn subphase(mut self, subphase: Subphase) -> Self {
        self.subphases.push(subphase);
        self
    }

    pub fn not_idempotent(mut self) -> Self {
        self.idempotent = false;
        self
    }

    pub fn complete_when(mut self, check: impl CompletionCheck + 'static) -> Self {
        self.completion = Some(Box::new(check));
        self
    }

    pub fn find_subphase(&self, id: &str) -> Option<&Subphase> {
        self.subphases.iter().find(|s| s.id == id)
    }
}

impl fmt::Debug for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Phase")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("subphases", &self.subphases)
            .field("idempotent", &self.idempotent)
            .finish_non_exhaustive()
    }
}

/// Where `--stop-after` ends the run: `[PHASE:]SUBPHASE`, PHASE being an id
/// or a name. Without a phase the first match at or after the start phase wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopAfter {
    pub phase: Option<String>,
    pub subphase: String,
}

impl StopAfter {
    pub fn parse(raw: &str) -> Result<Self, BootstrapError> {
        let raw = raw.trim();
        let (phase, subphase) = match raw.split_once(':') {
            Some((phase, subphase)) => (Some(phase.trim().to_string()), subphase.trim()),
            None => (None, raw),
        };
        if subphase.is_empty() || phase.as_deref().is_some_and(str::is_empty) {
            return Err(BootstrapError::UnknownSubphase(raw.to_string()));
        }
        Ok(Self {
            phase,
            subphase: subphase.to_string(),
        })
    }

    pub fn matches(&self, phase: &Phase, subphase: &str) -> bool {
        if self.subphase != subphase {
            return false;
        }
        match &self.phase {
            None => true,
            Some(p) => *p == phase.name || p.parse::<PhaseId>().is_ok_and(|id| id == phase.id),
        }
    }
}

impl fmt::Display for StopAfter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.phase {
            Some(phase) => write!(f, "{phase}:{}", self.subphase),
            None => f.write_str(&self.subphase),
        }
    }
}
