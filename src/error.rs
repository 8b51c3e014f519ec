use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::phase::PhaseId;
use crate::platform::{CommandError, ProbeError};
use crate::retry::Classification;
use crate::vault::VaultError;

/// Exit code for a run that finished or stopped where it was asked to.
pub const EXIT_OK: u8 = 0;
/// Exit code for a fatal error that leaves external state consistent.
pub const EXIT_FATAL: u8 = 1;
/// Exit code for invalid configuration or arguments.
pub const EXIT_USAGE: u8 = 2;
/// Exit code for a failure that needs manual inspection before anything else runs.
pub const EXIT_UNSAFE: u8 = 3;
/// Exit code after an interrupt signal.
pub const EXIT_INTERRUPTED: u8 = 130;

/// Severity of a failure as seen by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
    /// Network or timing problem, safe to retry in place.
    Transient,
    /// The run stopped but external state is consistent; re-run from the failed phase.
    FatalRecoverable,
    /// External state may be in an ambiguous pairing; inspect by hand.
    FatalUnsafe,
}

impl ErrorClass {
    /// Class of a failure that stopped the run. Retrying happens inside
    /// operations, so nothing reaching the orchestrator is still transient.
    pub fn surfaced(self) -> Self {
        match self {
            ErrorClass::Transient => ErrorClass::FatalRecoverable,
            other => other,
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::FatalRecoverable => write!(f, "fatal-recoverable"),
            ErrorClass::FatalUnsafe => write!(f, "fatal-unsafe"),
        }
    }
}

/// What the operator is expected to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryAction {
    RetryCommand,
    InspectExternal,
    ManualRollback,
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryAction::RetryCommand => write!(f, "retry command"),
            RecoveryAction::InspectExternal => write!(f, "inspect external resource"),
            RecoveryAction::ManualRollback => write!(f, "manual rollback"),
        }
    }
}

#[derive(Debug, Error)]
pub enum OperationError {
    #[error("{operation}: fatal failure on attempt {attempt}: {message}")]
    Fatal {
        operation: String,
        attempt: u32,
        message: String,
    },

    #[error("{operation}: still failing after {attempts} attempts: {last_error}")]
    Exhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    #[error("{operation}: interrupted before attempt {next_attempt}")]
    Interrupted { operation: String, next_attempt: u32 },
}

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("timed out after {waited_ms}ms waiting for {what}{}", last_error_suffix(.last_error))]
    TimedOut {
        what: String,
        waited_ms: u64,
        last_error: Option<String>,
    },

    #[error("interrupted while waiting for {what}")]
    Interrupted { what: String },
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    match last_error {
        Some(e) => format!(" (last error: {e})"),
        None => String::new(),
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("entropy source unavailable: {0}")]
    EntropyUnavailable(String),

    #[error("invalid credential spec for scope `{scope}`: {reason}")]
    InvalidSpec { scope: String, reason: String },

    #[error("credential scope `{0}` is already open")]
    AlreadyOpen(String),

    #[error("no open credential scope `{0}`")]
    UnknownScope(String),

    #[error("environment name `{name}` already holds a value this run did not export")]
    ExportCollision { name: String },

    #[error("credential scope `{0}` has persisted fields but no store path")]
    NoStorePath(String),

    #[error("persisting scope `{scope}` to `{path}` failed: {source}")]
    PersistFailed {
        scope: String,
        path: String,
        #[source]
        source: OperationError,
    },

    #[error("reading existing material for scope `{scope}` from `{path}` failed: {source}")]
    ReuseReadFailed {
        scope: String,
        path: String,
        #[source]
        source: OperationError,
    },

    #[error("scope `{scope}` requires existing material at `{path}` but none was found")]
    MissingExisting { scope: String, path: String },
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("local state {} is not readable: {reason}", .path.display())]
    LocalUnreadable { path: PathBuf, reason: String },

    #[error("remote state backend unreachable: {0}")]
    RemoteUnreachable(#[source] OperationError),

    #[error("could not back up local state: {0}")]
    Backup(#[source] std::io::Error),

    #[error("listing tracked resources failed: {source}{}", backup_suffix(.backup))]
    Listing {
        #[source]
        source: OperationError,
        backup: Option<PathBuf>,
    },

    #[error("state copy to the remote backend failed: {source}; local backup {} remains authoritative", .backup.display())]
    CopyFailed {
        #[source]
        source: OperationError,
        backup: PathBuf,
    },

    #[error(
        "remote state verification failed: expected {expected} resources, remote lists {found} \
         (missing: {missing:?}, unexpected: {unexpected:?}); local backup {} remains authoritative",
        .backup.display()
    )]
    VerificationFailed {
        expected: usize,
        found: usize,
        missing: Vec<String>,
        unexpected: Vec<String>,
        backup: PathBuf,
    },

    #[error("remote state verified but the local copy could not be discarded: {0}")]
    Discard(#[source] std::io::Error),
}

fn backup_suffix(backup: &Option<PathBuf>) -> String {
    match backup {
        Some(path) => format!("; local backup {} remains authoritative", path.display()),
        None => String::new(),
    }
}

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("another credential handoff is already in flight")]
    InFlight,

    #[error("handoff interrupted before any change")]
    Interrupted,

    #[error("handoff rolled back: {reason}")]
    RolledBack { reason: String, mutated: bool },

    #[error(
        "handoff rollback failed, reconciler credential state is ambiguous: {reason}\n  \
         snapshot: {snapshot}\n  attempted target: {target}"
    )]
    Unsafe {
        reason: String,
        snapshot: String,
        target: String,
    },
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("config error: {0}")]
    Config(String),

    #[error("unknown phase {0}")]
    UnknownPhase(PhaseId),

    #[error("unknown subphase `{0}`")]
    UnknownSubphase(String),

    #[error("precondition `{check}` failed: {reason}")]
    Precondition { check: String, reason: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("interrupted")]
    Interrupted,

    #[error("illegal run transition from {from} to {to}")]
    Transition { from: String, to: String },

    #[error(transparent)]
    Operation(#[from] OperationError),

    #[error(transparent)]
    Wait(#[from] WaitError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error(transparent)]
    Handoff(#[from] HandoffError),

    #[error("secret manager error: {0}")]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl BootstrapError {
    pub fn class(&self) -> ErrorClass {
        match self {
            BootstrapError::Handoff(HandoffError::Unsafe { .. }) => ErrorClass::FatalUnsafe,
            BootstrapError::Vault(e) if e.classification() == Classification::Transient => {
                ErrorClass::Transient
            }
            BootstrapError::Command(e) if e.classification() == Classification::Transient => {
                ErrorClass::Transient
            }
            BootstrapError::Probe(e) if e.classification() == Classification::Transient => {
                ErrorClass::Transient
            }
            _ => ErrorClass::FatalRecoverable,
        }
    }

    pub fn recovery(&self) -> RecoveryAction {
        match self {
            BootstrapError::Handoff(HandoffError::Unsafe { .. }) => RecoveryAction::ManualRollback,
            BootstrapError::Config(_)
            | BootstrapError::UnknownPhase(_)
            | BootstrapError::UnknownSubphase(_)
            | BootstrapError::Interrupted
            | BootstrapError::Operation(_)
            | BootstrapError::Wait(_)
            | BootstrapError::Handoff(HandoffError::InFlight | HandoffError::Interrupted) => {
                RecoveryAction::RetryCommand
            }
            BootstrapError::Vault(_) | BootstrapError::Command(_) | BootstrapError::Probe(_)
                if self.class() == ErrorClass::Transient =>
            {
                RecoveryAction::RetryCommand
            }
            _ => RecoveryAction::InspectExternal,
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            BootstrapError::Interrupted
            | BootstrapError::Operation(OperationError::Interrupted { .. })
            | BootstrapError::Wait(WaitError::Interrupted { .. })
            | BootstrapError::Handoff(HandoffError::Interrupted) => EXIT_INTERRUPTED,
            BootstrapError::Config(_)
            | BootstrapError::UnknownPhase(_)
            | BootstrapError::UnknownSubphase(_)
            | BootstrapError::Toml(_) => EXIT_USAGE,
            _ if self.class() == ErrorClass::FatalUnsafe => EXIT_UNSAFE,
            _ => EXIT_FATAL,
        }
    }

    pub fn is_interrupt(&self) -> bool {
        self.exit_code() == EXIT_INTERRUPTED
    }
}

/// A failure surfaced by the orchestrator, tagged with where it happened.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("invalid run request: {0}")]
    InvalidRequest(#[source] BootstrapError),

    #[error("phase {phase} ({phase_name}){} failed [{}]: {source}", subphase_suffix(.subphase), .source.class().surfaced())]
    PhaseFailed {
        phase: PhaseId,
        phase_name: String,
        subphase: Option<String>,
        #[source]
        source: BootstrapError,
    },
}

fn subphase_suffix(subphase: &Option<String>) -> String {
    match subphase {
        Some(id) => format!(" subphase `{id}`"),
        None => String::new(),
    }
}

impl OrchestrationError {
    pub fn cause(&self) -> &BootstrapError {
        match self {
            OrchestrationError::InvalidRequest(e) => e,
            OrchestrationError::PhaseFailed { source, .. } => source,
        }
    }

    pub fn class(&self) -> ErrorClass {
        self.cause().class().surfaced()
    }

    pub fn recovery(&self) -> RecoveryAction {
        self.cause().recovery()
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            OrchestrationError::InvalidRequest(_) => EXIT_USAGE,
            OrchestrationError::PhaseFailed { source, .. } => source.exit_code(),
        }
    }

    pub fn is_interrupt(&self) -> bool {
        self.cause().is_interrupt()
    }

    /// One line telling the operator what to do next.
    pub fn hint(&self) -> String {
        let phase = match self {
            OrchestrationError::InvalidRequest(_) => {
                return "check the --start-phase / --stop-after arguments against `bootstrap phases`"
                    .to_string();
            }
            OrchestrationError::PhaseFailed { phase, .. } => *phase,
        };
        match self.recovery() {
            RecoveryAction::RetryCommand => {
                format!("{}: re-run with `bootstrap run --start-phase={phase}`", self.recovery())
            }
            RecoveryAction::InspectExternal => format!(
                "{}: fix the resource named above, then re-run with `bootstrap run --start-phase={phase}`",
                self.recovery()
            ),
            RecoveryAction::ManualRollback => format!(
                "{}: restore the reconciler source from the snapshot above before running anything else",
                self.recovery()
            ),
        }
    }
}
