use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::retry::Classification;

/// Stderr fragments that indicate a network, timing or lock problem.
const TRANSIENT_MARKERS: &[&str] = &[
    "connection refused",
    "connection reset",
    "i/o timeout",
    "timed out",
    "timeout",
    "tls handshake",
    "temporarily unavailable",
    "service unavailable",
    "too many requests",
    "error acquiring the state lock",
    "unexpected eof",
    "no route to host",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to start `{program}`: {reason}")]
    Spawn { program: String, reason: String },

    #[error("`{program} {}` exited with status {status}: {}", .args.join(" "), .stderr.trim())]
    Failed {
        program: String,
        args: Vec<String>,
        status: i32,
        stderr: String,
    },

    #[error("unexpected output from `{program}`: {reason}")]
    Output { program: String, reason: String },

    #[error("`{program} {}` gave no answer within {secs}s and was killed", .args.join(" "))]
    TimedOut {
        program: String,
        args: Vec<String>,
        secs: u64,
    },
}

impl CommandError {
    pub fn classification(&self) -> Classification {
        match self {
            CommandError::Failed { stderr, .. } => {
                let lower = stderr.to_lowercase();
                if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
                    Classification::Transient
                } else {
                    Classification::Fatal
                }
            }
            CommandError::TimedOut { .. } => Classification::Transient,
            CommandError::Spawn { .. } | CommandError::Output { .. } => Classification::Fatal,
        }
    }

    pub(crate) fn output(program: &str, reason: impl std::fmt::Display) -> Self {
        CommandError::Output {
            program: program.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// A long-running child process (e.g. a port-forward tunnel).
pub trait Background: Send {
    fn id(&self) -> Option<u32>;
    fn stop(self: Box<Self>) -> anyhow::Result<()>;
}

/// Runs external programs. Swapped for a scripted fake in tests.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, CommandError>;

    fn spawn(&self, program: &str, args: &[String]) -> Result<Box<dyn Background>, CommandError>;
}

/// Runs each command to completion, killing it once `timeout` passes.
#[derive(Debug, Clone, Copy)]
pub struct ProcessRunner {
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(900))
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, CommandError> {
        debug!(program, args = ?args, timeout_secs = self.timeout.as_secs(), "running command");
        // Dropping the output future on timeout kills the child.
        let running = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.timeout, running)
            .await
            .map_err(|_| CommandError::TimedOut {
                program: program.to_string(),
                args: args.to_vec(),
                secs: self.timeout.as_secs(),
            })?
            .map_err(|e| CommandError::Spawn {
                program: program.to_string(),
                reason: e.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Err(CommandError::Failed {
                program: program.to_string(),
                args: args.to_vec(),
                status: output.status.code().unwrap_or(-1),
                stderr,
            });
        }
        Ok(CommandOutput { stdout, stderr })
    }

    fn spawn(&self, program: &str, args: &[String]) -> Result<Box<dyn Background>, CommandError> {
        debug!(program, args = ?args, "spawning background command");
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CommandError::Spawn {
                program: program.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Box::new(ChildProcess { child }))
    }
}

struct ChildProcess {
    child: Child,
}

impl Background for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn stop(mut self: Box<Self>) -> anyhow::Result<()> {
        // Already exited is fine; anything else is reported.
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        self.child.start_kill()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(stderr: &str) -> CommandError {
        CommandError::Failed {
            program: "terraform".into(),
            args: vec!["apply".into()],
            status: 1,
            stderr: stderr.into(),
        }
    }

    #[test]
    fn network_errors_are_transient() {
        assert_eq!(
            failed("dial tcp 10.0.0.1:443: connect: connection refused").classification(),
            Classification::Transient
        );
        assert_eq!(
            failed("Error: Error acquiring the state lock").classification(),
            Classification::Transient
        );
    }

    #[test]
    fn other_failures_are_fatal() {
        assert_eq!(
            failed("Error: Invalid reference").classification(),
            Classification::Fatal
        );
        let spawn = CommandError::Spawn {
            program: "tofu".into(),
            reason: "No such file or directory".into(),
        };
        assert_eq!(spawn.classification(), Classification::Fatal);
    }

    #[test]
    fn failed_display_includes_args_and_stderr() {
        assert_eq!(
            failed("  boom \n").to_string(),
            "`terraform apply` exited with status 1: boom"
        );
    }

    #[tokio::test]
    async fn process_runner_captures_stdout() {
        let out = ProcessRunner::default()
            .run("echo", &["hello".to_string()])
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn process_runner_reports_missing_program() {
        let err = ProcessRunner::default()
            .run("definitely-not-a-real-binary-xyz", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }

    #[tokio::test]
    async fn hung_command_is_killed_at_the_timeout() {
        let started = std::time::Instant::now();
        let err = ProcessRunner::new(Duration::from_millis(100))
            .run("sleep", &["5".to_string()])
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(matches!(err, CommandError::TimedOut { ref program, .. } if program == "sleep"));
        assert_eq!(err.classification(), Classification::Transient);
    }
}
