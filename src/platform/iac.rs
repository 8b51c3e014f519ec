use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use super::command::{CommandError, CommandRunner};

/// Name of the generated file selecting the backend type.
pub const BACKEND_OVERRIDE_FILE: &str = "zz_bootstrap_backend_override.tf";

/// Backend type plus the `-backend-config` settings for `init`.
///
/// Settings are passed on the command line and never written to disk;
/// backend credentials come from the process environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub kind: String,
    pub settings: Vec<(String, String)>,
}

impl BackendConfig {
    pub fn local(path: &Path) -> Self {
        Self {
            kind: "local".to_string(),
            settings: vec![("path".to_string(), path.display().to_string())],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitMode {
    /// Point at the backend without copying state.
    Reconfigure,
    /// Copy existing state into the newly configured backend.
    MigrateState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanSummary {
    pub has_changes: bool,
}

/// The infra-as-code engine. Its planning/apply internals are out of scope;
/// the bootstrapper only drives it.
#[async_trait]
pub trait IacEngine: Send + Sync {
    async fn init(&self, backend: &BackendConfig, mode: InitMode) -> Result<(), CommandError>;
    async fn plan(&self) -> Result<PlanSummary, CommandError>;
    /// Apply the whole configuration, or only `targets` when non-empty.
    async fn apply(&self, targets: &[String]) -> Result<(), CommandError>;
    /// Addresses of every resource tracked by the configured backend.
    async fn state_list(&self) -> Result<Vec<String>, CommandError>;
}

/// [`IacEngine`] driving the `terraform` (or `tofu`) CLI.
pub struct TerraformCli {
    runner: Arc<dyn CommandRunner>,
    binary: String,
    working_dir: PathBuf,
}

impl TerraformCli {
    pub fn new(runner: Arc<dyn CommandRunner>, binary: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            binary: binary.into(),
            working_dir: working_dir.into(),
        }
    }

    fn args(&self, rest: &[&str]) -> Vec<String> {
        let mut args = vec![format!("-chdir={}", self.working_dir.display())];
        args.extend(rest.iter().map(|s| s.to_string()));
        args
    }

    async fn write_backend_override(&self, kind: &str) -> Result<(), CommandError> {
        let contents = format!("terraform {{\n  backend \"{kind}\" {{}}\n}}\n");
        tokio::fs::write(self.working_dir.join(BACKEND_OVERRIDE_FILE), contents)
            .await
            .map_err(|e| CommandError::output(&self.binary, format!("writing backend override: {e}")))
    }
}

#[async_trait]
impl IacEngine for TerraformCli {
    async fn init(&self, backend: &BackendConfig, mode: InitMode) -> Result<(), CommandError> {
        self.write_backend_override(&backend.kind).await?;
        let mut args = self.args(&["init", "-input=false", "-no-color"]);
        match mode {
            InitMode::Reconfigure => args.push("-reconfigure".into()),
            InitMode::MigrateState => {
                args.push("-migrate-state".into());
                args.push("-force-copy".into());
            }
        }
        args.extend(
            backend
                .settings
                .iter()
                .map(|(k, v)| format!("-backend-config={k}={v}")),
        );
        self.runner.run(&self.binary, &args).await?;
        Ok(())
    }

    async fn plan(&self) -> Result<PlanSummary, CommandError> {
        let args = self.args(&["plan", "-input=false", "-no-color", "-detailed-exitcode", "-lock=true"]);
        match self.runner.run(&self.binary, &args).await {
            Ok(_) => Ok(PlanSummary { has_changes: false }),
            // -detailed-exitcode: 2 means "succeeded, changes present".
            Err(CommandError::Failed { status: 2, .. }) => Ok(PlanSummary { has_changes: true }),
            Err(e) => Err(e),
        }
    }

    async fn apply(&self, targets: &[String]) -> Result<(), CommandError> {
        let mut args = self.args(&["apply", "-input=false", "-no-color", "-auto-approve", "-lock=true"]);
        args.extend(targets.iter().map(|t| format!("-target={t}")));
        self.runner.run(&self.binary, &args).await?;
        Ok(())
    }

    async fn state_list(&self) -> Result<Vec<String>, CommandError> {
        let args = self.args(&["state", "list"]);
        let out = self.runner.run(&self.binary, &args).await?;
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }
}
