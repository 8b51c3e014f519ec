//! One-way move of infrastructure state from a local file to the remote,
//! lock-protected backend.

use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::MigrationError;
use crate::interrupt::Interrupt;
use crate::platform::{BackendConfig, CommandError, IacEngine, InitMode, ProbeError, Reachability};
use crate::retry::{RetryPolicy, RetryableOperation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    Remote,
}

/// Where authoritative state lives. Exactly one is authoritative at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateBackend {
    pub kind: BackendKind,
    pub location: String,
    pub lock_backend: Option<String>,
}

impl StateBackend {
    pub fn local(path: &Path) -> Self {
        Self {
            kind: BackendKind::Local,
            location: path.display().to_string(),
            lock_backend: None,
        }
    }
}

/// S3-compatible remote state settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteBackendConfig {
    pub bucket: String,
    pub key: String,
    pub region: String,
    /// Custom endpoint (in-cluster object storage); `None` means AWS S3.
    pub endpoint: Option<String>,
    /// DynamoDB table used as the lock backend.
    pub lock_table: Option<String>,
    /// S3-native lockfile locking.
    pub use_lockfile: bool,
}

impl Default for RemoteBackendConfig {
    fn default() -> Self {
        Self {
            bucket: "tfstate".to_string(),
            key: "platform/terraform.tfstate".to_string(),
            region: "us-east-1".to_string(),
            endpoint: None,
            lock_table: None,
            use_lockfile: true,
        }
    }
}

impl RemoteBackendConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.bucket.is_empty() || self.key.is_empty() {
            return Err("remote_state.bucket and remote_state.key must be set".into());
        }
        if self.lock_table.is_none() && !self.use_lockfile {
            return Err("remote_state needs a lock backend (lock_table or use_lockfile)".into());
        }
        Ok(())
    }

    pub fn backend_config(&self) -> BackendConfig {
        let mut settings = vec![
            ("bucket".to_string(), self.bucket.clone()),
            ("key".to_string(), self.key.clone()),
            ("region".to_string(), self.region.clone()),
        ];
        if let Some(endpoint) = &self.endpoint {
            settings.push(("endpoints".to_string(), format!("{{s3=\"{endpoint}\"}}")));
            settings.push(("use_path_style".to_string(), "true".to_string()));
            settings.push(("skip_credentials_validation".to_string(), "true".to_string()));
            settings.push(("skip_region_validation".to_string(), "true".to_string()));
            settings.push(("skip_requesting_account_id".to_string(), "true".to_string()));
        }
        if let Some(table) = &self.lock_table {
            settings.push(("dynamodb_table".to_string(), table.clone()));
        }
        if self.use_lockfile {
            settings.push(("use_lockfile".to_string(), "true".to_string()));
        }
        BackendConfig {
            kind: "s3".to_string(),
            settings,
        }
    }

    pub fn state_backend(&self) -> StateBackend {
        let lock_backend = match (&self.lock_table, self.use_lockfile) {
            (Some(table), _) => Some(format!("dynamodb:{table}")),
            (None, true) => Some("s3-lockfile".to_string()),
            (None, false) => None,
        };
        StateBackend {
            kind: BackendKind::Remote,
            location: format!("s3://{}/{}", self.bucket, self.key),
            lock_backend,
        }
    }

    /// URL whose reachability stands in for "object store is up".
    pub fn probe_url(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!("https://s3.{}.amazonaws.com", self.region),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    Migrated { backup: PathBuf, resources: usize },
    /// Local state was absent or tracked nothing.
    AlreadyMigrated,
}

pub struct StateBackendMigrator {
    iac: Arc<dyn IacEngine>,
    reachability: Arc<dyn Reachability>,
    retry: RetryPolicy,
    interrupt: Option<Interrupt>,
}

impl StateBackendMigrator {
    pub fn new(iac: Arc<dyn IacEngine>, reachability: Arc<dyn Reachability>, retry: RetryPolicy) -> Self {
        Self {
            iac,
            reachability,
            retry,
            interrupt: None,
        }
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    /// Copy `local` into `remote`, verify it, then discard `local`.
    ///
    /// The timestamped backup is never deleted. Until verification passes it
    /// is the authoritative copy.
    pub async fn migrate(
        &self,
        local: &Path,
        remote: &RemoteBackendConfig,
    ) -> Result<MigrationOutcome, MigrationError> {
        let Some(resource_count) = local_resource_count(local)? else {
            info!(path = %local.display(), "local state absent or empty, nothing to migrate");
            return Ok(MigrationOutcome::AlreadyMigrated);
        };

        let target = remote.state_backend();
        info!(
            from = %local.display(),
            to = %target.location,
            lock = target.lock_backend.as_deref().unwrap_or("none"),
            resources = resource_count,
            "migrating state backend"
        );

        let iac = self.iac.as_ref();
        let local_backend = BackendConfig::local(local);
        let local_backend = &local_backend;
        let before: BTreeSet<String> = self
            .operation("list local state")
            .execute(
                move |_| async move {
                    iac.init(local_backend, InitMode::Reconfigure).await?;
                    iac.state_list().await
                },
                CommandError::classification,
            )
            .await
            .map_err(|source| MigrationError::Listing { source, backup: None })?
            .into_iter()
            .collect();

        let probe = self.reachability.as_ref();
        let url = remote.probe_url();
        let url = url.as_str();
        self.operation("probe remote state backend")
            .execute(move |_| probe.check(url), ProbeError::classification)
            .await
            .map_err(MigrationError::RemoteUnreachable)?;

        let backup = backup_local(local)?;
        info!(backup = %backup.display(), "local state backed up");

        let remote_backend = remote.backend_config();
        let remote_backend = &remote_backend;
        self.operation("copy state to remote backend")
            .execute(
                move |_| iac.init(remote_backend, InitMode::MigrateState),
                CommandError::classification,
            )
            .await
            .map_err(|source| MigrationError::CopyFailed {
                source,
                backup: backup.clone(),
            })?;

        let after: BTreeSet<String> = self
            .operation("list remote state")
            .execute(move |_| iac.state_list(), CommandError::classification)
            .await
            .map_err(|source| MigrationError::Listing {
                source,
                backup: Some(backup.clone()),
            })?
            .into_iter()
            .collect();

        let missing: Vec<String> = before.difference(&after).cloned().collect();
        let unexpected: Vec<String> = after.difference(&before).cloned().collect();
        if !missing.is_empty() || !unexpected.is_empty() {
            warn!(
                missing = missing.len(),
                unexpected = unexpected.len(),
                backup = %backup.display(),
                "remote state does not match local listing"
            );
            return Err(MigrationError::VerificationFailed {
                expected: before.len(),
                found: after.len(),
                missing,
                unexpected,
                backup,
            });
        }

        std::fs::remove_file(local).map_err(MigrationError::Discard)?;
        info!(resources = after.len(), location = %target.location, "state migration verified");
        Ok(MigrationOutcome::Migrated {
            backup,
            resources: after.len(),
        })
    }

    fn operation(&self, id: &str) -> RetryableOperation {
        let op = self.retry.operation(id);
        match &self.interrupt {
            Some(flag) => op.with_interrupt(flag.clone()),
            None => op,
        }
    }
}

/// Number of resources in the local state file, `None` when there is nothing
/// to migrate.
pub fn local_resource_count(local: &Path) -> Result<Option<usize>, MigrationError> {
    let raw = match std::fs::read_to_string(local) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(MigrationError::LocalUnreadable {
                path: local.to_path_buf(),
                reason: e.to_string(),
            });
        }
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }
    let state: serde_json::Value =
        serde_json::from_str(&raw).map_err(|e| MigrationError::LocalUnreadable {
            path: local.to_path_buf(),
            reason: e.to_string(),
        })?;
    let count = state["resources"].as_array().map_or(0, Vec::len);
    Ok((count > 0).then_some(count))
}

fn backup_local(local: &Path) -> Result<PathBuf, MigrationError> {
    let contents = std::fs::read(local).map_err(MigrationError::Backup)?;
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
    let mut name = local.as_os_str().to_owned();
    name.push(format!(".{stamp}.backup"));
    let backup = PathBuf::from(name);

    // create_new: an existing backup is never overwritten.
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&backup)
        .map_err(MigrationError::Backup)?;
    file.write_all(&contents).map_err(MigrationError::Backup)?;
    file.sync_all().map_err(MigrationError::Backup)?;
    Ok(backup)
}
