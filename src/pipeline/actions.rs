use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;
use tracing::{info, warn};

use super::tunnel::Tunnels;
use crate::config::TunnelConfig;
use crate::credentials::{CredentialSpec, EnvSink, Reuse};
use crate::error::BootstrapError;
use crate::handoff::{AuthHandoffCoordinator, CredentialRef, HandoffSettings};
use crate::migrate::{MigrationOutcome, RemoteBackendConfig, StateBackendMigrator};
use crate::phase::{PhaseContext, SubphaseAction};
use crate::platform::{CommandError, ProbeError};
use crate::vault::VaultError;
use crate::wait::{PollSpec, wait_until};

/// Every node reports Ready.
pub struct WaitNodes {
    pub poll: PollSpec,
}

#[async_trait]
impl SubphaseAction for WaitNodes {
    async fn run(&self, ctx: &PhaseContext) -> Result<(), BootstrapError> {
        let cluster = ctx.platform.cluster.as_ref();
        let nodes = wait_until("all nodes ready", self.poll, Some(&ctx.interrupt), move || async move {
            let nodes = cluster.nodes_ready().await?;
            Ok::<_, CommandError>(nodes.all_ready().then_some(nodes))
        })
        .await?;
        info!(ready = nodes.ready, total = nodes.total, "all nodes ready");
        Ok(())
    }
}

/// Retried infra-as-code apply of one slice of the configuration.
pub struct ApplyInfra {
    pub label: String,
    pub targets: Vec<String>,
}

#[async_trait]
impl SubphaseAction for ApplyInfra {
    async fn run(&self, ctx: &PhaseContext) -> Result<(), BootstrapError> {
        let iac = ctx.platform.iac.as_ref();
        let targets = self.targets.as_slice();
        ctx.operation(format!("apply {}", self.label))
            .execute(move |_| iac.apply(targets), CommandError::classification)
            .await?;
        info!(slice = %self.label, targets = ?self.targets, "infrastructure applied");
        Ok(())
    }
}

pub struct OpenTunnel {
    pub tunnel: Option<TunnelConfig>,
    pub tunnels: Tunnels,
}

#[async_trait]
impl SubphaseAction for OpenTunnel {
    async fn run(&self, ctx: &PhaseContext) -> Result<(), BootstrapError> {
        match &self.tunnel {
            Some(tunnel) => self.tunnels.ensure(ctx, tunnel),
            None => {
                info!("no tunnel configured, using direct addresses");
                Ok(())
            }
        }
    }
}

pub struct WaitSecretManager {
    pub poll: PollSpec,
}

#[async_trait]
impl SubphaseAction for WaitSecretManager {
    async fn run(&self, ctx: &PhaseContext) -> Result<(), BootstrapError> {
        let store = ctx.platform.store.as_ref();
        wait_until("secret manager unsealed", self.poll, Some(&ctx.interrupt), move || async move {
            store.health().await.map(Some)
        })
        .await?;
        info!("secret manager healthy");
        Ok(())
    }
}

/// Whether opening a scope may adopt what the secret store already holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredMaterial {
    Reuse,
    Require,
}

/// Open a credential scope from stored material or fresh entropy.
pub struct OpenCredentials {
    pub scope: String,
    pub spec: CredentialSpec,
    pub stored: StoredMaterial,
}

#[async_trait]
impl SubphaseAction for OpenCredentials {
    async fn run(&self, ctx: &PhaseContext) -> Result<(), BootstrapError> {
        let store = ctx.platform.store.as_ref();
        let reuse = match self.stored {
            StoredMaterial::Reuse => Reuse::IfExists(store),
            StoredMaterial::Require => Reuse::Required(store),
        };
        let summary = ctx.credentials.generate(&self.scope, &self.spec, reuse).await?;
        info!(scope = %summary.scope, reused = summary.reused, fields = ?summary.fields, "credentials ready");
        Ok(())
    }
}

pub struct PersistCredentials {
    pub scope: String,
}

#[async_trait]
impl SubphaseAction for PersistCredentials {
    async fn run(&self, ctx: &PhaseContext) -> Result<(), BootstrapError> {
        ctx.credentials
            .persist(&self.scope, ctx.platform.store.as_ref())
            .await?;
        Ok(())
    }
}

pub struct ExportCredentials {
    pub scope: String,
}

#[async_trait]
impl SubphaseAction for ExportCredentials {
    async fn run(&self, ctx: &PhaseContext) -> Result<(), BootstrapError> {
        let names = ctx.credentials.export(&self.scope)?;
        info!(scope = %self.scope, names = ?names, "credentials exported");
        Ok(())
    }
}

/// An HTTP endpoint answers within the poll budget.
pub struct VerifyReachable {
    pub what: String,
    pub url: String,
    pub poll: PollSpec,
}

#[async_trait]
impl SubphaseAction for VerifyReachable {
    async fn run(&self, ctx: &PhaseContext) -> Result<(), BootstrapError> {
        let probe = ctx.platform.reachability.as_ref();
        let url = self.url.as_str();
        let status = wait_until(&self.what, self.poll, Some(&ctx.interrupt), move || async move {
            Ok::<_, ProbeError>(Some(probe.check(url).await?))
        })
        .await?;
        info!(what = %self.what, url = %self.url, status, "endpoint reachable");
        Ok(())
    }
}

pub struct MigrateState {
    pub local: PathBuf,
    pub remote: RemoteBackendConfig,
}

#[async_trait]
impl SubphaseAction for MigrateState {
    async fn run(&self, ctx: &PhaseContext) -> Result<(), BootstrapError> {
        let migrator = StateBackendMigrator::new(
            ctx.platform.iac.clone(),
            ctx.platform.reachability.clone(),
            ctx.retry,
        )
        .with_interrupt(ctx.interrupt.clone());
        match migrator.migrate(&self.local, &self.remote).await? {
            MigrationOutcome::Migrated { backup, resources } => info!(
                resources,
                backup = %backup.display(),
                "state now lives in the remote backend"
            ),
            MigrationOutcome::AlreadyMigrated => info!("state already remote, nothing to do"),
        }
        Ok(())
    }
}

fn read_operator_secret(env: &dyn EnvSink, name: &str) -> Option<SecretString> {
    env.get(name)
        .filter(|v| !v.is_empty())
        .map(SecretString::from)
}

/// Adopt an operator-supplied token from the environment into a scope.
pub struct AdoptFromEnv {
    pub scope: String,
    pub field: String,
    pub spec: CredentialSpec,
    pub env_var: String,
    pub source: Arc<dyn EnvSink>,
}

#[async_trait]
impl SubphaseAction for AdoptFromEnv {
    async fn run(&self, ctx: &PhaseContext) -> Result<(), BootstrapError> {
        let value = read_operator_secret(self.source.as_ref(), &self.env_var)
            .ok_or_else(|| BootstrapError::Config(format!("${} is not set", self.env_var)))?;
        ctx.credentials
            .adopt(&self.scope, &self.spec, BTreeMap::from([(self.field.clone(), value)]))?;
        Ok(())
    }
}

/// Store the long-lived GitOps token unless the secret store already has one.
pub struct StoreLongLivedToken {
    pub adopt: AdoptFromEnv,
}

#[async_trait]
impl SubphaseAction for StoreLongLivedToken {
    async fn run(&self, ctx: &PhaseContext) -> Result<(), BootstrapError> {
        let path = self
            .adopt
            .spec
            .store_path
            .as_deref()
            .ok_or_else(|| BootstrapError::Config(format!("scope `{}` has no store path", self.adopt.scope)))?;
        let store = ctx.platform.store.as_ref();
        if ctx.credentials.already_generated(path, store).await? {
            info!(path, "long-lived token already stored");
            return Ok(());
        }
        self.adopt.run(ctx).await?;
        ctx.credentials.persist(&self.adopt.scope, store).await?;
        Ok(())
    }
}

/// The reconciler's source object exists.
pub struct WaitReconcilerSource {
    pub poll: PollSpec,
}

#[async_trait]
impl SubphaseAction for WaitReconcilerSource {
    async fn run(&self, ctx: &PhaseContext) -> Result<(), BootstrapError> {
        let reconciler = ctx.platform.reconciler.as_ref();
        wait_until("reconciler source", self.poll, Some(&ctx.interrupt), move || async move {
            Ok::<_, CommandError>(reconciler.source_exists().await?.then_some(()))
        })
        .await?;
        info!("reconciler source created");
        Ok(())
    }
}

pub struct Handoff {
    pub target: CredentialRef,
    pub settings: HandoffSettings,
}

#[async_trait]
impl SubphaseAction for Handoff {
    async fn run(&self, ctx: &PhaseContext) -> Result<(), BootstrapError> {
        let repo_probe = if self.settings.verify_repo_access {
            ctx.platform.repo_probe.clone()
        } else {
            None
        };
        let coordinator = AuthHandoffCoordinator::new(
            ctx.platform.cluster.clone(),
            ctx.platform.reconciler.clone(),
            repo_probe,
            self.settings.clone(),
        )
        .with_interrupt(ctx.interrupt.clone());
        let tx = coordinator.handoff(&self.target).await?;
        info!(
            secret = %self.target.secret_name,
            outcome = ?tx.outcome,
            "reconciler authenticates with the synced credential"
        );
        Ok(())
    }
}

pub struct RevokeBootstrapCredential {
    pub namespace: String,
    pub secret: String,
}

#[async_trait]
impl SubphaseAction for RevokeBootstrapCredential {
    async fn run(&self, ctx: &PhaseContext) -> Result<(), BootstrapError> {
        let cluster = ctx.platform.cluster.as_ref();
        let (namespace, secret) = (self.namespace.as_str(), self.secret.as_str());
        let deleted = ctx
            .operation("delete bootstrap credential")
            .execute(
                move |_| cluster.delete_secret(namespace, secret),
                CommandError::classification,
            )
            .await?;
        if deleted {
            info!(namespace, secret, "bootstrap credential revoked");
        } else {
            info!(namespace, secret, "bootstrap credential already absent");
        }
        Ok(())
    }
}

/// Last look at everything the bootstrap set up.
pub struct FinalHealth;

#[async_trait]
impl SubphaseAction for FinalHealth {
    async fn run(&self, ctx: &PhaseContext) -> Result<(), BootstrapError> {
        let nodes = ctx.platform.cluster.nodes_ready().await?;
        if !nodes.all_ready() {
            return Err(BootstrapError::Validation(format!(
                "{}/{} nodes ready",
                nodes.ready, nodes.total
            )));
        }

        let store = ctx.platform.store.as_ref();
        ctx.operation("secret manager health")
            .execute(move |_| store.health(), VaultError::classification)
            .await?;

        let status = ctx.platform.reconciler.reconcile_status().await?;
        if !status.ready {
            return Err(BootstrapError::Validation(format!(
                "reconciler source not ready: {}",
                status.message.as_deref().unwrap_or("no message")
            )));
        }

        let iac = ctx.platform.iac.as_ref();
        let plan = ctx
            .operation("plan for drift")
            .execute(move |_| iac.plan(), CommandError::classification)
            .await?;
        if plan.has_changes {
            warn!("infrastructure plan reports pending changes");
            return Err(BootstrapError::Validation(
                "infrastructure drift: plan reports pending changes".into(),
            ));
        }

        info!(nodes = nodes.total, "platform healthy");
        Ok(())
    }
}
