use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;

use super::tunnel::Tunnels;
use crate::config::TunnelConfig;
use crate::error::{BootstrapError, WaitError};
use crate::migrate::local_resource_count;
use crate::phase::{CompletionCheck, PhaseContext, Precondition};
use crate::wait::{PollSpec, wait_until};

fn failed(check: &str, reason: impl fmt::Display) -> BootstrapError {
    BootstrapError::Precondition {
        check: check.to_string(),
        reason: reason.to_string(),
    }
}

/// Timeouts become precondition failures; interrupts stay interrupts.
fn wait_failed(check: &str, err: WaitError) -> BootstrapError {
    match err {
        WaitError::Interrupted { .. } => err.into(),
        WaitError::TimedOut { .. } => failed(check, err),
    }
}

/// The control plane answers and has registered nodes.
pub struct ClusterReachable;

#[async_trait]
impl Precondition for ClusterReachable {
    fn name(&self) -> &str {
        "cluster reachable"
    }

    async fn check(&self, ctx: &PhaseContext) -> Result<(), BootstrapError> {
        let nodes = ctx
            .platform
            .cluster
            .nodes_ready()
            .await
            .map_err(|e| failed(self.name(), e))?;
        if nodes.total == 0 {
            return Err(failed(self.name(), "no nodes registered"));
        }
        Ok(())
    }
}

pub struct NamespaceExists {
    namespace: String,
    label: String,
}

impl NamespaceExists {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            label: format!("namespace {namespace} exists"),
        }
    }
}

#[async_trait]
impl Precondition for NamespaceExists {
    fn name(&self) -> &str {
        &self.label
    }

    async fn check(&self, ctx: &PhaseContext) -> Result<(), BootstrapError> {
        let exists = ctx
            .platform
            .cluster
            .resource_exists("namespace", None, &self.namespace)
            .await
            .map_err(|e| failed(self.name(), e))?;
        if !exists {
            return Err(failed(self.name(), format!("namespace {} not found", self.namespace)));
        }
        Ok(())
    }
}

/// The secret manager is initialized and unsealed. Opens its tunnel first when one is configured.
pub struct SecretManagerHealthy {
    pub tunnel: Option<TunnelConfig>,
    pub tunnels: Tunnels,
    pub poll: PollSpec,
}

#[async_trait]
impl Precondition for SecretManagerHealthy {
    fn name(&self) -> &str {
        "secret manager healthy"
    }

    async fn check(&self, ctx: &PhaseContext) -> Result<(), BootstrapError> {
        if let Some(tunnel) = &self.tunnel {
            self.tunnels
                .ensure(ctx, tunnel)
                .map_err(|e| failed(self.name(), e))?;
        }
        let store = ctx.platform.store.as_ref();
        wait_until("secret manager health", self.poll, Some(&ctx.interrupt), move || async move {
            store.health().await.map(Some)
        })
        .await
        .map_err(|e| wait_failed(self.name(), e))
    }
}

/// The object store backing remote state answers HTTP.
pub struct ObjectStoreReachable {
    pub tunnel: Option<TunnelConfig>,
    pub tunnels: Tunnels,
    pub url: String,
    pub poll: PollSpec,
}

#[async_trait]
impl Precondition for ObjectStoreReachable {
    fn name(&self) -> &str {
        "object store reachable"
    }

    async fn check(&self, ctx: &PhaseContext) -> Result<(), BootstrapError> {
        if let Some(tunnel) = &self.tunnel {
            self.tunnels
                .ensure(ctx, tunnel)
                .map_err(|e| failed(self.name(), e))?;
        }
        let probe = ctx.platform.reachability.as_ref();
        let url = self.url.as_str();
        wait_until("object store", self.poll, Some(&ctx.interrupt), move || async move {
            probe.check(url).await.map(Some)
        })
        .await
        .map(|_| ())
        .map_err(|e| wait_failed(self.name(), e))
    }
}

pub struct ReconcilerSourceExists;

#[async_trait]
impl Precondition for ReconcilerSourceExists {
    fn name(&self) -> &str {
        "reconciler source exists"
    }

    async fn check(&self, ctx: &PhaseContext) -> Result<(), BootstrapError> {
        let exists = ctx
            .platform
            .reconciler
            .source_exists()
            .await
            .map_err(|e| failed(self.name(), e))?;
        if !exists {
            return Err(failed(self.name(), "the GitOps source object is missing"));
        }
        Ok(())
    }
}

/// The reconciler's source authenticates with `secret`.
///
/// A completion check for the handoff and a precondition for finalization.
pub struct ReconcilerUses {
    secret: String,
    label: String,
}

impl ReconcilerUses {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.to_string(),
            label: format!("reconciler uses {secret}"),
        }
    }

    async fn current(&self, ctx: &PhaseContext) -> Result<Option<String>, BootstrapError> {
        Ok(ctx.platform.reconciler.read_source_spec().await?.secret_ref())
    }
}

#[async_trait]
impl Precondition for ReconcilerUses {
    fn name(&self) -> &str {
        &self.label
    }

    async fn check(&self, ctx: &PhaseContext) -> Result<(), BootstrapError> {
        let current = self.current(ctx).await.map_err(|e| failed(self.name(), e))?;
        if current.as_deref() != Some(self.secret.as_str()) {
            return Err(failed(
                self.name(),
                format!("source references {}", current.as_deref().unwrap_or("no secret")),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl CompletionCheck for ReconcilerUses {
    fn describe(&self) -> &str {
        &self.label
    }

    async fn is_complete(&self, ctx: &PhaseContext) -> Result<bool, BootstrapError> {
        Ok(self.current(ctx).await?.as_deref() == Some(self.secret.as_str()))
    }
}

/// Nothing left in the local state file.
pub struct LocalStateMigrated {
    pub local: PathBuf,
}

#[async_trait]
impl CompletionCheck for LocalStateMigrated {
    fn describe(&self) -> &str {
        "local state is absent or tracks no resources"
    }

    async fn is_complete(&self, _ctx: &PhaseContext) -> Result<bool, BootstrapError> {
        Ok(local_resource_count(&self.local)?.is_none())
    }
}
