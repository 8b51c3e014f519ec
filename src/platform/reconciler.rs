use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::cluster::KubectlCommand;
use super::command::CommandError;

/// Annotation Flux watches to trigger an out-of-band reconciliation.
pub const RECONCILE_ANNOTATION: &str = "reconcile.fluxcd.io/requestedAt";

/// Verbatim `.spec` of the reconciler's source object, serialized canonically
/// (sorted keys) so two snapshots compare byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec(String);

impl SourceSpec {
    pub fn from_value(spec: &Value) -> Self {
        // serde_json's default map is ordered, so this is stable.
        Self(spec.to_string())
    }

    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(raw)?;
        Ok(Self::from_value(&value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_str(&self.0)
    }

    /// Name of the secret the source currently authenticates with.
    pub fn secret_ref(&self) -> Option<String> {
        let value = self.to_value().ok()?;
        value["secretRef"]["name"].as_str().map(String::from)
    }
}

impl std::fmt::Display for SourceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileStatus {
    pub ready: bool,
    pub last_handled: Option<String>,
    pub message: Option<String>,
}

impl ReconcileStatus {
    /// True once the controller handled `token` and reported Ready.
    pub fn satisfied_by(&self, token: &str) -> bool {
        self.ready && self.last_handled.as_deref() == Some(token)
    }
}

/// Control surface of the GitOps reconciler's source object.
#[async_trait]
pub trait Reconciler: Send + Sync {
    async fn source_exists(&self) -> Result<bool, CommandError>;
    async fn read_source_spec(&self) -> Result<SourceSpec, CommandError>;
    async fn point_at(&self, secret_name: &str) -> Result<(), CommandError>;
    async fn restore_source_spec(&self, snapshot: &SourceSpec) -> Result<(), CommandError>;
    /// Restart the source controller so cached credentials are dropped now.
    async fn refresh_credentials(&self, timeout: Duration) -> Result<(), CommandError>;
    async fn request_reconcile(&self, token: &str) -> Result<(), CommandError>;
    async fn reconcile_status(&self) -> Result<ReconcileStatus, CommandError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRef {
    pub namespace: String,
    pub name: String,
    pub controller: String,
}

/// [`Reconciler`] for a Flux `GitRepository`, driven through kubectl.
pub struct FluxSource {
    cmd: KubectlCommand,
    source: SourceRef,
}

impl FluxSource {
    pub fn new(cmd: KubectlCommand, source: SourceRef) -> Self {
        Self { cmd, source }
    }

    fn object(&self) -> [String; 4] {
        [
            "gitrepository".to_string(),
            self.source.name.clone(),
            "-n".to_string(),
            self.source.namespace.clone(),
        ]
    }

    async fn get(&self) -> Result<Option<Value>, CommandError> {
        let mut args = vec!["get".to_string()];
        args.extend(self.object());
        args.extend(["--ignore-not-found", "-o", "json"].map(String::from));
        self.cmd.json(args).await
    }

    async fn patch(&self, kind: &str, body: &Value) -> Result<(), CommandError> {
        let mut args = vec!["patch".to_string()];
        args.extend(self.object());
        args.extend(["--type".to_string(), kind.to_string(), "-p".to_string(), body.to_string()]);
        self.cmd.run(args).await?;
        Ok(())
    }

    fn missing(&self) -> CommandError {
        CommandError::output(
            self.cmd.binary(),
            format!(
                "gitrepository {}/{} not found",
                self.source.namespace, self.source.name
            ),
        )
    }
}

#[async_trait]
impl Reconciler for FluxSource {
    async fn source_exists(&self) -> Result<bool, CommandError> {
        Ok(self.get().await?.is_some())
    }

    async fn read_source_spec(&self) -> Result<SourceSpec, CommandError> {
        let object = self.get().await?.ok_or_else(|| self.missing())?;
        match object.get("spec") {
            Some(spec) => Ok(SourceSpec::from_value(spec)),
            None => Err(self.missing()),
        }
    }

    async fn point_at(&self, secret_name: &str) -> Result<(), CommandError> {
        self.patch("merge", &json!({"spec": {"secretRef": {"name": secret_name}}}))
            .await
    }

    async fn restore_source_spec(&self, snapshot: &SourceSpec) -> Result<(), CommandError> {
        let spec = snapshot
            .to_value()
            .map_err(|e| CommandError::output(self.cmd.binary(), e))?;
        self.patch("json", &json!([{"op": "replace", "path": "/spec", "value": spec}]))
            .await
    }

    async fn refresh_credentials(&self, timeout: Duration) -> Result<(), CommandError> {
        let deployment = format!("deployment/{}", self.source.controller);
        self.cmd
            .run([
                "rollout",
                "restart",
                deployment.as_str(),
                "-n",
                self.source.namespace.as_str(),
            ])
            .await?;
        let timeout = format!("--timeout={}s", timeout.as_secs().max(1));
        self.cmd
            .run([
                "rollout",
                "status",
                deployment.as_str(),
                "-n",
                self.source.namespace.as_str(),
                timeout.as_str(),
            ])
            .await?;
        Ok(())
    }

    async fn request_reconcile(&self, token: &str) -> Result<(), CommandError> {
        let mut args = vec!["annotate".to_string(), "--overwrite".to_string()];
        args.extend(self.object());
        args.push(format!("{RECONCILE_ANNOTATION}={token}"));
        self.cmd.run(args).await?;
        Ok(())
    }

    async fn reconcile_status(&self) -> Result<ReconcileStatus, CommandError> {
        let object = self.get().await?.ok_or_else(|| self.missing())?;
        let status = &object["status"];
        let ready = status["conditions"]
            .as_array()
            .and_then(|conds| conds.iter().find(|c| c["type"] == "Ready"));
        Ok(ReconcileStatus {
            ready: ready.is_some_and(|c| c["status"] == "True"),
            last_handled: status["lastHandledReconcileAt"].as_str().map(String::from),
            message: ready.and_then(|c| c["message"].as_str()).map(String::from),
        })
    }
}
