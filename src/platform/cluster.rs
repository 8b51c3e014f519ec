use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use secrecy::SecretString;
use serde_json::Value;

use super::command::{Background, CommandError, CommandOutput, CommandRunner};

/// Ready/total node counts reported by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeReadiness {
    pub ready: usize,
    pub total: usize,
}

impl NodeReadiness {
    pub fn all_ready(&self) -> bool {
        self.total > 0 && self.ready == self.total
    }
}

/// Read-mostly view of the cluster control plane.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn nodes_ready(&self) -> Result<NodeReadiness, CommandError>;

    async fn resource_exists(
        &self,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<bool, CommandError>;

    /// Decoded value of `key` in a secret, `None` if the secret or key is absent.
    async fn secret_value(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Option<SecretString>, CommandError>;

    /// Returns whether a secret was actually deleted.
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<bool, CommandError>;

    fn port_forward(
        &self,
        namespace: &str,
        service: &str,
        local_port: u16,
        remote_port: u16,
    ) -> Result<Box<dyn Background>, CommandError>;
}

/// `kubectl` invocation shared by the cluster and reconciler adapters.
#[derive(Clone)]
pub struct KubectlCommand {
    runner: Arc<dyn CommandRunner>,
    binary: String,
    context: Option<String>,
    request_timeout: Option<Duration>,
}

impl KubectlCommand {
    pub fn new(runner: Arc<dyn CommandRunner>, binary: impl Into<String>, context: Option<String>) -> Self {
        Self {
            runner,
            binary: binary.into(),
            context,
            request_timeout: None,
        }
    }

    /// Bound each API request of one-shot commands. Commands that carry their
    /// own `--timeout` (rollout status) and background commands are left alone.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub(crate) fn args<I, S>(&self, args: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut full = Vec::new();
        if let Some(context) = &self.context {
            full.push("--context".to_string());
            full.push(context.clone());
        }
        full.extend(args.into_iter().map(Into::into));
        full
    }

    pub(crate) async fn run<I, S>(&self, args: I) -> Result<CommandOutput, CommandError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut args = self.args(args);
        if let Some(timeout) = self.request_timeout
            && !args.iter().any(|a| a.starts_with("--timeout="))
        {
            args.push(format!("--request-timeout={}s", timeout.as_secs().max(1)));
        }
        self.runner.run(&self.binary, &args).await
    }

    pub(crate) async fn json<I, S>(&self, args: I) -> Result<Option<Value>, CommandError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let out = self.run(args).await?;
        if out.stdout.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&out.stdout)
            .map(Some)
            .map_err(|e| CommandError::output(&self.binary, e))
    }

    pub(crate) fn spawn(&self, args: Vec<String>) -> Result<Box<dyn Background>, CommandError> {
        let args = self.args(args);
        self.runner.spawn(&self.binary, &args)
    }

    pub(crate) fn binary(&self) -> &str {
        &self.binary
    }
}

/// [`ClusterApi`] backed by `kubectl`.
pub struct Kubectl {
    cmd: KubectlCommand,
}

impl Kubectl {
    pub fn new(cmd: KubectlCommand) -> Self {
        Self { cmd }
    }
}

fn namespaced(namespace: Option<&str>) -> Vec<String> {
    match namespace {
        Some(ns) => vec!["-n".to_string(), ns.to_string()],
        None => Vec::new(),
    }
}

#[async_trait]
impl ClusterApi for Kubectl {
    async fn nodes_ready(&self) -> Result<NodeReadiness, CommandError> {
        let list = self
            .cmd
            .json(["get", "nodes", "-o", "json"])
            .await?
            .ok_or_else(|| CommandError::output(self.cmd.binary(), "empty node list"))?;
        let items = list["items"].as_array().cloned().unwrap_or_default();
        let ready = items
            .iter()
            .filter(|node| {
                node["status"]["conditions"]
                    .as_array()
                    .is_some_and(|conds| {
                        conds
                            .iter()
                            .any(|c| c["type"] == "Ready" && c["status"] == "True")
                    })
            })
            .count();
        Ok(NodeReadiness {
            ready,
            total: items.len(),
        })
    }

    async fn resource_exists(
        &self,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<bool, CommandError> {
        let mut args = vec!["get".to_string(), kind.to_string(), name.to_string()];
        args.extend(namespaced(namespace));
        args.extend(["--ignore-not-found", "-o", "name"].map(String::from));
        let out = self.cmd.run(args).await?;
        Ok(!out.stdout.trim().is_empty())
    }

    async fn secret_value(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Option<SecretString>, CommandError> {
        let secret = self
            .cmd
            .json(["get", "secret", name, "-n", namespace, "--ignore-not-found", "-o", "json"])
            .await?;
        let Some(encoded) = secret
            .as_ref()
            .and_then(|s| s["data"][key].as_str())
        else {
            return Ok(None);
        };
        let decoded = STANDARD
            .decode(encoded)
            .map_err(|e| CommandError::output(self.cmd.binary(), format!("secret {namespace}/{name}: {e}")))?;
        let value = String::from_utf8(decoded)
            .map_err(|_| CommandError::output(self.cmd.binary(), format!("secret {namespace}/{name} key {key} is not UTF-8")))?;
        Ok(Some(SecretString::from(value)))
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<bool, CommandError> {
        let out = self
            .cmd
            .run(["delete", "secret", name, "-n", namespace, "--ignore-not-found"])
            .await?;
        Ok(!out.stdout.trim().is_empty())
    }

    fn port_forward(
        &self,
        namespace: &str,
        service: &str,
        local_port: u16,
        remote_port: u16,
    ) -> Result<Box<dyn Background>, CommandError> {
        self.cmd.spawn(vec![
            "port-forward".to_string(),
            "-n".to_string(),
            namespace.to_string(),
            format!("svc/{service}"),
            format!("{local_port}:{remote_port}"),
        ])
    }
}
