//! External collaborators the bootstrapper drives but does not reimplement.

pub mod cluster;
pub mod command;
pub mod iac;
pub mod probe;
pub mod reconciler;

use std::sync::Arc;

pub use cluster::{ClusterApi, Kubectl, KubectlCommand, NodeReadiness};
pub use command::{Background, CommandError, CommandOutput, CommandRunner, ProcessRunner};
pub use iac::{BackendConfig, IacEngine, InitMode, PlanSummary, TerraformCli};
pub use probe::{HttpProbe, ProbeError, Reachability};
pub use reconciler::{FluxSource, ReconcileStatus, Reconciler, SourceRef, SourceSpec};

use crate::git::RepoAccessProbe;
use crate::vault::SecretStore;

/// Handles to every external system, shared by all phases of a run.
#[derive(Clone)]
pub struct Platform {
    pub cluster: Arc<dyn ClusterApi>,
    pub iac: Arc<dyn IacEngine>,
    pub store: Arc<dyn SecretStore>,
    pub reconciler: Arc<dyn Reconciler>,
    pub reachability: Arc<dyn Reachability>,
    pub repo_probe: Option<Arc<dyn RepoAccessProbe>>,
}
