//! Cutover of the GitOps reconciler from the bootstrap credential to the
//! synced one, with preflight, live validation and automatic rollback.
//!
//! The five steps run strictly in sequence and are not interruptible: the
//! waits inside ignore the interrupt flag so a rollback can always finish
//! before the process exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::{HandoffError, WaitError};
use crate::git::RepoAccessProbe;
use crate::interrupt::Interrupt;
use crate::platform::{ClusterApi, ReconcileStatus, Reconciler, SourceSpec};
use crate::wait::{PollSpec, wait_until};

/// The synced secret the reconciler should authenticate with after handoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRef {
    pub namespace: String,
    pub secret_name: String,
    /// Key inside the secret holding the token.
    pub key: String,
    /// Required token prefix, e.g. `ghp_`.
    pub expected_prefix: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffSettings {
    /// How long to wait for the secret-sync agent to materialize the target.
    pub sync_timeout: Duration,
    pub poll_interval: Duration,
    /// Bound on the forced reconciliation. Covers at least one controller restart.
    pub validate_timeout: Duration,
    pub controller_restart_budget: Duration,
    /// Needs a repository probe; preflight fails without one.
    pub verify_repo_access: bool,
}

impl Default for HandoffSettings {
    fn default() -> Self {
        Self {
            sync_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(5),
            validate_timeout: Duration::from_secs(300),
            controller_restart_budget: Duration::from_secs(120),
            verify_repo_access: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HandoffState {
    Idle,
    PreflightChecked,
    /// Cutover written, validation pending.
    Pending,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransactionOutcome {
    Pending,
    Committed,
    RolledBack,
}

/// One cutover attempt. Lives only in memory; never retried after rollback.
#[derive(Debug, Clone)]
pub struct HandoffTransaction {
    pub prior_spec: SourceSpec,
    pub target: CredentialRef,
    pub validation: Option<ReconcileStatus>,
    pub outcome: TransactionOutcome,
}

/// Bound on one `ls-remote` against the GitOps repository.
const REPO_PROBE_TIMEOUT: Duration = Duration::from_secs(60);

pub struct AuthHandoffCoordinator {
    cluster: Arc<dyn ClusterApi>,
    reconciler: Arc<dyn Reconciler>,
    repo_probe: Option<Arc<dyn RepoAccessProbe>>,
    settings: HandoffSettings,
    /// Honoured only while nothing has been mutated.
    interrupt: Option<Interrupt>,
    in_flight: Arc<AtomicBool>,
    state: Mutex<HandoffState>,
}

struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl AuthHandoffCoordinator {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        reconciler: Arc<dyn Reconciler>,
        repo_probe: Option<Arc<dyn RepoAccessProbe>>,
        settings: HandoffSettings,
    ) -> Self {
        Self {
            cluster,
            reconciler,
            repo_probe,
            settings,
            interrupt: None,
            in_flight: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(HandoffState::Idle),
        }
    }

    /// Let `interrupt` abort the preflight. Commit, validation and rollback run to the end.
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    pub fn state(&self) -> HandoffState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn enter(&self, next: HandoffState) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        info!(from = ?*state, to = ?next, "handoff state");
        *state = next;
    }

    /// Switch the reconciler to `target`. `Ok` only once a forced
    /// reconciliation succeeded with the new credential.
    pub async fn handoff(&self, target: &CredentialRef) -> Result<HandoffTransaction, HandoffError> {
        let _flight = InFlight::acquire(&self.in_flight).ok_or(HandoffError::InFlight)?;
        self.enter(HandoffState::Idle);

        self.preflight(target).await?;
        self.enter(HandoffState::PreflightChecked);

        let prior_spec = match self.reconciler.read_source_spec().await {
            Ok(spec) => spec,
            Err(e) => return Err(self.abort_unmutated(format!("snapshot: {e}"))),
        };
        info!(snapshot = %prior_spec, "reconciler source captured");

        let mut tx = HandoffTransaction {
            prior_spec,
            target: target.clone(),
            validation: None,
            outcome: TransactionOutcome::Pending,
        };
        self.enter(HandoffState::Pending);

        match self.commit_and_validate(&mut tx).await {
            Ok(()) => {
                tx.outcome = TransactionOutcome::Committed;
                self.enter(HandoffState::Committed);
                info!(secret = %target.secret_name, "reconciler now uses the synced credential");
                Ok(tx)
            }
            Err(reason) => Err(self.rollback(&mut tx, reason).await),
        }
    }

    async fn preflight(&self, target: &CredentialRef) -> Result<(), HandoffError> {
        let cluster = self.cluster.as_ref();
        let what = format!("synced secret {}/{}", target.namespace, target.secret_name);
        let value = wait_until(
            &what,
            PollSpec::new(self.settings.poll_interval, self.settings.sync_timeout),
            self.interrupt.as_ref(),
            move || cluster.secret_value(&target.namespace, &target.secret_name, &target.key),
        )
        .await
        .map_err(|e| match e {
            WaitError::Interrupted { .. } => {
                warn!("handoff interrupted during preflight, nothing was changed");
                self.enter(HandoffState::Idle);
                HandoffError::Interrupted
            }
            other => self.abort_unmutated(format!("preflight: {other}")),
        })?;
        self.check_synced(target, value)
            .await
            .map_err(|reason| self.abort_unmutated(reason))
    }

    async fn check_synced(&self, target: &CredentialRef, value: SecretString) -> Result<(), String> {
        if value.expose_secret().is_empty() {
            return Err("invalid format: synced token is empty".to_string());
        }
        if let Some(prefix) = &target.expected_prefix {
            if !value.expose_secret().starts_with(prefix.as_str()) {
                return Err(format!("invalid format: token does not start with `{prefix}`"));
            }
        }

        if self.settings.verify_repo_access {
            let probe = self
                .repo_probe
                .clone()
                .ok_or_else(|| "preflight: repository access check requested but no repository configured".to_string())?;
            let listing = tokio::task::spawn_blocking(move || probe.list_refs(&value));
            let refs = tokio::time::timeout(REPO_PROBE_TIMEOUT, listing)
                .await
                .map_err(|_| format!("preflight: repository gave no answer within {}s", REPO_PROBE_TIMEOUT.as_secs()))?
                .map_err(|e| format!("preflight: repository probe did not finish: {e}"))?
                .map_err(|e| format!("preflight: target credential cannot read the repository: {}", e.message()))?;
            if refs == 0 {
                return Err("preflight: repository advertised no refs".to_string());
            }
        }
        Ok(())
    }

    async fn commit_and_validate(&self, tx: &mut HandoffTransaction) -> Result<(), String> {
        let reconciler = self.reconciler.as_ref();
        reconciler
            .point_at(&tx.target.secret_name)
            .await
            .map_err(|e| format!("commit: {e}"))?;
        reconciler
            .refresh_credentials(self.settings.controller_restart_budget)
            .await
            .map_err(|e| format!("refresh: {e}"))?;

        let token = Utc::now().to_rfc3339();
        reconciler
            .request_reconcile(&token)
            .await
            .map_err(|e| format!("validation: {e}"))?;

        let token = token.as_str();
        let status = wait_until(
            "reconciliation with the new credential",
            PollSpec::new(self.settings.poll_interval, self.settings.validate_timeout),
            None,
            move || async move {
                let status = reconciler.reconcile_status().await.map_err(|e| e.to_string())?;
                if status.satisfied_by(token) {
                    Ok(Some(status))
                } else if status.last_handled.as_deref() == Some(token) {
                    Err(status
                        .message
                        .unwrap_or_else(|| "source not ready".to_string()))
                } else {
                    Ok(None)
                }
            },
        )
        .await
        .map_err(|e| format!("validation: {e}"))?;

        tx.validation = Some(status);
        Ok(())
    }

    /// Reapply the snapshot and prove it took. Always returns the error to report.
    async fn rollback(&self, tx: &mut HandoffTransaction, reason: String) -> HandoffError {
        warn!(%reason, "handoff failed after commit, restoring prior reconciler source");
        let reconciler = self.reconciler.as_ref();
        let restored = async {
            reconciler.restore_source_spec(&tx.prior_spec).await?;
            reconciler
                .refresh_credentials(self.settings.controller_restart_budget)
                .await?;
            reconciler.read_source_spec().await
        }
        .await;

        let failure = match restored {
            Ok(current) if current == tx.prior_spec => {
                tx.outcome = TransactionOutcome::RolledBack;
                self.enter(HandoffState::RolledBack);
                return HandoffError::RolledBack {
                    reason,
                    mutated: true,
                };
            }
            Ok(current) => format!("restored source differs from snapshot (now {current})"),
            Err(e) => format!("rollback failed: {e}"),
        };

        error!(%reason, %failure, snapshot = %tx.prior_spec, "reconciler left in an ambiguous state");
        HandoffError::Unsafe {
            reason: format!("{reason}; {failure}"),
            snapshot: tx.prior_spec.to_string(),
            target: format!("{}/{}", tx.target.namespace, tx.target.secret_name),
        }
    }

    fn abort_unmutated(&self, reason: String) -> HandoffError {
        warn!(%reason, "handoff aborted before any change");
        self.enter(HandoffState::Idle);
        HandoffError::RolledBack {
            reason,
            mutated: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeCluster, FakeReconciler, FakeRepoProbe};

    const BOOTSTRAP_SPEC: &str =
        r#"{"interval":"1m","ref":{"branch":"main"},"secretRef":{"name":"flux-bootstrap"},"url":"https://github.com/acme/platform"}"#;

    fn target() -> CredentialRef {
        CredentialRef {
            namespace: "flux-system".into(),
            secret_name: "gitops-credentials".into(),
            key: "password".into(),
            expected_prefix: Some("ghp_".into()),
        }
    }

    fn settings() -> HandoffSettings {
        HandoffSettings {
            sync_timeout: Duration::from_millis(30),
            poll_interval: Duration::from_millis(5),
            validate_timeout: Duration::from_millis(40),
            controller_restart_budget: Duration::from_millis(10),
            verify_repo_access: false,
        }
    }

    fn synced_cluster(token: &str) -> Arc<FakeCluster> {
        let cluster = Arc::new(FakeCluster::new());
        cluster.put_secret("flux-system", "gitops-credentials", "password", token);
        cluster
    }

    fn coordinator(cluster: Arc<FakeCluster>, reconciler: Arc<FakeReconciler>) -> AuthHandoffCoordinator {
        AuthHandoffCoordinator::new(cluster, reconciler, None, settings())
    }

    #[tokio::test]
    async fn commits_when_reconciliation_succeeds() {
        let reconciler = Arc::new(FakeReconciler::new(BOOTSTRAP_SPEC).accepting("gitops-credentials"));
        let coord = coordinator(synced_cluster("ghp_live"), reconciler.clone());

        let tx = coord.handoff(&target()).await.unwrap();
        assert_eq!(tx.outcome, TransactionOutcome::Committed);
        assert_eq!(tx.prior_spec.as_str(), BOOTSTRAP_SPEC);
        assert!(tx.validation.unwrap().ready);
        assert_eq!(coord.state(), HandoffState::Committed);
        assert_eq!(reconciler.secret_ref().as_deref(), Some("gitops-credentials"));
    }

    #[tokio::test]
    async fn bad_prefix_rolls_back_without_mutation() {
        let reconciler = Arc::new(FakeReconciler::new(BOOTSTRAP_SPEC).accepting("gitops-credentials"));
        let coord = coordinator(synced_cluster("glpat-wrong-kind"), reconciler.clone());

        match coord.handoff(&target()).await {
            Err(HandoffError::RolledBack { reason, mutated }) => {
                assert!(reason.starts_with("invalid format"));
                assert!(!mutated);
            }
            other => panic!("expected preflight rollback, got {other:?}"),
        }
        assert!(reconciler.calls().is_empty());
    }

    #[tokio::test]
    async fn missing_synced_secret_times_out_in_preflight() {
        let reconciler = Arc::new(FakeReconciler::new(BOOTSTRAP_SPEC));
        let coord = coordinator(Arc::new(FakeCluster::new()), reconciler.clone());

        let err = coord.handoff(&target()).await.unwrap_err();
        assert!(matches!(err, HandoffError::RolledBack { mutated: false, .. }));
        assert!(reconciler.calls().is_empty());
    }

    #[tokio::test]
    async fn failed_validation_restores_spec_byte_for_byte() {
        // Reconciler only works with the bootstrap secret: the new one is rejected.
        let reconciler = Arc::new(FakeReconciler::new(BOOTSTRAP_SPEC).accepting("flux-bootstrap"));
        let coord = coordinator(synced_cluster("ghp_revoked"), reconciler.clone());

        match coord.handoff(&target()).await {
            Err(HandoffError::RolledBack { reason, mutated }) => {
                assert!(reason.starts_with("validation"));
                assert!(mutated);
            }
            other => panic!("expected rollback, got {other:?}"),
        }
        assert_eq!(reconciler.spec().as_str(), BOOTSTRAP_SPEC);
        assert_eq!(coord.state(), HandoffState::RolledBack);
        let calls = reconciler.calls();
        assert!(calls.contains(&"restore_source_spec".to_string()));
        assert_eq!(calls.iter().filter(|c| *c == "refresh_credentials").count(), 2);
    }

    #[tokio::test]
    async fn failed_rollback_is_unsafe() {
        let reconciler = Arc::new(
            FakeReconciler::new(BOOTSTRAP_SPEC)
                .accepting("flux-bootstrap")
                .failing_restore(),
        );
        let coord = coordinator(synced_cluster("ghp_revoked"), reconciler);

        match coord.handoff(&target()).await {
            Err(HandoffError::Unsafe { snapshot, target, .. }) => {
                assert_eq!(snapshot, BOOTSTRAP_SPEC);
                assert_eq!(target, "flux-system/gitops-credentials");
            }
            other => panic!("expected unsafe, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn only_one_handoff_in_flight() {
        let reconciler = Arc::new(FakeReconciler::new(BOOTSTRAP_SPEC).accepting("gitops-credentials"));
        let coord = coordinator(synced_cluster("ghp_live"), reconciler.clone());

        let held = InFlight::acquire(&coord.in_flight).unwrap();
        assert!(matches!(coord.handoff(&target()).await, Err(HandoffError::InFlight)));
        assert!(reconciler.calls().is_empty());
        drop(held);
        assert!(coord.handoff(&target()).await.is_ok());
    }

    #[tokio::test]
    async fn repo_probe_failure_aborts_preflight() {
        let reconciler = Arc::new(FakeReconciler::new(BOOTSTRAP_SPEC).accepting("gitops-credentials"));
        let coord = AuthHandoffCoordinator::new(
            synced_cluster("ghp_live"),
            reconciler.clone(),
            Some(Arc::new(FakeRepoProbe::denying())),
            HandoffSettings {
                verify_repo_access: true,
                ..settings()
            },
        );

        let err = coord.handoff(&target()).await.unwrap_err();
        assert!(matches!(err, HandoffError::RolledBack { mutated: false, .. }));
        assert!(reconciler.calls().is_empty());
    }

    #[tokio::test]
    async fn failed_cutover_patch_is_rolled_back() {
        let reconciler = Arc::new(
            FakeReconciler::new(BOOTSTRAP_SPEC)
                .accepting("gitops-credentials")
                .failing_point_at(),
        );
        let coord = coordinator(synced_cluster("ghp_live"), reconciler.clone());

        match coord.handoff(&target()).await {
            Err(HandoffError::RolledBack { reason, mutated }) => {
                assert!(reason.starts_with("commit"), "{reason}");
                assert!(mutated);
            }
            other => panic!("expected rollback, got {other:?}"),
        }
        assert_eq!(reconciler.spec().as_str(), BOOTSTRAP_SPEC);
        assert_eq!(coord.state(), HandoffState::RolledBack);
        assert!(!reconciler.calls().contains(&"request_reconcile".to_string()));
    }

    #[tokio::test]
    async fn failed_controller_restart_is_rolled_back() {
        let reconciler = Arc::new(
            FakeReconciler::new(BOOTSTRAP_SPEC)
                .accepting("gitops-credentials")
                .failing_refresh(1),
        );
        let coord = coordinator(synced_cluster("ghp_live"), reconciler.clone());

        match coord.handoff(&target()).await {
            Err(HandoffError::RolledBack { reason, mutated }) => {
                assert!(reason.starts_with("refresh"), "{reason}");
                assert!(mutated);
            }
            other => panic!("expected rollback, got {other:?}"),
        }
        assert_eq!(reconciler.spec().as_str(), BOOTSTRAP_SPEC);
        let calls = reconciler.calls();
        assert_eq!(calls.iter().filter(|c| *c == "refresh_credentials").count(), 2);
        assert!(calls.contains(&"restore_source_spec".to_string()));
    }

    #[tokio::test]
    async fn interrupt_during_preflight_changes_nothing() {
        let reconciler = Arc::new(FakeReconciler::new(BOOTSTRAP_SPEC).accepting("gitops-credentials"));
        let interrupt = Interrupt::new();
        let coord = AuthHandoffCoordinator::new(
            Arc::new(FakeCluster::new()),
            reconciler.clone(),
            None,
            HandoffSettings {
                sync_timeout: Duration::from_secs(300),
                ..settings()
            },
        )
        .with_interrupt(interrupt.clone());
        interrupt.trigger();

        let err = coord.handoff(&target()).await.unwrap_err();
        assert!(matches!(err, HandoffError::Interrupted));
        assert_eq!(coord.state(), HandoffState::Idle);
        assert!(reconciler.calls().is_empty());
    }
}
