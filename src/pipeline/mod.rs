//! The fixed bootstrap pipeline: cluster, secret manager, object storage,
//! state migration, GitOps, credential handoff, finalization.

mod actions;
mod checks;
mod tunnel;

use std::sync::Arc;

pub use tunnel::Tunnels;

use actions::{
    AdoptFromEnv, ApplyInfra, ExportCredentials, FinalHealth, Handoff, MigrateState, OpenCredentials,
    OpenTunnel, PersistCredentials, RevokeBootstrapCredential, StoreLongLivedToken, StoredMaterial,
    VerifyReachable, WaitNodes, WaitReconcilerSource, WaitSecretManager,
};
use checks::{
    ClusterReachable, LocalStateMigrated, NamespaceExists, ObjectStoreReachable, ReconcilerSourceExists,
    ReconcilerUses, SecretManagerHealthy,
};

use crate::config::BootstrapConfig;
use crate::credentials::{CredentialSpec, EnvSink, FieldSpec};
use crate::phase::{Phase, Subphase};

const STORAGE_SCOPE: &str = "object_storage";
const BACKEND_SCOPE: &str = "state_backend";
const BOOTSTRAP_TOKEN_SCOPE: &str = "gitops_bootstrap";
const LONG_LIVED_TOKEN_SCOPE: &str = "gitops";

/// Root credentials of the object store, persisted under their store path.
fn storage_spec(config: &BootstrapConfig) -> CredentialSpec {
    CredentialSpec::new()
        .field(FieldSpec::access_key("access_key", 20).persisted())
        .field(FieldSpec::password("secret_key", 40).persisted())
        .store_at(config.object_storage.credentials_path.clone())
}

/// The same stored material, exported under the names the state backend reads.
fn backend_spec(config: &BootstrapConfig) -> CredentialSpec {
    CredentialSpec::new()
        .field(
            FieldSpec::access_key("access_key", 20)
                .persisted()
                .exported_as(config.object_storage.access_key_env.clone()),
        )
        .field(
            FieldSpec::password("secret_key", 40)
                .persisted()
                .exported_as(config.object_storage.secret_key_env.clone()),
        )
        .store_at(config.object_storage.credentials_path.clone())
}

fn load_backend_credentials(config: &BootstrapConfig) -> Subphase {
    Subphase::new(
        "load-backend-credentials",
        "Load state backend credentials from the secret manager",
        OpenCredentials {
            scope: BACKEND_SCOPE.to_string(),
            spec: backend_spec(config),
            stored: StoredMaterial::Require,
        },
    )
}

fn export_backend_credentials() -> Subphase {
    Subphase::new(
        "export-backend-credentials",
        "Export state backend credentials",
        ExportCredentials {
            scope: BACKEND_SCOPE.to_string(),
        },
    )
}

/// Build the ordered phase catalog.
///
/// `operator_env` is where operator-supplied tokens are read from; exported
/// credentials go to the sink of the run's credential manager instead.
pub fn bootstrap_phases(config: &BootstrapConfig, operator_env: Arc<dyn EnvSink>) -> Vec<Phase> {
    let tunnels = Tunnels::new();
    let cluster = &config.cluster;
    let precondition_poll = cluster.poll(cluster.precondition_timeout_secs);
    let secret_manager_healthy = || SecretManagerHealthy {
        tunnel: config.secret_manager.tunnel.clone(),
        tunnels: tunnels.clone(),
        poll: precondition_poll,
    };
    let secret_manager_tunnel = || OpenTunnel {
        tunnel: config.secret_manager.tunnel.clone(),
        tunnels: tunnels.clone(),
    };
    let storage_tunnel = || OpenTunnel {
        tunnel: config.object_storage.tunnel.clone(),
        tunnels: tunnels.clone(),
    };
    let targets = &config.iac.targets;
    let gitops = &config.gitops;

    vec![
        Phase::new(1, "cluster", "Base cluster services")
            .requires(ClusterReachable)
            .subphase(
                Subphase::new(
                    "wait-nodes",
                    "Wait for every node to be Ready",
                    WaitNodes {
                        poll: cluster.poll(cluster.node_timeout_secs),
                    },
                )
                .validation(),
            )
            .subphase(Subphase::new(
                "apply-base",
                "Apply base cluster infrastructure",
                ApplyInfra {
                    label: "base".into(),
                    targets: targets.base.clone(),
                },
            )),
        Phase::new(2, "secret-manager", "Secret management service")
            .requires(NamespaceExists::new(&config.secret_manager.namespace))
            .subphase(Subphase::new(
                "apply-secret-manager",
                "Apply the secret manager",
                ApplyInfra {
                    label: "secret-manager".into(),
                    targets: targets.secret_manager.clone(),
                },
            ))
            .subphase(Subphase::new(
                "open-tunnel",
                "Open the secret manager tunnel",
                secret_manager_tunnel(),
            ))
            .subphase(
                Subphase::new(
                    "wait-secret-manager",
                    "Wait for the secret manager to be unsealed",
                    WaitSecretManager {
                        poll: cluster.poll(config.secret_manager.wait_timeout_secs),
                    },
                )
                .validation(),
            ),
        Phase::new(3, "object-storage", "Object storage for remote state")
            .requires(secret_manager_healthy())
            .subphase(Subphase::new(
                "open-tunnel",
                "Open the object storage tunnel",
                storage_tunnel(),
            ))
            .subphase(Subphase::new(
                "generate-storage-credentials",
                "Generate object storage credentials, reusing stored ones",
                OpenCredentials {
                    scope: STORAGE_SCOPE.to_string(),
                    spec: storage_spec(config),
                    stored: StoredMaterial::Reuse,
                },
            ))
            .subphase(Subphase::new(
                "persist-storage-credentials",
                "Persist object storage credentials to the secret manager",
                PersistCredentials {
                    scope: STORAGE_SCOPE.to_string(),
                },
            ))
            .subphase(Subphase::new(
                "export-storage-credentials",
                "Export object storage credentials",
                ExportCredentials {
                    scope: STORAGE_SCOPE.to_string(),
                },
            ))
            .subphase(Subphase::new(
                "apply-object-storage",
                "Apply object storage",
                ApplyInfra {
                    label: "object-storage".into(),
                    targets: targets.object_storage.clone(),
                },
            ))
            .subphase(
                Subphase::new(
                    "verify-object-storage",
                    "Verify the object store answers",
                    VerifyReachable {
                        what: "object storage".into(),
                        url: config.remote_state.probe_url(),
                        poll: cluster.poll(config.object_storage.wait_timeout_secs),
                    },
                )
                .validation(),
            ),
        Phase::new(4, "state-migration", "Move infrastructure state to the remote backend")
            .requires(ObjectStoreReachable {
                tunnel: config.object_storage.tunnel.clone(),
                tunnels: tunnels.clone(),
                url: config.remote_state.probe_url(),
                poll: precondition_poll,
            })
            .requires(secret_manager_healthy())
            .complete_when(LocalStateMigrated {
                local: config.iac.local_state.clone(),
            })
            .subphase(Subphase::new(
                "open-tunnel",
                "Open the object storage tunnel",
                storage_tunnel(),
            ))
            .subphase(load_backend_credentials(config))
            .subphase(export_backend_credentials())
            .subphase(Subphase::new(
                "migrate-state",
                "Copy, verify and switch to remote state",
                MigrateState {
                    local: config.iac.local_state.clone(),
                    remote: config.remote_state.clone(),
                },
            )),
        Phase::new(5, "gitops", "GitOps reconciler")
            .requires(ClusterReachable)
            .requires(secret_manager_healthy())
            .subphase(Subphase::new(
                "open-tunnel",
                "Open the secret manager tunnel",
                secret_manager_tunnel(),
            ))
            .subphase(Subphase::new(
                "load-bootstrap-token",
                "Adopt the operator's bootstrap token",
                AdoptFromEnv {
                    scope: BOOTSTRAP_TOKEN_SCOPE.to_string(),
                    field: "token".into(),
                    spec: CredentialSpec::new().field(FieldSpec::token("token")),
                    env_var: gitops.bootstrap_token_env.clone(),
                    source: operator_env.clone(),
                },
            ))
            .subphase(Subphase::new(
                "persist-gitops-token",
                "Store the long-lived GitOps token for the secret-sync agent",
                StoreLongLivedToken {
                    adopt: AdoptFromEnv {
                        scope: LONG_LIVED_TOKEN_SCOPE.to_string(),
                        field: "token".into(),
                        spec: CredentialSpec::new()
                            .field(FieldSpec::token("token").persisted())
                            .store_at(gitops.store_path.clone()),
                        env_var: gitops.token_env.clone(),
                        source: operator_env,
                    },
                },
            ))
            .subphase(Subphase::new(
                "export-gitops-credentials",
                "Export the bootstrap token",
                ExportCredentials {
                    scope: BOOTSTRAP_TOKEN_SCOPE.to_string(),
                },
            ))
            .subphase(load_backend_credentials(config))
            .subphase(export_backend_credentials())
            .subphase(Subphase::new(
                "apply-gitops",
                "Apply the GitOps reconciler",
                ApplyInfra {
                    label: "gitops".into(),
                    targets: targets.gitops.clone(),
                },
            ))
            .subphase(
                Subphase::new(
                    "wait-reconciler",
                    "Wait for the reconciler source object",
                    WaitReconcilerSource {
                        poll: precondition_poll,
                    },
                )
                .validation(),
            ),
        Phase::new(6, "auth-handoff", "Switch the reconciler to the synced credential")
            .requires(ReconcilerSourceExists)
            .not_idempotent()
            .complete_when(ReconcilerUses::new(&gitops.target_secret))
            .subphase(Subphase::new(
                "handoff",
                "Hand the reconciler over to the synced credential",
                Handoff {
                    target: gitops.target(),
                    settings: config.handoff.settings(gitops.repo_url.is_some()),
                },
            )),
        Phase::new(7, "finalize", "Revoke bootstrap access and check health")
            .requires(ReconcilerUses::new(&gitops.target_secret))
            .requires(secret_manager_healthy())
            .subphase(Subphase::new(
                "revoke-bootstrap-credential",
                "Delete the bootstrap credential",
                RevokeBootstrapCredential {
                    namespace: gitops.namespace.clone(),
                    secret: gitops.bootstrap_secret.clone(),
                },
            ))
            .subphase(load_backend_credentials(config))
            .subphase(export_backend_credentials())
            .subphase(
                Subphase::new("final-health", "Check the whole platform", FinalHealth).validation(),
            ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MapSink;
    use crate::error::{BootstrapError, EXIT_USAGE, HandoffError, OrchestrationError};
    use crate::phase::{PhaseOrchestrator, RunOutcome, StopAfter};
    use crate::testing::{FakeReconciler, FakeRepoProbe, Fakes};
    use tempfile::TempDir;

    const LOCAL_STATE: &str = r#"{"version":4,"resources":[
        {"type":"kubernetes_namespace","name":"vault"},
        {"type":"helm_release","name":"vault"}
    ]}"#;

    struct Setup {
        fakes: Fakes,
        config: BootstrapConfig,
        operator: Arc<MapSink>,
        _dir: TempDir,
    }

    fn setup() -> Setup {
        setup_with(Fakes::new())
    }

    fn setup_with(fakes: Fakes) -> Setup {
        let dir = TempDir::new().unwrap();
        let mut config = BootstrapConfig::default();
        config.cluster.poll_interval_secs = 1;
        config.cluster.precondition_timeout_secs = 0;
        config.cluster.node_timeout_secs = 0;
        config.secret_manager.wait_timeout_secs = 0;
        config.object_storage.wait_timeout_secs = 0;
        config.handoff.sync_timeout_secs = 0;
        config.iac.local_state = dir.path().join("terraform.tfstate");
        std::fs::write(&config.iac.local_state, LOCAL_STATE).unwrap();

        fakes.cluster.add_resource("namespace", None, "vault");
        fakes.cluster.put_secret("flux-system", "gitops-bootstrap", "password", "bootstrap-token");
        fakes.cluster.put_secret("flux-system", "gitops-credentials", "password", "long-lived-token");
        fakes.iac.set_local_resources(&["kubernetes_namespace.vault", "helm_release.vault"]);

        let operator = Arc::new(MapSink::new());
        operator.set("GITOPS_BOOTSTRAP_TOKEN", "bootstrap-token");
        operator.set("GITOPS_TOKEN", "long-lived-token");

        Setup {
            fakes,
            config,
            operator,
            _dir: dir,
        }
    }

    impl Setup {
        fn orchestrator(&self) -> PhaseOrchestrator {
            PhaseOrchestrator::new(
                bootstrap_phases(&self.config, self.operator.clone()),
                self.fakes.context(),
            )
            .unwrap()
        }
    }

    #[test]
    fn catalog_is_ordered_and_handoff_is_penultimate() {
        let s = setup();
        let phases = bootstrap_phases(&s.config, s.operator.clone());
        let ids: Vec<u32> = phases.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6, 7]);
        let handoff = &phases[phases.len() - 2];
        assert_eq!(handoff.name, "auth-handoff");
        assert!(!handoff.idempotent);
        assert!(handoff.completion.is_some());
        assert!(PhaseOrchestrator::new(phases, s.fakes.context()).is_ok());
    }

    #[tokio::test]
    async fn full_run_bootstraps_the_platform() {
        let s = setup();
        let orch = s.orchestrator();

        assert_eq!(orch.run(1, None).await.unwrap(), RunOutcome::Completed);

        // Object storage credentials were persisted before anything depended on them.
        let stored = s.fakes.store.get("bootstrap/object-storage").unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored["access_key"].len(), 20);
        assert_eq!(
            s.fakes.store.get("bootstrap/gitops").unwrap()["token"],
            "long-lived-token"
        );

        // State moved to the remote backend and the local copy is gone.
        assert!(!s.config.iac.local_state.exists());
        assert_eq!(s.fakes.iac.remote_resources().len(), 2);

        assert_eq!(s.fakes.reconciler.secret_ref().as_deref(), Some("gitops-credentials"));
        assert_eq!(s.fakes.cluster.deleted(), vec!["flux-system/gitops-bootstrap"]);

        // No credential outlives its phase.
        assert!(s.fakes.sink.is_empty());
        assert!(s.fakes.credentials.open_scopes().is_empty());
        assert_eq!(s.fakes.guard.pending(), 0);

        let record = orch.record().unwrap();
        assert_eq!(record.phases_executed, vec![1, 2, 3, 4, 5, 6, 7]);
        assert!(record.phases_skipped.is_empty());
    }

    #[tokio::test]
    async fn re_run_reuses_stored_credentials_and_skips_done_phases() {
        let s = setup();
        s.orchestrator().run(1, None).await.unwrap();
        let first = s.fakes.store.get("bootstrap/object-storage").unwrap();

        let again = s.orchestrator();
        again.run(1, None).await.unwrap();
        assert_eq!(s.fakes.store.get("bootstrap/object-storage").unwrap(), first);

        let record = again.record().unwrap();
        // State migration and handoff detect their effects and skip.
        assert_eq!(record.phases_skipped, vec![4, 6]);
        assert_eq!(
            s.fakes.reconciler.calls().iter().filter(|c| *c == "point_at").count(),
            1
        );
    }

    #[tokio::test]
    async fn stop_after_storage_credentials_leaves_nothing_exported() {
        let s = setup();
        let stop = StopAfter::parse("export-storage-credentials").unwrap();
        let outcome = s.orchestrator().run(1, Some(&stop)).await.unwrap();

        assert_eq!(
            outcome,
            RunOutcome::StoppedAt {
                phase: 3,
                subphase: "export-storage-credentials".into()
            }
        );
        assert!(s.fakes.store.get("bootstrap/object-storage").is_some());
        assert!(s.fakes.sink.is_empty());
        // Phase 3 apply never ran.
        assert_eq!(s.fakes.iac.applies(), 2);
    }

    #[tokio::test]
    async fn persist_failure_stops_before_apply() {
        let s = setup();
        s.fakes.store.fail_writes(true);
        let err = s.orchestrator().run(3, None).await.unwrap_err();

        match &err {
            OrchestrationError::PhaseFailed { phase, subphase, .. } => {
                assert_eq!(*phase, 3);
                assert_eq!(subphase.as_deref(), Some("persist-storage-credentials"));
            }
            other => panic!("unexpected {other}"),
        }
        assert_eq!(s.fakes.iac.applies(), 0);
        assert!(s.fakes.sink.is_empty());
    }

    #[tokio::test]
    async fn missing_namespace_blocks_secret_manager_phase() {
        // Fresh fakes: the cluster has no `vault` namespace.
        let s = Setup {
            fakes: Fakes::new(),
            ..setup()
        };
        let err = s.orchestrator().run(2, None).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::PhaseFailed {
                phase: 2,
                subphase: None,
                source: BootstrapError::Precondition { .. },
                ..
            }
        ));
        assert!(s.fakes.iac.calls().is_empty());
    }

    #[tokio::test]
    async fn migration_needs_stored_backend_credentials() {
        let s = setup();
        let err = s.orchestrator().run(4, None).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::PhaseFailed { phase: 4, ref subphase, .. }
                if subphase.as_deref() == Some("load-backend-credentials")
        ));
        assert!(s.config.iac.local_state.exists());
    }

    #[tokio::test]
    async fn gitops_phase_requires_the_operator_token() {
        let s = setup();
        s.operator.unset("GITOPS_BOOTSTRAP_TOKEN");
        let err = s.orchestrator().run(5, None).await.unwrap_err();
        assert!(err.to_string().contains("GITOPS_BOOTSTRAP_TOKEN"));
        assert_eq!(err.exit_code(), EXIT_USAGE);
    }

    #[tokio::test]
    async fn rejected_handoff_restores_the_bootstrap_source() {
        let fakes = Fakes::with_reconciler(
            FakeReconciler::new(crate::testing::BOOTSTRAP_SOURCE_SPEC).accepting("someone-else"),
        );
        let s = setup_with(fakes);
        let before = s.fakes.reconciler.spec();
        let mut config = s.config.clone();
        config.handoff.validate_timeout_secs = 0;
        config.handoff.controller_restart_budget_secs = 0;
        config.handoff.poll_interval_secs = 1;
        let s = Setup { config, ..s };

        let err = s.orchestrator().run(6, None).await.unwrap_err();
        assert!(matches!(
            err.cause(),
            BootstrapError::Handoff(HandoffError::RolledBack { mutated: true, .. })
        ));
        assert_eq!(s.fakes.reconciler.spec(), before);
    }

    #[tokio::test]
    async fn configured_repository_is_checked_before_the_handoff() {
        let mut fakes = Fakes::new();
        fakes.repo_probe = Some(Arc::new(FakeRepoProbe::denying()));
        let mut s = setup_with(fakes);
        s.config.gitops.repo_url = Some("https://git.example.com/platform/infra.git".into());
        let before = s.fakes.reconciler.spec();

        let err = s.orchestrator().run(6, None).await.unwrap_err();
        assert!(matches!(
            err.cause(),
            BootstrapError::Handoff(HandoffError::RolledBack { mutated: false, .. })
        ));
        assert_eq!(s.fakes.reconciler.spec(), before);
    }

    #[tokio::test]
    async fn finalize_reports_drift() {
        let s = setup();
        s.orchestrator()
            .run(1, Some(&StopAfter::parse("6:handoff").unwrap()))
            .await
            .unwrap();
        s.fakes.iac.set_drift(true);

        let err = s.orchestrator().run(7, None).await.unwrap_err();
        assert!(matches!(
            err.cause(),
            BootstrapError::Validation(msg) if msg.contains("drift")
        ));
        // Validation subphases can be skipped by the operator.
        s.orchestrator().with_skip_validation(true).run(7, None).await.unwrap();
    }
}
