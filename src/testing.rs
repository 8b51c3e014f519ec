//! In-memory fakes of every external collaborator, recording calls for assertions.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};

use crate::credentials::{CredentialLifecycleManager, CredentialSettings, MapSink};
use crate::git::RepoAccessProbe;
use crate::guard::ResourceGuard;
use crate::interrupt::Interrupt;
use crate::phase::PhaseContext;
use crate::platform::{
    Background, BackendConfig, ClusterApi, CommandError, CommandOutput, CommandRunner, IacEngine,
    InitMode, NodeReadiness, PlanSummary, Platform, ProbeError, Reachability, ReconcileStatus,
    Reconciler, SourceSpec,
};
use crate::retry::{BackoffPolicy, RetryPolicy};
use crate::vault::{SecretStore, VaultError};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap()
}

static PROCESS_ENV: Mutex<()> = Mutex::new(());

/// Serializes tests that write the process environment with the tests whose
/// C libraries read it through `getenv` (libgit2).
pub fn process_env_lock() -> std::sync::MutexGuard<'static, ()> {
    PROCESS_ENV.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn failed(program: &str, args: Vec<String>, status: i32, stderr: &str) -> CommandError {
    CommandError::Failed {
        program: program.to_string(),
        args,
        status,
        stderr: stderr.to_string(),
    }
}

struct FakeBackground {
    stopped: Arc<AtomicUsize>,
}

impl Background for FakeBackground {
    fn id(&self) -> Option<u32> {
        None
    }

    fn stop(self: Box<Self>) -> anyhow::Result<()> {
        self.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

type Scripted = Result<String, (i32, String)>;

/// [`CommandRunner`] answering by substring match on the full command line.
/// Unmatched commands succeed with empty output.
#[derive(Default)]
pub struct ScriptedRunner {
    script: Mutex<Vec<(String, VecDeque<Scripted>)>>,
    calls: Mutex<Vec<String>>,
    stopped: Arc<AtomicUsize>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, pattern: &str, reply: Scripted) {
        let mut script = lock(&self.script);
        match script.iter_mut().find(|(p, _)| p == pattern) {
            Some((_, replies)) => replies.push_back(reply),
            None => script.push((pattern.to_string(), VecDeque::from([reply]))),
        }
    }

    /// Queue `stdout` for commands containing `pattern`. The last reply repeats.
    pub fn respond(&self, pattern: &str, stdout: &str) {
        self.push(pattern, Ok(stdout.to_string()));
    }

    pub fn fail(&self, pattern: &str, status: i32, stderr: &str) {
        self.push(pattern, Err((status, stderr.to_string())));
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }

    fn reply(&self, line: &str) -> Scripted {
        let mut script = lock(&self.script);
        let Some((_, replies)) = script.iter_mut().find(|(p, _)| line.contains(p.as_str())) else {
            return Ok(String::new());
        };
        if replies.len() > 1 {
            replies.pop_front().unwrap_or(Ok(String::new()))
        } else {
            replies.front().cloned().unwrap_or(Ok(String::new()))
        }
    }

    fn record(&self, program: &str, args: &[String]) -> String {
        let line = format!("{program} {}", args.join(" "));
        lock(&self.calls).push(line.clone());
        line
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, CommandError> {
        let line = self.record(program, args);
        match self.reply(&line) {
            Ok(stdout) => Ok(CommandOutput {
                stdout,
                stderr: String::new(),
            }),
            Err((status, stderr)) => Err(failed(program, args.to_vec(), status, &stderr)),
        }
    }

    fn spawn(&self, program: &str, args: &[String]) -> Result<Box<dyn Background>, CommandError> {
        self.record(program, args);
        Ok(Box::new(FakeBackground {
            stopped: self.stopped.clone(),
        }))
    }
}

/// [`SecretStore`] backed by a map.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
    fail_writes: AtomicBool,
    sealed: AtomicBool,
    write_attempts: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, path: &str, fields: &[(&str, &str)]) {
        lock(&self.data).insert(
            path.to_string(),
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
    }

    pub fn get(&self, path: &str) -> Option<BTreeMap<String, String>> {
        lock(&self.data).get(path).cloned()
    }

    /// Make every write fail with a transient error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_sealed(&self, sealed: bool) {
        self.sealed.store(sealed, Ordering::SeqCst);
    }

    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecretStore for MemoryStore {
    async fn write(
        &self,
        path: &str,
        fields: &BTreeMap<String, SecretString>,
    ) -> Result<(), VaultError> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(VaultError::Sealed);
        }
        lock(&self.data).insert(
            path.to_string(),
            fields
                .iter()
                .map(|(k, v)| (k.clone(), v.expose_secret().to_string()))
                .collect(),
        );
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Option<BTreeMap<String, SecretString>>, VaultError> {
        Ok(lock(&self.data).get(path).map(|fields| {
            fields
                .iter()
                .map(|(k, v)| (k.clone(), SecretString::from(v.clone())))
                .collect()
        }))
    }

    async fn health(&self) -> Result<(), VaultError> {
        if self.sealed.load(Ordering::SeqCst) {
            return Err(VaultError::Sealed);
        }
        Ok(())
    }
}

/// [`ClusterApi`] over in-memory resources and secrets.
pub struct FakeCluster {
    nodes: Mutex<NodeReadiness>,
    resources: Mutex<BTreeSet<String>>,
    secrets: Mutex<BTreeMap<String, String>>,
    deleted: Mutex<Vec<String>>,
    tunnels: AtomicUsize,
    stopped: Arc<AtomicUsize>,
}

fn resource_key(kind: &str, namespace: Option<&str>, name: &str) -> String {
    format!("{kind}/{}/{name}", namespace.unwrap_or("-"))
}

impl FakeCluster {
    pub fn new() -> Self {
        Self {
            nodes: Mutex::new(NodeReadiness { ready: 3, total: 3 }),
            resources: Mutex::default(),
            secrets: Mutex::default(),
            deleted: Mutex::default(),
            tunnels: AtomicUsize::new(0),
            stopped: Arc::default(),
        }
    }

    pub fn set_nodes(&self, ready: usize, total: usize) {
        *lock(&self.nodes) = NodeReadiness { ready, total };
    }

    pub fn add_resource(&self, kind: &str, namespace: Option<&str>, name: &str) {
        lock(&self.resources).insert(resource_key(kind, namespace, name));
    }

    pub fn put_secret(&self, namespace: &str, name: &str, key: &str, value: &str) {
        lock(&self.secrets).insert(format!("{namespace}/{name}/{key}"), value.to_string());
    }

    pub fn has_secret(&self, namespace: &str, name: &str) -> bool {
        let prefix = format!("{namespace}/{name}/");
        lock(&self.secrets).keys().any(|k| k.starts_with(&prefix))
    }

    pub fn deleted(&self) -> Vec<String> {
        lock(&self.deleted).clone()
    }

    pub fn tunnels_opened(&self) -> usize {
        self.tunnels.load(Ordering::SeqCst)
    }

    pub fn tunnels_stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn nodes_ready(&self) -> Result<NodeReadiness, CommandError> {
        Ok(*lock(&self.nodes))
    }

    async fn resource_exists(
        &self,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<bool, CommandError> {
        Ok(lock(&self.resources).contains(&resource_key(kind, namespace, name)))
    }

    async fn secret_value(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Option<SecretString>, CommandError> {
        Ok(lock(&self.secrets)
            .get(&format!("{namespace}/{name}/{key}"))
            .map(|v| SecretString::from(v.clone())))
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<bool, CommandError> {
        let prefix = format!("{namespace}/{name}/");
        let mut secrets = lock(&self.secrets);
        let before = secrets.len();
        secrets.retain(|k, _| !k.starts_with(&prefix));
        let removed = secrets.len() != before;
        if removed {
            lock(&self.deleted).push(format!("{namespace}/{name}"));
        }
        Ok(removed)
    }

    fn port_forward(
        &self,
        _namespace: &str,
        _service: &str,
        _local_port: u16,
        _remote_port: u16,
    ) -> Result<Box<dyn Background>, CommandError> {
        self.tunnels.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeBackground {
            stopped: self.stopped.clone(),
        }))
    }
}

/// [`IacEngine`] tracking which backend is configured and what it holds.
#[derive(Default)]
pub struct FakeIac {
    calls: Mutex<Vec<String>>,
    backend: Mutex<Option<String>>,
    local: Mutex<Vec<String>>,
    remote: Mutex<Vec<String>>,
    dropped: Mutex<Vec<String>>,
    migrate_failure: Mutex<Option<String>>,
    apply_failures: Mutex<VecDeque<String>>,
    applied_targets: Mutex<Vec<Vec<String>>>,
    drift: AtomicBool,
}

impl FakeIac {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn applies(&self) -> usize {
        lock(&self.calls).iter().filter(|c| *c == "apply").count()
    }

    /// Make `plan` report pending changes.
    pub fn set_drift(&self, drift: bool) {
        self.drift.store(drift, Ordering::SeqCst);
    }

    /// Targets passed to each apply, in call order.
    pub fn applied_targets(&self) -> Vec<Vec<String>> {
        lock(&self.applied_targets).clone()
    }

    pub fn set_local_resources(&self, addresses: &[&str]) {
        *lock(&self.local) = addresses.iter().map(|a| a.to_string()).collect();
    }

    pub fn remote_resources(&self) -> Vec<String> {
        lock(&self.remote).clone()
    }

    /// Lose `address` during the state copy.
    pub fn drop_on_migrate(&self, address: &str) {
        lock(&self.dropped).push(address.to_string());
    }

    pub fn fail_migrate(&self, stderr: &str) {
        *lock(&self.migrate_failure) = Some(stderr.to_string());
    }

    /// Fail the next apply with `stderr`. Calls queue up.
    pub fn fail_apply_once(&self, stderr: &str) {
        lock(&self.apply_failures).push_back(stderr.to_string());
    }
}

#[async_trait]
impl IacEngine for FakeIac {
    async fn init(&self, backend: &BackendConfig, mode: InitMode) -> Result<(), CommandError> {
        lock(&self.calls).push(format!("init {} {mode:?}", backend.kind));
        if mode == InitMode::MigrateState {
            if let Some(stderr) = lock(&self.migrate_failure).clone() {
                return Err(failed("terraform", vec!["init".into()], 1, &stderr));
            }
            let dropped = lock(&self.dropped).clone();
            let copied = lock(&self.local)
                .iter()
                .filter(|a| !dropped.contains(a))
                .cloned()
                .collect();
            *lock(&self.remote) = copied;
        }
        *lock(&self.backend) = Some(backend.kind.clone());
        Ok(())
    }

    async fn plan(&self) -> Result<PlanSummary, CommandError> {
        lock(&self.calls).push("plan".to_string());
        Ok(PlanSummary {
            has_changes: self.drift.load(Ordering::SeqCst),
        })
    }

    async fn apply(&self, targets: &[String]) -> Result<(), CommandError> {
        lock(&self.calls).push("apply".to_string());
        lock(&self.applied_targets).push(targets.to_vec());
        match lock(&self.apply_failures).pop_front() {
            Some(stderr) => Err(failed("terraform", vec!["apply".into()], 1, &stderr)),
            None => Ok(()),
        }
    }

    async fn state_list(&self) -> Result<Vec<String>, CommandError> {
        lock(&self.calls).push("state list".to_string());
        let backend = lock(&self.backend).clone();
        Ok(match backend.as_deref() {
            Some("local") => lock(&self.local).clone(),
            _ => lock(&self.remote).clone(),
        })
    }
}

pub struct FakeReachability {
    reachable: AtomicBool,
    checks: AtomicUsize,
}

impl FakeReachability {
    pub fn new(reachable: bool) -> Self {
        Self {
            reachable: AtomicBool::new(reachable),
            checks: AtomicUsize::new(0),
        }
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl Reachability for FakeReachability {
    async fn check(&self, url: &str) -> Result<u16, ProbeError> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        if self.reachable.load(Ordering::SeqCst) {
            Ok(200)
        } else {
            Err(ProbeError::Unreachable {
                url: url.to_string(),
                reason: "connection refused".to_string(),
            })
        }
    }
}

/// [`Reconciler`] whose source only becomes Ready when it references the
/// accepted secret.
pub struct FakeReconciler {
    spec: Mutex<Value>,
    accepted: Option<String>,
    fail_restore: bool,
    fail_point_at: bool,
    refresh_failures: Mutex<u32>,
    requested: Mutex<Option<String>>,
    calls: Mutex<Vec<String>>,
}

impl FakeReconciler {
    pub fn new(spec: &str) -> Self {
        Self {
            spec: Mutex::new(serde_json::from_str(spec).unwrap()),
            accepted: None,
            fail_restore: false,
            fail_point_at: false,
            refresh_failures: Mutex::new(0),
            requested: Mutex::default(),
            calls: Mutex::default(),
        }
    }

    pub fn accepting(mut self, secret: &str) -> Self {
        self.accepted = Some(secret.to_string());
        self
    }

    pub fn failing_restore(mut self) -> Self {
        self.fail_restore = true;
        self
    }

    /// The patch lands but kubectl reports a failure, like a timeout after the write.
    pub fn failing_point_at(mut self) -> Self {
        self.fail_point_at = true;
        self
    }

    /// The next `times` controller restarts fail.
    pub fn failing_refresh(self, times: u32) -> Self {
        *lock(&self.refresh_failures) = times;
        self
    }

    pub fn spec(&self) -> SourceSpec {
        SourceSpec::from_value(&lock(&self.spec))
    }

    pub fn secret_ref(&self) -> Option<String> {
        self.spec().secret_ref()
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    fn record(&self, call: &str) {
        lock(&self.calls).push(call.to_string());
    }
}

#[async_trait]
impl Reconciler for FakeReconciler {
    async fn source_exists(&self) -> Result<bool, CommandError> {
        self.record("source_exists");
        Ok(true)
    }

    async fn read_source_spec(&self) -> Result<SourceSpec, CommandError> {
        self.record("read_source_spec");
        Ok(self.spec())
    }

    async fn point_at(&self, secret_name: &str) -> Result<(), CommandError> {
        self.record("point_at");
        lock(&self.spec)["secretRef"] = json!({ "name": secret_name });
        if self.fail_point_at {
            return Err(failed("kubectl", vec!["patch".into()], 1, "Unable to connect to the server: net/http: request canceled"));
        }
        Ok(())
    }

    async fn restore_source_spec(&self, snapshot: &SourceSpec) -> Result<(), CommandError> {
        self.record("restore_source_spec");
        if self.fail_restore {
            return Err(failed("kubectl", vec!["patch".into()], 1, "admission webhook denied the request"));
        }
        *lock(&self.spec) = snapshot.to_value().unwrap();
        Ok(())
    }

    async fn refresh_credentials(&self, _timeout: Duration) -> Result<(), CommandError> {
        self.record("refresh_credentials");
        let mut remaining = lock(&self.refresh_failures);
        if *remaining > 0 {
            *remaining -= 1;
            return Err(failed(
                "kubectl",
                vec!["rollout".into(), "status".into()],
                1,
                "error: timed out waiting for the condition",
            ));
        }
        Ok(())
    }

    async fn request_reconcile(&self, token: &str) -> Result<(), CommandError> {
        self.record("request_reconcile");
        *lock(&self.requested) = Some(token.to_string());
        Ok(())
    }

    async fn reconcile_status(&self) -> Result<ReconcileStatus, CommandError> {
        self.record("reconcile_status");
        let ready = self.accepted.is_some() && self.secret_ref() == self.accepted;
        Ok(ReconcileStatus {
            ready,
            last_handled: lock(&self.requested).clone(),
            message: (!ready).then(|| "authentication required".to_string()),
        })
    }
}

pub struct FakeRepoProbe {
    refs: Option<usize>,
}

impl FakeRepoProbe {
    pub fn allowing(refs: usize) -> Self {
        Self { refs: Some(refs) }
    }

    pub fn denying() -> Self {
        Self { refs: None }
    }
}

impl RepoAccessProbe for FakeRepoProbe {
    fn list_refs(&self, _token: &SecretString) -> Result<usize, git2::Error> {
        self.refs
            .ok_or_else(|| git2::Error::from_str("remote authentication required but no callback set"))
    }
}

/// Source spec the fake reconciler starts from: still on the bootstrap credential.
pub const BOOTSTRAP_SOURCE_SPEC: &str =
    r#"{"interval":"1m0s","ref":{"branch":"main"},"secretRef":{"name":"gitops-bootstrap"},"url":"http://gitea-http.gitea:3000/platform/infra.git"}"#;

/// One set of fakes wired into a [`PhaseContext`]. Clones of the context share them.
pub struct Fakes {
    pub cluster: Arc<FakeCluster>,
    pub iac: Arc<FakeIac>,
    pub store: Arc<MemoryStore>,
    pub reconciler: Arc<FakeReconciler>,
    pub reachability: Arc<FakeReachability>,
    pub repo_probe: Option<Arc<FakeRepoProbe>>,
    pub sink: Arc<MapSink>,
    pub credentials: CredentialLifecycleManager,
    pub guard: ResourceGuard,
    pub interrupt: Interrupt,
    pub retry: RetryPolicy,
}

impl Fakes {
    pub fn new() -> Self {
        Self::with_reconciler(FakeReconciler::new(BOOTSTRAP_SOURCE_SPEC).accepting("gitops-credentials"))
    }

    pub fn with_reconciler(reconciler: FakeReconciler) -> Self {
        let retry = RetryPolicy {
            max_attempts: 2,
            backoff: BackoffPolicy::Linear { step_ms: 1 },
        };
        let interrupt = Interrupt::new();
        let sink = Arc::new(MapSink::new());
        let credentials = CredentialLifecycleManager::new(sink.clone(), CredentialSettings::default(), retry)
            .with_interrupt(interrupt.clone());
        Self {
            cluster: Arc::new(FakeCluster::new()),
            iac: Arc::new(FakeIac::new()),
            store: Arc::new(MemoryStore::new()),
            reconciler: Arc::new(reconciler),
            reachability: Arc::new(FakeReachability::new(true)),
            repo_probe: None,
            sink,
            credentials,
            guard: ResourceGuard::new(),
            interrupt,
            retry,
        }
    }

    pub fn context(&self) -> PhaseContext {
        PhaseContext {
            platform: Platform {
                cluster: self.cluster.clone(),
                iac: self.iac.clone(),
                store: self.store.clone(),
                reconciler: self.reconciler.clone(),
                reachability: self.reachability.clone(),
                repo_probe: self
                    .repo_probe
                    .clone()
                    .map(|p| p as Arc<dyn RepoAccessProbe>),
            },
            credentials: self.credentials.clone(),
            guard: self.guard.clone(),
            interrupt: self.interrupt.clone(),
            retry: self.retry,
        }
    }
}
