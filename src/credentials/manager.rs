use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::entropy::{EntropySource, OsEntropy};
use super::set::{CredentialSet, CredentialSpec, CredentialSummary, FieldSpec};
use super::sink::EnvSink;
use crate::error::CredentialError;
use crate::interrupt::Interrupt;
use crate::retry::RetryPolicy;
use crate::vault::{SecretStore, VaultError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialSettings {
    /// Prefix of conventional export names (`{prefix}{scope}_{field}`).
    #[serde(default = "default_env_prefix")]
    pub env_prefix: String,
    /// Lower bound on generated password/token entropy.
    #[serde(default = "default_min_entropy_bits")]
    pub min_entropy_bits: u32,
}

fn default_env_prefix() -> String {
    "TF_VAR_".to_string()
}

fn default_min_entropy_bits() -> u32 {
    128
}

impl Default for CredentialSettings {
    fn default() -> Self {
        Self {
            env_prefix: default_env_prefix(),
            min_entropy_bits: default_min_entropy_bits(),
        }
    }
}

/// Whether `generate` may adopt material already in the secret store.
#[derive(Clone, Copy)]
pub enum Reuse<'a> {
    /// Always generate fresh values.
    Never,
    /// Adopt stored values when every persisted field is present, else generate.
    IfExists(&'a dyn SecretStore),
    /// Adopt stored values; missing material is an error.
    Required(&'a dyn SecretStore),
}

/// Generates, exports, persists and erases scoped credential sets.
///
/// Open sets live only inside the manager; callers get value-free
/// [`CredentialSummary`]s, so `wipe` leaves nothing reachable.
#[derive(Clone)]
pub struct CredentialLifecycleManager {
    open: Arc<Mutex<BTreeMap<String, CredentialSet>>>,
    exported: Arc<Mutex<BTreeMap<String, String>>>,
    sink: Arc<dyn EnvSink>,
    entropy: Arc<dyn EntropySource>,
    settings: CredentialSettings,
    retry: RetryPolicy,
    interrupt: Option<Interrupt>,
}

impl CredentialLifecycleManager {
    pub fn new(sink: Arc<dyn EnvSink>, settings: CredentialSettings, retry: RetryPolicy) -> Self {
        Self {
            open: Arc::default(),
            exported: Arc::default(),
            sink,
            entropy: Arc::new(OsEntropy),
            settings,
            retry,
            interrupt: None,
        }
    }

    pub fn with_entropy(mut self, entropy: Arc<dyn EntropySource>) -> Self {
        self.entropy = entropy;
        self
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    /// Open `scope` with values for every field of `spec`.
    pub async fn generate(
        &self,
        scope: &str,
        spec: &CredentialSpec,
        reuse: Reuse<'_>,
    ) -> Result<CredentialSummary, CredentialError> {
        spec.validate(scope, self.settings.min_entropy_bits)?;
        if self.lock_open().contains_key(scope) {
            return Err(CredentialError::AlreadyOpen(scope.to_string()));
        }

        let existing = match reuse {
            Reuse::Never => None,
            Reuse::IfExists(store) | Reuse::Required(store) => {
                self.read_existing(scope, spec, store).await?
            }
        };
        if existing.is_none() {
            if let (Reuse::Required(_), Some(path)) = (reuse, &spec.store_path) {
                return Err(CredentialError::MissingExisting {
                    scope: scope.to_string(),
                    path: path.clone(),
                });
            }
        }

        let reused = existing.is_some();
        let mut stored = existing.unwrap_or_default();
        let mut set = CredentialSet::empty(scope, spec, reused);
        for field in &spec.fields {
            match stored.remove(&field.name) {
                Some(value) if field.persist => {
                    set.insert(field, value, &self.settings.env_prefix)
                }
                _ => set.generate_field(field, self.entropy.as_ref(), &self.settings.env_prefix)?,
            }
        }

        let summary = set.summary();
        info!(scope, fields = ?summary.fields, reused, "credential scope opened");
        self.lock_open().insert(scope.to_string(), set);
        Ok(summary)
    }

    /// Open `scope` with operator-supplied values so they get the same wipe guarantee.
    pub fn adopt(
        &self,
        scope: &str,
        spec: &CredentialSpec,
        values: BTreeMap<String, SecretString>,
    ) -> Result<CredentialSummary, CredentialError> {
        let mut open = self.lock_open();
        if open.contains_key(scope) {
            return Err(CredentialError::AlreadyOpen(scope.to_string()));
        }
        let mut values = values;
        let mut set = CredentialSet::empty(scope, spec, true);
        for field in &spec.fields {
            let value = values.remove(&field.name).ok_or_else(|| CredentialError::InvalidSpec {
                scope: scope.to_string(),
                reason: format!("no value supplied for field `{}`", field.name),
            })?;
            if value.expose_secret().is_empty() {
                return Err(CredentialError::InvalidSpec {
                    scope: scope.to_string(),
                    reason: format!("empty value supplied for field `{}`", field.name),
                });
            }
            set.insert(field, value, &self.settings.env_prefix);
        }
        let summary = set.summary();
        info!(scope, fields = ?summary.fields, "credential scope adopted");
        open.insert(scope.to_string(), set);
        Ok(summary)
    }

    /// Place every field of `scope` into the sink. Returns the names used.
    pub fn export(&self, scope: &str) -> Result<Vec<String>, CredentialError> {
        let mut open = self.lock_open();
        let set = open
            .get_mut(scope)
            .ok_or_else(|| CredentialError::UnknownScope(scope.to_string()))?;
        let mut exported = self.lock_exported();

        // Check every name before writing any, so a collision leaves the sink untouched.
        // A name held by another open scope is a collision even at an equal value.
        for field in set.fields.values() {
            let collides = match exported.get(&field.env_name) {
                Some(owner) => owner != scope,
                None => self
                    .sink
                    .get(&field.env_name)
                    .is_some_and(|current| current != field.value.expose_secret()),
            };
            if collides {
                return Err(CredentialError::ExportCollision {
                    name: field.env_name.clone(),
                });
            }
        }

        let mut names = Vec::with_capacity(set.fields.len());
        for field in set.fields.values() {
            self.sink.set(&field.env_name, field.value.expose_secret());
            exported.insert(field.env_name.clone(), scope.to_string());
            names.push(field.env_name.clone());
        }
        set.destinations.process_env = true;
        debug!(scope, names = ?names, "credential scope exported");
        Ok(names)
    }

    /// Write the persisted fields of `scope` to its store path. Failure is fatal:
    /// after exit these are the only copies.
    pub async fn persist(&self, scope: &str, store: &dyn SecretStore) -> Result<(), CredentialError> {
        let (path, fields) = {
            let open = self.lock_open();
            let set = open
                .get(scope)
                .ok_or_else(|| CredentialError::UnknownScope(scope.to_string()))?;
            let path = set
                .destinations
                .external_store
                .clone()
                .ok_or_else(|| CredentialError::NoStorePath(scope.to_string()))?;
            let fields: BTreeMap<String, SecretString> = set
                .fields
                .iter()
                .filter(|(_, f)| f.persist)
                .map(|(name, f)| (name.clone(), duplicate(&f.value)))
                .collect();
            (path, fields)
        };
        if fields.is_empty() {
            return Err(CredentialError::InvalidSpec {
                scope: scope.to_string(),
                reason: "no fields are marked for persistence".into(),
            });
        }

        let path_ref = path.as_str();
        let fields_ref = &fields;
        self.operation(format!("persist credentials `{scope}`"))
            .execute(
                move |_| store.write(path_ref, fields_ref),
                VaultError::classification,
            )
            .await
            .map_err(|source| CredentialError::PersistFailed {
                scope: scope.to_string(),
                path: path.clone(),
                source,
            })?;

        info!(scope, path = %path, fields = fields.len(), "credential scope persisted");
        Ok(())
    }

    /// Overwrite and unset every exported field of `scope`, then drop its values.
    /// Returns whether the scope was open.
    pub fn wipe(&self, scope: &str) -> bool {
        let removed = self.lock_open().remove(scope);
        let Some(set) = removed else {
            return false;
        };
        let mut exported = self.lock_exported();
        for field in set.fields.values() {
            let owned = exported.get(&field.env_name).is_some_and(|owner| owner == scope);
            if owned {
                exported.remove(&field.env_name);
                self.sink.set(&field.env_name, "");
                self.sink.unset(&field.env_name);
            }
        }
        drop(set);
        info!(scope, "credential scope wiped");
        true
    }

    /// Wipe every open scope. Returns how many were open.
    pub fn wipe_all(&self) -> usize {
        let scopes = self.open_scopes();
        scopes.iter().filter(|scope| self.wipe(scope)).count()
    }

    pub fn open_scopes(&self) -> Vec<String> {
        self.lock_open().keys().cloned().collect()
    }

    /// Whether credential material already exists at `path` downstream.
    pub async fn already_generated(
        &self,
        path: &str,
        store: &dyn SecretStore,
    ) -> Result<bool, CredentialError> {
        let existing = self
            .operation(format!("check existing credentials at `{path}`"))
            .execute(move |_| store.read(path), VaultError::classification)
            .await
            .map_err(|source| CredentialError::ReuseReadFailed {
                scope: String::new(),
                path: path.to_string(),
                source,
            })?;
        Ok(existing.is_some_and(|fields| !fields.is_empty()))
    }

    #[cfg(test)]
    pub(crate) fn with_field<R>(&self, scope: &str, field: &str, f: impl FnOnce(&str) -> R) -> Option<R> {
        let open = self.lock_open();
        let value = open.get(scope)?.fields.get(field)?;
        Some(f(value.value.expose_secret()))
    }

    async fn read_existing(
        &self,
        scope: &str,
        spec: &CredentialSpec,
        store: &dyn SecretStore,
    ) -> Result<Option<BTreeMap<String, SecretString>>, CredentialError> {
        let Some(path) = spec.store_path.as_deref() else {
            return Ok(None);
        };
        let stored = self
            .operation(format!("read credentials `{scope}`"))
            .execute(move |_| store.read(path), VaultError::classification)
            .await
            .map_err(|source| CredentialError::ReuseReadFailed {
                scope: scope.to_string(),
                path: path.to_string(),
                source,
            })?;
        let Some(stored) = stored else {
            return Ok(None);
        };

        let persisted: Vec<&FieldSpec> = spec.fields.iter().filter(|f| f.persist).collect();
        let complete = persisted.iter().all(|f| {
            stored
                .get(&f.name)
                .is_some_and(|v| !v.expose_secret().is_empty())
        });
        if !complete {
            warn!(scope, path, "stored credential material is incomplete, generating fresh values");
            return Ok(None);
        }
        Ok(Some(stored))
    }

    fn operation(&self, id: String) -> crate::retry::RetryableOperation {
        let op = self.retry.operation(id);
        match &self.interrupt {
            Some(flag) => op.with_interrupt(flag.clone()),
            None => op,
        }
    }

    fn lock_open(&self) -> MutexGuard<'_, BTreeMap<String, CredentialSet>> {
        self.open.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_exported(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.exported.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn duplicate(secret: &SecretString) -> SecretString {
    SecretString::from(secret.expose_secret().to_string())
}
