use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use super::entropy::{
    ACCESS_KEY_ALPHABET, EntropySource, HEX_ALPHABET_BITS, PASSWORD_ALPHABET, entropy_bits,
    random_hex, random_string,
};
use crate::error::CredentialError;

/// What kind of random value a field holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SecretKind {
    /// Hex encoding of `bytes` random bytes.
    Token { bytes: usize },
    /// Mixed-case alphanumeric password.
    Password { length: usize },
    /// Upper-case alphanumeric identifier, e.g. an object-store access key.
    AccessKey { length: usize },
}

impl SecretKind {
    fn entropy_bits(&self) -> f64 {
        match *self {
            SecretKind::Token { bytes } => HEX_ALPHABET_BITS * 2.0 * bytes as f64,
            SecretKind::Password { length } => entropy_bits(PASSWORD_ALPHABET.len(), length),
            SecretKind::AccessKey { length } => entropy_bits(ACCESS_KEY_ALPHABET.len(), length),
        }
    }

    fn generate(&self, source: &dyn EntropySource) -> Result<String, CredentialError> {
        match *self {
            SecretKind::Token { bytes } => random_hex(source, bytes),
            SecretKind::Password { length } => random_string(source, PASSWORD_ALPHABET, length),
            SecretKind::AccessKey { length } => random_string(source, ACCESS_KEY_ALPHABET, length),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: SecretKind,
    /// Written to the external secret store by `persist`.
    pub persist: bool,
    /// Explicit export name, overriding the `{prefix}{scope}_{field}` convention.
    pub env_name: Option<String>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: SecretKind) -> Self {
        Self {
            name: name.into(),
            kind,
            persist: false,
            env_name: None,
        }
    }

    pub fn token(name: impl Into<String>) -> Self {
        Self::new(name, SecretKind::Token { bytes: 32 })
    }

    pub fn password(name: impl Into<String>, length: usize) -> Self {
        Self::new(name, SecretKind::Password { length })
    }

    pub fn access_key(name: impl Into<String>, length: usize) -> Self {
        Self::new(name, SecretKind::AccessKey { length })
    }

    pub fn persisted(mut self) -> Self {
        self.persist = true;
        self
    }

    pub fn exported_as(mut self, env_name: impl Into<String>) -> Self {
        self.env_name = Some(env_name.into());
        self
    }
}

/// Shape of a credential scope: which fields exist and where they go.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialSpec {
    pub fields: Vec<FieldSpec>,
    pub store_path: Option<String>,
}

impl CredentialSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    pub fn store_at(mut self, path: impl Into<String>) -> Self {
        self.store_path = Some(path.into());
        self
    }

    pub fn has_persisted_fields(&self) -> bool {
        self.fields.iter().any(|f| f.persist)
    }

    pub(crate) fn validate(&self, scope: &str, min_entropy_bits: u32) -> Result<(), CredentialError> {
        let invalid = |reason: String| CredentialError::InvalidSpec {
            scope: scope.to_string(),
            reason,
        };
        if !is_identifier(scope) {
            return Err(invalid(format!("scope name `{scope}` is not a lowercase identifier")));
        }
        if self.fields.is_empty() {
            return Err(invalid("no fields".into()));
        }
        if self.has_persisted_fields() && self.store_path.is_none() {
            return Err(CredentialError::NoStorePath(scope.to_string()));
        }
        let mut seen = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            if !is_identifier(&field.name) {
                return Err(invalid(format!("field name `{}` is not a lowercase identifier", field.name)));
            }
            if seen.contains(&field.name.as_str()) {
                return Err(invalid(format!("field `{}` declared twice", field.name)));
            }
            seen.push(field.name.as_str());

            let bits = field.kind.entropy_bits();
            let needs_bound = !matches!(field.kind, SecretKind::AccessKey { .. });
            if bits <= 0.0 || (needs_bound && bits < f64::from(min_entropy_bits)) {
                return Err(invalid(format!(
                    "field `{}` carries {bits:.0} bits of entropy, at least {min_entropy_bits} required",
                    field.name
                )));
            }
        }
        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

/// Where a set's values are allowed to live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Destinations {
    pub process_env: bool,
    pub external_store: Option<String>,
}

pub(crate) struct SecretField {
    pub(crate) value: SecretString,
    pub(crate) persist: bool,
    pub(crate) env_name: String,
}

/// A scoped collection of secret values held only in process memory.
///
/// Values are `SecretString`s: redacted in `Debug` and zeroized on drop.
pub struct CredentialSet {
    pub scope: String,
    pub(crate) fields: BTreeMap<String, SecretField>,
    pub generated_at: DateTime<Utc>,
    pub destinations: Destinations,
    pub reused: bool,
}

impl std::fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSet")
            .field("scope", &self.scope)
            .field("fields", &self.fields.keys().collect::<Vec<_>>())
            .field("generated_at", &self.generated_at)
            .field("destinations", &self.destinations)
            .field("reused", &self.reused)
            .finish()
    }
}

impl CredentialSet {
    pub(crate) fn empty(scope: &str, spec: &CredentialSpec, reused: bool) -> Self {
        Self {
            scope: scope.to_string(),
            fields: BTreeMap::new(),
            generated_at: Utc::now(),
            destinations: Destinations {
                process_env: false,
                external_store: spec.store_path.clone(),
            },
            reused,
        }
    }

    pub(crate) fn insert(&mut self, field: &FieldSpec, value: SecretString, env_prefix: &str) {
        let env_name = field
            .env_name
            .clone()
            .unwrap_or_else(|| export_name(env_prefix, &self.scope, &field.name));
        self.fields.insert(
            field.name.clone(),
            SecretField {
                value,
                persist: field.persist,
                env_name,
            },
        );
    }

    pub(crate) fn generate_field(
        &mut self,
        field: &FieldSpec,
        source: &dyn EntropySource,
        env_prefix: &str,
    ) -> Result<(), CredentialError> {
        let value = field.kind.generate(source)?;
        self.insert(field, SecretString::from(value), env_prefix);
        Ok(())
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields.keys().cloned().collect()
    }

    pub fn summary(&self) -> CredentialSummary {
        CredentialSummary {
            scope: self.scope.clone(),
            fields: self.field_names(),
            generated_at: self.generated_at,
            destinations: self.destinations.clone(),
            reused: self.reused,
        }
    }
}

/// Deterministic environment name for a field: `{prefix}{scope}_{field}`.
pub fn export_name(prefix: &str, scope: &str, field: &str) -> String {
    format!("{prefix}{scope}_{field}")
}

/// Value-free description of an open credential set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialSummary {
    pub scope: String,
    pub fields: Vec<String>,
    pub generated_at: DateTime<Utc>,
    pub destinations: Destinations,
    pub reused: bool,
}
