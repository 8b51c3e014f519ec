//! Bootstrap credential lifecycle: generate, export, persist, wipe.

mod entropy;
mod manager;
mod set;
mod sink;

pub use entropy::{EntropySource, OsEntropy};
pub use manager::{CredentialLifecycleManager, CredentialSettings, Reuse};
pub use set::{CredentialSet, CredentialSpec, CredentialSummary, Destinations, FieldSpec, SecretKind, export_name};
pub use sink::{EnvSink, MapSink, ProcessEnv};
