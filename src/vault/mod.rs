pub mod client;
pub mod error;
pub mod types;

pub use client::{SecretStore, VaultClient};
pub use error::VaultError;
