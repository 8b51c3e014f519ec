//! Tipos de erro para o cliente do gerenciador de segredos.
//!
//! Define [`VaultError`] com variantes para selagem, erros HTTP e erros de
//! rede, e a classificação transitório/fatal usada pelas retentativas.

use thiserror::Error;

use crate::retry::Classification;

/// Erros que podem ocorrer ao falar com o gerenciador de segredos.
#[derive(Debug, Error)]
pub enum VaultError {
    /// O servidor respondeu HTTP 429.
    #[error("rate limited by the secret manager")]
    RateLimited,

    /// HTTP 503: o cofre está selado ou em standby.
    #[error("secret manager is sealed or unavailable")]
    Sealed,

    /// Qualquer outro status HTTP de erro.
    #[error("secret manager returned status {status}: {message}")]
    ApiError { status: u16, message: String },

    /// Resposta sem o formato KV v2 esperado.
    #[error("unexpected secret manager response: {0}")]
    Malformed(String),

    /// Token ausente na variável de ambiente configurada.
    #[error("no secret manager token in ${0}")]
    MissingToken(String),

    /// Falha de rede subjacente (DNS, conexão recusada, timeout).
    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

impl VaultError {
    /// Rede, 429 e 5xx são transitórios; o resto não melhora com retentativas.
    pub fn classification(&self) -> Classification {
        match self {
            VaultError::RateLimited | VaultError::Sealed | VaultError::NetworkError(_) => {
                Classification::Transient
            }
            VaultError::ApiError { status, .. } if *status >= 500 => Classification::Transient,
            _ => Classification::Fatal,
        }
    }
}
