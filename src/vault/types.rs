//! Tipos de dados do motor KV v2 do gerenciador de segredos.
//!
//! Os valores trafegam como `String` apenas durante a (de)serialização; o
//! cliente converte tudo para `SecretString` antes de devolver ao chamador.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// Corpo de escrita para `POST /v1/{mount}/data/{path}`.
#[derive(Debug, Serialize)]
pub struct KvWriteRequest {
    pub data: BTreeMap<String, String>,
}

impl Drop for KvWriteRequest {
    fn drop(&mut self) {
        for value in self.data.values_mut() {
            value.zeroize();
        }
    }
}

/// Resposta de `GET /v1/{mount}/data/{path}`.
#[derive(Debug, Deserialize)]
pub struct KvReadResponse {
    pub data: KvReadData,
}

/// Envelope interno com os pares chave/valor e os metadados da versão.
#[derive(Debug, Deserialize)]
pub struct KvReadData {
    /// `null` quando a versão mais recente foi apagada.
    pub data: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub metadata: Option<KvMetadata>,
}

/// Metadados da versão lida.
#[derive(Debug, Clone, Deserialize)]
pub struct KvMetadata {
    pub version: u64,
    #[serde(default)]
    pub destroyed: bool,
}

/// Resposta de `GET /v1/sys/health`.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthResponse {
    pub initialized: bool,
    pub sealed: bool,
    #[serde(default)]
    pub standby: bool,
}
