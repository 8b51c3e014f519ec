use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::retry::Classification;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("{url} unreachable: {reason}")]
    Unreachable { url: String, reason: String },

    #[error("invalid probe URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl ProbeError {
    pub fn classification(&self) -> Classification {
        match self {
            ProbeError::Unreachable { .. } => Classification::Transient,
            ProbeError::InvalidUrl { .. } => Classification::Fatal,
        }
    }
}

/// Network-level liveness check for an endpoint.
#[async_trait]
pub trait Reachability: Send + Sync {
    /// Any HTTP response counts as reachable; only transport failures do not.
    async fn check(&self, url: &str) -> Result<u16, ProbeError>;
}

pub struct HttpProbe {
    http: reqwest::Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Result<Self, ProbeError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProbeError::InvalidUrl {
                url: String::new(),
                reason: e.to_string(),
            })?;
        Ok(Self { http })
    }
}

#[async_trait]
impl Reachability for HttpProbe {
    async fn check(&self, url: &str) -> Result<u16, ProbeError> {
        let parsed = reqwest::Url::parse(url).map_err(|e| ProbeError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let response = self
            .http
            .get(parsed)
            .send()
            .await
            .map_err(|e| ProbeError::Unreachable {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        Ok(response.status().as_u16())
    }
}
