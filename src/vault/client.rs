use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};

use super::error::VaultError;
use super::types::{HealthResponse, KvReadResponse, KvWriteRequest};

/// External secret management service, as seen by the bootstrapper.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn write(
        &self,
        path: &str,
        fields: &BTreeMap<String, SecretString>,
    ) -> Result<(), VaultError>;

    /// `Ok(None)` when nothing is stored at `path`.
    async fn read(&self, path: &str) -> Result<Option<BTreeMap<String, SecretString>>, VaultError>;

    /// `Ok(())` once the service is initialized, unsealed and answering.
    async fn health(&self) -> Result<(), VaultError>;
}

/// KV v2 client for a Vault-compatible secret manager.
pub struct VaultClient {
    address: String,
    mount: String,
    token: SecretString,
    client: Client,
}

impl VaultClient {
    pub fn new(address: &str, mount: &str, token: SecretString) -> Result<Self, VaultError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            address: address.trim_end_matches('/').to_string(),
            mount: mount.trim_matches('/').to_string(),
            token,
            client,
        })
    }

    /// Build a client whose token comes from the environment variable `token_env`.
    pub fn from_env(address: &str, mount: &str, token_env: &str) -> Result<Self, VaultError> {
        let token = std::env::var(token_env)
            .ok()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| VaultError::MissingToken(token_env.to_string()))?;
        Self::new(address, mount, SecretString::from(token))
    }

    fn data_url(&self, path: &str) -> String {
        format!(
            "{}/v1/{}/data/{}",
            self.address,
            self.mount,
            path.trim_start_matches('/')
        )
    }

    async fn check_status(response: Response) -> Result<Response, VaultError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(VaultError::RateLimited);
        }
        if status == StatusCode::SERVICE_UNAVAILABLE {
            return Err(VaultError::Sealed);
        }
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        Err(VaultError::ApiError {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl SecretStore for VaultClient {
    async fn write(
        &self,
        path: &str,
        fields: &BTreeMap<String, SecretString>,
    ) -> Result<(), VaultError> {
        let body = KvWriteRequest {
            data: fields
                .iter()
                .map(|(k, v)| (k.clone(), v.expose_secret().to_string()))
                .collect(),
        };
        let response = self
            .client
            .post(self.data_url(path))
            .header("X-Vault-Token", self.token.expose_secret())
            .json(&body)
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Option<BTreeMap<String, SecretString>>, VaultError> {
        let response = self
            .client
            .get(self.data_url(path))
            .header("X-Vault-Token", self.token.expose_secret())
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check_status(response).await?;
        let body: KvReadResponse = response
            .json()
            .await
            .map_err(|e| VaultError::Malformed(e.to_string()))?;

        if body.data.metadata.as_ref().is_some_and(|m| m.destroyed) {
            return Ok(None);
        }
        Ok(body.data.data.map(|data| {
            data.into_iter()
                .map(|(k, v)| (k, SecretString::from(v)))
                .collect()
        }))
    }

    async fn health(&self) -> Result<(), VaultError> {
        let response = self
            .client
            .get(format!("{}/v1/sys/health", self.address))
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let health: HealthResponse = response
            .json()
            .await
            .map_err(|e| VaultError::Malformed(e.to_string()))?;
        if !health.initialized {
            return Err(VaultError::ApiError {
                status: 501,
                message: "secret manager is not initialized".into(),
            });
        }
        if health.sealed {
            return Err(VaultError::Sealed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> VaultClient {
        VaultClient::new(&server.uri(), "secret", SecretString::from("s.root".to_string())).unwrap()
    }

    fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, SecretString> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), SecretString::from(v.to_string())))
            .collect()
    }

    #[tokio::test]
    async fn write_posts_kv_v2_body_with_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/secret/data/bootstrap/object-storage"))
            .and(header("X-Vault-Token", "s.root"))
            .and(body_json(serde_json::json!({
                "data": {"access_key": "AK", "secret_key": "SK"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"version": 1}
            })))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .write(
                "bootstrap/object-storage",
                &fields(&[("access_key", "AK"), ("secret_key", "SK")]),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn read_returns_fields() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/bootstrap/gitops"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"data": {"token": "ghp_abc"}, "metadata": {"version": 4}}
            })))
            .mount(&server)
            .await;

        let data = client(&server).read("bootstrap/gitops").await.unwrap().unwrap();
        assert_eq!(data["token"].expose_secret(), "ghp_abc");
    }

    #[tokio::test]
    async fn read_missing_path_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({"errors": []})))
            .mount(&server)
            .await;

        assert!(client(&server).read("nothing/here").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sealed_vault_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client(&server)
            .write("p", &fields(&[("a", "b")]))
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::Sealed));
    }

    #[tokio::test]
    async fn forbidden_is_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string("permission denied"))
            .mount(&server)
            .await;

        match client(&server).read("p").await {
            Err(VaultError::ApiError { status, message }) => {
                assert_eq!(status, 403);
                assert_eq!(message, "permission denied");
            }
            other => panic!("expected ApiError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn health_reports_sealed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/sys/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "initialized": true, "sealed": true, "standby": false
            })))
            .mount(&server)
            .await;

        assert!(matches!(client(&server).health().await, Err(VaultError::Sealed)));
    }

    #[tokio::test]
    async fn health_ok_when_unsealed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/sys/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "initialized": true, "sealed": false
            })))
            .mount(&server)
            .await;

        client(&server).health().await.unwrap();
    }

    #[test]
    fn from_env_requires_token() {
        let err = VaultClient::from_env("http://127.0.0.1:8200", "secret", "PLATFORM_BOOTSTRAP_NO_SUCH_TOKEN")
            .err()
            .unwrap();
        assert!(matches!(err, VaultError::MissingToken(_)));
    }
}
