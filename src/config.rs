//! Configuração do bootstrapper carregada a partir de `bootstrap.toml`.
//!
//! A struct [`BootstrapConfig`] contém todos os parâmetros configuráveis,
//! agrupados por seção. Seções ausentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `VAULT_ADDR` tem precedência sobre o arquivo; o
//! token do gerenciador de segredos nunca fica no arquivo, só no ambiente.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::credentials::CredentialSettings;
use crate::error::BootstrapError;
use crate::handoff::{CredentialRef, HandoffSettings};
use crate::migrate::RemoteBackendConfig;
use crate::retry::RetryPolicy;
use crate::wait::PollSpec;

/// Caminho padrão do arquivo de configuração.
pub const DEFAULT_CONFIG_PATH: &str = "bootstrap.toml";

/// Configuração de nível superior carregada de `bootstrap.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    pub retry: RetryPolicy,
    pub credentials: CredentialSettings,
    pub secret_manager: SecretManagerConfig,
    pub object_storage: ObjectStorageConfig,
    pub cluster: ClusterConfig,
    pub iac: IacConfig,
    pub remote_state: RemoteBackendConfig,
    pub gitops: GitopsConfig,
    pub handoff: HandoffConfig,
}

/// Port-forward até um serviço dentro do cluster.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TunnelConfig {
    pub namespace: String,
    pub service: String,
    pub local_port: u16,
    pub remote_port: u16,
}

/// Gerenciador de segredos (Vault KV v2).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecretManagerConfig {
    pub address: String,
    /// Mount do engine KV v2.
    pub mount: String,
    /// Nome da variável de ambiente que carrega o token.
    pub token_env: String,
    /// Namespace onde o serviço é instalado.
    pub namespace: String,
    pub tunnel: Option<TunnelConfig>,
    pub wait_timeout_secs: u64,
}

impl Default for SecretManagerConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:8200".to_string(),
            mount: "secret".to_string(),
            token_env: "VAULT_TOKEN".to_string(),
            namespace: "vault".to_string(),
            tunnel: None,
            wait_timeout_secs: 300,
        }
    }
}

/// Armazenamento de objetos que recebe o estado remoto.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObjectStorageConfig {
    pub tunnel: Option<TunnelConfig>,
    /// Caminho no gerenciador de segredos onde as credenciais ficam guardadas.
    pub credentials_path: String,
    pub access_key_env: String,
    pub secret_key_env: String,
    pub wait_timeout_secs: u64,
}

impl Default for ObjectStorageConfig {
    fn default() -> Self {
        Self {
            tunnel: None,
            credentials_path: "bootstrap/object-storage".to_string(),
            access_key_env: "AWS_ACCESS_KEY_ID".to_string(),
            secret_key_env: "AWS_SECRET_ACCESS_KEY".to_string(),
            wait_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub kubectl: String,
    pub context: Option<String>,
    pub node_timeout_secs: u64,
    pub poll_interval_secs: u64,
    /// Tempo que uma pré-condição espera por um serviço antes de falhar.
    pub precondition_timeout_secs: u64,
    /// Repassado ao kubectl como `--request-timeout`.
    pub request_timeout_secs: u64,
    /// Limite de uma invocação do kubectl, incluindo `rollout status`.
    pub command_timeout_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            kubectl: "kubectl".to_string(),
            context: None,
            node_timeout_secs: 600,
            poll_interval_secs: 5,
            precondition_timeout_secs: 60,
            request_timeout_secs: 30,
            command_timeout_secs: 600,
        }
    }
}

impl ClusterConfig {
    pub fn poll(&self, timeout_secs: u64) -> PollSpec {
        PollSpec::from_secs(self.poll_interval_secs, timeout_secs)
    }
}

/// Motor de infraestrutura como código (terraform ou tofu).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IacConfig {
    pub binary: String,
    pub working_dir: PathBuf,
    /// Arquivo de estado local usado até a migração.
    pub local_state: PathBuf,
    pub targets: IacTargets,
    /// Limite de uma invocação do motor (init, plan, apply).
    pub command_timeout_secs: u64,
}

impl Default for IacConfig {
    fn default() -> Self {
        Self {
            binary: "terraform".to_string(),
            working_dir: PathBuf::from("infra"),
            local_state: PathBuf::from("infra/terraform.tfstate"),
            targets: IacTargets::default(),
            command_timeout_secs: 1800,
        }
    }
}

/// Alvos `-target` de cada fase que aplica infraestrutura. Lista vazia aplica tudo.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IacTargets {
    pub base: Vec<String>,
    pub secret_manager: Vec<String>,
    pub object_storage: Vec<String>,
    pub gitops: Vec<String>,
}

impl Default for IacTargets {
    fn default() -> Self {
        Self {
            base: vec!["module.base".to_string()],
            secret_manager: vec!["module.vault".to_string()],
            object_storage: vec!["module.object_storage".to_string()],
            gitops: vec!["module.gitops".to_string()],
        }
    }
}

/// Reconciliador GitOps e as credenciais que ele usa.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GitopsConfig {
    pub namespace: String,
    /// Nome do objeto de origem (GitRepository).
    pub source_name: String,
    /// Deployment do controlador que lê a credencial da origem.
    pub controller: String,
    /// URL do repositório; quando presente, habilita a checagem de acesso no preflight.
    pub repo_url: Option<String>,
    pub repo_username: String,
    /// Secret com a credencial temporária de bootstrap.
    pub bootstrap_secret: String,
    /// Secret sincronizado que assume após o handoff.
    pub target_secret: String,
    pub secret_key: String,
    pub token_prefix: Option<String>,
    /// Caminho no gerenciador de segredos do token de longa duração.
    pub store_path: String,
    pub bootstrap_token_env: String,
    pub token_env: String,
}

impl Default for GitopsConfig {
    fn default() -> Self {
        Self {
            namespace: "flux-system".to_string(),
            source_name: "flux-system".to_string(),
            controller: "source-controller".to_string(),
            repo_url: None,
            repo_username: "git".to_string(),
            bootstrap_secret: "gitops-bootstrap".to_string(),
            target_secret: "gitops-credentials".to_string(),
            secret_key: "password".to_string(),
            token_prefix: None,
            store_path: "bootstrap/gitops".to_string(),
            bootstrap_token_env: "GITOPS_BOOTSTRAP_TOKEN".to_string(),
            token_env: "GITOPS_TOKEN".to_string(),
        }
    }
}

impl GitopsConfig {
    /// Referência ao secret sincronizado que o handoff deve adotar.
    pub fn target(&self) -> CredentialRef {
        CredentialRef {
            namespace: self.namespace.clone(),
            secret_name: self.target_secret.clone(),
            key: self.secret_key.clone(),
            expected_prefix: self.token_prefix.clone(),
        }
    }
}

/// Limites de tempo do handoff, em segundos.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HandoffConfig {
    pub sync_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub validate_timeout_secs: u64,
    pub controller_restart_budget_secs: u64,
    /// Testa o token sincronizado contra o repositório antes do corte.
    /// Sem valor explícito, testa somente quando `gitops.repo_url` existe.
    pub verify_repo_access: Option<bool>,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        let settings = HandoffSettings::default();
        Self {
            sync_timeout_secs: settings.sync_timeout.as_secs(),
            poll_interval_secs: settings.poll_interval.as_secs(),
            validate_timeout_secs: settings.validate_timeout.as_secs(),
            controller_restart_budget_secs: settings.controller_restart_budget.as_secs(),
            verify_repo_access: None,
        }
    }
}

impl HandoffConfig {
    /// Converte para [`HandoffSettings`]; `repo_configured` decide o teste de acesso implícito.
    pub fn settings(&self, repo_configured: bool) -> HandoffSettings {
        HandoffSettings {
            sync_timeout: Duration::from_secs(self.sync_timeout_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            validate_timeout: Duration::from_secs(self.validate_timeout_secs),
            controller_restart_budget: Duration::from_secs(self.controller_restart_budget_secs),
            verify_repo_access: self.verify_repo_access.unwrap_or(repo_configured),
        }
    }
}

impl BootstrapConfig {
    /// Carrega a configuração de `path`.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load(path: &Path) -> Result<Self, BootstrapError> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| BootstrapError::Config(format!("{}: {e}", path.display())))?;
            Self::parse(&contents)?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo para o endereço do Vault.
        if let Ok(address) = std::env::var("VAULT_ADDR")
            && !address.is_empty()
        {
            config.secret_manager.address = address;
        }

        config.validate()?;
        Ok(config)
    }

    /// Interpreta o conteúdo TOML sem consultar o ambiente nem validar.
    pub fn parse(contents: &str) -> Result<Self, BootstrapError> {
        Ok(toml::from_str(contents)?)
    }

    /// Rejeita combinações que o bootstrap não consegue cumprir.
    pub fn validate(&self) -> Result<(), BootstrapError> {
        let invalid = |msg: String| Err(BootstrapError::Config(msg));

        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1".into());
        }
        if self.cluster.poll_interval_secs == 0 || self.handoff.poll_interval_secs == 0 {
            return invalid("poll intervals must be positive".into());
        }
        // A validação do handoff precisa cobrir ao menos um restart do controlador.
        if self.handoff.validate_timeout_secs < self.handoff.controller_restart_budget_secs {
            return invalid(format!(
                "handoff.validate_timeout_secs ({}) must be >= handoff.controller_restart_budget_secs ({})",
                self.handoff.validate_timeout_secs, self.handoff.controller_restart_budget_secs
            ));
        }
        if self.credentials.min_entropy_bits < 64 {
            return invalid(format!(
                "credentials.min_entropy_bits ({}) is below 64",
                self.credentials.min_entropy_bits
            ));
        }
        if self.handoff.verify_repo_access == Some(true) && self.gitops.repo_url.is_none() {
            return invalid("handoff.verify_repo_access requires gitops.repo_url".into());
        }
        if self.cluster.command_timeout_secs == 0 || self.iac.command_timeout_secs == 0 {
            return invalid("command timeouts must be positive".into());
        }
        // O `rollout status` do handoff roda dentro de um único comando kubectl.
        if self.cluster.command_timeout_secs < self.handoff.controller_restart_budget_secs {
            return invalid(format!(
                "cluster.command_timeout_secs ({}) must be >= handoff.controller_restart_budget_secs ({})",
                self.cluster.command_timeout_secs, self.handoff.controller_restart_budget_secs
            ));
        }
        if self.gitops.bootstrap_secret == self.gitops.target_secret {
            return invalid("gitops.bootstrap_secret and gitops.target_secret must differ".into());
        }
        self.remote_state.validate().map_err(BootstrapError::Config)?;
        Ok(())
    }
}
