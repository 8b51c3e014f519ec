//! Verificação de acesso ao repositório GitOps via libgit2.
//!
//! O [`GitRemoteProbe`] conecta ao remoto com uma credencial candidata e lista
//! as refs, sem clonar nada. É usado como checagem extra no preflight do
//! handoff: se o token não consegue listar o repositório, o reconciliador
//! também não conseguirá.

use git2::{Cred, Direction, Remote, RemoteCallbacks};
use secrecy::{ExposeSecret, SecretString};

/// Checagem bloqueante de que uma credencial consegue ler o repositório.
///
/// Implementações fazem I/O de rede síncrono; chame via `spawn_blocking`.
pub trait RepoAccessProbe: Send + Sync {
    /// Retorna quantas refs o remoto anunciou.
    fn list_refs(&self, token: &SecretString) -> Result<usize, git2::Error>;
}

/// Sonda de acesso baseada em `git ls-remote` (libgit2).
pub struct GitRemoteProbe {
    url: String,
    username: String,
}

impl GitRemoteProbe {
    /// Cria uma sonda para `url`, autenticando como `username` + token.
    pub fn new(url: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: username.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl RepoAccessProbe for GitRemoteProbe {
    fn list_refs(&self, token: &SecretString) -> Result<usize, git2::Error> {
        let mut remote = Remote::create_detached(self.url.as_str())?;

        let mut callbacks = RemoteCallbacks::new();
        let mut attempted = false;
        callbacks.credentials(|_url, username_from_url, _allowed| {
            // libgit2 repete o callback indefinidamente quando a credencial é recusada.
            if attempted {
                return Err(git2::Error::from_str("credential rejected by remote"));
            }
            attempted = true;
            let user = username_from_url.unwrap_or(self.username.as_str());
            Cred::userpass_plaintext(user, token.expose_secret())
        });

        let connection = remote.connect_auth(Direction::Fetch, Some(callbacks), None)?;
        let refs = connection.list()?.len();
        Ok(refs)
    }
}
