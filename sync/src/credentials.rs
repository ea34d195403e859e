//! # Credential resolution
//!
//! Turns a [`TokenSpec`] into a usable token string, and finds the
//! credential to use for a given repo.
//!
//! No partial credential ever escapes: a spec either resolves to a
//! non-empty token or fails with a [`CredentialError`].

use crate::github_app::GithubAppManager;
use config::{ConnectionConfig, TokenSpec};
use errors::{CredentialError, JobError};
use std::sync::Arc;
use storage::{Connection, Repo, SecretCipher, SecretProvider, SecretStore, SyncStore};
use tracing::{debug, warn};

pub struct CredentialResolver {
    secrets: Arc<dyn SecretStore>,
    cipher: Option<SecretCipher>,
    cloud: Option<Arc<dyn SecretProvider>>
}

impl CredentialResolver {
    pub fn new(secrets: Arc<dyn SecretStore>) -> Self {
        Self {
            secrets,
            cipher: None,
            cloud: None
        }
    }

    #[must_use]
    pub fn with_cipher(mut self, cipher: SecretCipher) -> Self {
        self.cipher = Some(cipher);
        self
    }

    #[must_use]
    pub fn with_cloud_provider(mut self, provider: Arc<dyn SecretProvider>) -> Self {
        self.cloud = Some(provider);
        self
    }

    pub async fn resolve(&self, spec: &TokenSpec, org_id: i32) -> Result<String, JobError> {
        let token = match spec {
            TokenSpec::Env { env } => match std::env::var(env) {
                Ok(value) if !value.is_empty() => value,
                _ => {
                    return Err(CredentialError::MissingEnvVar { name: env.clone() }.into());
                }
            },
            TokenSpec::Secret { secret } => {
                let cipher = self.cipher.as_ref().ok_or_else(|| CredentialError::DecryptionFailed {
                    key: secret.clone(),
                    reason: "no encryption key configured".to_string()
                })?;
                let stored = self
                    .secrets
                    .get_secret(org_id, secret)
                    .await?
                    .ok_or_else(|| CredentialError::SecretNotFound {
                        key: secret.clone(),
                        org_id
                    })?;
                cipher.decrypt(&stored)?
            }
            TokenSpec::GoogleCloudSecret { google_cloud_secret } => {
                let provider = self.cloud.as_ref().ok_or_else(|| CredentialError::CloudSecret {
                    resource: google_cloud_secret.clone(),
                    reason: "no cloud secret provider configured".to_string()
                })?;
                provider.get_secret(google_cloud_secret).await?
            }
        };

        if token.is_empty() {
            return Err(CredentialError::InvalidTokenConfig {
                reason: "token resolved to an empty string".to_string()
            }
            .into());
        }
        Ok(token)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct RepoAuthCredentials {
    pub host_url: String,
    pub token: String,
    pub clone_url_with_token: String
}

impl std::fmt::Debug for RepoAuthCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepoAuthCredentials")
            .field("host_url", &self.host_url)
            .finish_non_exhaustive()
    }
}

/// Embeds `token` in `clone_url` the way each code host expects it.
pub fn clone_url_with_token(clone_url: &str, code_host_type: &str, token: &str) -> String {
    let Ok(mut url) = url::Url::parse(clone_url) else {
        return clone_url.to_string();
    };
    let applied = match code_host_type {
        "gitlab" => url
            .set_username("oauth2")
            .and_then(|()| url.set_password(Some(token))),
        "github" | "gitea" => url.set_username(token),
        _ => return clone_url.to_string()
    };
    match applied {
        Ok(()) => url.to_string(),
        Err(()) => clone_url.to_string()
    }
}

/// Owner segment of a host-qualified repo name, e.g. `acme` for
/// `github.com/acme/web`.
fn repo_owner(repo: &Repo) -> Option<&str> {
    repo.name.split('/').nth(1)
}

/// Picks credentials for a repo from the connections that link it.
pub struct RepoCredentialProvider {
    store: Arc<dyn SyncStore>,
    resolver: Arc<CredentialResolver>,
    github_apps: Option<Arc<GithubAppManager>>
}

impl RepoCredentialProvider {
    pub fn new(store: Arc<dyn SyncStore>, resolver: Arc<CredentialResolver>) -> Self {
        Self {
            store,
            resolver,
            github_apps: None
        }
    }

    #[must_use]
    pub fn with_github_apps(mut self, manager: Arc<GithubAppManager>) -> Self {
        self.github_apps = Some(manager);
        self
    }

    pub fn resolver(&self) -> &Arc<CredentialResolver> {
        &self.resolver
    }

    /// First connection, in link order, whose token resolves wins. A token
    /// that fails to resolve moves on to the next connection; the first such
    /// error is returned only when no connection yields a token.
    pub async fn for_repo(&self, repo: &Repo) -> Result<Option<RepoAuthCredentials>, JobError> {
        let connections = self.store.list_connections_for_repo(repo.id).await?;
        let mut first_error = None;
        for connection in &connections {
            match self.from_connection(repo, connection).await {
                Ok(Some(credentials)) => return Ok(Some(credentials)),
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        repo_id = repo.id,
                        connection = %connection.name,
                        error = %e,
                        "Could not resolve connection token, trying next connection"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                debug!(repo_id = repo.id, "No credentials found for repo");
                Ok(None)
            }
        }
    }

    async fn from_connection(
        &self,
        repo: &Repo,
        connection: &Connection
    ) -> Result<Option<RepoAuthCredentials>, JobError> {
        let config: ConnectionConfig = match serde_json::from_value(connection.config.clone()) {
            Ok(config) => config,
            Err(e) => {
                warn!(connection = %connection.name, error = %e, "Skipping connection with unreadable config");
                return Ok(None);
            }
        };
        let host_url = config.host_url();

        let token = if let Some(spec) = config.token() {
            self.resolver.resolve(spec, connection.org_id).await?
        } else if let (ConnectionConfig::Github(_), Some(apps)) = (&config, &self.github_apps) {
            let Some(owner) = repo_owner(repo) else {
                return Ok(None);
            };
            let hostname = url::Url::parse(&host_url)
                .ok()
                .and_then(|u| u.host_str().map(String::from))
                .unwrap_or_else(|| crate::github_app::DEFAULT_DEPLOYMENT_HOSTNAME.to_string());
            match apps.get_installation_token(owner, &hostname).await {
                Ok(token) => token,
                Err(CredentialError::InstallationNotFound { .. } | CredentialError::NotInitialized) => {
                    return Ok(None);
                }
                Err(e) => return Err(e.into())
            }
        } else {
            return Ok(None);
        };

        Ok(Some(RepoAuthCredentials {
            clone_url_with_token: clone_url_with_token(&repo.clone_url, config.code_host_type(), &token),
            host_url,
            token
        }))
    }
}
