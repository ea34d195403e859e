//! # GitHub App installations
//!
//! Installation-scoped tokens for configured GitHub Apps, cached per
//! `(deployment hostname, account login)`.
//!
//! [`GithubAppManager::init`] resolves each App's private key, lists its
//! installations and mints one token per installation. Afterwards
//! [`GithubAppManager::get_installation_token`] hands out the cached token
//! while it is valid and re-mints it on the first access after expiry.

use crate::credentials::CredentialResolver;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use config::GithubAppConfig;
use errors::CredentialError;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const DEFAULT_DEPLOYMENT_HOSTNAME: &str = "github.com";

/// An installation of an App on one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInstallation {
    pub id: u64,
    pub account_login: String
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallationToken {
    pub token: String,
    pub expires_at: DateTime<Utc>
}

/// Credentials used to authenticate as the App itself.
#[derive(Clone)]
pub struct AppIdentity {
    pub app_id: String,
    pub private_key: String,
    pub hostname: String
}

impl std::fmt::Debug for AppIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppIdentity")
            .field("app_id", &self.app_id)
            .field("hostname", &self.hostname)
            .finish_non_exhaustive()
    }
}

/// GitHub endpoints the manager relies on.
#[async_trait]
pub trait GithubAppApi: Send + Sync {
    async fn list_installations(&self, app: &AppIdentity) -> Result<Vec<AppInstallation>, CredentialError>;

    async fn create_installation_token(
        &self,
        app: &AppIdentity,
        installation_id: u64
    ) -> Result<InstallationToken, CredentialError>;
}

#[derive(Serialize)]
struct AppClaims<'a> {
    iat: i64,
    exp: i64,
    iss: &'a str
}

#[derive(Deserialize)]
struct InstallationResponse {
    id: u64,
    account: Option<InstallationAccount>
}

#[derive(Deserialize)]
struct InstallationAccount {
    login: Option<String>
}

#[derive(Deserialize)]
struct AccessTokenResponse {
    token: String,
    expires_at: DateTime<Utc>
}

/// REST implementation authenticating with an RS256 App JWT.
pub struct RestGithubAppApi {
    client: reqwest::Client,
    api_url: Option<String>
}

impl RestGithubAppApi {
    pub fn new(timeout: Duration) -> Result<Self, CredentialError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("sync-engine")
            .build()
            .map_err(|e| CredentialError::GithubApp {
                reason: e.to_string()
            })?;
        Ok(Self { client, api_url: None })
    }

    /// Sends every request to `url` instead of the hostname's API.
    #[must_use]
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = Some(url.into().trim_end_matches('/').to_string());
        self
    }

    fn base_url(&self, hostname: &str) -> String {
        match &self.api_url {
            Some(url) => url.clone(),
            None if hostname == DEFAULT_DEPLOYMENT_HOSTNAME => "https://api.github.com".to_string(),
            None => format!("https://{hostname}/api/v3")
        }
    }

    /// Short-lived JWT identifying the App. Backdated a minute for clock skew.
    pub fn app_jwt(app: &AppIdentity, now: DateTime<Utc>) -> Result<String, CredentialError> {
        let fail = |e: jsonwebtoken::errors::Error| CredentialError::GithubApp {
            reason: format!("cannot sign JWT for app {}: {e}", app.app_id)
        };
        let claims = AppClaims {
            iat: (now - ChronoDuration::seconds(60)).timestamp(),
            exp: (now + ChronoDuration::minutes(9)).timestamp(),
            iss: &app.app_id
        };
        let key = EncodingKey::from_rsa_pem(app.private_key.as_bytes()).map_err(fail)?;
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key).map_err(fail)
    }

    async fn send<T: for<'de> Deserialize<'de>>(
        &self,
        request: reqwest::RequestBuilder,
        app: &AppIdentity
    ) -> Result<T, CredentialError> {
        let jwt = Self::app_jwt(app, Utc::now())?;
        let response = request
            .bearer_auth(jwt)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| CredentialError::GithubApp {
                reason: e.to_string()
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CredentialError::GithubApp {
                reason: format!("{status}: {body}")
            });
        }
        response.json::<T>().await.map_err(|e| CredentialError::GithubApp {
            reason: e.to_string()
        })
    }
}

#[async_trait]
impl GithubAppApi for RestGithubAppApi {
    async fn list_installations(&self, app: &AppIdentity) -> Result<Vec<AppInstallation>, CredentialError> {
        let url = format!("{}/app/installations?per_page=100", self.base_url(&app.hostname));
        let installations: Vec<InstallationResponse> = self.send(self.client.get(&url), app).await?;

        Ok(installations
            .into_iter()
            .filter_map(|i| match i.account.and_then(|a| a.login) {
                Some(login) => Some(AppInstallation {
                    id: i.id,
                    account_login: login
                }),
                None => {
                    warn!(installation_id = i.id, "Skipping installation without account login");
                    None
                }
            })
            .collect())
    }

    async fn create_installation_token(
        &self,
        app: &AppIdentity,
        installation_id: u64
    ) -> Result<InstallationToken, CredentialError> {
        let url = format!(
            "{}/app/installations/{installation_id}/access_tokens",
            self.base_url(&app.hostname)
        );
        let token: AccessTokenResponse = self.send(self.client.post(&url), app).await?;
        Ok(InstallationToken {
            token: token.token,
            expires_at: token.expires_at
        })
    }
}

#[derive(Debug, Clone)]
struct Installation {
    id: u64,
    app_id: String,
    token: String,
    expires_at: DateTime<Utc>
}

#[derive(Default)]
struct InstallationCache {
    apps: HashMap<String, AppIdentity>,
    installations: HashMap<(String, String), Installation>
}

/// Owns the installation cache. Construct one per process and share it.
pub struct GithubAppManager {
    api: Arc<dyn GithubAppApi>,
    resolver: Arc<CredentialResolver>,
    cache: Mutex<InstallationCache>,
    ready: AtomicBool
}

impl GithubAppManager {
    pub fn new(api: Arc<dyn GithubAppApi>, resolver: Arc<CredentialResolver>) -> Self {
        Self {
            api,
            resolver,
            cache: Mutex::new(InstallationCache::default()),
            ready: AtomicBool::new(false)
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Loads every installation of every configured App. Calling it again
    /// replaces the cache.
    pub async fn init(&self, apps: &[GithubAppConfig], org_id: i32) -> Result<(), errors::JobError> {
        let mut fresh = InstallationCache::default();

        for app in apps {
            let hostname = app
                .deployment_hostname
                .clone()
                .unwrap_or_else(|| DEFAULT_DEPLOYMENT_HOSTNAME.to_string());
            let private_key = self.resolver.resolve(&app.private_key, org_id).await?;
            let identity = AppIdentity {
                app_id: app.id.clone(),
                private_key,
                hostname: hostname.clone()
            };

            let installations = self.api.list_installations(&identity).await?;
            info!(
                app_id = %app.id,
                hostname = %hostname,
                count = installations.len(),
                "Found GitHub App installations"
            );

            for installation in installations {
                let token = self
                    .api
                    .create_installation_token(&identity, installation.id)
                    .await?;
                debug!(
                    installation_id = installation.id,
                    account = %installation.account_login,
                    "Cached installation token"
                );
                fresh.installations.insert(
                    (hostname.clone(), installation.account_login),
                    Installation {
                        id: installation.id,
                        app_id: app.id.clone(),
                        token: token.token,
                        expires_at: token.expires_at
                    }
                );
            }
            fresh.apps.insert(app.id.clone(), identity);
        }

        *self.cache.lock().await = fresh;
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    pub async fn apps_configured(&self) -> bool {
        !self.cache.lock().await.apps.is_empty()
    }

    /// A token for the installation on `owner`, never one that has expired.
    pub async fn get_installation_token(&self, owner: &str, hostname: &str) -> Result<String, CredentialError> {
        if !self.is_ready() {
            return Err(CredentialError::NotInitialized);
        }

        let mut cache = self.cache.lock().await;
        let key = (hostname.to_string(), owner.to_string());
        let installation = cache
            .installations
            .get(&key)
            .cloned()
            .ok_or_else(|| CredentialError::InstallationNotFound {
                key: format!("{hostname}/{owner}")
            })?;

        if installation.expires_at > Utc::now() {
            return Ok(installation.token);
        }

        let identity = cache
            .apps
            .get(&installation.app_id)
            .cloned()
            .ok_or_else(|| CredentialError::GithubApp {
                reason: format!("app {} is no longer configured", installation.app_id)
            })?;
        debug!(installation_id = installation.id, "Installation token expired, refreshing");
        let fresh = self
            .api
            .create_installation_token(&identity, installation.id)
            .await?;

        if let Some(entry) = cache.installations.get_mut(&key) {
            entry.token.clone_from(&fresh.token);
            entry.expires_at = fresh.expires_at;
        }
        Ok(fresh.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::TokenSpec;
    use serial_test::serial;
    use std::sync::atomic::AtomicUsize;
    use storage::InMemorySyncStore;

    /// Hands out numbered tokens; the first one is already expired.
    struct CountingApi {
        mints: AtomicUsize
    }

    #[async_trait]
    impl GithubAppApi for CountingApi {
        async fn list_installations(&self, _app: &AppIdentity) -> Result<Vec<AppInstallation>, CredentialError> {
            Ok(vec![AppInstallation {
                id: 11,
                account_login: "acme".to_string()
            }])
        }

        async fn create_installation_token(
            &self,
            _app: &AppIdentity,
            _installation_id: u64
        ) -> Result<InstallationToken, CredentialError> {
            let n = self.mints.fetch_add(1, Ordering::SeqCst);
            let expires_at = if n == 0 {
                Utc::now() - ChronoDuration::minutes(1)
            } else {
                Utc::now() + ChronoDuration::hours(1)
            };
            Ok(InstallationToken {
                token: format!("ghs_{n}"),
                expires_at
            })
        }
    }

    fn manager(api: Arc<CountingApi>) -> GithubAppManager {
        let resolver = Arc::new(CredentialResolver::new(Arc::new(InMemorySyncStore::new())));
        GithubAppManager::new(api, resolver)
    }

    fn app_config() -> GithubAppConfig {
        GithubAppConfig {
            id: "1234".to_string(),
            deployment_hostname: None,
            private_key: TokenSpec::Env {
                env: "TEST_GITHUB_APP_PRIVATE_KEY".to_string()
            }
        }
    }

    #[tokio::test]
    async fn test_access_before_init_fails_fast() {
        let manager = manager(Arc::new(CountingApi {
            mints: AtomicUsize::new(0)
        }));
        assert!(!manager.is_ready());
        let err = manager
            .get_installation_token("acme", DEFAULT_DEPLOYMENT_HOSTNAME)
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::NotInitialized));
    }

    #[tokio::test]
    #[serial]
    async fn test_expired_token_refreshes_exactly_once() {
        unsafe { std::env::set_var("TEST_GITHUB_APP_PRIVATE_KEY", "pem") };
        let api = Arc::new(CountingApi {
            mints: AtomicUsize::new(0)
        });
        let manager = manager(api.clone());
        manager.init(&[app_config()], 1).await.unwrap();
        assert_eq!(api.mints.load(Ordering::SeqCst), 1);

        let first = manager
            .get_installation_token("acme", DEFAULT_DEPLOYMENT_HOSTNAME)
            .await
            .unwrap();
        assert_eq!(first, "ghs_1");
        assert_eq!(api.mints.load(Ordering::SeqCst), 2);

        let second = manager
            .get_installation_token("acme", DEFAULT_DEPLOYMENT_HOSTNAME)
            .await
            .unwrap();
        assert_eq!(second, "ghs_1");
        assert_eq!(api.mints.load(Ordering::SeqCst), 2);
        unsafe { std::env::remove_var("TEST_GITHUB_APP_PRIVATE_KEY") };
    }

    #[tokio::test]
    #[serial]
    async fn test_unknown_owner_is_not_found() {
        unsafe { std::env::set_var("TEST_GITHUB_APP_PRIVATE_KEY", "pem") };
        let manager = manager(Arc::new(CountingApi {
            mints: AtomicUsize::new(0)
        }));
        manager.init(&[app_config()], 1).await.unwrap();
        let err = manager
            .get_installation_token("someone-else", DEFAULT_DEPLOYMENT_HOSTNAME)
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::InstallationNotFound { .. }));
        unsafe { std::env::remove_var("TEST_GITHUB_APP_PRIVATE_KEY") };
    }

    #[tokio::test]
    #[serial]
    async fn test_init_fails_when_private_key_missing() {
        unsafe { std::env::remove_var("TEST_GITHUB_APP_PRIVATE_KEY") };
        let manager = manager(Arc::new(CountingApi {
            mints: AtomicUsize::new(0)
        }));
        assert!(manager.init(&[app_config()], 1).await.is_err());
        assert!(!manager.is_ready());
    }

    #[test]
    fn test_base_url_for_enterprise_hosts() {
        let api = RestGithubAppApi::new(Duration::from_secs(5)).unwrap();
        assert_eq!(api.base_url("github.com"), "https://api.github.com");
        assert_eq!(api.base_url("ghe.acme.io"), "https://ghe.acme.io/api/v3");
    }
}
