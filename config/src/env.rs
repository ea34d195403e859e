//! # Engine Environment Config
//!
//! Process-level configuration read from environment variables, following
//! 12-factor app principles. The declarative config file (connections,
//! contexts, apps) is separate; see [`crate::loader`].
//!
//! # Environment Variables
//! - `DATABASE_URL`: Postgres connection string (required)
//! - `REDIS_URLS`: comma separated Redis nodes; the first also hosts the job
//!   queue (default: `redis://localhost:6379`)
//! - `CONFIG_PATH`: declarative config file to watch (optional)
//! - `DATA_DIR`: root for mirrors and shards (default: `.sync-data`)
//! - `HOST` / `PORT`: API bind address (default: `0.0.0.0:3060`)
//! - `SYNC_ENCRYPTION_KEY`: 32-byte key for stored secrets (optional)
//! - `SYNC_ENTITLEMENTS`: comma separated feature list (optional)
//! - `ZOEKT_INDEX_BIN`: indexer executable (default: `zoekt-git-index`)
//! - `PERMISSION_SYNC_ENABLED`: `true`/`1` to run the permission scheduler
//! - `MAX_DB_CONNECTIONS`: pool size (default: 10)
//! - `AUTH_GITHUB_BASE_URL` / `AUTH_GITLAB_BASE_URL`: hosts that issued the
//!   users' OAuth tokens (default: the cloud hosts)

use errors::ConfigValidationError;
use std::path::{Path, PathBuf};

pub const DEFAULT_PORT: u16 = 3060;
pub const DEFAULT_INDEXER_BIN: &str = "zoekt-git-index";

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub database_url: String,
    pub redis_urls: Vec<String>,
    pub config_path: Option<PathBuf>,
    pub data_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub encryption_key: Option<String>,
    pub entitlements: Vec<String>,
    pub indexer_bin: String,
    pub permission_sync_enabled: bool,
    pub max_db_connections: u32,
    pub github_auth_url: Option<String>,
    pub gitlab_auth_url: Option<String>
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            redis_urls: vec!["redis://localhost:6379".to_string()],
            config_path: None,
            data_dir: PathBuf::from(".sync-data"),
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            encryption_key: None,
            entitlements: Vec::new(),
            indexer_bin: DEFAULT_INDEXER_BIN.to_string(),
            permission_sync_enabled: false,
            max_db_connections: 10,
            github_auth_url: None,
            gitlab_auth_url: None
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl EngineConfig {
    /// Creates a new configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigValidationError> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigValidationError::Environment {
                name: "DATABASE_URL".to_string(),
                reason: "not set".to_string()
            })?;

        let defaults = Self::default();
        let port = match std::env::var("PORT") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| ConfigValidationError::Environment {
                    name: "PORT".to_string(),
                    reason: format!("'{raw}' is not a valid port")
                })?,
            Err(_) => defaults.port
        };

        let redis_urls = std::env::var("REDIS_URLS")
            .map(|raw| split_list(&raw))
            .unwrap_or(defaults.redis_urls);
        if redis_urls.is_empty() {
            return Err(ConfigValidationError::Environment {
                name: "REDIS_URLS".to_string(),
                reason: "at least one node is required".to_string()
            });
        }

        Ok(Self {
            database_url,
            redis_urls,
            config_path: std::env::var("CONFIG_PATH").ok().map(PathBuf::from),
            data_dir: std::env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            host: std::env::var("HOST").unwrap_or(defaults.host),
            port,
            encryption_key: std::env::var("SYNC_ENCRYPTION_KEY").ok(),
            entitlements: std::env::var("SYNC_ENTITLEMENTS")
                .map(|raw| split_list(&raw))
                .unwrap_or_default(),
            indexer_bin: std::env::var("ZOEKT_INDEX_BIN").unwrap_or(defaults.indexer_bin),
            permission_sync_enabled: std::env::var("PERMISSION_SYNC_ENABLED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            max_db_connections: std::env::var("MAX_DB_CONNECTIONS")
                .ok()
                .and_then(|c| c.parse().ok())
                .unwrap_or(defaults.max_db_connections),
            github_auth_url: std::env::var("AUTH_GITHUB_BASE_URL").ok(),
            gitlab_auth_url: std::env::var("AUTH_GITLAB_BASE_URL").ok()
        })
    }

    /// Creates a builder for configuration.
    #[must_use]
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Directory holding one bare mirror per repo.
    pub fn repos_dir(&self) -> PathBuf {
        self.data_dir.join("repos")
    }

    /// Directory the indexer writes shards into.
    pub fn index_dir(&self) -> PathBuf {
        self.data_dir.join("index")
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }
}

/// Builder for `EngineConfig`.
#[derive(Default)]
pub struct EngineConfigBuilder {
    database_url: Option<String>,
    redis_urls: Option<Vec<String>>,
    config_path: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    host: Option<String>,
    port: Option<u16>,
    encryption_key: Option<String>,
    entitlements: Option<Vec<String>>,
    indexer_bin: Option<String>,
    permission_sync_enabled: Option<bool>
}

impl EngineConfigBuilder {
    #[must_use]
    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn redis_urls(mut self, urls: Vec<String>) -> Self {
        self.redis_urls = Some(urls);
        self
    }

    #[must_use]
    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(path.into());
        self
    }

    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    #[must_use]
    pub fn encryption_key(mut self, key: impl Into<String>) -> Self {
        self.encryption_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn entitlements(mut self, entitlements: Vec<String>) -> Self {
        self.entitlements = Some(entitlements);
        self
    }

    #[must_use]
    pub fn indexer_bin(mut self, bin: impl Into<String>) -> Self {
        self.indexer_bin = Some(bin.into());
        self
    }

    #[must_use]
    pub fn permission_sync_enabled(mut self, enabled: bool) -> Self {
        self.permission_sync_enabled = Some(enabled);
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> Result<EngineConfig, ConfigValidationError> {
        let database_url = self
            .database_url
            .ok_or_else(|| ConfigValidationError::Environment {
                name: "database_url".to_string(),
                reason: "is required".to_string()
            })?;

        let defaults = EngineConfig::default();
        Ok(EngineConfig {
            database_url,
            redis_urls: self.redis_urls.unwrap_or(defaults.redis_urls),
            config_path: self.config_path,
            data_dir: self.data_dir.unwrap_or(defaults.data_dir),
            host: self.host.unwrap_or(defaults.host),
            port: self.port.unwrap_or(defaults.port),
            encryption_key: self.encryption_key,
            entitlements: self.entitlements.unwrap_or_default(),
            indexer_bin: self.indexer_bin.unwrap_or(defaults.indexer_bin),
            permission_sync_enabled: self.permission_sync_enabled.unwrap_or(false),
            max_db_connections: defaults.max_db_connections,
            github_auth_url: None,
            gitlab_auth_url: None
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for name in [
            "DATABASE_URL",
            "REDIS_URLS",
            "CONFIG_PATH",
            "DATA_DIR",
            "PORT",
            "SYNC_ENTITLEMENTS",
            "PERMISSION_SYNC_ENABLED",
            "AUTH_GITHUB_BASE_URL"
        ] {
            unsafe { std::env::remove_var(name) };
        }
    }

    #[test]
    #[serial]
    fn test_from_env_requires_database_url() {
        clear_env();
        let err = EngineConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
    }

    #[test]
    #[serial]
    fn test_from_env_reads_lists_and_flags() {
        clear_env();
        unsafe {
            std::env::set_var("DATABASE_URL", "postgres://localhost/sync");
            std::env::set_var("REDIS_URLS", "redis://a:6379, redis://b:6379,,redis://c:6379");
            std::env::set_var("SYNC_ENTITLEMENTS", "search-contexts,permission-syncing");
            std::env::set_var("PERMISSION_SYNC_ENABLED", "1");
            std::env::set_var("DATA_DIR", "/var/lib/sync");
            std::env::set_var("AUTH_GITHUB_BASE_URL", "https://ghe.acme.io");
        }

        let config = EngineConfig::from_env().unwrap();
        assert_eq!(config.redis_urls.len(), 3);
        assert_eq!(config.entitlements, vec!["search-contexts", "permission-syncing"]);
        assert!(config.permission_sync_enabled);
        assert_eq!(config.github_auth_url.as_deref(), Some("https://ghe.acme.io"));
        assert!(config.gitlab_auth_url.is_none());
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.repos_dir(), PathBuf::from("/var/lib/sync/repos"));
        assert_eq!(config.index_dir(), PathBuf::from("/var/lib/sync/index"));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_bad_port() {
        clear_env();
        unsafe {
            std::env::set_var("DATABASE_URL", "postgres://localhost/sync");
            std::env::set_var("PORT", "not-a-port");
        }
        assert!(EngineConfig::from_env().is_err());
        clear_env();
    }

    #[test]
    fn test_builder_requires_database_url() {
        assert!(EngineConfig::builder().build().is_err());
        let config = EngineConfig::builder()
            .database_url("postgres://localhost/sync")
            .port(8080)
            .build()
            .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.indexer_bin, DEFAULT_INDEXER_BIN);
    }
}
