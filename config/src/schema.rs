//! # Declarative Config Schema
//!
//! Typed model of the declarative config file: global settings, code-host
//! connections, search contexts and GitHub App definitions.
//!
//! All structures:
//! - Use `serde` with camelCase field names, matching the file format
//! - Use `validator` for field-level rules
//! - Serialize back to the same shape, so a connection's stored JSON can be
//!   compared against a freshly parsed one

use errors::CredentialError;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use validator::Validate;

pub const DEFAULT_MAX_FILE_SIZE: u64 = 2 * 1024 * 1024;
pub const DEFAULT_MAX_TRIGRAM_COUNT: u64 = 20_000;

/// Global engine settings.
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Tunables for indexing limits, polling intervals and per-queue worker
/// concurrency. Every field has a default, so an absent `settings` block is
/// equivalent to `Settings::default()`.
///
/// ## Validation
/// Limits and concurrency values must be strictly positive.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Files larger than this many bytes are skipped by the indexer.
    #[validate(range(min = 1))]
    pub max_file_size: u64,

    /// Files with more trigrams than this are skipped by the indexer.
    #[validate(range(min = 1))]
    pub max_trigram_count: u64,

    pub reindex_interval_ms: u64,
    pub resync_connection_interval_ms: u64,
    pub resync_connection_polling_interval_ms: u64,
    pub reindex_repo_polling_interval_ms: u64,

    #[validate(range(min = 1))]
    pub max_connection_sync_job_concurrency: usize,

    #[validate(range(min = 1))]
    pub max_repo_indexing_job_concurrency: usize,

    #[validate(range(min = 1))]
    pub max_repo_garbage_collection_job_concurrency: usize,

    /// Grace period before an orphaned repo's shards are deleted.
    pub repo_garbage_collection_grace_period_ms: u64,

    pub repo_index_timeout_ms: u64,

    /// Minimum age of a repo's last permission sync before it is re-synced.
    pub repo_driven_permission_sync_interval_ms: u64,

    /// Same, for an account's last sync.
    pub user_driven_permission_sync_interval_ms: u64
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_trigram_count: DEFAULT_MAX_TRIGRAM_COUNT,
            reindex_interval_ms: 1000 * 60 * 60,
            resync_connection_interval_ms: 1000 * 60 * 60 * 24,
            resync_connection_polling_interval_ms: 1000,
            reindex_repo_polling_interval_ms: 1000,
            max_connection_sync_job_concurrency: 8,
            max_repo_indexing_job_concurrency: 8,
            max_repo_garbage_collection_job_concurrency: 8,
            repo_garbage_collection_grace_period_ms: 10 * 1000,
            repo_index_timeout_ms: 1000 * 60 * 60 * 2,
            repo_driven_permission_sync_interval_ms: 1000 * 60 * 60 * 24,
            user_driven_permission_sync_interval_ms: 1000 * 60 * 60 * 24
        }
    }
}

/// Where a credential comes from.
///
/// Serialized as a single-key object: `{"secret": ..}`, `{"env": ..}` or
/// `{"googleCloudSecret": ..}`. Bare string literals are rejected so that
/// plaintext secrets never end up in a config file.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum TokenSpec {
    Secret { secret: String },
    Env { env: String },
    GoogleCloudSecret {
        #[serde(rename = "googleCloudSecret")]
        google_cloud_secret: String
    }
}

impl TokenSpec {
    /// Interprets a raw JSON value as a token specification.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, CredentialError> {
        let invalid = |reason: &str| CredentialError::InvalidTokenConfig {
            reason: reason.to_string()
        };

        let object = match value {
            serde_json::Value::String(_) => {
                return Err(invalid(
                    "plaintext tokens are not allowed, use {\"env\": ..}, {\"secret\": ..} or {\"googleCloudSecret\": ..}"
                ));
            }
            serde_json::Value::Object(map) => map,
            _ => return Err(invalid("expected an object"))
        };

        if object.len() != 1 {
            return Err(invalid("expected exactly one of env, secret, googleCloudSecret"));
        }

        let name = |v: &serde_json::Value| -> Result<String, CredentialError> {
            match v.as_str() {
                Some(s) if !s.is_empty() => Ok(s.to_string()),
                _ => Err(invalid("token reference must be a non-empty string"))
            }
        };

        if let Some(v) = object.get("secret") {
            Ok(Self::Secret { secret: name(v)? })
        } else if let Some(v) = object.get("env") {
            Ok(Self::Env { env: name(v)? })
        } else if let Some(v) = object.get("googleCloudSecret") {
            Ok(Self::GoogleCloudSecret {
                google_cloud_secret: name(v)?
            })
        } else {
            Err(invalid("expected exactly one of env, secret, googleCloudSecret"))
        }
    }
}

impl<'de> Deserialize<'de> for TokenSpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        TokenSpec::from_value(&value).map_err(serde::de::Error::custom)
    }
}

/// Branch and tag globs selected for indexing, in addition to `HEAD`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GitRevisions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branches: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SizeBounds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u64>
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GithubExclude {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forks: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repos: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topics: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<SizeBounds>
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GithubConnectionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<TokenSpec>,

    /// Defaults to https://github.com
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(url)]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orgs: Option<Vec<String>>,

    /// `owner/name` pairs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repos: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(min = 1))]
    pub topics: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<GithubExclude>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revisions: Option<GitRevisions>
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GitlabExclude {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forks: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projects: Option<Vec<String>>
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GitlabConnectionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<TokenSpec>,

    /// Defaults to https://gitlab.com
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(url)]
    pub url: Option<String>,

    /// Sync every visible project. Ignored on gitlab.com.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<String>>,

    /// `group/project` paths.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projects: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<GitlabExclude>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revisions: Option<GitRevisions>
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GiteaExclude {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forks: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repos: Option<Vec<String>>
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GiteaConnectionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<TokenSpec>,

    /// Defaults to https://gitea.com
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(url)]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orgs: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repos: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<GiteaExclude>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revisions: Option<GitRevisions>
}

/// A single repository reachable by clone URL, no code-host API involved.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GenericGitHostConnectionConfig {
    #[validate(length(min = 1))]
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revisions: Option<GitRevisions>
}

/// One code-host integration, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionConfig {
    Github(GithubConnectionConfig),
    Gitlab(GitlabConnectionConfig),
    Gitea(GiteaConnectionConfig),
    Git(GenericGitHostConnectionConfig)
}

impl ConnectionConfig {
    /// The `type` discriminator, as stored in `connection.connection_type`.
    pub fn code_host_type(&self) -> &'static str {
        match self {
            Self::Github(_) => "github",
            Self::Gitlab(_) => "gitlab",
            Self::Gitea(_) => "gitea",
            Self::Git(_) => "git"
        }
    }

    pub fn token(&self) -> Option<&TokenSpec> {
        match self {
            Self::Github(c) => c.token.as_ref(),
            Self::Gitlab(c) => c.token.as_ref(),
            Self::Gitea(c) => c.token.as_ref(),
            Self::Git(_) => None
        }
    }

    pub fn revisions(&self) -> Option<&GitRevisions> {
        match self {
            Self::Github(c) => c.revisions.as_ref(),
            Self::Gitlab(c) => c.revisions.as_ref(),
            Self::Gitea(c) => c.revisions.as_ref(),
            Self::Git(c) => c.revisions.as_ref()
        }
    }

    /// Base web URL of the code host, with the public default applied.
    pub fn host_url(&self) -> String {
        let trimmed = |u: &Option<String>, default: &str| {
            u.as_deref()
                .unwrap_or(default)
                .trim_end_matches('/')
                .to_string()
        };
        match self {
            Self::Github(c) => trimmed(&c.url, "https://github.com"),
            Self::Gitlab(c) => trimmed(&c.url, "https://gitlab.com"),
            Self::Gitea(c) => trimmed(&c.url, "https://gitea.com"),
            Self::Git(c) => c.url.clone()
        }
    }
}

impl Validate for ConnectionConfig {
    fn validate(&self) -> Result<(), validator::ValidationErrors> {
        match self {
            Self::Github(c) => c.validate(),
            Self::Gitlab(c) => c.validate(),
            Self::Gitea(c) => c.validate(),
            Self::Git(c) => c.validate()
        }
    }
}

/// A named set of repositories, derived by glob-matching repo names.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SearchContextConfig {
    /// Globs over host-qualified repo names, e.g. `github.com/acme/**`.
    #[validate(length(min = 1))]
    pub include: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GithubAppConfig {
    /// Numeric App ID, kept as a string as it appears in the file.
    #[validate(length(min = 1))]
    pub id: String,

    /// Defaults to github.com
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_hostname: Option<String>,

    pub private_key: TokenSpec
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AppConfig {
    Github(GithubAppConfig)
}

/// Fully loaded and validated declarative config.
///
/// Connections that fail validation are kept aside in `invalid_connections`
/// rather than failing the whole file, so one bad entry does not block the
/// others. Their names still count as declared: the reconciler must not
/// tombstone them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncConfig {
    pub settings: Settings,
    pub connections: BTreeMap<String, ConnectionConfig>,
    pub invalid_connections: BTreeMap<String, String>,
    pub contexts: Option<BTreeMap<String, SearchContextConfig>>,
    pub apps: Vec<AppConfig>
}

impl SyncConfig {
    /// Names of every connection key present in the file, valid or not.
    pub fn declared_connection_names(&self) -> Vec<String> {
        self.connections
            .keys()
            .chain(self.invalid_connections.keys())
            .cloned()
            .collect()
    }

    pub fn github_apps(&self) -> impl Iterator<Item = &GithubAppConfig> {
        self.apps.iter().map(|app| match app {
            AppConfig::Github(github) => github
        })
    }
}
