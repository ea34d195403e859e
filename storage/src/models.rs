//! Persisted entities of the sync engine.
//!
//! Ids follow the relational schema: organizations, connections, repos and
//! search contexts use integer keys, jobs use UUIDs and accounts use the
//! identity provider's string id.

use chrono::{DateTime, Utc};
use errors::StorageError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Org that owns everything declared in the config file.
pub const SINGLE_TENANT_ORG_ID: i32 = 1;

/// Lifecycle shared by every job table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED"
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(StorageError::SerializationError {
                reason: format!("unknown job status '{other}'")
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionSyncStatus {
    SyncNeeded,
    InSyncQueue,
    Syncing,
    Synced,
    Failed
}

impl ConnectionSyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SyncNeeded => "SYNC_NEEDED",
            Self::InSyncQueue => "IN_SYNC_QUEUE",
            Self::Syncing => "SYNCING",
            Self::Synced => "SYNCED",
            Self::Failed => "FAILED"
        }
    }
}

impl FromStr for ConnectionSyncStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SYNC_NEEDED" => Ok(Self::SyncNeeded),
            "IN_SYNC_QUEUE" => Ok(Self::InSyncQueue),
            "SYNCING" => Ok(Self::Syncing),
            "SYNCED" => Ok(Self::Synced),
            "FAILED" => Ok(Self::Failed),
            other => Err(StorageError::SerializationError {
                reason: format!("unknown connection sync status '{other}'")
            })
        }
    }
}

/// A named code-host integration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: i32,
    pub org_id: i32,
    pub name: String,
    pub connection_type: String,
    /// Validated connection config, stored in its normalized JSON form.
    pub config: serde_json::Value,
    /// Owned by the config file; only the reconciler may delete it.
    pub is_declarative: bool,
    pub sync_status: ConnectionSyncStatus,
    pub synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>
}

/// Indexing hints carried on each repo.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoMetadata {
    /// Branch globs to index in addition to HEAD.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branches: Option<Vec<String>>,
    /// Tag globs to index in addition to HEAD.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_config: Option<BTreeMap<String, String>>,
    /// Revisions that went into the last successful index build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexed_revisions: Option<Vec<String>>
}

/// Provider name to external account ids with read access.
pub type PermittedAccounts = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repo {
    pub id: i32,
    pub org_id: i32,
    /// Host-qualified, e.g. `github.com/acme/web`.
    pub name: String,
    pub display_name: Option<String>,
    pub clone_url: String,
    pub web_url: Option<String>,
    pub external_id: String,
    pub external_code_host_type: String,
    pub external_code_host_url: String,
    pub is_fork: bool,
    pub is_archived: bool,
    pub is_public: bool,
    pub metadata: RepoMetadata,
    /// Raw JSON so a malformed cache on one repo cannot poison a scan.
    pub cached_permitted_external_accounts: Option<serde_json::Value>,
    pub indexed_at: Option<DateTime<Utc>>,
    pub indexed_commit_hash: Option<String>,
    pub permission_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>
}

impl Repo {
    /// Parses the permission cache. `Ok(None)` when there is no cache.
    pub fn permitted_accounts(&self) -> Result<Option<PermittedAccounts>, serde_json::Error> {
        self.cached_permitted_external_accounts
            .as_ref()
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
    }

    /// Shard file prefix owned by this repo.
    pub fn shard_prefix(&self) -> String {
        format!("{}_{}", self.org_id, self.id)
    }
}

/// Repo as produced by discovery, before it has an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoUpsert {
    pub name: String,
    pub display_name: Option<String>,
    pub clone_url: String,
    pub web_url: Option<String>,
    pub external_id: String,
    pub external_code_host_type: String,
    pub external_code_host_url: String,
    pub is_fork: bool,
    pub is_archived: bool,
    pub is_public: bool,
    pub metadata: RepoMetadata
}

impl RepoUpsert {
    /// Identity used for deduplication and upserts within one org.
    pub fn external_key(&self) -> (&str, &str) {
        (&self.external_id, &self.external_code_host_url)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchContext {
    pub id: i32,
    pub org_id: i32,
    pub name: String,
    pub description: Option<String>,
    pub repo_ids: Vec<i32>
}

/// An internal user's linked identity on an external provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub user_id: String,
    pub provider: String,
    pub provider_account_id: String,
    /// OAuth token from sign-in. Used to list the repos the user can see.
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    pub permission_synced_at: Option<DateTime<Utc>>
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSyncJob {
    pub id: Uuid,
    pub connection_id: i32,
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepoIndexingJobType {
    Index,
    Cleanup
}

impl RepoIndexingJobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Index => "INDEX",
            Self::Cleanup => "CLEANUP"
        }
    }
}

impl FromStr for RepoIndexingJobType {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INDEX" => Ok(Self::Index),
            "CLEANUP" => Ok(Self::Cleanup),
            other => Err(StorageError::SerializationError {
                reason: format!("unknown repo indexing job type '{other}'")
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoIndexingJob {
    pub id: Uuid,
    pub repo_id: i32,
    pub job_type: RepoIndexingJobType,
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoPermissionSyncJob {
    pub id: Uuid,
    pub repo_id: i32,
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountPermissionSyncJob {
    pub id: Uuid,
    pub account_id: String,
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>
}

/// Org-scoped encrypted secret. `iv` and `encrypted_value` are base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub org_id: i32,
    pub key: String,
    pub iv: String,
    pub encrypted_value: String
}

/// Status change applied to a job row. `completed_at` is stamped for
/// terminal statuses.
#[derive(Debug, Clone, PartialEq)]
pub struct JobUpdate {
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub metadata: Option<serde_json::Value>
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status,
            error_message: None,
            metadata: None
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            error_message: Some(message.into()),
            metadata: None
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}
