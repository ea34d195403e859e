//! # Sync Engine Errors
//!
//! Error taxonomy shared by every crate of the repository synchronization
//! engine.
//!
//! - Uses `thiserror` for structured error definitions
//! - Named fields everywhere so messages stay greppable in logs
//! - [`JobError`] is the boundary type seen by the job queue, which decides
//!   retry versus terminal failure through [`JobError::is_retryable`]

use thiserror::Error;

pub type Result<T, E = JobError> = std::result::Result<T, E>;

/// Malformed or invalid declarative configuration.
///
/// A sync run that hits this aborts before touching persisted state.
#[derive(Debug, Error)]
pub enum ConfigValidationError {
    #[error("Failed to read config file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to parse config file {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("Config failed schema validation: {reason}")]
    Schema { reason: String },

    #[error("Invalid connection '{name}': {reason}")]
    InvalidConnection { name: String, reason: String },

    #[error("Invalid environment variable {name}: {reason}")]
    Environment { name: String, reason: String }
}

/// Token specification could not be turned into a usable credential.
///
/// No partial credential is ever returned alongside one of these.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Environment variable {name} not found.")]
    MissingEnvVar { name: String },

    #[error("Invalid token configuration: {reason}")]
    InvalidTokenConfig { reason: String },

    #[error("Secret with key {key} not found for org {org_id}")]
    SecretNotFound { key: String, org_id: i32 },

    #[error("Failed to decrypt secret {key}: {reason}")]
    DecryptionFailed { key: String, reason: String },

    #[error("Failed to access Google Cloud secret {resource}: {reason}")]
    CloudSecret { resource: String, reason: String },

    #[error("GitHub App error: {reason}")]
    GithubApp { reason: String },

    #[error("GitHub App installation not found for {key}")]
    InstallationNotFound { key: String },

    #[error("GithubAppManager must be initialized before use. Call init() first.")]
    NotInitialized
}

/// Git mirror operation failures, always carrying the underlying message.
#[derive(Debug, Error)]
pub enum GitOperationError {
    #[error("Failed to clone repository: {reason}")]
    Clone { url: String, reason: String },

    #[error("Failed to fetch repository {path}: {reason}")]
    Fetch { path: String, reason: String },

    #[error("Failed to set git config {path}: {reason}")]
    Config { path: String, reason: String },

    #[error("Failed to list refs for {path}: {reason}")]
    Refs { path: String, reason: String },

    #[error("Failed to open repository {path}: {reason}")]
    Open { path: String, reason: String }
}

/// External indexer invocation failures.
#[derive(Debug, Error)]
pub enum IndexBuildError {
    #[error("Failed to spawn indexer {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("Indexer exited with status {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("Failed to clean up index data for repo {repo_id}: {reason}")]
    Cleanup { repo_id: i32, reason: String }
}

/// Permission sync job failures.
#[derive(Debug, Error)]
pub enum PermissionSyncError {
    #[error("Repo {repo_id} not found")]
    RepoNotFound { repo_id: i32 },

    #[error("No credentials found for repo {repo_id}")]
    NoCredentials { repo_id: i32 },

    #[error("Repo {repo_id} does not have a displayName")]
    MissingDisplayName { repo_id: i32 },

    #[error("Permission syncing is not supported for code host {code_host_type}")]
    UnsupportedCodeHost { code_host_type: String },

    #[error("Permission syncing is not supported in current plan.")]
    NotEntitled,

    #[error("Account {account_id} not found")]
    AccountNotFound { account_id: String },

    #[error("Account {account_id} has no {provider} OAuth access token")]
    MissingAccessToken { account_id: String, provider: String },

    #[error("Failed to list collaborators from {provider}: {reason}")]
    Provider { provider: String, reason: String }
}

/// Distributed lock failures.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Resource locked: {resources:?}")]
    ResourceLocked { resources: Vec<String> },

    #[error("Quorum not reached: {acquired}/{required} nodes")]
    Quorum { acquired: usize, required: usize },

    #[error("Lock for {resources:?} has expired")]
    Expired { resources: Vec<String> },

    #[error("Lock backend error: {reason}")]
    Backend { reason: String }
}

/// Persistence failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Connection to {backend} failed: {reason}")]
    ConnectionError { backend: String, reason: String },

    #[error("{backend} query failed: {reason}")]
    QueryError { backend: String, reason: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("Serialization failed: {reason}")]
    SerializationError { reason: String },

    #[error("Invalid state transition for job {job_id}: {reason}")]
    InvalidState { job_id: String, reason: String }
}

/// Job queue backend failures.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue backend error on {queue}: {reason}")]
    Backend { queue: String, reason: String },

    #[error("Malformed job payload on {queue}: {reason}")]
    Payload { queue: String, reason: String },

    #[error("Queue {queue} is shut down")]
    ShutDown { queue: String }
}

/// Code host REST API failures.
#[derive(Debug, Error)]
pub enum CodeHostError {
    #[error("Rate limited by {host}: retry after {retry_after_seconds}s")]
    RateLimited { host: String, retry_after_seconds: u64 },

    #[error("{host} API error: {status} - {message}")]
    Api {
        host: String,
        status: u16,
        message: String
    },

    #[error("HTTP request to {host} failed: {reason}")]
    Http { host: String, reason: String },

    #[error("Invalid code host configuration: {reason}")]
    InvalidConfig { reason: String }
}

/// Boundary error for anything executed by the job queue.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Config(#[from] ConfigValidationError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Git(#[from] GitOperationError),

    #[error(transparent)]
    Index(#[from] IndexBuildError),

    #[error(transparent)]
    Permission(#[from] PermissionSyncError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    CodeHost(#[from] CodeHostError),

    #[error("Job {job_id} is not in a valid state. Expected: PENDING or IN_PROGRESS. Actual: {actual}. Skipping.")]
    InvalidJobState { job_id: String, actual: String },

    #[error("Job timed out")]
    TimedOut
}

impl JobError {
    /// Whether the queue should schedule another attempt.
    ///
    /// Config and credential problems will not fix themselves between
    /// attempts; everything that touches the network, disk or a contended
    /// lock might.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Config(_) | Self::InvalidJobState { .. } => false,
            Self::Credential(e) => matches!(e, CredentialError::CloudSecret { .. } | CredentialError::GithubApp { .. }),
            Self::Git(_) | Self::Index(_) | Self::Lock(_) | Self::Queue(_) => true,
            Self::Permission(e) => !matches!(
                e,
                PermissionSyncError::NotEntitled | PermissionSyncError::MissingAccessToken { .. }
            ),
            Self::Storage(e) => !matches!(e, StorageError::InvalidState { .. }),
            Self::CodeHost(e) => !matches!(e, CodeHostError::InvalidConfig { .. }),
            Self::TimedOut => true
        }
    }

    /// Explicit wait requested by the failing dependency, in seconds.
    pub fn retry_after(&self) -> Option<u64> {
        if let Self::CodeHost(CodeHostError::RateLimited {
            retry_after_seconds, ..
        }) = self
        {
            Some(*retry_after_seconds)
        } else {
            None
        }
    }

    /// Stable machine-readable kind, used as a metrics label and API code.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_validation",
            Self::Credential(_) => "credential_resolution",
            Self::Git(_) => "git_operation",
            Self::Index(_) => "index_build",
            Self::Permission(_) => "permission_sync",
            Self::Lock(_) => "lock_acquisition",
            Self::Storage(_) => "storage",
            Self::Queue(_) => "queue",
            Self::CodeHost(_) => "code_host",
            Self::InvalidJobState { .. } => "invalid_job_state",
            Self::TimedOut => "timeout"
        }
    }
}
