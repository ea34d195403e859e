//! Persistence seams of the sync engine.
//!
//! The engine only talks to these traits. [`crate::postgres::PgSyncStore`]
//! is the system of record; [`crate::memory::InMemorySyncStore`] backs tests
//! and single-node runs.

use crate::models::{
    Account, AccountPermissionSyncJob, Connection, ConnectionSyncJob, ConnectionSyncStatus, JobUpdate, Repo,
    RepoIndexingJob, RepoIndexingJobType, RepoPermissionSyncJob, RepoUpsert, SearchContext, Secret
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use errors::StorageError;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, StorageError>;

#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn get_connection(&self, id: i32) -> Result<Option<Connection>>;

    async fn find_connection_by_name(&self, org_id: i32, name: &str) -> Result<Option<Connection>>;

    async fn list_connections(&self, org_id: i32) -> Result<Vec<Connection>>;

    /// Every connection across orgs, for the resync scheduler.
    async fn list_all_connections(&self) -> Result<Vec<Connection>>;

    /// Insert or overwrite a declarative connection keyed by `(org_id, name)`.
    async fn upsert_declarative_connection(
        &self,
        org_id: i32,
        name: &str,
        connection_type: &str,
        config: serde_json::Value
    ) -> Result<Connection>;

    /// Deletes the connection and its repo links.
    async fn delete_connection(&self, id: i32) -> Result<()>;

    async fn set_connection_sync_status(
        &self,
        id: i32,
        status: ConnectionSyncStatus,
        synced_at: Option<DateTime<Utc>>
    ) -> Result<()>;

    /// Connections linked to a repo, oldest link first.
    async fn list_connections_for_repo(&self, repo_id: i32) -> Result<Vec<Connection>>;
}

#[async_trait]
pub trait RepoStore: Send + Sync {
    async fn get_repo(&self, id: i32) -> Result<Option<Repo>>;

    async fn list_repos(&self, org_id: i32) -> Result<Vec<Repo>>;

    async fn list_all_repos(&self) -> Result<Vec<Repo>>;

    async fn list_repos_for_connection(&self, connection_id: i32) -> Result<Vec<Repo>>;

    /// Repos that are not linked to any connection.
    async fn list_orphaned_repos(&self) -> Result<Vec<Repo>>;

    async fn list_repos_with_permission_cache(&self) -> Result<Vec<Repo>>;

    /// Repos of one code host type whose `external_id` is in `external_ids`,
    /// across every connection and org.
    async fn find_repos_by_external_ids(
        &self,
        code_host_type: &str,
        external_ids: &[String]
    ) -> Result<Vec<Repo>>;

    /// Atomically unlinks every repo from the connection, upserts `repos`
    /// keyed by `(external_id, external_code_host_url, org_id)` and links
    /// them again. Returns the repo ids in input order.
    async fn replace_connection_repos(
        &self,
        org_id: i32,
        connection_id: i32,
        repos: Vec<RepoUpsert>
    ) -> Result<Vec<i32>>;

    async fn mark_repo_indexed(
        &self,
        repo_id: i32,
        indexed_at: DateTime<Utc>,
        commit_hash: Option<String>,
        indexed_revisions: Vec<String>
    ) -> Result<()>;

    /// Overwrites one provider's entry in the permission cache and stamps
    /// `permission_synced_at`.
    async fn set_repo_permission_cache(
        &self,
        repo_id: i32,
        provider: &str,
        external_account_ids: Vec<String>,
        synced_at: DateTime<Utc>
    ) -> Result<()>;

    async fn delete_repo(&self, id: i32) -> Result<()>;
}

#[async_trait]
pub trait SearchContextStore: Send + Sync {
    async fn list_search_contexts(&self, org_id: i32) -> Result<Vec<SearchContext>>;

    /// Upsert by `(org_id, name)` and set membership to exactly `repo_ids`.
    async fn upsert_search_context(
        &self,
        org_id: i32,
        name: &str,
        description: Option<String>,
        repo_ids: Vec<i32>
    ) -> Result<SearchContext>;

    async fn delete_search_context(&self, id: i32) -> Result<()>;
}

#[async_trait]
pub trait PermissionStore: Send + Sync {
    /// Upsert by id. An absent access token keeps the stored one, and
    /// `permission_synced_at` is only set on insert.
    async fn upsert_account(&self, account: Account) -> Result<()>;

    async fn get_account(&self, id: &str) -> Result<Option<Account>>;

    async fn list_accounts(&self) -> Result<Vec<Account>>;

    async fn find_accounts_by_provider_ids(
        &self,
        provider: &str,
        provider_account_ids: &[String]
    ) -> Result<Vec<Account>>;

    /// Inserts `(account_id, repo_id)` pairs, ignoring ones that already
    /// exist. Returns the number of new rows.
    async fn grant_repo_permissions(&self, account_id: &str, repo_ids: &[i32]) -> Result<u64>;

    /// Deletes every permission row for the repo, then inserts the given
    /// accounts, in one transaction.
    async fn replace_repo_permissions(&self, repo_id: i32, account_ids: &[String]) -> Result<()>;

    async fn list_repo_permissions(&self, repo_id: i32) -> Result<Vec<String>>;

    /// Deletes every permission row for the account, then inserts the given
    /// repos, in one transaction.
    async fn replace_account_permissions(&self, account_id: &str, repo_ids: &[i32]) -> Result<()>;

    async fn list_account_permissions(&self, account_id: &str) -> Result<Vec<i32>>;

    async fn set_account_permission_synced_at(
        &self,
        account_id: &str,
        synced_at: DateTime<Utc>
    ) -> Result<()>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_connection_sync_job(&self, connection_id: i32) -> Result<ConnectionSyncJob>;

    async fn get_connection_sync_job(&self, id: Uuid) -> Result<Option<ConnectionSyncJob>>;

    async fn update_connection_sync_job(&self, id: Uuid, update: JobUpdate) -> Result<ConnectionSyncJob>;

    /// Newest first.
    async fn list_connection_sync_jobs(&self, connection_id: i32) -> Result<Vec<ConnectionSyncJob>>;

    async fn create_repo_indexing_job(
        &self,
        repo_id: i32,
        job_type: RepoIndexingJobType
    ) -> Result<RepoIndexingJob>;

    async fn get_repo_indexing_job(&self, id: Uuid) -> Result<Option<RepoIndexingJob>>;

    async fn update_repo_indexing_job(&self, id: Uuid, update: JobUpdate) -> Result<RepoIndexingJob>;

    /// Newest first.
    async fn list_repo_indexing_jobs(&self, repo_id: i32) -> Result<Vec<RepoIndexingJob>>;

    async fn create_permission_sync_job(&self, repo_id: i32) -> Result<RepoPermissionSyncJob>;

    async fn get_permission_sync_job(&self, id: Uuid) -> Result<Option<RepoPermissionSyncJob>>;

    async fn update_permission_sync_job(
        &self,
        id: Uuid,
        update: JobUpdate
    ) -> Result<RepoPermissionSyncJob>;

    /// Newest first.
    async fn list_permission_sync_jobs(&self, repo_id: i32) -> Result<Vec<RepoPermissionSyncJob>>;

    async fn create_account_permission_sync_job(
        &self,
        account_id: &str
    ) -> Result<AccountPermissionSyncJob>;

    async fn get_account_permission_sync_job(
        &self,
        id: Uuid
    ) -> Result<Option<AccountPermissionSyncJob>>;

    async fn update_account_permission_sync_job(
        &self,
        id: Uuid,
        update: JobUpdate
    ) -> Result<AccountPermissionSyncJob>;

    /// Newest first.
    async fn list_account_permission_sync_jobs(
        &self,
        account_id: &str
    ) -> Result<Vec<AccountPermissionSyncJob>>;
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret(&self, org_id: i32, key: &str) -> Result<Option<Secret>>;

    async fn put_secret(&self, secret: Secret) -> Result<()>;
}

/// Everything the engine needs from persistence.
pub trait SyncStore:
    ConnectionStore + RepoStore + SearchContextStore + PermissionStore + JobStore + SecretStore
{
}

impl<T> SyncStore for T where
    T: ConnectionStore + RepoStore + SearchContextStore + PermissionStore + JobStore + SecretStore
{
}

pub(crate) fn not_found(entity: &str, id: impl ToString) -> StorageError {
    StorageError::NotFound {
        entity: entity.to_string(),
        id: id.to_string()
    }
}
