//! In-process store with the same semantics as the Postgres schema,
//! including cascades. Used by tests and single-node runs.

use crate::models::{
    Account, AccountPermissionSyncJob, Connection, ConnectionSyncJob, ConnectionSyncStatus, JobStatus, JobUpdate, Repo,
    RepoIndexingJob, RepoIndexingJobType, RepoPermissionSyncJob, RepoUpsert, SearchContext, Secret
};
use crate::store::{
    ConnectionStore, JobStore, PermissionStore, RepoStore, Result, SearchContextStore, SecretStore,
    not_found
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use errors::StorageError;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
struct RepoLink {
    repo_id: i32,
    connection_id: i32,
    seq: u64
}

#[derive(Default)]
struct MemoryState {
    next_id: i32,
    link_seq: u64,
    connections: BTreeMap<i32, Connection>,
    repos: BTreeMap<i32, Repo>,
    links: Vec<RepoLink>,
    contexts: BTreeMap<i32, SearchContext>,
    accounts: BTreeMap<String, Account>,
    permissions: BTreeSet<(String, i32)>,
    connection_jobs: Vec<ConnectionSyncJob>,
    index_jobs: Vec<RepoIndexingJob>,
    permission_jobs: Vec<RepoPermissionSyncJob>,
    account_jobs: Vec<AccountPermissionSyncJob>,
    secrets: HashMap<(i32, String), Secret>
}

impl MemoryState {
    fn next_id(&mut self) -> i32 {
        self.next_id += 1;
        self.next_id
    }

    fn link(&mut self, repo_id: i32, connection_id: i32) {
        if self
            .links
            .iter()
            .any(|l| l.repo_id == repo_id && l.connection_id == connection_id)
        {
            return;
        }
        self.link_seq += 1;
        self.links.push(RepoLink {
            repo_id,
            connection_id,
            seq: self.link_seq
        });
    }

    fn remove_repo(&mut self, id: i32) {
        self.repos.remove(&id);
        self.links.retain(|l| l.repo_id != id);
        self.permissions.retain(|(_, repo_id)| *repo_id != id);
        self.index_jobs.retain(|j| j.repo_id != id);
        self.permission_jobs.retain(|j| j.repo_id != id);
        for context in self.contexts.values_mut() {
            context.repo_ids.retain(|r| *r != id);
        }
    }
}

fn apply_update(
    status: &mut JobStatus,
    error_message: &mut Option<String>,
    updated_at: &mut DateTime<Utc>,
    completed_at: &mut Option<DateTime<Utc>>,
    update: &JobUpdate
) {
    let now = Utc::now();
    *status = update.status;
    if update.error_message.is_some() {
        error_message.clone_from(&update.error_message);
    }
    *updated_at = now;
    if update.status.is_terminal() {
        *completed_at = Some(now);
    }
}

#[derive(Default)]
pub struct InMemorySyncStore {
    state: RwLock<MemoryState>
}

impl InMemorySyncStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a connection as created through the UI rather than the config
    /// file.
    pub fn set_ui_owned(&self, connection_id: i32) {
        if let Some(connection) = self.state.write().connections.get_mut(&connection_id) {
            connection.is_declarative = false;
        }
    }
}

#[async_trait]
impl ConnectionStore for InMemorySyncStore {
    async fn get_connection(&self, id: i32) -> Result<Option<Connection>> {
        Ok(self.state.read().connections.get(&id).cloned())
    }

    async fn find_connection_by_name(&self, org_id: i32, name: &str) -> Result<Option<Connection>> {
        Ok(self
            .state
            .read()
            .connections
            .values()
            .find(|c| c.org_id == org_id && c.name == name)
            .cloned())
    }

    async fn list_connections(&self, org_id: i32) -> Result<Vec<Connection>> {
        Ok(self
            .state
            .read()
            .connections
            .values()
            .filter(|c| c.org_id == org_id)
            .cloned()
            .collect())
    }

    async fn list_all_connections(&self) -> Result<Vec<Connection>> {
        Ok(self.state.read().connections.values().cloned().collect())
    }

    async fn upsert_declarative_connection(
        &self,
        org_id: i32,
        name: &str,
        connection_type: &str,
        config: serde_json::Value
    ) -> Result<Connection> {
        let mut state = self.state.write();
        let now = Utc::now();
        if let Some(existing) = state
            .connections
            .values_mut()
            .find(|c| c.org_id == org_id && c.name == name)
        {
            existing.connection_type = connection_type.to_string();
            existing.config = config;
            existing.is_declarative = true;
            existing.updated_at = now;
            return Ok(existing.clone());
        }

        let id = state.next_id();
        let connection = Connection {
            id,
            org_id,
            name: name.to_string(),
            connection_type: connection_type.to_string(),
            config,
            is_declarative: true,
            sync_status: ConnectionSyncStatus::SyncNeeded,
            synced_at: None,
            created_at: now,
            updated_at: now
        };
        state.connections.insert(id, connection.clone());
        Ok(connection)
    }

    async fn delete_connection(&self, id: i32) -> Result<()> {
        let mut state = self.state.write();
        state.connections.remove(&id);
        state.links.retain(|l| l.connection_id != id);
        state.connection_jobs.retain(|j| j.connection_id != id);
        Ok(())
    }

    async fn set_connection_sync_status(
        &self,
        id: i32,
        status: ConnectionSyncStatus,
        synced_at: Option<DateTime<Utc>>
    ) -> Result<()> {
        let mut state = self.state.write();
        let connection = state
            .connections
            .get_mut(&id)
            .ok_or_else(|| not_found("Connection", id))?;
        connection.sync_status = status;
        if synced_at.is_some() {
            connection.synced_at = synced_at;
        }
        connection.updated_at = Utc::now();
        Ok(())
    }

    async fn list_connections_for_repo(&self, repo_id: i32) -> Result<Vec<Connection>> {
        let state = self.state.read();
        let mut links: Vec<_> = state.links.iter().filter(|l| l.repo_id == repo_id).collect();
        links.sort_by_key(|l| l.seq);
        Ok(links
            .into_iter()
            .filter_map(|l| state.connections.get(&l.connection_id).cloned())
            .collect())
    }
}

#[async_trait]
impl RepoStore for InMemorySyncStore {
    async fn get_repo(&self, id: i32) -> Result<Option<Repo>> {
        Ok(self.state.read().repos.get(&id).cloned())
    }

    async fn list_repos(&self, org_id: i32) -> Result<Vec<Repo>> {
        Ok(self
            .state
            .read()
            .repos
            .values()
            .filter(|r| r.org_id == org_id)
            .cloned()
            .collect())
    }

    async fn list_all_repos(&self) -> Result<Vec<Repo>> {
        Ok(self.state.read().repos.values().cloned().collect())
    }

    async fn list_repos_for_connection(&self, connection_id: i32) -> Result<Vec<Repo>> {
        let state = self.state.read();
        Ok(state
            .links
            .iter()
            .filter(|l| l.connection_id == connection_id)
            .filter_map(|l| state.repos.get(&l.repo_id).cloned())
            .collect())
    }

    async fn list_orphaned_repos(&self) -> Result<Vec<Repo>> {
        let state = self.state.read();
        Ok(state
            .repos
            .values()
            .filter(|r| !state.links.iter().any(|l| l.repo_id == r.id))
            .cloned()
            .collect())
    }

    async fn list_repos_with_permission_cache(&self) -> Result<Vec<Repo>> {
        Ok(self
            .state
            .read()
            .repos
            .values()
            .filter(|r| r.cached_permitted_external_accounts.is_some())
            .cloned()
            .collect())
    }

    async fn find_repos_by_external_ids(
        &self,
        code_host_type: &str,
        external_ids: &[String]
    ) -> Result<Vec<Repo>> {
        Ok(self
            .state
            .read()
            .repos
            .values()
            .filter(|r| r.external_code_host_type == code_host_type && external_ids.contains(&r.external_id))
            .cloned()
            .collect())
    }

    async fn replace_connection_repos(
        &self,
        org_id: i32,
        connection_id: i32,
        repos: Vec<RepoUpsert>
    ) -> Result<Vec<i32>> {
        let mut state = self.state.write();
        if !state.connections.contains_key(&connection_id) {
            return Err(not_found("Connection", connection_id));
        }
        state.links.retain(|l| l.connection_id != connection_id);

        let now = Utc::now();
        let mut ids = Vec::with_capacity(repos.len());
        for upsert in repos {
            let existing = state
                .repos
                .values()
                .find(|r| {
                    r.org_id == org_id
                        && r.external_id == upsert.external_id
                        && r.external_code_host_url == upsert.external_code_host_url
                })
                .map(|r| r.id);

            let id = match existing {
                Some(id) => {
                    if let Some(repo) = state.repos.get_mut(&id) {
                        repo.name = upsert.name;
                        repo.display_name = upsert.display_name;
                        repo.clone_url = upsert.clone_url;
                        repo.web_url = upsert.web_url;
                        repo.external_code_host_type = upsert.external_code_host_type;
                        repo.is_fork = upsert.is_fork;
                        repo.is_archived = upsert.is_archived;
                        repo.is_public = upsert.is_public;
                        // Revision globs and git config come from the connection;
                        // indexing results survive the resync.
                        repo.metadata.branches = upsert.metadata.branches;
                        repo.metadata.tags = upsert.metadata.tags;
                        repo.metadata.git_config = upsert.metadata.git_config;
                        repo.updated_at = now;
                    }
                    id
                }
                None => {
                    let id = state.next_id();
                    state.repos.insert(
                        id,
                        Repo {
                            id,
                            org_id,
                            name: upsert.name,
                            display_name: upsert.display_name,
                            clone_url: upsert.clone_url,
                            web_url: upsert.web_url,
                            external_id: upsert.external_id,
                            external_code_host_type: upsert.external_code_host_type,
                            external_code_host_url: upsert.external_code_host_url,
                            is_fork: upsert.is_fork,
                            is_archived: upsert.is_archived,
                            is_public: upsert.is_public,
                            metadata: upsert.metadata,
                            cached_permitted_external_accounts: None,
                            indexed_at: None,
                            indexed_commit_hash: None,
                            permission_synced_at: None,
                            created_at: now,
                            updated_at: now
                        }
                    );
                    id
                }
            };
            state.link(id, connection_id);
            ids.push(id);
        }
        Ok(ids)
    }

    async fn mark_repo_indexed(
        &self,
        repo_id: i32,
        indexed_at: DateTime<Utc>,
        commit_hash: Option<String>,
        indexed_revisions: Vec<String>
    ) -> Result<()> {
        let mut state = self.state.write();
        let repo = state
            .repos
            .get_mut(&repo_id)
            .ok_or_else(|| not_found("Repo", repo_id))?;
        repo.indexed_at = Some(indexed_at);
        repo.indexed_commit_hash = commit_hash;
        repo.metadata.indexed_revisions = Some(indexed_revisions);
        repo.updated_at = Utc::now();
        Ok(())
    }

    async fn set_repo_permission_cache(
        &self,
        repo_id: i32,
        provider: &str,
        external_account_ids: Vec<String>,
        synced_at: DateTime<Utc>
    ) -> Result<()> {
        let mut state = self.state.write();
        let repo = state
            .repos
            .get_mut(&repo_id)
            .ok_or_else(|| not_found("Repo", repo_id))?;

        let mut cache = match repo.cached_permitted_external_accounts.take() {
            Some(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new()
        };
        cache.insert(
            provider.to_string(),
            serde_json::Value::from(external_account_ids)
        );
        repo.cached_permitted_external_accounts = Some(serde_json::Value::Object(cache));
        repo.permission_synced_at = Some(synced_at);
        Ok(())
    }

    async fn delete_repo(&self, id: i32) -> Result<()> {
        self.state.write().remove_repo(id);
        Ok(())
    }
}

#[async_trait]
impl SearchContextStore for InMemorySyncStore {
    async fn list_search_contexts(&self, org_id: i32) -> Result<Vec<SearchContext>> {
        Ok(self
            .state
            .read()
            .contexts
            .values()
            .filter(|c| c.org_id == org_id)
            .cloned()
            .collect())
    }

    async fn upsert_search_context(
        &self,
        org_id: i32,
        name: &str,
        description: Option<String>,
        mut repo_ids: Vec<i32>
    ) -> Result<SearchContext> {
        let mut state = self.state.write();
        repo_ids.retain(|id| state.repos.contains_key(id));
        repo_ids.sort_unstable();
        repo_ids.dedup();

        if let Some(existing) = state
            .contexts
            .values_mut()
            .find(|c| c.org_id == org_id && c.name == name)
        {
            existing.description = description;
            existing.repo_ids = repo_ids;
            return Ok(existing.clone());
        }

        let id = state.next_id();
        let context = SearchContext {
            id,
            org_id,
            name: name.to_string(),
            description,
            repo_ids
        };
        state.contexts.insert(id, context.clone());
        Ok(context)
    }

    async fn delete_search_context(&self, id: i32) -> Result<()> {
        self.state.write().contexts.remove(&id);
        Ok(())
    }
}

#[async_trait]
impl PermissionStore for InMemorySyncStore {
    async fn upsert_account(&self, mut account: Account) -> Result<()> {
        let mut state = self.state.write();
        if let Some(existing) = state.accounts.get(&account.id) {
            if account.access_token.is_none() {
                account.access_token.clone_from(&existing.access_token);
            }
            account.permission_synced_at = existing.permission_synced_at;
        }
        state.accounts.insert(account.id.clone(), account);
        Ok(())
    }

    async fn get_account(&self, id: &str) -> Result<Option<Account>> {
        Ok(self.state.read().accounts.get(id).cloned())
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        Ok(self.state.read().accounts.values().cloned().collect())
    }

    async fn find_accounts_by_provider_ids(
        &self,
        provider: &str,
        provider_account_ids: &[String]
    ) -> Result<Vec<Account>> {
        Ok(self
            .state
            .read()
            .accounts
            .values()
            .filter(|a| a.provider == provider && provider_account_ids.contains(&a.provider_account_id))
            .cloned()
            .collect())
    }

    async fn grant_repo_permissions(&self, account_id: &str, repo_ids: &[i32]) -> Result<u64> {
        let mut state = self.state.write();
        if !state.accounts.contains_key(account_id) {
            return Err(not_found("Account", account_id));
        }
        let mut inserted = 0;
        for repo_id in repo_ids {
            if state.repos.contains_key(repo_id)
                && state.permissions.insert((account_id.to_string(), *repo_id))
            {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn replace_repo_permissions(&self, repo_id: i32, account_ids: &[String]) -> Result<()> {
        let mut state = self.state.write();
        if !state.repos.contains_key(&repo_id) {
            return Err(not_found("Repo", repo_id));
        }
        state.permissions.retain(|(_, r)| *r != repo_id);
        for account_id in account_ids {
            if state.accounts.contains_key(account_id) {
                state.permissions.insert((account_id.clone(), repo_id));
            }
        }
        Ok(())
    }

    async fn list_repo_permissions(&self, repo_id: i32) -> Result<Vec<String>> {
        Ok(self
            .state
            .read()
            .permissions
            .iter()
            .filter(|(_, r)| *r == repo_id)
            .map(|(a, _)| a.clone())
            .collect())
    }

    async fn replace_account_permissions(&self, account_id: &str, repo_ids: &[i32]) -> Result<()> {
        let mut state = self.state.write();
        if !state.accounts.contains_key(account_id) {
            return Err(not_found("Account", account_id));
        }
        state.permissions.retain(|(a, _)| a != account_id);
        for repo_id in repo_ids {
            if state.repos.contains_key(repo_id) {
                state.permissions.insert((account_id.to_string(), *repo_id));
            }
        }
        Ok(())
    }

    async fn list_account_permissions(&self, account_id: &str) -> Result<Vec<i32>> {
        Ok(self
            .state
            .read()
            .permissions
            .iter()
            .filter(|(a, _)| a == account_id)
            .map(|(_, r)| *r)
            .collect())
    }

    async fn set_account_permission_synced_at(
        &self,
        account_id: &str,
        synced_at: DateTime<Utc>
    ) -> Result<()> {
        let mut state = self.state.write();
        let account = state
            .accounts
            .get_mut(account_id)
            .ok_or_else(|| not_found("Account", account_id))?;
        account.permission_synced_at = Some(synced_at);
        Ok(())
    }
}

fn newest_first<T>(mut jobs: Vec<T>, created_at: impl Fn(&T) -> DateTime<Utc>) -> Vec<T> {
    jobs.sort_by_key(|j| std::cmp::Reverse(created_at(j)));
    jobs
}

#[async_trait]
impl JobStore for InMemorySyncStore {
    async fn create_connection_sync_job(&self, connection_id: i32) -> Result<ConnectionSyncJob> {
        let mut state = self.state.write();
        if !state.connections.contains_key(&connection_id) {
            return Err(not_found("Connection", connection_id));
        }
        let now = Utc::now();
        let job = ConnectionSyncJob {
            id: Uuid::new_v4(),
            connection_id,
            status: JobStatus::Pending,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None
        };
        state.connection_jobs.push(job.clone());
        Ok(job)
    }

    async fn get_connection_sync_job(&self, id: Uuid) -> Result<Option<ConnectionSyncJob>> {
        Ok(self
            .state
            .read()
            .connection_jobs
            .iter()
            .find(|j| j.id == id)
            .cloned())
    }

    async fn update_connection_sync_job(&self, id: Uuid, update: JobUpdate) -> Result<ConnectionSyncJob> {
        let mut state = self.state.write();
        let job = state
            .connection_jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| not_found("ConnectionSyncJob", id))?;
        apply_update(
            &mut job.status,
            &mut job.error_message,
            &mut job.updated_at,
            &mut job.completed_at,
            &update
        );
        Ok(job.clone())
    }

    async fn list_connection_sync_jobs(&self, connection_id: i32) -> Result<Vec<ConnectionSyncJob>> {
        let jobs = self
            .state
            .read()
            .connection_jobs
            .iter()
            .filter(|j| j.connection_id == connection_id)
            .cloned()
            .collect();
        Ok(newest_first(jobs, |j| j.created_at))
    }

    async fn create_repo_indexing_job(
        &self,
        repo_id: i32,
        job_type: RepoIndexingJobType
    ) -> Result<RepoIndexingJob> {
        let mut state = self.state.write();
        if !state.repos.contains_key(&repo_id) {
            return Err(not_found("Repo", repo_id));
        }
        let now = Utc::now();
        let job = RepoIndexingJob {
            id: Uuid::new_v4(),
            repo_id,
            job_type,
            status: JobStatus::Pending,
            error_message: None,
            metadata: None,
            created_at: now,
            updated_at: now,
            completed_at: None
        };
        state.index_jobs.push(job.clone());
        Ok(job)
    }

    async fn get_repo_indexing_job(&self, id: Uuid) -> Result<Option<RepoIndexingJob>> {
        Ok(self
            .state
            .read()
            .index_jobs
            .iter()
            .find(|j| j.id == id)
            .cloned())
    }

    async fn update_repo_indexing_job(&self, id: Uuid, update: JobUpdate) -> Result<RepoIndexingJob> {
        let mut state = self.state.write();
        let job = state
            .index_jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| not_found("RepoIndexingJob", id))?;
        apply_update(
            &mut job.status,
            &mut job.error_message,
            &mut job.updated_at,
            &mut job.completed_at,
            &update
        );
        if update.metadata.is_some() {
            job.metadata = update.metadata;
        }
        Ok(job.clone())
    }

    async fn list_repo_indexing_jobs(&self, repo_id: i32) -> Result<Vec<RepoIndexingJob>> {
        let jobs = self
            .state
            .read()
            .index_jobs
            .iter()
            .filter(|j| j.repo_id == repo_id)
            .cloned()
            .collect();
        Ok(newest_first(jobs, |j| j.created_at))
    }

    async fn create_permission_sync_job(&self, repo_id: i32) -> Result<RepoPermissionSyncJob> {
        let mut state = self.state.write();
        if !state.repos.contains_key(&repo_id) {
            return Err(not_found("Repo", repo_id));
        }
        let now = Utc::now();
        let job = RepoPermissionSyncJob {
            id: Uuid::new_v4(),
            repo_id,
            status: JobStatus::Pending,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None
        };
        state.permission_jobs.push(job.clone());
        Ok(job)
    }

    async fn get_permission_sync_job(&self, id: Uuid) -> Result<Option<RepoPermissionSyncJob>> {
        Ok(self
            .state
            .read()
            .permission_jobs
            .iter()
            .find(|j| j.id == id)
            .cloned())
    }

    async fn update_permission_sync_job(
        &self,
        id: Uuid,
        update: JobUpdate
    ) -> Result<RepoPermissionSyncJob> {
        let mut state = self.state.write();
        let job = state
            .permission_jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| not_found("RepoPermissionSyncJob", id))?;
        apply_update(
            &mut job.status,
            &mut job.error_message,
            &mut job.updated_at,
            &mut job.completed_at,
            &update
        );
        Ok(job.clone())
    }

    async fn list_permission_sync_jobs(&self, repo_id: i32) -> Result<Vec<RepoPermissionSyncJob>> {
        let jobs = self
            .state
            .read()
            .permission_jobs
            .iter()
            .filter(|j| j.repo_id == repo_id)
            .cloned()
            .collect();
        Ok(newest_first(jobs, |j| j.created_at))
    }

    async fn create_account_permission_sync_job(
        &self,
        account_id: &str
    ) -> Result<AccountPermissionSyncJob> {
        let mut state = self.state.write();
        if !state.accounts.contains_key(account_id) {
            return Err(not_found("Account", account_id));
        }
        let now = Utc::now();
        let job = AccountPermissionSyncJob {
            id: Uuid::new_v4(),
            account_id: account_id.to_string(),
            status: JobStatus::Pending,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None
        };
        state.account_jobs.push(job.clone());
        Ok(job)
    }

    async fn get_account_permission_sync_job(
        &self,
        id: Uuid
    ) -> Result<Option<AccountPermissionSyncJob>> {
        Ok(self
            .state
            .read()
            .account_jobs
            .iter()
            .find(|j| j.id == id)
            .cloned())
    }

    async fn update_account_permission_sync_job(
        &self,
        id: Uuid,
        update: JobUpdate
    ) -> Result<AccountPermissionSyncJob> {
        let mut state = self.state.write();
        let job = state
            .account_jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| not_found("AccountPermissionSyncJob", id))?;
        apply_update(
            &mut job.status,
            &mut job.error_message,
            &mut job.updated_at,
            &mut job.completed_at,
            &update
        );
        Ok(job.clone())
    }

    async fn list_account_permission_sync_jobs(
        &self,
        account_id: &str
    ) -> Result<Vec<AccountPermissionSyncJob>> {
        let jobs = self
            .state
            .read()
            .account_jobs
            .iter()
            .filter(|j| j.account_id == account_id)
            .cloned()
            .collect();
        Ok(newest_first(jobs, |j| j.created_at))
    }
}

#[async_trait]
impl SecretStore for InMemorySyncStore {
    async fn get_secret(&self, org_id: i32, key: &str) -> Result<Option<Secret>> {
        Ok(self
            .state
            .read()
            .secrets
            .get(&(org_id, key.to_string()))
            .cloned())
    }

    async fn put_secret(&self, secret: Secret) -> Result<()> {
        if secret.key.is_empty() {
            return Err(StorageError::SerializationError {
                reason: "secret key must not be empty".to_string()
            });
        }
        self.state
            .write()
            .secrets
            .insert((secret.org_id, secret.key.clone()), secret);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RepoMetadata;
    use serde_json::json;

    fn upsert(external_id: &str) -> RepoUpsert {
        RepoUpsert {
            name: format!("github.com/acme/{external_id}"),
            display_name: Some(format!("acme/{external_id}")),
            clone_url: format!("https://github.com/acme/{external_id}.git"),
            web_url: None,
            external_id: external_id.to_string(),
            external_code_host_type: "github".to_string(),
            external_code_host_url: "https://github.com".to_string(),
            is_fork: false,
            is_archived: false,
            is_public: true,
            metadata: RepoMetadata::default()
        }
    }

    #[tokio::test]
    async fn test_upsert_connection_is_keyed_by_name() {
        let store = InMemorySyncStore::new();
        let first = store
            .upsert_declarative_connection(1, "c1", "github", json!({"type": "github"}))
            .await
            .unwrap();
        let second = store
            .upsert_declarative_connection(1, "c1", "github", json!({"type": "github", "orgs": ["a"]}))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.list_connections(1).await.unwrap().len(), 1);
        assert_eq!(second.config["orgs"][0], "a");
    }

    #[tokio::test]
    async fn test_replace_connection_repos_relinks_and_keeps_shared_repos() {
        let store = InMemorySyncStore::new();
        let a = store
            .upsert_declarative_connection(1, "a", "github", json!({}))
            .await
            .unwrap();
        let b = store
            .upsert_declarative_connection(1, "b", "github", json!({}))
            .await
            .unwrap();

        let ids_a = store
            .replace_connection_repos(1, a.id, vec![upsert("r1"), upsert("r2")])
            .await
            .unwrap();
        let ids_b = store
            .replace_connection_repos(1, b.id, vec![upsert("r2")])
            .await
            .unwrap();
        assert_eq!(ids_a[1], ids_b[0], "same external id upserts the same row");

        store
            .replace_connection_repos(1, a.id, vec![upsert("r1")])
            .await
            .unwrap();
        assert_eq!(store.list_repos_for_connection(a.id).await.unwrap().len(), 1);
        assert!(store.list_orphaned_repos().await.unwrap().is_empty());

        store.delete_connection(b.id).await.unwrap();
        let orphans = store.list_orphaned_repos().await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].external_id, "r2");

        let linked = store.list_connections_for_repo(ids_a[0]).await.unwrap();
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0].name, "a");
    }

    #[tokio::test]
    async fn test_permission_cache_write_back_merges_providers() {
        let store = InMemorySyncStore::new();
        let c = store
            .upsert_declarative_connection(1, "a", "github", json!({}))
            .await
            .unwrap();
        let ids = store
            .replace_connection_repos(1, c.id, vec![upsert("r1")])
            .await
            .unwrap();

        let now = Utc::now();
        store
            .set_repo_permission_cache(ids[0], "github", vec!["1".to_string()], now)
            .await
            .unwrap();
        store
            .set_repo_permission_cache(ids[0], "gitlab", vec!["9".to_string()], now)
            .await
            .unwrap();

        let repo = store.get_repo(ids[0]).await.unwrap().unwrap();
        let cache = repo.permitted_accounts().unwrap().unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(repo.permission_synced_at, Some(now));
        assert_eq!(store.list_repos_with_permission_cache().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_job_update_stamps_completion() {
        let store = InMemorySyncStore::new();
        let c = store
            .upsert_declarative_connection(1, "a", "git", json!({}))
            .await
            .unwrap();
        let job = store.create_connection_sync_job(c.id).await.unwrap();
        assert!(job.completed_at.is_none());

        let running = store
            .update_connection_sync_job(job.id, JobUpdate::status(JobStatus::InProgress))
            .await
            .unwrap();
        assert!(running.completed_at.is_none());

        let failed = store
            .update_connection_sync_job(job.id, JobUpdate::failed("boom"))
            .await
            .unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("boom"));
        assert!(failed.completed_at.is_some());

        assert!(matches!(
            store
                .update_connection_sync_job(Uuid::new_v4(), JobUpdate::status(JobStatus::Completed))
                .await,
            Err(StorageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_replace_account_permissions_drops_stale_grants() {
        let store = InMemorySyncStore::new();
        let c = store
            .upsert_declarative_connection(1, "a", "github", json!({}))
            .await
            .unwrap();
        let ids = store
            .replace_connection_repos(1, c.id, vec![upsert("r1"), upsert("r2")])
            .await
            .unwrap();
        store
            .upsert_account(Account {
                id: "acc".to_string(),
                user_id: "u".to_string(),
                provider: "github".to_string(),
                provider_account_id: "1".to_string(),
                access_token: Some("gho".to_string()),
                permission_synced_at: None
            })
            .await
            .unwrap();
        store.grant_repo_permissions("acc", &[ids[0]]).await.unwrap();

        store
            .replace_account_permissions("acc", &[ids[1], 4242])
            .await
            .unwrap();
        assert_eq!(store.list_account_permissions("acc").await.unwrap(), vec![ids[1]]);

        let found = store
            .find_repos_by_external_ids("github", &["r2".to_string(), "r9".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, ids[1]);
        assert!(store
            .find_repos_by_external_ids("gitlab", &["r2".to_string()])
            .await
            .unwrap()
            .is_empty());
        assert!(matches!(
            store.replace_account_permissions("missing", &[]).await,
            Err(StorageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_repo_cascades() {
        let store = InMemorySyncStore::new();
        let c = store
            .upsert_declarative_connection(1, "a", "github", json!({}))
            .await
            .unwrap();
        let ids = store
            .replace_connection_repos(1, c.id, vec![upsert("r1")])
            .await
            .unwrap();
        store
            .upsert_account(Account {
                id: "acc".to_string(),
                user_id: "u".to_string(),
                provider: "github".to_string(),
                provider_account_id: "1".to_string(),
                access_token: None,
                permission_synced_at: None
            })
            .await
            .unwrap();
        store.grant_repo_permissions("acc", &ids).await.unwrap();
        store
            .upsert_search_context(1, "ctx", None, ids.clone())
            .await
            .unwrap();
        store
            .create_repo_indexing_job(ids[0], RepoIndexingJobType::Index)
            .await
            .unwrap();

        store.delete_repo(ids[0]).await.unwrap();
        assert!(store.list_repo_permissions(ids[0]).await.unwrap().is_empty());
        assert!(store.list_repo_indexing_jobs(ids[0]).await.unwrap().is_empty());
        assert!(store.list_search_contexts(1).await.unwrap()[0].repo_ids.is_empty());
    }
}
