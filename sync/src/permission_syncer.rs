//! # Repo permission sync
//!
//! Each job asks the code host who can read one repo and replaces that
//! repo's permission rows with the answer. An empty answer is trusted and
//! clears the rows. The collaborator ids are also written back to the
//! repo's permission cache for [`crate::permissions::PermissionCacheRebuilder`].

use crate::codehost::CollaboratorSource;
use crate::credentials::RepoCredentialProvider;
use crate::entitlements::{Entitlements, PERMISSION_SYNCING};
use crate::queue::{JobHandler, JobQueue, QueueSettings};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use config::Settings;
use errors::{JobError, PermissionSyncError, QueueError, StorageError};
use observability::{JobLabels, JobQueueKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use storage::{JobStatus, JobUpdate, QueueBackend, Repo, RepoPermissionSyncJob, SyncStore};
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const SUPPORTED_CODE_HOST_TYPES: &[&str] = &["github"];
pub const PERMISSION_SYNC_MAX_ATTEMPTS: u32 = 3;
const PERMISSION_SYNC_CONCURRENCY: usize = 1;
const SCHEDULE: &str = "*/30 * * * * *";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionSyncPayload {
    pub job_id: Uuid,
    pub repo_id: i32,
    pub repo_name: String
}

pub struct PermissionSyncHandler {
    store: Arc<dyn SyncStore>,
    credentials: Arc<RepoCredentialProvider>,
    collaborators: Arc<dyn CollaboratorSource>
}

impl PermissionSyncHandler {
    pub fn new(
        store: Arc<dyn SyncStore>,
        credentials: Arc<RepoCredentialProvider>,
        collaborators: Arc<dyn CollaboratorSource>
    ) -> Self {
        Self {
            store,
            credentials,
            collaborators
        }
    }
}

#[async_trait]
impl JobHandler for PermissionSyncHandler {
    type Payload = PermissionSyncPayload;
    /// Number of accounts granted access.
    type Output = usize;

    fn labels(&self, payload: &PermissionSyncPayload) -> JobLabels {
        JobLabels::repo(&payload.repo_name)
    }

    async fn process(&self, payload: &PermissionSyncPayload) -> Result<usize, JobError> {
        let job = self
            .store
            .get_permission_sync_job(payload.job_id)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                entity: "RepoPermissionSyncJob".to_string(),
                id: payload.job_id.to_string()
            })?;
        if !job.status.is_active() {
            return Err(JobError::InvalidJobState {
                job_id: payload.job_id.to_string(),
                actual: job.status.to_string()
            });
        }
        self.store
            .update_permission_sync_job(payload.job_id, JobUpdate::status(JobStatus::InProgress))
            .await?;

        let repo_id = payload.repo_id;
        let repo = self
            .store
            .get_repo(repo_id)
            .await?
            .ok_or(PermissionSyncError::RepoNotFound { repo_id })?;
        info!(repo_id, "Syncing permissions for repo {}", repo.display_name.as_deref().unwrap_or(&repo.name));

        let credentials = self
            .credentials
            .for_repo(&repo)
            .await?
            .ok_or(PermissionSyncError::NoCredentials { repo_id })?;
        let (owner, name) = repo
            .display_name
            .as_deref()
            .and_then(|d| d.split_once('/'))
            .ok_or(PermissionSyncError::MissingDisplayName { repo_id })?;

        let provider = repo.external_code_host_type.as_str();
        let external_ids = self
            .collaborators
            .list_collaborators(provider, &credentials.host_url, &credentials.token, owner, name)
            .await?;

        let account_ids: Vec<String> = self
            .store
            .find_accounts_by_provider_ids(provider, &external_ids)
            .await?
            .into_iter()
            .map(|a| a.id)
            .collect();

        self.store.replace_repo_permissions(repo_id, &account_ids).await?;
        self.store
            .set_repo_permission_cache(repo_id, provider, external_ids, Utc::now())
            .await?;

        Ok(account_ids.len())
    }

    async fn on_completed(&self, payload: &PermissionSyncPayload, granted: usize) -> Result<(), JobError> {
        self.store
            .update_permission_sync_job(payload.job_id, JobUpdate::status(JobStatus::Completed))
            .await?;
        info!(repo = %payload.repo_name, granted, "Permissions synced for repo {}", payload.repo_name);
        Ok(())
    }

    async fn on_failed(&self, payload: &PermissionSyncPayload, error: &JobError, is_final: bool) -> Result<(), JobError> {
        if !is_final {
            warn!(repo = %payload.repo_name, error = %error, "Repo permission sync job failed, retrying");
            return Ok(());
        }
        if matches!(error, JobError::InvalidJobState { .. }) {
            warn!(job_id = %payload.job_id, error = %error, "Skipped repo permission sync job");
            return Ok(());
        }
        self.store
            .update_permission_sync_job(payload.job_id, JobUpdate::failed(error.to_string()))
            .await?;
        error!(repo = %payload.repo_name, error = %error, "Repo permission sync job failed for repo {}", payload.repo_name);
        Ok(())
    }
}

/// Whether a repo should get a permission sync job now.
pub fn is_permission_sync_due(
    repo: &Repo,
    jobs: &[RepoPermissionSyncJob],
    now: DateTime<Utc>,
    interval: ChronoDuration
) -> bool {
    if !SUPPORTED_CODE_HOST_TYPES.contains(&repo.external_code_host_type.as_str()) {
        return false;
    }
    let threshold = now - interval;
    let stale = repo.permission_synced_at.is_none_or(|at| at < threshold);
    let blocked = jobs.iter().any(|job| {
        job.status.is_active()
            || (job.status == JobStatus::Failed && job.completed_at.is_some_and(|at| at > threshold))
    });
    stale && !blocked
}

pub struct RepoPermissionSyncer {
    store: Arc<dyn SyncStore>,
    queue: Arc<JobQueue<PermissionSyncHandler>>,
    entitlements: Entitlements,
    interval: ChronoDuration
}

impl RepoPermissionSyncer {
    pub fn new(
        store: Arc<dyn SyncStore>,
        backend: Arc<dyn QueueBackend>,
        handler: PermissionSyncHandler,
        entitlements: Entitlements,
        settings: &Settings
    ) -> Self {
        let queue_settings = QueueSettings {
            concurrency: PERMISSION_SYNC_CONCURRENCY,
            max_attempts: PERMISSION_SYNC_MAX_ATTEMPTS,
            ..QueueSettings::default()
        };
        Self {
            store,
            queue: Arc::new(JobQueue::new(
                backend,
                Arc::new(handler),
                JobQueueKind::PermissionSync,
                queue_settings
            )),
            entitlements,
            interval: crate::connection_manager::millis(settings.repo_driven_permission_sync_interval_ms)
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue<PermissionSyncHandler>> {
        &self.queue
    }

    pub async fn create_jobs(&self, repos: &[Repo]) -> Result<Vec<Uuid>, JobError> {
        let mut ids = Vec::with_capacity(repos.len());
        for repo in repos {
            let job = self.store.create_permission_sync_job(repo.id).await?;
            let payload = PermissionSyncPayload {
                job_id: job.id,
                repo_id: repo.id,
                repo_name: repo.name.clone()
            };
            self.queue.enqueue(job.id, &payload).await?;
            ids.push(job.id);
        }
        Ok(ids)
    }

    pub async fn repos_due(&self, now: DateTime<Utc>) -> Result<Vec<Repo>, JobError> {
        let mut due = Vec::new();
        for repo in self.store.list_all_repos().await? {
            let jobs = self.store.list_permission_sync_jobs(repo.id).await?;
            if is_permission_sync_due(&repo, &jobs, now, self.interval) {
                due.push(repo);
            }
        }
        Ok(due)
    }

    pub async fn schedule_due(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, JobError> {
        let due = self.repos_due(now).await?;
        if due.is_empty() {
            return Ok(Vec::new());
        }
        info!(count = due.len(), "Scheduling permission sync jobs");
        self.create_jobs(&due).await
    }

    /// Spawns the worker pool and the cron scheduler. Refuses to start when
    /// permission syncing is not licensed.
    pub async fn start(self: &Arc<Self>, shutdown: CancellationToken) -> Result<Vec<JoinHandle<()>>, JobError> {
        if !self.entitlements.has(PERMISSION_SYNCING) {
            return Err(PermissionSyncError::NotEntitled.into());
        }
        let scheduler_error = |e: tokio_cron_scheduler::JobSchedulerError| QueueError::Backend {
            queue: self.queue.name().to_string(),
            reason: e.to_string()
        };

        let mut scheduler = JobScheduler::new().await.map_err(scheduler_error)?;
        let syncer = Arc::clone(self);
        let job = Job::new_async(SCHEDULE, move |_uuid, _lock| {
            let syncer = syncer.clone();
            Box::pin(async move {
                if let Err(e) = syncer.schedule_due(Utc::now()).await {
                    error!(error = %e, "Permission sync scheduling failed");
                }
            })
        })
        .map_err(scheduler_error)?;
        scheduler.add(job).await.map_err(scheduler_error)?;
        scheduler.start().await.map_err(scheduler_error)?;
        info!("Permission sync scheduler started");

        let worker = tokio::spawn(self.queue.clone().run(shutdown.clone()));
        let stopper = tokio::spawn(async move {
            shutdown.cancelled().await;
            if let Err(e) = scheduler.shutdown().await {
                warn!(error = %e, "Failed to stop permission sync scheduler");
            }
        });
        Ok(vec![worker, stopper])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialResolver;
    use parking_lot::Mutex;
    use serde_json::json;
    use serial_test::serial;
    use storage::{
        Account, ConnectionStore, InMemoryQueueBackend, InMemorySyncStore, JobStore, PermissionStore,
        RepoMetadata, RepoStore, RepoUpsert
    };

    const TOKEN_VAR: &str = "PERMISSION_SYNCER_TEST_TOKEN";

    struct FakeCollaborators {
        ids: Mutex<Vec<String>>,
        calls: Mutex<Vec<(String, String)>>
    }

    #[async_trait]
    impl CollaboratorSource for FakeCollaborators {
        async fn list_collaborators(
            &self,
            _code_host_type: &str,
            _host_url: &str,
            token: &str,
            owner: &str,
            repo: &str
        ) -> Result<Vec<String>, JobError> {
            assert_eq!(token, "ghp_test");
            self.calls.lock().push((owner.to_string(), repo.to_string()));
            Ok(self.ids.lock().clone())
        }
    }

    fn upsert(name: &str, display_name: Option<&str>) -> RepoUpsert {
        RepoUpsert {
            name: name.to_string(),
            display_name: display_name.map(String::from),
            clone_url: format!("https://{name}.git"),
            web_url: None,
            external_id: name.to_string(),
            external_code_host_type: "github".to_string(),
            external_code_host_url: "https://github.com".to_string(),
            is_fork: false,
            is_archived: false,
            is_public: false,
            metadata: RepoMetadata::default()
        }
    }

    struct Fixture {
        store: Arc<InMemorySyncStore>,
        syncer: Arc<RepoPermissionSyncer>,
        collaborators: Arc<FakeCollaborators>,
        repo_ids: Vec<i32>
    }

    async fn fixture(token: Option<serde_json::Value>, entitlements: Entitlements) -> Fixture {
        let store = Arc::new(InMemorySyncStore::new());
        let mut config = json!({"type": "github", "orgs": ["acme"]});
        if let Some(token) = token {
            config["token"] = token;
        }
        let connection = store
            .upsert_declarative_connection(1, "gh", "github", config)
            .await
            .unwrap();
        let repo_ids = store
            .replace_connection_repos(
                1,
                connection.id,
                vec![
                    upsert("github.com/acme/web", Some("acme/web")),
                    upsert("github.com/acme/nameless", None),
                ]
            )
            .await
            .unwrap();
        for (id, provider_id) in [("a1", "1"), ("a2", "2"), ("a3", "3")] {
            store
                .upsert_account(Account {
                    id: id.to_string(),
                    user_id: format!("u-{id}"),
                    provider: "github".to_string(),
                    provider_account_id: provider_id.to_string(),
                    access_token: None,
                    permission_synced_at: None
                })
                .await
                .unwrap();
        }

        let collaborators = Arc::new(FakeCollaborators {
            ids: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new())
        });
        let credentials = Arc::new(RepoCredentialProvider::new(
            store.clone(),
            Arc::new(CredentialResolver::new(store.clone()))
        ));
        let handler = PermissionSyncHandler::new(store.clone(), credentials, collaborators.clone());
        let syncer = Arc::new(RepoPermissionSyncer::new(
            store.clone(),
            Arc::new(InMemoryQueueBackend::new()),
            handler,
            entitlements,
            &Settings::default()
        ));
        Fixture {
            store,
            syncer,
            collaborators,
            repo_ids
        }
    }

    fn payload(job_id: Uuid, repo_id: i32) -> PermissionSyncPayload {
        PermissionSyncPayload {
            job_id,
            repo_id,
            repo_name: "github.com/acme/web".to_string()
        }
    }

    #[tokio::test]
    #[serial]
    async fn test_sync_replaces_permissions_and_writes_cache() {
        unsafe { std::env::set_var(TOKEN_VAR, "ghp_test") };
        let f = fixture(Some(json!({"env": TOKEN_VAR})), Entitlements::all()).await;
        let web = f.repo_ids[0];
        f.store
            .replace_repo_permissions(web, &["a1".to_string(), "a2".to_string(), "a3".to_string()])
            .await
            .unwrap();

        *f.collaborators.ids.lock() = vec!["2".to_string(), "999".to_string()];
        let web_repo = f.store.get_repo(web).await.unwrap().unwrap();
        let ids = f.syncer.create_jobs(std::slice::from_ref(&web_repo)).await.unwrap();
        let handler = f.syncer.queue().handler();
        let p = payload(ids[0], web);

        let granted = handler.process(&p).await.unwrap();
        assert_eq!(granted, 1);
        handler.on_completed(&p, granted).await.unwrap();

        assert_eq!(f.store.list_repo_permissions(web).await.unwrap(), vec!["a2".to_string()]);
        assert_eq!(
            f.collaborators.calls.lock().clone(),
            vec![("acme".to_string(), "web".to_string())]
        );
        let repo = f.store.get_repo(web).await.unwrap().unwrap();
        let cache = repo.permitted_accounts().unwrap().unwrap();
        assert_eq!(cache["github"], vec!["2".to_string(), "999".to_string()]);
        assert!(repo.permission_synced_at.is_some());
        let job = f.store.get_permission_sync_job(ids[0]).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);

        // An empty snapshot clears every row.
        f.collaborators.ids.lock().clear();
        let ids = f.syncer.create_jobs(&[repo]).await.unwrap();
        handler.process(&payload(ids[0], web)).await.unwrap();
        assert!(f.store.list_repo_permissions(web).await.unwrap().is_empty());

        unsafe { std::env::remove_var(TOKEN_VAR) };
    }

    #[tokio::test]
    async fn test_missing_credentials_fail_loud() {
        let f = fixture(None, Entitlements::all()).await;
        let web = f.store.get_repo(f.repo_ids[0]).await.unwrap().unwrap();
        let ids = f.syncer.create_jobs(&[web]).await.unwrap();
        let handler = f.syncer.queue().handler();
        let p = payload(ids[0], f.repo_ids[0]);

        let err = handler.process(&p).await.unwrap_err();
        assert!(matches!(
            err,
            JobError::Permission(PermissionSyncError::NoCredentials { .. })
        ));
        assert!(err.is_retryable());

        handler.on_failed(&p, &err, true).await.unwrap();
        let job = f.store.get_permission_sync_job(ids[0]).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test]
    #[serial]
    async fn test_missing_display_name_fails() {
        unsafe { std::env::set_var(TOKEN_VAR, "ghp_test") };
        let f = fixture(Some(json!({"env": TOKEN_VAR})), Entitlements::all()).await;
        let nameless = f.store.get_repo(f.repo_ids[1]).await.unwrap().unwrap();
        let ids = f.syncer.create_jobs(&[nameless]).await.unwrap();

        let err = f
            .syncer
            .queue()
            .handler()
            .process(&payload(ids[0], f.repo_ids[1]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            JobError::Permission(PermissionSyncError::MissingDisplayName { .. })
        ));
        unsafe { std::env::remove_var(TOKEN_VAR) };
    }

    #[tokio::test]
    async fn test_scheduler_eligibility() {
        let f = fixture(None, Entitlements::all()).await;
        let now = Utc::now();
        assert_eq!(f.syncer.repos_due(now).await.unwrap().len(), 2);

        f.syncer.schedule_due(now).await.unwrap();
        // Pending jobs block another enqueue.
        assert!(f.syncer.repos_due(now).await.unwrap().is_empty());
        assert_eq!(f.syncer.queue().pending_count().await.unwrap(), 2);
    }

    #[test]
    fn test_unsupported_code_host_is_never_due() {
        let now = Utc::now();
        let repo = Repo {
            id: 1,
            org_id: 1,
            name: "gitlab.com/acme/web".to_string(),
            display_name: Some("acme/web".to_string()),
            clone_url: String::new(),
            web_url: None,
            external_id: "1".to_string(),
            external_code_host_type: "gitlab".to_string(),
            external_code_host_url: "https://gitlab.com".to_string(),
            is_fork: false,
            is_archived: false,
            is_public: false,
            metadata: RepoMetadata::default(),
            cached_permitted_external_accounts: None,
            indexed_at: None,
            indexed_commit_hash: None,
            permission_synced_at: None,
            created_at: now,
            updated_at: now
        };
        assert!(!is_permission_sync_due(&repo, &[], now, ChronoDuration::hours(24)));
    }

    #[tokio::test]
    async fn test_start_requires_entitlement() {
        let f = fixture(None, Entitlements::default()).await;
        let err = f.syncer.start(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, JobError::Permission(PermissionSyncError::NotEntitled)));
    }
}
