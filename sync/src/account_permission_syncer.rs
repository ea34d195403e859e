//! # Account permission sync
//!
//! The user-driven half of permission syncing. Each job lists the restricted
//! repos an account's user can read on its provider, using the OAuth token
//! stored on the account, and replaces that account's permission rows with
//! the repos we know about. Public repos are never listed since they need
//! no rows.

use crate::codehost::AccessibleRepoSource;
use crate::entitlements::{Entitlements, PERMISSION_SYNCING};
use crate::queue::{JobHandler, JobQueue, QueueSettings};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use config::Settings;
use errors::{JobError, PermissionSyncError, QueueError, StorageError};
use observability::{JobLabels, JobQueueKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use storage::{Account, AccountPermissionSyncJob, JobStatus, JobUpdate, QueueBackend, SyncStore};
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const SUPPORTED_PROVIDERS: &[&str] = &["github", "gitlab"];
pub const ACCOUNT_PERMISSION_SYNC_MAX_ATTEMPTS: u32 = 3;
const ACCOUNT_PERMISSION_SYNC_CONCURRENCY: usize = 1;
const SCHEDULE: &str = "*/30 * * * * *";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountPermissionSyncPayload {
    pub job_id: Uuid,
    pub account_id: String
}

pub struct AccountPermissionSyncHandler {
    store: Arc<dyn SyncStore>,
    source: Arc<dyn AccessibleRepoSource>
}

impl AccountPermissionSyncHandler {
    pub fn new(store: Arc<dyn SyncStore>, source: Arc<dyn AccessibleRepoSource>) -> Self {
        Self { store, source }
    }
}

#[async_trait]
impl JobHandler for AccountPermissionSyncHandler {
    type Payload = AccountPermissionSyncPayload;
    /// Number of repos the account can read.
    type Output = usize;

    fn labels(&self, payload: &AccountPermissionSyncPayload) -> JobLabels {
        JobLabels::account(&payload.account_id)
    }

    async fn process(&self, payload: &AccountPermissionSyncPayload) -> Result<usize, JobError> {
        let job = self
            .store
            .get_account_permission_sync_job(payload.job_id)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                entity: "AccountPermissionSyncJob".to_string(),
                id: payload.job_id.to_string()
            })?;
        if !job.status.is_active() {
            return Err(JobError::InvalidJobState {
                job_id: payload.job_id.to_string(),
                actual: job.status.to_string()
            });
        }
        self.store
            .update_account_permission_sync_job(payload.job_id, JobUpdate::status(JobStatus::InProgress))
            .await?;

        let account = self
            .store
            .get_account(&payload.account_id)
            .await?
            .ok_or_else(|| PermissionSyncError::AccountNotFound {
                account_id: payload.account_id.clone()
            })?;
        info!(
            account_id = %account.id,
            provider = %account.provider,
            "Syncing permissions for {} account {}", account.provider, account.id
        );

        let token = account
            .access_token
            .as_deref()
            .ok_or_else(|| PermissionSyncError::MissingAccessToken {
                account_id: account.id.clone(),
                provider: account.provider.clone()
            })?;
        let external_ids = self
            .source
            .list_accessible_repo_ids(&account.provider, token)
            .await?;

        let repo_ids: Vec<i32> = self
            .store
            .find_repos_by_external_ids(&account.provider, &external_ids)
            .await?
            .into_iter()
            .map(|repo| repo.id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        self.store
            .replace_account_permissions(&account.id, &repo_ids)
            .await?;
        Ok(repo_ids.len())
    }

    async fn on_completed(&self, payload: &AccountPermissionSyncPayload, repos: usize) -> Result<(), JobError> {
        self.store
            .update_account_permission_sync_job(payload.job_id, JobUpdate::status(JobStatus::Completed))
            .await?;
        self.store
            .set_account_permission_synced_at(&payload.account_id, Utc::now())
            .await?;
        info!(account_id = %payload.account_id, repos, "Permissions synced for account {}", payload.account_id);
        Ok(())
    }

    async fn on_failed(
        &self,
        payload: &AccountPermissionSyncPayload,
        error: &JobError,
        is_final: bool
    ) -> Result<(), JobError> {
        if !is_final {
            warn!(account_id = %payload.account_id, error = %error, "Account permission sync job failed, retrying");
            return Ok(());
        }
        if matches!(error, JobError::InvalidJobState { .. }) {
            warn!(job_id = %payload.job_id, error = %error, "Skipped account permission sync job");
            return Ok(());
        }
        self.store
            .update_account_permission_sync_job(payload.job_id, JobUpdate::failed(error.to_string()))
            .await?;
        error!(account_id = %payload.account_id, error = %error, "Account permission sync job failed");
        Ok(())
    }
}

/// Whether an account should get a permission sync job now.
pub fn is_account_sync_due(
    account: &Account,
    jobs: &[AccountPermissionSyncJob],
    now: DateTime<Utc>,
    interval: ChronoDuration
) -> bool {
    if !SUPPORTED_PROVIDERS.contains(&account.provider.as_str()) {
        return false;
    }
    let threshold = now - interval;
    let stale = account.permission_synced_at.is_none_or(|at| at < threshold);
    let blocked = jobs.iter().any(|job| {
        job.status.is_active()
            || (job.status == JobStatus::Failed && job.completed_at.is_some_and(|at| at > threshold))
    });
    stale && !blocked
}

pub struct AccountPermissionSyncer {
    store: Arc<dyn SyncStore>,
    queue: Arc<JobQueue<AccountPermissionSyncHandler>>,
    entitlements: Entitlements,
    interval: ChronoDuration
}

impl AccountPermissionSyncer {
    pub fn new(
        store: Arc<dyn SyncStore>,
        backend: Arc<dyn QueueBackend>,
        handler: AccountPermissionSyncHandler,
        entitlements: Entitlements,
        settings: &Settings
    ) -> Self {
        let queue_settings = QueueSettings {
            concurrency: ACCOUNT_PERMISSION_SYNC_CONCURRENCY,
            max_attempts: ACCOUNT_PERMISSION_SYNC_MAX_ATTEMPTS,
            ..QueueSettings::default()
        };
        Self {
            store,
            queue: Arc::new(JobQueue::new(
                backend,
                Arc::new(handler),
                JobQueueKind::AccountPermissionSync,
                queue_settings
            )),
            entitlements,
            interval: crate::connection_manager::millis(settings.user_driven_permission_sync_interval_ms)
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue<AccountPermissionSyncHandler>> {
        &self.queue
    }

    pub async fn create_jobs(&self, accounts: &[Account]) -> Result<Vec<Uuid>, JobError> {
        let mut ids = Vec::with_capacity(accounts.len());
        for account in accounts {
            let job = self.store.create_account_permission_sync_job(&account.id).await?;
            let payload = AccountPermissionSyncPayload {
                job_id: job.id,
                account_id: account.id.clone()
            };
            self.queue.enqueue(job.id, &payload).await?;
            ids.push(job.id);
        }
        Ok(ids)
    }

    pub async fn accounts_due(&self, now: DateTime<Utc>) -> Result<Vec<Account>, JobError> {
        let mut due = Vec::new();
        for account in self.store.list_accounts().await? {
            let jobs = self.store.list_account_permission_sync_jobs(&account.id).await?;
            if is_account_sync_due(&account, &jobs, now, self.interval) {
                due.push(account);
            }
        }
        Ok(due)
    }

    pub async fn schedule_due(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, JobError> {
        let due = self.accounts_due(now).await?;
        if due.is_empty() {
            return Ok(Vec::new());
        }
        info!(count = due.len(), "Scheduling account permission sync jobs");
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
                    error!(error = %e, "Account permission sync scheduling failed");
                }
            })
        })
        .map_err(scheduler_error)?;
        scheduler.add(job).await.map_err(scheduler_error)?;
        scheduler.start().await.map_err(scheduler_error)?;
        info!("Account permission sync scheduler started");

        let worker = tokio::spawn(self.queue.clone().run(shutdown.clone()));
        let stopper = tokio::spawn(async move {
            shutdown.cancelled().await;
            if let Err(e) = scheduler.shutdown().await {
                warn!(error = %e, "Failed to stop account permission sync scheduler");
            }
        });
        Ok(vec![worker, stopper])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use storage::{
        ConnectionStore, InMemoryQueueBackend, InMemorySyncStore, JobStore, PermissionStore,
        RepoMetadata, RepoStore, RepoUpsert
    };

    struct FakeSource {
        ids: Mutex<Vec<String>>,
        calls: Mutex<Vec<(String, String)>>
    }

    #[async_trait]
    impl AccessibleRepoSource for FakeSource {
        async fn list_accessible_repo_ids(&self, provider: &str, token: &str) -> Result<Vec<String>, JobError> {
            self.calls.lock().push((provider.to_string(), token.to_string()));
            Ok(self.ids.lock().clone())
        }
    }

    fn upsert(external_id: &str, code_host_type: &str) -> RepoUpsert {
        RepoUpsert {
            name: format!("{code_host_type}.com/acme/{external_id}"),
            display_name: Some(format!("acme/{external_id}")),
            clone_url: format!("https://{code_host_type}.com/acme/{external_id}.git"),
            web_url: None,
            external_id: external_id.to_string(),
            external_code_host_type: code_host_type.to_string(),
            external_code_host_url: format!("https://{code_host_type}.com"),
            is_fork: false,
            is_archived: false,
            is_public: false,
            metadata: RepoMetadata::default()
        }
    }

    fn account(id: &str, provider: &str, access_token: Option<&str>) -> Account {
        Account {
            id: id.to_string(),
            user_id: format!("u-{id}"),
            provider: provider.to_string(),
            provider_account_id: format!("ext-{id}"),
            access_token: access_token.map(String::from),
            permission_synced_at: None
        }
    }

    struct Fixture {
        store: Arc<InMemorySyncStore>,
        syncer: Arc<AccountPermissionSyncer>,
        source: Arc<FakeSource>,
        /// github 100, github 200, gitlab 100
        repo_ids: Vec<i32>
    }

    async fn fixture(entitlements: Entitlements) -> Fixture {
        let store = Arc::new(InMemorySyncStore::new());
        let github = store
            .upsert_declarative_connection(1, "gh", "github", json!({"type": "github"}))
            .await
            .unwrap();
        let gitlab = store
            .upsert_declarative_connection(1, "gl", "gitlab", json!({"type": "gitlab"}))
            .await
            .unwrap();
        let mut repo_ids = store
            .replace_connection_repos(1, github.id, vec![upsert("100", "github"), upsert("200", "github")])
            .await
            .unwrap();
        repo_ids.extend(
            store
                .replace_connection_repos(1, gitlab.id, vec![upsert("100", "gitlab")])
                .await
                .unwrap()
        );

        store.upsert_account(account("gh-user", "github", Some("gho_user"))).await.unwrap();
        store.upsert_account(account("gl-user", "gitlab", None)).await.unwrap();

        let source = Arc::new(FakeSource {
            ids: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new())
        });
        let handler = AccountPermissionSyncHandler::new(store.clone(), source.clone());
        let syncer = Arc::new(AccountPermissionSyncer::new(
            store.clone(),
            Arc::new(InMemoryQueueBackend::new()),
            handler,
            entitlements,
            &Settings::default()
        ));
        Fixture {
            store,
            syncer,
            source,
            repo_ids
        }
    }

    fn payload(job_id: Uuid, account_id: &str) -> AccountPermissionSyncPayload {
        AccountPermissionSyncPayload {
            job_id,
            account_id: account_id.to_string()
        }
    }

    #[tokio::test]
    async fn test_sync_replaces_account_permissions() {
        let f = fixture(Entitlements::all()).await;
        let (gh_100, gh_200, gl_100) = (f.repo_ids[0], f.repo_ids[1], f.repo_ids[2]);
        f.store.grant_repo_permissions("gh-user", &[gh_100]).await.unwrap();

        // "100" on github only; the gitlab repo with the same external id
        // must not match, and unknown ids are ignored.
        *f.source.ids.lock() = vec!["200".to_string(), "100".to_string(), "404".to_string()];
        let gh_user = f.store.get_account("gh-user").await.unwrap().unwrap();
        let ids = f.syncer.create_jobs(&[gh_user.clone()]).await.unwrap();
        let handler = f.syncer.queue().handler();
        let p = payload(ids[0], "gh-user");

        let repos = handler.process(&p).await.unwrap();
        assert_eq!(repos, 2);
        handler.on_completed(&p, repos).await.unwrap();
        assert_eq!(
            f.store.list_account_permissions("gh-user").await.unwrap(),
            vec![gh_100, gh_200]
        );
        assert!(!f.store.list_account_permissions("gh-user").await.unwrap().contains(&gl_100));
        assert_eq!(
            f.source.calls.lock().clone(),
            vec![("github".to_string(), "gho_user".to_string())]
        );

        let account = f.store.get_account("gh-user").await.unwrap().unwrap();
        assert!(account.permission_synced_at.is_some());
        let job = f.store.get_account_permission_sync_job(ids[0]).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);

        // A later listing drops the stale grant.
        *f.source.ids.lock() = vec!["200".to_string()];
        let ids = f.syncer.create_jobs(&[gh_user.clone()]).await.unwrap();
        handler.process(&payload(ids[0], "gh-user")).await.unwrap();
        assert_eq!(f.store.list_account_permissions("gh-user").await.unwrap(), vec![gh_200]);

        // An empty listing clears every row.
        f.source.ids.lock().clear();
        let ids = f.syncer.create_jobs(&[gh_user]).await.unwrap();
        handler.process(&payload(ids[0], "gh-user")).await.unwrap();
        assert!(f.store.list_account_permissions("gh-user").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_access_token_fails_without_retry() {
        let f = fixture(Entitlements::all()).await;
        let gl_100 = f.repo_ids[2];
        f.store.grant_repo_permissions("gl-user", &[gl_100]).await.unwrap();
        let gl_user = f.store.get_account("gl-user").await.unwrap().unwrap();
        let ids = f.syncer.create_jobs(&[gl_user]).await.unwrap();
        let handler = f.syncer.queue().handler();
        let p = payload(ids[0], "gl-user");

        let err = handler.process(&p).await.unwrap_err();
        assert!(matches!(
            err,
            JobError::Permission(PermissionSyncError::MissingAccessToken { .. })
        ));
        assert!(!err.is_retryable());
        assert!(f.source.calls.lock().is_empty());
        // Existing rows stay until a listing succeeds.
        assert_eq!(f.store.list_account_permissions("gl-user").await.unwrap(), vec![gl_100]);

        handler.on_failed(&p, &err, true).await.unwrap();
        let job = f.store.get_account_permission_sync_job(ids[0]).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_finished_job_is_skipped() {
        let f = fixture(Entitlements::all()).await;
        let gh_user = f.store.get_account("gh-user").await.unwrap().unwrap();
        let ids = f.syncer.create_jobs(&[gh_user]).await.unwrap();
        f.store
            .update_account_permission_sync_job(ids[0], JobUpdate::status(JobStatus::Completed))
            .await
            .unwrap();

        let err = f
            .syncer
            .queue()
            .handler()
            .process(&payload(ids[0], "gh-user"))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidJobState { .. }));
    }

    #[tokio::test]
    async fn test_scheduler_eligibility() {
        let f = fixture(Entitlements::all()).await;
        f.store
            .upsert_account(account("bb-user", "bitbucket", Some("t")))
            .await
            .unwrap();
        let now = Utc::now();
        let due: Vec<String> = f
            .syncer
            .accounts_due(now)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(due, vec!["gh-user".to_string(), "gl-user".to_string()]);

        f.syncer.schedule_due(now).await.unwrap();
        // Pending jobs block another enqueue.
        assert!(f.syncer.accounts_due(now).await.unwrap().is_empty());
        assert_eq!(f.syncer.queue().pending_count().await.unwrap(), 2);
    }

    #[test]
    fn test_recent_sync_or_failure_is_not_due() {
        let now = Utc::now();
        let interval = ChronoDuration::hours(24);
        let mut synced = account("a", "github", Some("t"));
        synced.permission_synced_at = Some(now - ChronoDuration::hours(1));
        assert!(!is_account_sync_due(&synced, &[], now, interval));

        synced.permission_synced_at = Some(now - ChronoDuration::hours(25));
        assert!(is_account_sync_due(&synced, &[], now, interval));

        let failed = AccountPermissionSyncJob {
            id: Uuid::new_v4(),
            account_id: "a".to_string(),
            status: JobStatus::Failed,
            error_message: Some("boom".to_string()),
            created_at: now,
            updated_at: now,
            completed_at: Some(now - ChronoDuration::minutes(5))
        };
        assert!(!is_account_sync_due(&synced, &[failed], now, interval));
    }

    #[tokio::test]
    async fn test_start_requires_entitlement() {
        let f = fixture(Entitlements::default()).await;
        let err = f.syncer.start(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, JobError::Permission(PermissionSyncError::NotEntitled)));
    }
}
