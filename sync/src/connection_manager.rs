//! # Connection sync
//!
//! One job per connection run: discover the connection's repos on its code
//! host and replace the connection's repo links with the result. Repos that
//! drop out of the discovery are unlinked and become orphans, which the
//! repo index manager later garbage collects.
//!
//! A polling scheduler re-enqueues connections that have not synced within
//! `resyncConnectionIntervalMs`.

use crate::codehost::RepoDiscovery;
use crate::queue::{JobHandler, JobQueue, QueueSettings};
use crate::search_contexts::SearchContextSyncer;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use config::{ConnectionConfig, Settings};
use errors::{ConfigValidationError, JobError, StorageError};
use observability::{JobLabels, JobQueueKind};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use storage::{
    Connection, ConnectionSyncJob, ConnectionSyncStatus, JobStatus, JobUpdate, QueueBackend, SyncStore
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Active jobs older than this no longer block rescheduling.
pub const CONNECTION_SYNC_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);
pub const CONNECTION_SYNC_MAX_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSyncPayload {
    pub job_id: Uuid,
    pub connection_id: i32,
    pub connection_name: String,
    pub org_id: i32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSyncOutput {
    pub repo_count: usize
}

pub struct ConnectionSyncHandler {
    store: Arc<dyn SyncStore>,
    discovery: Arc<dyn RepoDiscovery>,
    search_contexts: Arc<SearchContextSyncer>,
    config_path: Option<PathBuf>
}

impl ConnectionSyncHandler {
    pub fn new(
        store: Arc<dyn SyncStore>,
        discovery: Arc<dyn RepoDiscovery>,
        search_contexts: Arc<SearchContextSyncer>,
        config_path: Option<PathBuf>
    ) -> Self {
        Self {
            store,
            discovery,
            search_contexts,
            config_path
        }
    }

    async fn resync_search_contexts(&self, org_id: i32) -> Result<(), JobError> {
        let Some(path) = &self.config_path else {
            return Ok(());
        };
        let config = config::load_config(path).await?;
        self.search_contexts.sync(org_id, config.contexts.as_ref()).await?;
        Ok(())
    }
}

/// Keeps the first of each `(external_id, external_code_host_url)` pair.
fn dedupe_repos(repos: Vec<storage::RepoUpsert>) -> Vec<storage::RepoUpsert> {
    let mut seen = HashSet::new();
    repos
        .into_iter()
        .filter(|r| seen.insert((r.external_id.clone(), r.external_code_host_url.clone())))
        .collect()
}

#[async_trait]
impl JobHandler for ConnectionSyncHandler {
    type Payload = ConnectionSyncPayload;
    type Output = ConnectionSyncOutput;

    fn labels(&self, payload: &ConnectionSyncPayload) -> JobLabels {
        JobLabels::connection(&payload.connection_name)
    }

    async fn process(&self, payload: &ConnectionSyncPayload) -> Result<ConnectionSyncOutput, JobError> {
        info!(
            connection = %payload.connection_name,
            connection_id = payload.connection_id,
            "Running connection sync job"
        );

        let job = self
            .store
            .get_connection_sync_job(payload.job_id)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                entity: "ConnectionSyncJob".to_string(),
                id: payload.job_id.to_string()
            })?;
        if !job.status.is_active() {
            return Err(JobError::InvalidJobState {
                job_id: payload.job_id.to_string(),
                actual: job.status.to_string()
            });
        }

        self.store
            .update_connection_sync_job(payload.job_id, JobUpdate::status(JobStatus::InProgress))
            .await?;
        self.store
            .set_connection_sync_status(payload.connection_id, ConnectionSyncStatus::Syncing, None)
            .await?;

        let connection = self
            .store
            .get_connection(payload.connection_id)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                entity: "Connection".to_string(),
                id: payload.connection_id.to_string()
            })?;
        let config: ConnectionConfig = serde_json::from_value(connection.config.clone()).map_err(|e| {
            ConfigValidationError::InvalidConnection {
                name: connection.name.clone(),
                reason: e.to_string()
            }
        })?;

        let repos = dedupe_repos(self.discovery.discover(&connection, &config).await?);
        let repo_count = repos.len();
        self.store
            .replace_connection_repos(connection.org_id, connection.id, repos)
            .await?;

        info!(connection = %connection.name, repo_count, "Upserted repos for connection");
        Ok(ConnectionSyncOutput { repo_count })
    }

    async fn on_completed(&self, payload: &ConnectionSyncPayload, output: ConnectionSyncOutput) -> Result<(), JobError> {
        self.store
            .update_connection_sync_job(payload.job_id, JobUpdate::status(JobStatus::Completed))
            .await?;
        self.store
            .set_connection_sync_status(payload.connection_id, ConnectionSyncStatus::Synced, Some(Utc::now()))
            .await?;

        // New repos may now match context globs.
        if let Err(e) = self.resync_search_contexts(payload.org_id).await {
            error!(connection_id = payload.connection_id, error = %e, "Failed to sync search contexts");
        }

        info!(
            connection = %payload.connection_name,
            repo_count = output.repo_count,
            "Connection sync job completed"
        );
        Ok(())
    }

    async fn on_failed(&self, payload: &ConnectionSyncPayload, error: &JobError, is_final: bool) -> Result<(), JobError> {
        if !is_final {
            warn!(connection = %payload.connection_name, error = %error, "Connection sync job failed, retrying");
            return Ok(());
        }
        // A job in a terminal state belongs to an earlier run; leave it alone.
        if matches!(error, JobError::InvalidJobState { .. }) {
            warn!(job_id = %payload.job_id, error = %error, "Skipped connection sync job");
            return Ok(());
        }

        self.store
            .update_connection_sync_job(payload.job_id, JobUpdate::failed(error.to_string()))
            .await?;
        self.store
            .set_connection_sync_status(payload.connection_id, ConnectionSyncStatus::Failed, None)
            .await?;
        error!(connection = %payload.connection_name, error = %error, "Connection sync job failed");
        Ok(())
    }
}

/// Whether the scheduler should enqueue a sync for `connection`, given its
/// job history.
pub fn is_connection_due(
    connection: &Connection,
    jobs: &[ConnectionSyncJob],
    now: DateTime<Utc>,
    resync_interval: ChronoDuration
) -> bool {
    let threshold = now - resync_interval;
    let timeout_cutoff = now - ChronoDuration::from_std(CONNECTION_SYNC_TIMEOUT).unwrap_or(ChronoDuration::hours(2));

    let stale = connection.synced_at.is_none_or(|synced| synced < threshold);
    let blocked = jobs.iter().any(|job| {
        (job.status.is_active() && job.created_at > timeout_cutoff)
            || (job.status == JobStatus::Failed && job.completed_at.is_some_and(|at| at > threshold))
    });
    stale && !blocked
}

pub struct ConnectionManager {
    store: Arc<dyn SyncStore>,
    queue: Arc<JobQueue<ConnectionSyncHandler>>,
    resync_interval: ChronoDuration,
    polling_interval: Duration
}

impl ConnectionManager {
    pub fn new(
        store: Arc<dyn SyncStore>,
        backend: Arc<dyn QueueBackend>,
        handler: ConnectionSyncHandler,
        settings: &Settings
    ) -> Self {
        let queue_settings = QueueSettings {
            concurrency: settings.max_connection_sync_job_concurrency,
            max_attempts: CONNECTION_SYNC_MAX_ATTEMPTS,
            timeout: Some(CONNECTION_SYNC_TIMEOUT),
            ..QueueSettings::default()
        };
        Self {
            store,
            queue: Arc::new(JobQueue::new(
                backend,
                Arc::new(handler),
                JobQueueKind::ConnectionSync,
                queue_settings
            )),
            resync_interval: millis(settings.resync_connection_interval_ms),
            polling_interval: Duration::from_millis(settings.resync_connection_polling_interval_ms.max(1))
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue<ConnectionSyncHandler>> {
        &self.queue
    }

    /// Persists and enqueues one sync job per connection.
    pub async fn create_jobs(&self, connections: &[Connection]) -> Result<Vec<Uuid>, JobError> {
        let mut ids = Vec::with_capacity(connections.len());
        for connection in connections {
            let job = self.store.create_connection_sync_job(connection.id).await?;
            self.store
                .set_connection_sync_status(connection.id, ConnectionSyncStatus::InSyncQueue, None)
                .await?;
            info!(job_id = %job.id, connection = %connection.name, connection_id = connection.id, "Scheduling connection sync job");

            let payload = ConnectionSyncPayload {
                job_id: job.id,
                connection_id: connection.id,
                connection_name: connection.name.clone(),
                org_id: connection.org_id
            };
            self.queue.enqueue(job.id, &payload).await?;
            ids.push(job.id);
        }
        Ok(ids)
    }

    pub async fn connections_due(&self, now: DateTime<Utc>) -> Result<Vec<Connection>, JobError> {
        let mut due = Vec::new();
        for connection in self.store.list_all_connections().await? {
            let jobs = self.store.list_connection_sync_jobs(connection.id).await?;
            if is_connection_due(&connection, &jobs, now, self.resync_interval) {
                due.push(connection);
            }
        }
        Ok(due)
    }

    pub async fn schedule_due(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, JobError> {
        let due = self.connections_due(now).await?;
        if due.is_empty() {
            return Ok(Vec::new());
        }
        self.create_jobs(&due).await
    }

    /// Spawns the worker pool and the resync scheduler.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let worker = tokio::spawn(self.queue.clone().run(shutdown.clone()));

        let manager = Arc::clone(self);
        let scheduler = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.polling_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = manager.schedule_due(Utc::now()).await {
                            error!(error = %e, "Connection resync scheduling failed");
                        }
                    }
                }
            }
        });

        vec![worker, scheduler]
    }
}

pub(crate) fn millis(ms: u64) -> ChronoDuration {
    ChronoDuration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX / 2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entitlements::Entitlements;
    use errors::CodeHostError;
    use parking_lot::Mutex;
    use serde_json::json;
    use storage::{ConnectionStore, InMemoryQueueBackend, InMemorySyncStore, JobStore, RepoMetadata, RepoStore, RepoUpsert};

    fn upsert(name: &str, external_id: &str) -> RepoUpsert {
        RepoUpsert {
            name: name.to_string(),
            display_name: Some(name.to_string()),
            clone_url: format!("https://{name}.git"),
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

    struct FakeDiscovery {
        result: Mutex<Option<Result<Vec<RepoUpsert>, JobError>>>
    }

    #[async_trait]
    impl RepoDiscovery for FakeDiscovery {
        async fn discover(&self, _: &Connection, _: &ConnectionConfig) -> Result<Vec<RepoUpsert>, JobError> {
            self.result.lock().take().unwrap_or(Ok(Vec::new()))
        }
    }

    async fn fixture(result: Result<Vec<RepoUpsert>, JobError>) -> (Arc<InMemorySyncStore>, ConnectionManager, Connection) {
        let store = Arc::new(InMemorySyncStore::new());
        let connection = store
            .upsert_declarative_connection(1, "gh", "github", json!({"type": "github", "orgs": ["acme"]}))
            .await
            .unwrap();
        let handler = ConnectionSyncHandler::new(
            store.clone(),
            Arc::new(FakeDiscovery {
                result: Mutex::new(Some(result))
            }),
            Arc::new(SearchContextSyncer::new(store.clone(), Entitlements::default())),
            None
        );
        let manager = ConnectionManager::new(
            store.clone(),
            Arc::new(InMemoryQueueBackend::new()),
            handler,
            &Settings::default()
        );
        (store, manager, connection)
    }

    fn payload(job_id: Uuid, connection: &Connection) -> ConnectionSyncPayload {
        ConnectionSyncPayload {
            job_id,
            connection_id: connection.id,
            connection_name: connection.name.clone(),
            org_id: connection.org_id
        }
    }

    #[tokio::test]
    async fn test_sync_dedupes_and_links_repos() {
        let (store, manager, connection) = fixture(Ok(vec![
            upsert("github.com/acme/web", "1"),
            upsert("github.com/acme/web-dup", "1"),
            upsert("github.com/acme/api", "2"),
        ]))
        .await;

        let ids = manager.create_jobs(std::slice::from_ref(&connection)).await.unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(manager.queue().pending_count().await.unwrap(), 1);

        let handler = manager.queue().handler();
        let p = payload(ids[0], &connection);
        let output = handler.process(&p).await.unwrap();
        assert_eq!(output.repo_count, 2);
        handler.on_completed(&p, output).await.unwrap();

        let repos = store.list_repos_for_connection(connection.id).await.unwrap();
        let mut names: Vec<_> = repos.into_iter().map(|r| r.name).collect();
        names.sort();
        assert_eq!(names, vec!["github.com/acme/api", "github.com/acme/web"]);

        let job = store.get_connection_sync_job(ids[0]).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        let synced = store.get_connection(connection.id).await.unwrap().unwrap();
        assert_eq!(synced.sync_status, ConnectionSyncStatus::Synced);
        assert!(synced.synced_at.is_some());

        // A completed job is not run again.
        let err = handler.process(&p).await.unwrap_err();
        assert!(matches!(err, JobError::InvalidJobState { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_final_failure_marks_job_failed() {
        let (store, manager, connection) = fixture(Err(CodeHostError::Api {
            host: "api.github.com".to_string(),
            status: 500,
            message: "down".to_string()
        }
        .into()))
        .await;

        let ids = manager.create_jobs(std::slice::from_ref(&connection)).await.unwrap();
        let handler = manager.queue().handler();
        let p = payload(ids[0], &connection);
        let err = handler.process(&p).await.unwrap_err();

        handler.on_failed(&p, &err, false).await.unwrap();
        let job = store.get_connection_sync_job(ids[0]).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::InProgress);

        handler.on_failed(&p, &err, true).await.unwrap();
        let job = store.get_connection_sync_job(ids[0]).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().contains("down"));
    }

    #[tokio::test]
    async fn test_scheduler_skips_recent_and_active() {
        let (store, manager, connection) = fixture(Ok(Vec::new())).await;
        let now = Utc::now();

        // Never synced, no jobs.
        assert_eq!(manager.connections_due(now).await.unwrap().len(), 1);

        // An active job blocks rescheduling.
        manager.create_jobs(std::slice::from_ref(&connection)).await.unwrap();
        assert!(manager.connections_due(now).await.unwrap().is_empty());

        // Past the job timeout the stuck job no longer blocks.
        let later = now + ChronoDuration::hours(3);
        assert_eq!(manager.connections_due(later).await.unwrap().len(), 1);

        // Freshly synced connections are not due.
        store
            .set_connection_sync_status(connection.id, ConnectionSyncStatus::Synced, Some(later))
            .await
            .unwrap();
        assert!(manager.connections_due(later).await.unwrap().is_empty());
    }

    #[test]
    fn test_recent_failure_blocks() {
        let now = Utc::now();
        let connection = Connection {
            id: 1,
            org_id: 1,
            name: "c".to_string(),
            connection_type: "github".to_string(),
            config: json!({}),
            is_declarative: true,
            sync_status: ConnectionSyncStatus::Failed,
            synced_at: None,
            created_at: now,
            updated_at: now
        };
        let failed = ConnectionSyncJob {
            id: Uuid::new_v4(),
            connection_id: 1,
            status: JobStatus::Failed,
            error_message: Some("x".to_string()),
            created_at: now - ChronoDuration::hours(1),
            updated_at: now,
            completed_at: Some(now - ChronoDuration::minutes(30))
        };
        let interval = ChronoDuration::hours(24);
        assert!(!is_connection_due(&connection, std::slice::from_ref(&failed), now, interval));
        assert!(is_connection_due(
            &connection,
            &[failed],
            now + ChronoDuration::hours(25),
            interval
        ));
    }
}
