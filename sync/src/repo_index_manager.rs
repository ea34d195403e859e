//! # Repo indexing
//!
//! INDEX jobs keep a repo's bare mirror current and rebuild its shards.
//! CLEANUP jobs remove the mirror and shards of repos no connection links
//! anymore, then delete the repo row.
//!
//! Work on a mirror runs under the `mirror:{repo_id}` lock so two workers
//! never touch the same directory at once. Losing the lease aborts the
//! running clone or fetch and fails the attempt.

use crate::connection_manager::millis;
use crate::credentials::RepoCredentialProvider;
use crate::git::{self, GitProgress, Transfer};
use crate::index::IndexBuilder;
use crate::queue::{JobHandler, JobQueue, QueueSettings};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use config::Settings;
use errors::{JobError, StorageError};
use observability::{JobLabels, JobQueueKind};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use storage::{
    JobStatus, JobUpdate, QueueBackend, Redlock, Repo, RepoIndexingJob, RepoIndexingJobType, SyncStore
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const REPO_INDEX_MAX_ATTEMPTS: u32 = 3;
const MIRROR_LOCK_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoIndexPayload {
    pub job_id: Uuid,
    #[serde(rename = "type")]
    pub job_type: RepoIndexingJobType,
    pub repo_id: i32,
    pub repo_name: String
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoIndexOutput {
    Indexed { revisions: Vec<String> },
    Cleaned { shards_removed: usize }
}

fn job_type_label(job_type: RepoIndexingJobType) -> &'static str {
    match job_type {
        RepoIndexingJobType::Index => "index",
        RepoIndexingJobType::Cleanup => "cleanup"
    }
}

/// On-disk mirror of a repo.
pub fn mirror_path(repos_dir: &Path, repo: &Repo) -> PathBuf {
    repos_dir.join(repo.id.to_string())
}

fn mirror_lock(repo_id: i32) -> Vec<String> {
    vec![format!("mirror:{repo_id}")]
}

pub struct RepoIndexHandler {
    store: Arc<dyn SyncStore>,
    credentials: Arc<RepoCredentialProvider>,
    builder: IndexBuilder,
    redlock: Arc<Redlock>,
    repos_dir: PathBuf,
    settings: Settings
}

impl RepoIndexHandler {
    pub fn new(
        store: Arc<dyn SyncStore>,
        credentials: Arc<RepoCredentialProvider>,
        builder: IndexBuilder,
        redlock: Arc<Redlock>,
        repos_dir: impl Into<PathBuf>,
        settings: Settings
    ) -> Self {
        Self {
            store,
            credentials,
            builder,
            redlock,
            repos_dir: repos_dir.into(),
            settings
        }
    }

    pub fn repos_dir(&self) -> &Path {
        &self.repos_dir
    }

    async fn load_repo(&self, repo_id: i32) -> Result<Repo, JobError> {
        self.store
            .get_repo(repo_id)
            .await?
            .ok_or_else(|| {
                StorageError::NotFound {
                    entity: "Repo".to_string(),
                    id: repo_id.to_string()
                }
                .into()
            })
    }

    async fn index(
        &self,
        payload: &RepoIndexPayload,
        repo: &Repo,
        lost: CancellationToken
    ) -> Result<Vec<String>, JobError> {
        let path = mirror_path(&self.repos_dir, repo);
        let credentials = self.credentials.for_repo(repo).await?;
        let remote_url = credentials
            .as_ref()
            .map_or(repo.clone_url.as_str(), |c| c.clone_url_with_token.as_str())
            .to_string();

        // A half-written clone is not worth salvaging.
        if tokio::fs::try_exists(&path).await.unwrap_or(false) && !git::is_valid_git_root(&path).await {
            warn!(repo_id = repo.id, path = %path.display(), "Mirror is not a valid git repository, removing");
            remove_dir(&path).await?;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<GitProgress>();
        let repo_id = repo.id;
        let reporter = tokio::spawn(async move {
            while let Some(progress) = rx.recv().await {
                debug!(
                    repo_id,
                    method = progress.method.as_str(),
                    stage = progress.stage,
                    percent = progress.percent,
                    "git progress"
                );
            }
        });

        let synced = if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            info!(repo_id = repo.id, "Fetching {}", repo.name);
            git::fetch_repository(&path, Some(&remote_url), Transfer::with_progress(tx).cancel_on(lost)).await
        } else {
            info!(repo_id = repo.id, "Cloning {}", repo.name);
            git::clone_repository(&remote_url, &path, Transfer::with_progress(tx).cancel_on(lost)).await
        };
        let _ = reporter.await;
        synced?;

        if let Some(git_config) = &repo.metadata.git_config {
            git::upsert_git_config(&path, git_config).await?;
        }

        info!(repo_id = repo.id, "Indexing {}", repo.name);
        let output = self.builder.index_repository(repo, &path, &self.settings).await?;
        if !output.stderr.is_empty() {
            debug!(repo_id = repo.id, stderr = %output.stderr, "Indexer output");
        }

        self.store
            .update_repo_indexing_job(
                payload.job_id,
                JobUpdate::status(JobStatus::InProgress).with_metadata(json!({
                    "indexedRevisions": output.revisions
                }))
            )
            .await?;
        Ok(output.revisions)
    }

    async fn cleanup(&self, repo: &Repo) -> Result<usize, JobError> {
        let path = mirror_path(&self.repos_dir, repo);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            info!(repo_id = repo.id, path = %path.display(), "Deleting mirror");
            remove_dir(&path).await?;
        }
        Ok(self.builder.cleanup(repo).await?)
    }
}

async fn remove_dir(path: &Path) -> Result<(), JobError> {
    tokio::fs::remove_dir_all(path).await.map_err(|e| {
        StorageError::QueryError {
            backend: "filesystem".to_string(),
            reason: format!("failed to remove {}: {e}", path.display())
        }
        .into()
    })
}

#[async_trait]
impl JobHandler for RepoIndexHandler {
    type Payload = RepoIndexPayload;
    type Output = RepoIndexOutput;

    fn labels(&self, payload: &RepoIndexPayload) -> JobLabels {
        JobLabels::repo_with_type(&payload.repo_name, job_type_label(payload.job_type))
    }

    async fn process(&self, payload: &RepoIndexPayload) -> Result<RepoIndexOutput, JobError> {
        info!(
            job_id = %payload.job_id,
            repo = %payload.repo_name,
            job_type = payload.job_type.as_str(),
            "Running repo index job"
        );

        let job = self
            .store
            .get_repo_indexing_job(payload.job_id)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                entity: "RepoIndexingJob".to_string(),
                id: payload.job_id.to_string()
            })?;
        if !job.status.is_active() {
            return Err(JobError::InvalidJobState {
                job_id: payload.job_id.to_string(),
                actual: job.status.to_string()
            });
        }
        self.store
            .update_repo_indexing_job(payload.job_id, JobUpdate::status(JobStatus::InProgress))
            .await?;

        let repo = self.load_repo(payload.repo_id).await?;
        let lock = mirror_lock(repo.id);
        match payload.job_type {
            RepoIndexingJobType::Index => {
                let revisions = self
                    .redlock
                    .using(&lock, MIRROR_LOCK_TTL, |lost| self.index(payload, &repo, lost))
                    .await?;
                Ok(RepoIndexOutput::Indexed { revisions })
            }
            RepoIndexingJobType::Cleanup => {
                let shards_removed = self
                    .redlock
                    .using(&lock, MIRROR_LOCK_TTL, |_lost| self.cleanup(&repo))
                    .await?;
                Ok(RepoIndexOutput::Cleaned { shards_removed })
            }
        }
    }

    async fn on_completed(&self, payload: &RepoIndexPayload, output: RepoIndexOutput) -> Result<(), JobError> {
        self.store
            .update_repo_indexing_job(payload.job_id, JobUpdate::status(JobStatus::Completed))
            .await?;

        match output {
            RepoIndexOutput::Indexed { revisions } => {
                let repo = self.load_repo(payload.repo_id).await?;
                let head = git::head_commit(&mirror_path(&self.repos_dir, &repo)).await?;
                self.store
                    .mark_repo_indexed(repo.id, Utc::now(), head, revisions)
                    .await?;
                info!(repo = %payload.repo_name, "Completed index job for {}", payload.repo_name);
            }
            RepoIndexOutput::Cleaned { shards_removed } => {
                self.store.delete_repo(payload.repo_id).await?;
                info!(repo = %payload.repo_name, shards_removed, "Completed cleanup job for {}", payload.repo_name);
            }
        }
        Ok(())
    }

    async fn on_failed(&self, payload: &RepoIndexPayload, error: &JobError, is_final: bool) -> Result<(), JobError> {
        if !is_final {
            warn!(repo = %payload.repo_name, error = %error, "Repo index job failed, retrying");
            return Ok(());
        }
        if matches!(error, JobError::InvalidJobState { .. }) {
            warn!(job_id = %payload.job_id, error = %error, "Skipped repo index job");
            return Ok(());
        }

        self.store
            .update_repo_indexing_job(payload.job_id, JobUpdate::failed(error.to_string()))
            .await?;
        error!(
            repo = %payload.repo_name,
            job_type = payload.job_type.as_str(),
            error = %error,
            "Repo index job failed"
        );
        Ok(())
    }
}

/// Whether an INDEX job is due, given the repo's indexing job history.
pub fn is_index_due(
    repo: &Repo,
    jobs: &[RepoIndexingJob],
    now: DateTime<Utc>,
    reindex_interval: ChronoDuration,
    timeout: ChronoDuration
) -> bool {
    let threshold = now - reindex_interval;
    let timeout_cutoff = now - timeout;

    let stale = repo.indexed_at.is_none_or(|at| at < threshold);
    let blocked = jobs
        .iter()
        .filter(|job| job.job_type == RepoIndexingJobType::Index)
        .any(|job| {
            (job.status.is_active() && job.created_at > timeout_cutoff)
                || (job.status == JobStatus::Failed && job.completed_at.is_some_and(|at| at > threshold))
        });
    stale && !blocked
}

/// Whether an orphaned repo is ready for CLEANUP.
pub fn is_cleanup_due(
    repo: &Repo,
    jobs: &[RepoIndexingJob],
    now: DateTime<Utc>,
    grace_period: ChronoDuration,
    timeout: ChronoDuration
) -> bool {
    let past_grace = repo.indexed_at.is_none_or(|at| at < now - grace_period);
    let blocked = jobs.iter().any(|job| {
        job.job_type == RepoIndexingJobType::Cleanup && job.status.is_active() && job.created_at > now - timeout
    });
    past_grace && !blocked
}

pub struct RepoIndexManager {
    store: Arc<dyn SyncStore>,
    queue: Arc<JobQueue<RepoIndexHandler>>,
    reindex_interval: ChronoDuration,
    gc_grace_period: ChronoDuration,
    timeout: ChronoDuration,
    polling_interval: Duration
}

impl RepoIndexManager {
    pub fn new(
        store: Arc<dyn SyncStore>,
        backend: Arc<dyn QueueBackend>,
        handler: RepoIndexHandler,
        settings: &Settings
    ) -> Self {
        let queue_settings = QueueSettings {
            concurrency: settings.max_repo_indexing_job_concurrency,
            max_attempts: REPO_INDEX_MAX_ATTEMPTS,
            timeout: Some(Duration::from_millis(settings.repo_index_timeout_ms)),
            ..QueueSettings::default()
        };
        Self {
            store,
            queue: Arc::new(JobQueue::new(
                backend,
                Arc::new(handler),
                JobQueueKind::RepoIndex,
                queue_settings
            )),
            reindex_interval: millis(settings.reindex_interval_ms),
            gc_grace_period: millis(settings.repo_garbage_collection_grace_period_ms),
            timeout: millis(settings.repo_index_timeout_ms),
            polling_interval: Duration::from_millis(settings.reindex_repo_polling_interval_ms.max(1))
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue<RepoIndexHandler>> {
        &self.queue
    }

    pub async fn create_jobs(&self, repos: &[Repo], job_type: RepoIndexingJobType) -> Result<Vec<Uuid>, JobError> {
        let mut ids = Vec::with_capacity(repos.len());
        for repo in repos {
            let job = self.store.create_repo_indexing_job(repo.id, job_type).await?;
            info!(job_id = %job.id, repo = %repo.name, job_type = job_type.as_str(), "Scheduling repo index job");

            let payload = RepoIndexPayload {
                job_id: job.id,
                job_type,
                repo_id: repo.id,
                repo_name: repo.name.clone()
            };
            self.queue.enqueue(job.id, &payload).await?;
            ids.push(job.id);
        }
        Ok(ids)
    }

    /// Out-of-band INDEX for one repo.
    pub async fn create_index_job(&self, repo_id: i32) -> Result<Option<Uuid>, JobError> {
        let Some(repo) = self.store.get_repo(repo_id).await? else {
            return Ok(None);
        };
        let ids = self
            .create_jobs(std::slice::from_ref(&repo), RepoIndexingJobType::Index)
            .await?;
        Ok(ids.into_iter().next())
    }

    pub async fn repos_due_for_index(&self, now: DateTime<Utc>) -> Result<Vec<Repo>, JobError> {
        let orphans: HashSet<i32> = self
            .store
            .list_orphaned_repos()
            .await?
            .into_iter()
            .map(|r| r.id)
            .collect();
        let mut due = Vec::new();
        for repo in self.store.list_all_repos().await? {
            if orphans.contains(&repo.id) {
                continue;
            }
            let jobs = self.store.list_repo_indexing_jobs(repo.id).await?;
            if is_index_due(&repo, &jobs, now, self.reindex_interval, self.timeout) {
                due.push(repo);
            }
        }
        Ok(due)
    }

    pub async fn repos_due_for_cleanup(&self, now: DateTime<Utc>) -> Result<Vec<Repo>, JobError> {
        let mut due = Vec::new();
        for repo in self.store.list_orphaned_repos().await? {
            let jobs = self.store.list_repo_indexing_jobs(repo.id).await?;
            if is_cleanup_due(&repo, &jobs, now, self.gc_grace_period, self.timeout) {
                due.push(repo);
            }
        }
        Ok(due)
    }

    pub async fn schedule_due(&self, now: DateTime<Utc>) -> Result<(), JobError> {
        let index = self.repos_due_for_index(now).await?;
        if !index.is_empty() {
            self.create_jobs(&index, RepoIndexingJobType::Index).await?;
        }
        let cleanup = self.repos_due_for_cleanup(now).await?;
        if !cleanup.is_empty() {
            self.create_jobs(&cleanup, RepoIndexingJobType::Cleanup).await?;
        }
        Ok(())
    }

    /// Spawns the worker pool and the reindex/GC scheduler.
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
                            error!(error = %e, "Repo index scheduling failed");
                        }
                    }
                }
            }
        });

        vec![worker, scheduler]
    }
}
