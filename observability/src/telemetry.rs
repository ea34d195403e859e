use crate::names::*;
use metrics::{counter, gauge, histogram};

/// The job queues, each with its own gauge and counter family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobQueueKind {
    ConnectionSync,
    RepoIndex,
    PermissionSync,
    AccountPermissionSync
}

struct Family {
    active: &'static str,
    pending: &'static str,
    reattempts: &'static str,
    fails: &'static str,
    successes: &'static str
}

impl JobQueueKind {
    /// Queue name used for backend keys and the `queue` label.
    pub fn queue_name(&self) -> &'static str {
        match self {
            Self::ConnectionSync => "connection-sync",
            Self::RepoIndex => "repo-index",
            Self::PermissionSync => "permission-sync",
            Self::AccountPermissionSync => "account-permission-sync"
        }
    }

    fn family(&self) -> Family {
        match self {
            Self::ConnectionSync => Family {
                active: ACTIVE_CONNECTION_SYNC_JOBS,
                pending: PENDING_CONNECTION_SYNC_JOBS,
                reattempts: CONNECTION_SYNC_JOB_REATTEMPTS,
                fails: CONNECTION_SYNC_JOB_FAILS,
                successes: CONNECTION_SYNC_JOB_SUCCESSES
            },
            Self::RepoIndex => Family {
                active: ACTIVE_REPO_INDEX_JOBS,
                pending: PENDING_REPO_INDEX_JOBS,
                reattempts: REPO_INDEX_JOB_REATTEMPTS,
                fails: REPO_INDEX_JOB_FAILS,
                successes: REPO_INDEX_JOB_SUCCESSES
            },
            Self::PermissionSync => Family {
                active: ACTIVE_PERMISSION_SYNC_JOBS,
                pending: PENDING_PERMISSION_SYNC_JOBS,
                reattempts: PERMISSION_SYNC_JOB_REATTEMPTS,
                fails: PERMISSION_SYNC_JOB_FAILS,
                successes: PERMISSION_SYNC_JOB_SUCCESSES
            },
            Self::AccountPermissionSync => Family {
                active: ACTIVE_ACCOUNT_PERMISSION_SYNC_JOBS,
                pending: PENDING_ACCOUNT_PERMISSION_SYNC_JOBS,
                reattempts: ACCOUNT_PERMISSION_SYNC_JOB_REATTEMPTS,
                fails: ACCOUNT_PERMISSION_SYNC_JOB_FAILS,
                successes: ACCOUNT_PERMISSION_SYNC_JOB_SUCCESSES
            }
        }
    }
}

/// Label set attached to a job's metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobLabels(Vec<(&'static str, String)>);

impl JobLabels {
    pub fn connection(name: &str) -> Self {
        Self(vec![("connection", name.to_string())])
    }

    pub fn repo(name: &str) -> Self {
        Self(vec![("repo", name.to_string())])
    }

    pub fn account(id: &str) -> Self {
        Self(vec![("account", id.to_string())])
    }

    pub fn repo_with_type(name: &str, job_type: &str) -> Self {
        Self(vec![("repo", name.to_string()), ("type", job_type.to_string())])
    }

    pub fn pairs(&self) -> &[(&'static str, String)] {
        &self.0
    }
}

/// Keeps a queue's pending/active gauges and outcome counters in step with
/// Gauge and counter bookkeeping for each step of a job's lifecycle.
#[derive(Debug, Clone, Copy)]
pub struct SyncTelemetry {
    kind: JobQueueKind
}

impl SyncTelemetry {
    pub fn new(kind: JobQueueKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> JobQueueKind {
        self.kind
    }

    pub fn job_enqueued(&self, labels: &JobLabels) {
        gauge!(self.kind.family().pending, labels.pairs()).increment(1.0);
    }

    pub fn job_started(&self, labels: &JobLabels) {
        let family = self.kind.family();
        gauge!(family.pending, labels.pairs()).decrement(1.0);
        gauge!(family.active, labels.pairs()).increment(1.0);
    }

    pub fn job_completed(&self, labels: &JobLabels) {
        let family = self.kind.family();
        gauge!(family.active, labels.pairs()).decrement(1.0);
        counter!(family.successes, labels.pairs()).increment(1);
    }

    /// A failed attempt. Non-final failures go back to pending.
    pub fn job_failed(&self, labels: &JobLabels, is_final: bool) {
        let family = self.kind.family();
        gauge!(family.active, labels.pairs()).decrement(1.0);
        if is_final {
            counter!(family.fails, labels.pairs()).increment(1);
        } else {
            counter!(family.reattempts, labels.pairs()).increment(1);
            gauge!(family.pending, labels.pairs()).increment(1.0);
        }
    }

    pub fn job_duration(&self, seconds: f64) {
        histogram!(JOB_DURATION_SECONDS, "queue" => self.kind.queue_name()).record(seconds);
    }
}

/// Records an index build whose revision list exceeded the cap.
pub fn revisions_truncated(repo_id: i32) {
    counter!(REVISIONS_TRUNCATED, "repo" => repo_id.to_string()).increment(1);
}
