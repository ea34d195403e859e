//! Metric name catalogue.

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};

pub const ACTIVE_CONNECTION_SYNC_JOBS: &str = "active_connection_sync_jobs";
pub const PENDING_CONNECTION_SYNC_JOBS: &str = "pending_connection_sync_jobs";
pub const CONNECTION_SYNC_JOB_REATTEMPTS: &str = "connection_sync_job_reattempts";
pub const CONNECTION_SYNC_JOB_FAILS: &str = "connection_sync_job_fails";
pub const CONNECTION_SYNC_JOB_SUCCESSES: &str = "connection_sync_job_successes";

pub const ACTIVE_REPO_INDEX_JOBS: &str = "active_repo_index_jobs";
pub const PENDING_REPO_INDEX_JOBS: &str = "pending_repo_index_jobs";
pub const REPO_INDEX_JOB_REATTEMPTS: &str = "repo_index_job_reattempts";
pub const REPO_INDEX_JOB_FAILS: &str = "repo_index_job_fails";
pub const REPO_INDEX_JOB_SUCCESSES: &str = "repo_index_job_successes";

pub const ACTIVE_PERMISSION_SYNC_JOBS: &str = "permission_sync_job_active";
pub const PENDING_PERMISSION_SYNC_JOBS: &str = "permission_sync_job_pending";
pub const PERMISSION_SYNC_JOB_REATTEMPTS: &str = "permission_sync_job_reattempts";
pub const PERMISSION_SYNC_JOB_FAILS: &str = "permission_sync_job_fails";
pub const PERMISSION_SYNC_JOB_SUCCESSES: &str = "permission_sync_job_successes";

pub const ACTIVE_ACCOUNT_PERMISSION_SYNC_JOBS: &str = "account_permission_sync_job_active";
pub const PENDING_ACCOUNT_PERMISSION_SYNC_JOBS: &str = "account_permission_sync_job_pending";
pub const ACCOUNT_PERMISSION_SYNC_JOB_REATTEMPTS: &str = "account_permission_sync_job_reattempts";
pub const ACCOUNT_PERMISSION_SYNC_JOB_FAILS: &str = "account_permission_sync_job_fails";
pub const ACCOUNT_PERMISSION_SYNC_JOB_SUCCESSES: &str = "account_permission_sync_job_successes";

pub const JOB_DURATION_SECONDS: &str = "job_duration_seconds";
pub const REVISIONS_TRUNCATED: &str = "revisions_truncated";

// Emitted from the storage crate's lock implementation.
pub const LOCK_ACQUIRED: &str = "lock_acquired";
pub const LOCK_CONTENDED: &str = "lock_contended";

pub(crate) fn describe_all() {
    for (name, help) in [
        (ACTIVE_CONNECTION_SYNC_JOBS, "Connection sync jobs currently running"),
        (PENDING_CONNECTION_SYNC_JOBS, "Connection sync jobs waiting in the queue"),
        (ACTIVE_REPO_INDEX_JOBS, "Repo index jobs currently running"),
        (PENDING_REPO_INDEX_JOBS, "Repo index jobs waiting in the queue"),
        (ACTIVE_PERMISSION_SYNC_JOBS, "Permission sync jobs currently running"),
        (PENDING_PERMISSION_SYNC_JOBS, "Permission sync jobs waiting in the queue"),
        (ACTIVE_ACCOUNT_PERMISSION_SYNC_JOBS, "Account permission sync jobs currently running"),
        (PENDING_ACCOUNT_PERMISSION_SYNC_JOBS, "Account permission sync jobs waiting in the queue")
    ] {
        describe_gauge!(name, help);
    }

    for (name, help) in [
        (CONNECTION_SYNC_JOB_REATTEMPTS, "Connection sync attempts scheduled for retry"),
        (CONNECTION_SYNC_JOB_FAILS, "Connection sync jobs failed after the last attempt"),
        (CONNECTION_SYNC_JOB_SUCCESSES, "Connection sync jobs completed"),
        (REPO_INDEX_JOB_REATTEMPTS, "Repo index attempts scheduled for retry"),
        (REPO_INDEX_JOB_FAILS, "Repo index jobs failed after the last attempt"),
        (REPO_INDEX_JOB_SUCCESSES, "Repo index jobs completed"),
        (PERMISSION_SYNC_JOB_REATTEMPTS, "Permission sync attempts scheduled for retry"),
        (PERMISSION_SYNC_JOB_FAILS, "Permission sync jobs failed after the last attempt"),
        (PERMISSION_SYNC_JOB_SUCCESSES, "Permission sync jobs completed"),
        (ACCOUNT_PERMISSION_SYNC_JOB_REATTEMPTS, "Account permission sync attempts scheduled for retry"),
        (ACCOUNT_PERMISSION_SYNC_JOB_FAILS, "Account permission sync jobs failed after the last attempt"),
        (ACCOUNT_PERMISSION_SYNC_JOB_SUCCESSES, "Account permission sync jobs completed"),
        (REVISIONS_TRUNCATED, "Index builds whose revision list hit the cap"),
        (LOCK_ACQUIRED, "Distributed lock acquisitions"),
        (LOCK_CONTENDED, "Distributed lock attempts that lost to another holder")
    ] {
        describe_counter!(name, help);
    }

    describe_histogram!(
        JOB_DURATION_SECONDS,
        Unit::Seconds,
        "Wall time of one job attempt"
    );
}
