//! # Sync Engine
//!
//! Keeps code-host connections, repository mirrors, search indexes and repo
//! permissions in step with the declarative config and the code hosts.
//!
//! Four job queues do the work:
//! - connection sync ([`connection_manager`]) discovers repos per connection
//! - repo indexing ([`repo_index_manager`]) mirrors, indexes and garbage
//!   collects repos
//! - permission sync ([`permission_syncer`]) replaces repo permissions from
//!   the code host's collaborator lists
//! - account permission sync ([`account_permission_syncer`]) replaces an
//!   account's permissions from the repos its user can see
//!
//! [`reconciler::ConfigReconciler`] feeds the first queue from the config
//! file.

pub mod account_permission_syncer;
pub mod codehost;
pub mod connection_manager;
pub mod credentials;
pub mod entitlements;
pub mod git;
pub mod github_app;
pub mod index;
pub mod permission_syncer;
pub mod permissions;
pub mod queue;
pub mod reconciler;
pub mod repo_index_manager;
pub mod search_contexts;

pub use account_permission_syncer::{AccountPermissionSyncHandler, AccountPermissionSyncer};
pub use codehost::{
    AccessibleRepoSource, CodeHostDiscovery, CollaboratorSource, RepoDiscovery, RestAccessibleRepoSource,
    RestCollaboratorSource
};
pub use connection_manager::{ConnectionManager, ConnectionSyncHandler, ConnectionSyncPayload};
pub use credentials::{CredentialResolver, RepoAuthCredentials, RepoCredentialProvider};
pub use entitlements::Entitlements;
pub use github_app::{GithubAppManager, RestGithubAppApi};
pub use index::IndexBuilder;
pub use permission_syncer::{PermissionSyncHandler, RepoPermissionSyncer};
pub use permissions::PermissionCacheRebuilder;
pub use queue::{BackoffPolicy, JobHandler, JobQueue, QueueSettings};
pub use reconciler::{ConfigReconciler, ReconcileReport};
pub use repo_index_manager::{RepoIndexHandler, RepoIndexManager};
pub use search_contexts::SearchContextSyncer;
