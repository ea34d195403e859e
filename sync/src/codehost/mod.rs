//! # Code host discovery
//!
//! Lists the repositories a connection selects on its code host and maps
//! them to [`RepoUpsert`] records, applying the connection's include and
//! exclude filters. GitHub also serves collaborator lists for permission
//! syncing.
//!
//! A 404 for an individual org, user or repo is logged and skipped. Any
//! other failure aborts discovery for the whole connection, since a partial
//! list would unlink repos that still exist.

pub mod generic;
pub mod gitea;
pub mod github;
pub mod gitlab;
mod http;

pub use http::{HostAuth, HostClient};

use crate::credentials::CredentialResolver;
use async_trait::async_trait;
use config::{ConnectionConfig, GitRevisions};
use errors::JobError;
use std::collections::BTreeMap;
use std::sync::Arc;
use storage::{Connection, RepoMetadata};
use tracing::info;

pub use storage::RepoUpsert;

#[async_trait]
pub trait RepoDiscovery: Send + Sync {
    async fn discover(&self, connection: &Connection, config: &ConnectionConfig) -> Result<Vec<RepoUpsert>, JobError>;
}

/// Lists collaborator account ids for a repo on its code host.
#[async_trait]
pub trait CollaboratorSource: Send + Sync {
    async fn list_collaborators(
        &self,
        code_host_type: &str,
        host_url: &str,
        token: &str,
        owner: &str,
        repo: &str
    ) -> Result<Vec<String>, JobError>;
}

/// Lists the external ids of the restricted repos an account's user can
/// read, using the account's own OAuth token.
#[async_trait]
pub trait AccessibleRepoSource: Send + Sync {
    async fn list_accessible_repo_ids(&self, provider: &str, token: &str) -> Result<Vec<String>, JobError>;
}

/// REST-backed discovery for every supported connection type.
pub struct CodeHostDiscovery {
    resolver: Arc<CredentialResolver>
}

impl CodeHostDiscovery {
    pub fn new(resolver: Arc<CredentialResolver>) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl RepoDiscovery for CodeHostDiscovery {
    async fn discover(&self, connection: &Connection, config: &ConnectionConfig) -> Result<Vec<RepoUpsert>, JobError> {
        let token = match config.token() {
            Some(spec) => Some(self.resolver.resolve(spec, connection.org_id).await?),
            None => None
        };

        let repos = match config {
            ConnectionConfig::Github(c) => github::GithubClient::new(c.url.as_deref(), token)?.discover(c).await?,
            ConnectionConfig::Gitlab(c) => gitlab::GitlabClient::new(c.url.as_deref(), token)?.discover(c).await?,
            ConnectionConfig::Gitea(c) => gitea::GiteaClient::new(c.url.as_deref(), token)?.discover(c).await?,
            ConnectionConfig::Git(c) => generic::discover(c)?
        };

        info!(
            connection = %connection.name,
            code_host = config.code_host_type(),
            repos = repos.len(),
            "Discovered repositories"
        );
        Ok(repos)
    }
}

/// GitHub collaborators via the REST API.
pub struct RestCollaboratorSource;

#[async_trait]
impl CollaboratorSource for RestCollaboratorSource {
    async fn list_collaborators(
        &self,
        code_host_type: &str,
        host_url: &str,
        token: &str,
        owner: &str,
        repo: &str
    ) -> Result<Vec<String>, JobError> {
        if code_host_type != "github" {
            return Err(errors::PermissionSyncError::UnsupportedCodeHost {
                code_host_type: code_host_type.to_string()
            }
            .into());
        }
        let config_url = (host_url != github::GITHUB_CLOUD_URL).then_some(host_url);
        let client = github::GithubClient::new(config_url, Some(token.to_string()))?;
        Ok(client.list_collaborator_ids(owner, repo).await?)
    }
}

/// Per-user repo listings on GitHub and GitLab. Base URLs default to the
/// cloud hosts.
#[derive(Debug, Clone, Default)]
pub struct RestAccessibleRepoSource {
    pub github_url: Option<String>,
    pub gitlab_url: Option<String>
}

#[async_trait]
impl AccessibleRepoSource for RestAccessibleRepoSource {
    async fn list_accessible_repo_ids(&self, provider: &str, token: &str) -> Result<Vec<String>, JobError> {
        let ids = match provider {
            "github" => {
                github::GithubClient::new(self.github_url.as_deref(), Some(token.to_string()))?
                    .list_private_repo_ids_for_user()
                    .await?
            }
            "gitlab" => {
                gitlab::GitlabClient::with_oauth_token(self.gitlab_url.as_deref(), token.to_string())?
                    .list_restricted_project_ids_for_user()
                    .await?
            }
            other => {
                return Err(errors::PermissionSyncError::UnsupportedCodeHost {
                    code_host_type: other.to_string()
                }
                .into());
            }
        };
        Ok(ids)
    }
}

pub(crate) fn marshal_bool(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}

pub(crate) fn hostname_of(host_url: &str, default: &str) -> String {
    url::Url::parse(host_url)
        .ok()
        .and_then(|u| u.host_str().map(String::from))
        .unwrap_or_else(|| default.to_string())
}

/// Repo metadata carrying the connection's revision globs and the
/// `zoekt.*` git config entries.
pub(crate) fn repo_metadata(revisions: Option<&GitRevisions>, git_config: BTreeMap<String, String>) -> RepoMetadata {
    RepoMetadata {
        branches: revisions.and_then(|r| r.branches.clone()),
        tags: revisions.and_then(|r| r.tags.clone()),
        git_config: Some(git_config),
        indexed_revisions: None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hostname_of() {
        assert_eq!(hostname_of("https://ghe.acme.io", "github.com"), "ghe.acme.io");
        assert_eq!(hostname_of("not a url", "github.com"), "github.com");
    }

    #[test]
    fn test_repo_metadata_copies_revision_globs() {
        let revisions = GitRevisions {
            branches: Some(vec!["release/*".to_string()]),
            tags: None
        };
        let metadata = repo_metadata(Some(&revisions), BTreeMap::new());
        assert_eq!(metadata.branches, Some(vec!["release/*".to_string()]));
        assert!(metadata.tags.is_none());
        assert_eq!(metadata.git_config, Some(BTreeMap::new()));
    }

    #[tokio::test]
    async fn test_collaborators_unsupported_for_gitlab() {
        let err = RestCollaboratorSource
            .list_collaborators("gitlab", "https://gitlab.com", "t", "a", "b")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            JobError::Permission(errors::PermissionSyncError::UnsupportedCodeHost { .. })
        ));
    }
}
