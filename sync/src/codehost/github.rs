//! GitHub and GitHub Enterprise Server.

use super::http::{HostAuth, HostClient};
use super::{hostname_of, marshal_bool, repo_metadata};
use crate::index::matches_any;
use config::{GithubConnectionConfig, GithubExclude};
use errors::CodeHostError;
use serde::Deserialize;
use std::collections::BTreeMap;
use storage::RepoUpsert;
use tracing::{debug, warn};

pub const GITHUB_CLOUD_URL: &str = "https://github.com";
const GITHUB_CLOUD_API_URL: &str = "https://api.github.com";

#[derive(Debug, Clone, Deserialize)]
pub struct GithubRepo {
    pub id: u64,
    pub full_name: String,
    #[serde(default)]
    pub fork: bool,
    #[serde(default)]
    pub private: bool,
    pub html_url: String,
    pub clone_url: Option<String>,
    pub stargazers_count: Option<u64>,
    pub watchers_count: Option<u64>,
    pub forks_count: Option<u64>,
    pub archived: Option<bool>,
    pub topics: Option<Vec<String>>,
    /// Kilobytes.
    pub size: Option<u64>
}

#[derive(Deserialize)]
struct Collaborator {
    id: u64
}

pub struct GithubClient {
    http: HostClient,
    host_url: String,
    hostname: String
}

impl GithubClient {
    /// `config_url` is the web URL of a GitHub Enterprise Server; `None`
    /// means github.com.
    pub fn new(config_url: Option<&str>, token: Option<String>) -> Result<Self, CodeHostError> {
        let host_url = config_url
            .unwrap_or(GITHUB_CLOUD_URL)
            .trim_end_matches('/')
            .to_string();
        let api_url = match config_url {
            Some(url) => format!("{}/api/v3", url.trim_end_matches('/')),
            None => GITHUB_CLOUD_API_URL.to_string()
        };
        let auth = token.map_or(HostAuth::Anonymous, HostAuth::Bearer);

        Ok(Self {
            http: HostClient::new(&api_url, auth)?,
            hostname: hostname_of(&host_url, "github.com"),
            host_url
        })
    }

    pub async fn discover(&self, config: &GithubConnectionConfig) -> Result<Vec<RepoUpsert>, CodeHostError> {
        let mut all = Vec::new();

        for org in config.orgs.iter().flatten() {
            match self.http.get_paginated::<GithubRepo>(&format!("/orgs/{org}/repos?per_page=100")).await? {
                Some(repos) => {
                    debug!(org = %org, count = repos.len(), "Fetched org repositories");
                    all.extend(repos);
                }
                None => warn!(org = %org, "GitHub org not found, skipping")
            }
        }

        for name in config.repos.iter().flatten() {
            let Some((owner, repo)) = name.split_once('/') else {
                warn!(repo = %name, "Expected owner/repo, skipping");
                continue;
            };
            match self.http.get_one::<GithubRepo>(&format!("/repos/{owner}/{repo}")).await? {
                Some(repo) => all.push(repo),
                None => warn!(repo = %name, "GitHub repo not found, skipping")
            }
        }

        for user in config.users.iter().flatten() {
            match self.http.get_paginated::<GithubRepo>(&format!("/users/{user}/repos?per_page=100")).await? {
                Some(repos) => {
                    debug!(user = %user, count = repos.len(), "Fetched user repositories");
                    all.extend(repos);
                }
                None => warn!(user = %user, "GitHub user not found, skipping")
            }
        }

        Ok(all
            .into_iter()
            .filter(|repo| match exclusion_reason(repo, config.topics.as_deref(), config.exclude.as_ref()) {
                Some(reason) => {
                    debug!(repo = %repo.full_name, reason = %reason, "Excluding repo");
                    false
                }
                None => true
            })
            .filter_map(|repo| self.to_upsert(repo, config))
            .collect())
    }

    fn to_upsert(&self, repo: GithubRepo, config: &GithubConnectionConfig) -> Option<RepoUpsert> {
        let clone_url = repo.clone_url?;
        let name = format!("{}/{}", self.hostname, repo.full_name);
        let archived = repo.archived.unwrap_or(false);

        let git_config = BTreeMap::from([
            ("zoekt.web-url-type".to_string(), "github".to_string()),
            ("zoekt.web-url".to_string(), repo.html_url.clone()),
            ("zoekt.name".to_string(), name.clone()),
            ("zoekt.github-stars".to_string(), repo.stargazers_count.unwrap_or(0).to_string()),
            ("zoekt.github-watchers".to_string(), repo.watchers_count.unwrap_or(0).to_string()),
            ("zoekt.github-forks".to_string(), repo.forks_count.unwrap_or(0).to_string()),
            ("zoekt.archived".to_string(), marshal_bool(archived)),
            ("zoekt.fork".to_string(), marshal_bool(repo.fork)),
            ("zoekt.public".to_string(), marshal_bool(!repo.private)),
        ]);

        Some(RepoUpsert {
            name,
            display_name: Some(repo.full_name),
            clone_url,
            web_url: Some(repo.html_url),
            external_id: repo.id.to_string(),
            external_code_host_type: "github".to_string(),
            external_code_host_url: self.host_url.clone(),
            is_fork: repo.fork,
            is_archived: archived,
            is_public: !repo.private,
            metadata: repo_metadata(config.revisions.as_ref(), git_config)
        })
    }

    /// Numeric account ids of everyone with access to `owner/repo`.
    pub async fn list_collaborator_ids(&self, owner: &str, repo: &str) -> Result<Vec<String>, CodeHostError> {
        let path = format!("/repos/{owner}/{repo}/collaborators?per_page=100");
        let collaborators = self
            .http
            .get_paginated::<Collaborator>(&path)
            .await?
            .ok_or_else(|| CodeHostError::Api {
                host: self.hostname.clone(),
                status: 404,
                message: format!("repository {owner}/{repo} not found")
            })?;
        Ok(collaborators.into_iter().map(|c| c.id.to_string()).collect())
    }

    /// Ids of the private repos the token's user can read. Public repos need
    /// no permission rows.
    pub async fn list_private_repo_ids_for_user(&self) -> Result<Vec<String>, CodeHostError> {
        let repos = self
            .http
            .get_paginated::<GithubRepo>("/user/repos?visibility=private&per_page=100")
            .await?
            .unwrap_or_default();
        Ok(repos.into_iter().map(|r| r.id.to_string()).collect())
    }
}

/// Why a repo is filtered out, or `None` when it is kept. Checks run in a
/// fixed order and the first hit wins.
pub fn exclusion_reason(
    repo: &GithubRepo,
    include_topics: Option<&[String]>,
    exclude: Option<&GithubExclude>
) -> Option<String> {
    if repo.clone_url.is_none() {
        return Some("clone_url is undefined".to_string());
    }

    if let Some(exclude) = exclude {
        if exclude.forks == Some(true) && repo.fork {
            return Some("`exclude.forks` is true".to_string());
        }
        if exclude.archived == Some(true) && repo.archived == Some(true) {
            return Some("`exclude.archived` is true".to_string());
        }
        if let Some(globs) = &exclude.repos
            && matches_any(globs, &repo.full_name)
        {
            return Some(format!("`exclude.repos` contains {}", repo.full_name));
        }
        if let Some(topics) = &exclude.topics {
            let globs = lowercase(topics);
            let hits: Vec<&str> = repo_topics(repo).filter(|t| matches_any(&globs, t)).collect();
            if !hits.is_empty() {
                return Some(format!("`exclude.topics` matches the following topics: {}", hits.join(", ")));
            }
        }
    }

    if let Some(topics) = include_topics {
        let globs = lowercase(topics);
        if !repo_topics(repo).any(|t| matches_any(&globs, t)) {
            return Some(format!(
                "`include.topics` does not match any of the following topics: {}",
                globs.join(", ")
            ));
        }
    }

    let size_bytes = repo.size.filter(|kb| *kb > 0).map(|kb| kb * 1000);
    if let (Some(bounds), Some(bytes)) = (exclude.and_then(|e| e.size.as_ref()), size_bytes) {
        if let Some(min) = bounds.min.filter(|m| *m > 0)
            && bytes < min
        {
            return Some(format!("repo is less than `exclude.size.min`={min} bytes."));
        }
        if let Some(max) = bounds.max.filter(|m| *m > 0)
            && bytes > max
        {
            return Some(format!("repo is greater than `exclude.size.max`={max} bytes."));
        }
    }

    None
}

fn lowercase(values: &[String]) -> Vec<String> {
    values.iter().map(|v| v.to_lowercase()).collect()
}

fn repo_topics(repo: &GithubRepo) -> impl Iterator<Item = &str> {
    repo.topics.iter().flatten().map(String::as_str)
}
