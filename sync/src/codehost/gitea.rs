//! Gitea.com and self-hosted Gitea.

use super::http::{HostAuth, HostClient};
use super::{hostname_of, marshal_bool, repo_metadata};
use crate::index::matches_any;
use config::{GiteaConnectionConfig, GiteaExclude};
use errors::CodeHostError;
use serde::Deserialize;
use std::collections::BTreeMap;
use storage::RepoUpsert;
use tracing::{debug, warn};

const GITEA_CLOUD_URL: &str = "https://gitea.com";

#[derive(Debug, Clone, Deserialize)]
pub struct GiteaRepo {
    pub id: u64,
    pub full_name: Option<String>,
    pub html_url: String,
    pub clone_url: String,
    #[serde(default)]
    pub fork: bool,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub private: bool,
    pub stars_count: Option<u64>,
    pub forks_count: Option<u64>
}

pub struct GiteaClient {
    http: HostClient,
    host_url: String,
    hostname: String
}

impl GiteaClient {
    pub fn new(config_url: Option<&str>, token: Option<String>) -> Result<Self, CodeHostError> {
        let host_url = config_url
            .unwrap_or(GITEA_CLOUD_URL)
            .trim_end_matches('/')
            .to_string();
        let auth = token.map_or(HostAuth::Anonymous, HostAuth::Token);

        Ok(Self {
            http: HostClient::new(&format!("{host_url}/api/v1"), auth)?,
            hostname: hostname_of(&host_url, "gitea.com"),
            host_url
        })
    }

    pub async fn discover(&self, config: &GiteaConnectionConfig) -> Result<Vec<RepoUpsert>, CodeHostError> {
        let mut all = Vec::new();

        for org in config.orgs.iter().flatten() {
            match self.http.get_paginated::<GiteaRepo>(&format!("/orgs/{org}/repos?limit=100")).await? {
                Some(repos) => all.extend(repos),
                None => warn!(org = %org, "Gitea org not found, skipping")
            }
        }

        for name in config.repos.iter().flatten() {
            let Some((owner, repo)) = name.split_once('/') else {
                warn!(repo = %name, "Expected owner/repo, skipping");
                continue;
            };
            match self.http.get_one::<GiteaRepo>(&format!("/repos/{owner}/{repo}")).await? {
                Some(repo) => all.push(repo),
                None => warn!(repo = %name, "Gitea repo not found, skipping")
            }
        }

        for user in config.users.iter().flatten() {
            match self.http.get_paginated::<GiteaRepo>(&format!("/users/{user}/repos?limit=100")).await? {
                Some(repos) => all.extend(repos),
                None => warn!(user = %user, "Gitea user not found, skipping")
            }
        }

        Ok(all
            .into_iter()
            .filter_map(|repo| {
                let Some(full_name) = repo.full_name.clone() else {
                    warn!(repo_id = repo.id, "Repository with undefined full_name found");
                    return None;
                };
                if let Some(reason) = exclusion_reason(&repo, &full_name, config.exclude.as_ref()) {
                    debug!(repo = %full_name, reason = %reason, "Excluding repo");
                    return None;
                }
                Some(self.to_upsert(repo, full_name, config))
            })
            .collect())
    }

    fn to_upsert(&self, repo: GiteaRepo, full_name: String, config: &GiteaConnectionConfig) -> RepoUpsert {
        let name = format!("{}/{}", self.hostname, full_name);
        let git_config = BTreeMap::from([
            ("zoekt.web-url-type".to_string(), "gitea".to_string()),
            ("zoekt.web-url".to_string(), repo.html_url.clone()),
            ("zoekt.name".to_string(), name.clone()),
            ("zoekt.gitea-stars".to_string(), repo.stars_count.unwrap_or(0).to_string()),
            ("zoekt.gitea-forks".to_string(), repo.forks_count.unwrap_or(0).to_string()),
            ("zoekt.archived".to_string(), marshal_bool(repo.archived)),
            ("zoekt.fork".to_string(), marshal_bool(repo.fork)),
            ("zoekt.public".to_string(), marshal_bool(!repo.private)),
        ]);

        RepoUpsert {
            name,
            display_name: Some(full_name),
            clone_url: repo.clone_url,
            web_url: Some(repo.html_url),
            external_id: repo.id.to_string(),
            external_code_host_type: "gitea".to_string(),
            external_code_host_url: self.host_url.clone(),
            is_fork: repo.fork,
            is_archived: repo.archived,
            is_public: !repo.private,
            metadata: repo_metadata(config.revisions.as_ref(), git_config)
        }
    }
}

fn exclusion_reason(repo: &GiteaRepo, full_name: &str, exclude: Option<&GiteaExclude>) -> Option<String> {
    let exclude = exclude?;
    if exclude.forks == Some(true) && repo.fork {
        return Some("`exclude.forks` is true".to_string());
    }
    if exclude.archived == Some(true) && repo.archived {
        return Some("`exclude.archived` is true".to_string());
    }
    if let Some(globs) = &exclude.repos
        && matches_any(globs, full_name)
    {
        return Some(format!("`exclude.repos` contains {full_name}"));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_discover_skips_nameless_and_excluded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/orgs/acme/repos"))
            .and(header("Authorization", "token tea"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "id": 1, "full_name": "acme/web", "html_url": "h", "clone_url": "https://gitea.acme.io/acme/web.git" },
                { "id": 2, "html_url": "h", "clone_url": "c" },
                { "id": 3, "full_name": "acme/fork", "fork": true, "html_url": "h", "clone_url": "c" }
            ])))
            .mount(&server)
            .await;

        let config: GiteaConnectionConfig = serde_json::from_value(json!({
            "url": server.uri(),
            "orgs": ["acme"],
            "exclude": { "forks": true }
        }))
        .unwrap();
        let client = GiteaClient::new(config.url.as_deref(), Some("tea".to_string())).unwrap();
        let repos = client.discover(&config).await.unwrap();

        assert_eq!(repos.len(), 1);
        assert_eq!(repos[0].display_name.as_deref(), Some("acme/web"));
        assert_eq!(repos[0].external_id, "1");
    }
}
