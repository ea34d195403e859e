//! GitLab.com and self-managed GitLab.

use super::http::{HostAuth, HostClient};
use super::{hostname_of, marshal_bool, repo_metadata};
use crate::index::matches_any;
use config::{GitlabConnectionConfig, GitlabExclude};
use errors::CodeHostError;
use serde::Deserialize;
use std::collections::BTreeMap;
use storage::RepoUpsert;
use tracing::{debug, warn};

pub const GITLAB_CLOUD_HOSTNAME: &str = "gitlab.com";
const GITLAB_CLOUD_URL: &str = "https://gitlab.com";

#[derive(Debug, Clone, Deserialize)]
pub struct GitlabProject {
    pub id: u64,
    pub path_with_namespace: String,
    pub web_url: String,
    pub http_url_to_repo: String,
    #[serde(default)]
    pub archived: bool,
    pub forked_from_project: Option<serde_json::Value>,
    pub visibility: Option<String>,
    pub star_count: Option<u64>,
    pub forks_count: Option<u64>
}

impl GitlabProject {
    fn is_fork(&self) -> bool {
        self.forked_from_project
            .as_ref()
            .is_some_and(|v| !v.is_null())
    }

    fn is_public(&self) -> bool {
        self.visibility.as_deref() == Some("public")
    }
}

pub struct GitlabClient {
    http: HostClient,
    host_url: String,
    hostname: String
}

fn encode_path(path: &str) -> String {
    url::form_urlencoded::byte_serialize(path.as_bytes()).collect()
}

impl GitlabClient {
    pub fn new(config_url: Option<&str>, token: Option<String>) -> Result<Self, CodeHostError> {
        let host_url = config_url
            .unwrap_or(GITLAB_CLOUD_URL)
            .trim_end_matches('/')
            .to_string();
        let auth = token.map_or(HostAuth::Anonymous, HostAuth::PrivateToken);

        Ok(Self {
            http: HostClient::new(&format!("{host_url}/api/v4"), auth)?,
            hostname: hostname_of(&host_url, GITLAB_CLOUD_HOSTNAME),
            host_url
        })
    }

    /// Client authenticated with a user's OAuth token rather than a
    /// personal access token.
    pub fn with_oauth_token(config_url: Option<&str>, token: String) -> Result<Self, CodeHostError> {
        let mut client = Self::new(config_url, None)?;
        client.http = HostClient::new(&format!("{}/api/v4", client.host_url), HostAuth::Bearer(token))?;
        Ok(client)
    }

    /// Ids of the private and internal projects the token's user is a
    /// member of.
    pub async fn list_restricted_project_ids_for_user(&self) -> Result<Vec<String>, CodeHostError> {
        let mut ids = Vec::new();
        for visibility in ["private", "internal"] {
            let path = format!("/projects?visibility={visibility}&membership=true&per_page=100");
            let projects = self
                .http
                .get_paginated::<GitlabProject>(&path)
                .await?
                .unwrap_or_default();
            ids.extend(projects.into_iter().map(|p| p.id.to_string()));
        }
        Ok(ids)
    }

    pub async fn discover(&self, config: &GitlabConnectionConfig) -> Result<Vec<RepoUpsert>, CodeHostError> {
        let mut all = Vec::new();

        if config.all == Some(true) {
            if self.hostname == GITLAB_CLOUD_HOSTNAME {
                warn!("Ignoring `all: true` for {GITLAB_CLOUD_HOSTNAME}");
            } else if let Some(projects) = self.http.get_paginated::<GitlabProject>("/projects?per_page=100").await? {
                debug!(count = projects.len(), "Fetched all visible projects");
                all.extend(projects);
            }
        }

        for group in config.groups.iter().flatten() {
            let path = format!(
                "/groups/{}/projects?per_page=100&include_subgroups=true",
                encode_path(group)
            );
            match self.http.get_paginated::<GitlabProject>(&path).await? {
                Some(projects) => {
                    debug!(group = %group, count = projects.len(), "Fetched group projects");
                    all.extend(projects);
                }
                None => warn!(group = %group, "GitLab group not found, skipping")
            }
        }

        for user in config.users.iter().flatten() {
            match self
                .http
                .get_paginated::<GitlabProject>(&format!("/users/{}/projects?per_page=100", encode_path(user)))
                .await?
            {
                Some(projects) => all.extend(projects),
                None => warn!(user = %user, "GitLab user not found, skipping")
            }
        }

        for project in config.projects.iter().flatten() {
            match self
                .http
                .get_one::<GitlabProject>(&format!("/projects/{}", encode_path(project)))
                .await?
            {
                Some(p) => all.push(p),
                None => warn!(project = %project, "GitLab project not found, skipping")
            }
        }

        Ok(all
            .into_iter()
            .filter(|p| match exclusion_reason(p, config.exclude.as_ref()) {
                Some(reason) => {
                    debug!(project = %p.path_with_namespace, reason = %reason, "Excluding project");
                    false
                }
                None => true
            })
            .map(|p| self.to_upsert(p, config))
            .collect())
    }

    fn to_upsert(&self, project: GitlabProject, config: &GitlabConnectionConfig) -> RepoUpsert {
        let name = format!("{}/{}", self.hostname, project.path_with_namespace);
        let is_fork = project.is_fork();
        let is_public = project.is_public();

        let git_config = BTreeMap::from([
            ("zoekt.web-url-type".to_string(), "gitlab".to_string()),
            ("zoekt.web-url".to_string(), project.web_url.clone()),
            ("zoekt.name".to_string(), name.clone()),
            ("zoekt.gitlab-stars".to_string(), project.star_count.unwrap_or(0).to_string()),
            ("zoekt.gitlab-forks".to_string(), project.forks_count.unwrap_or(0).to_string()),
            ("zoekt.archived".to_string(), marshal_bool(project.archived)),
            ("zoekt.fork".to_string(), marshal_bool(is_fork)),
            ("zoekt.public".to_string(), marshal_bool(is_public)),
        ]);

        RepoUpsert {
            name,
            display_name: Some(project.path_with_namespace),
            clone_url: project.http_url_to_repo,
            web_url: Some(project.web_url),
            external_id: project.id.to_string(),
            external_code_host_type: "gitlab".to_string(),
            external_code_host_url: self.host_url.clone(),
            is_fork,
            is_archived: project.archived,
            is_public,
            metadata: repo_metadata(config.revisions.as_ref(), git_config)
        }
    }
}

pub fn exclusion_reason(project: &GitlabProject, exclude: Option<&GitlabExclude>) -> Option<String> {
    let exclude = exclude?;
    if exclude.archived == Some(true) && project.archived {
        return Some("`exclude.archived` is true".to_string());
    }
    if exclude.forks == Some(true) && project.is_fork() {
        return Some("`exclude.forks` is true".to_string());
    }
    if let Some(globs) = &exclude.projects
        && matches_any(globs, &project.path_with_namespace)
    {
        return Some(format!("`exclude.projects` contains {}", project.path_with_namespace));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn project(path: &str, fork: bool) -> GitlabProject {
        serde_json::from_value(json!({
            "id": 9,
            "path_with_namespace": path,
            "web_url": format!("https://gitlab.com/{path}"),
            "http_url_to_repo": format!("https://gitlab.com/{path}.git"),
            "forked_from_project": if fork { json!({"id": 1}) } else { json!(null) },
            "visibility": "public"
        }))
        .unwrap()
    }

    #[test]
    fn test_exclusions() {
        let exclude = GitlabExclude {
            forks: Some(true),
            projects: Some(vec!["acme/legacy-*".to_string()]),
            ..Default::default()
        };
        assert!(exclusion_reason(&project("acme/web", true), Some(&exclude)).is_some());
        assert!(exclusion_reason(&project("acme/legacy-api", false), Some(&exclude)).is_some());
        assert!(exclusion_reason(&project("acme/web", false), Some(&exclude)).is_none());
        assert!(exclusion_reason(&project("acme/web", true), None).is_none());
    }

    #[tokio::test]
    async fn test_group_path_is_encoded_and_token_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/groups/acme%2Fplatform/projects"))
            .and(header("PRIVATE-TOKEN", "glpat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
                "id": 5,
                "path_with_namespace": "acme/platform/api",
                "web_url": "https://gl.acme.io/acme/platform/api",
                "http_url_to_repo": "https://gl.acme.io/acme/platform/api.git",
                "visibility": "internal"
            }])))
            .mount(&server)
            .await;

        let config: GitlabConnectionConfig = serde_json::from_value(json!({
            "url": server.uri(),
            "groups": ["acme/platform"]
        }))
        .unwrap();
        let client = GitlabClient::new(config.url.as_deref(), Some("glpat".to_string())).unwrap();
        let repos = client.discover(&config).await.unwrap();

        assert_eq!(repos.len(), 1);
        assert_eq!(repos[0].name, "127.0.0.1/acme/platform/api");
        assert_eq!(repos[0].external_code_host_type, "gitlab");
        assert!(!repos[0].is_public);
    }

    #[tokio::test]
    async fn test_restricted_project_ids_use_oauth_bearer() {
        let server = MockServer::start().await;
        for (visibility, id) in [("private", 11), ("internal", 12)] {
            Mock::given(method("GET"))
                .and(path("/api/v4/projects"))
                .and(query_param("visibility", visibility))
                .and(query_param("membership", "true"))
                .and(header("authorization", "Bearer oauth-token"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
                    "id": id,
                    "path_with_namespace": format!("acme/{visibility}"),
                    "web_url": "https://gl.acme.io/acme/x",
                    "http_url_to_repo": "https://gl.acme.io/acme/x.git",
                    "visibility": visibility
                }])))
                .mount(&server)
                .await;
        }

        let client = GitlabClient::with_oauth_token(Some(&server.uri()), "oauth-token".to_string()).unwrap();
        assert_eq!(
            client.list_restricted_project_ids_for_user().await.unwrap(),
            vec!["11", "12"]
        );
    }
}
