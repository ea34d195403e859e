//! A single repository named by its clone URL or local path.

use super::{marshal_bool, repo_metadata};
use config::GenericGitHostConnectionConfig;
use errors::CodeHostError;
use std::collections::BTreeMap;
use std::path::Path;
use storage::RepoUpsert;
use url::Url;

fn parse_remote(raw: &str) -> Result<Url, CodeHostError> {
    let invalid = || CodeHostError::InvalidConfig {
        reason: format!("{raw} is neither a URL nor an absolute path")
    };
    match Url::parse(raw) {
        Ok(url) => Ok(url),
        Err(_) if Path::new(raw).is_absolute() => Url::from_file_path(raw).map_err(|()| invalid()),
        Err(_) => Err(invalid())
    }
}

pub fn discover(config: &GenericGitHostConnectionConfig) -> Result<Vec<RepoUpsert>, CodeHostError> {
    let remote = parse_remote(&config.url)?;
    let path = remote.path().trim_end_matches('/').trim_end_matches(".git");
    let name = match remote.host_str() {
        Some(host) => format!("{host}{path}"),
        None => path.trim_start_matches('/').to_string()
    };
    let origin = match remote.host_str() {
        Some(host) => format!("{}://{host}", remote.scheme()),
        None => format!("{}://", remote.scheme())
    };

    let git_config = BTreeMap::from([
        ("zoekt.name".to_string(), name.clone()),
        ("zoekt.archived".to_string(), marshal_bool(false)),
        ("zoekt.fork".to_string(), marshal_bool(false)),
        ("zoekt.public".to_string(), marshal_bool(true)),
    ]);

    Ok(vec![RepoUpsert {
        display_name: Some(name.clone()),
        name,
        clone_url: config.url.clone(),
        web_url: None,
        external_id: remote.to_string(),
        external_code_host_type: "git".to_string(),
        external_code_host_url: origin,
        is_fork: false,
        is_archived: false,
        is_public: true,
        metadata: repo_metadata(config.revisions.as_ref(), git_config)
    }])
}
