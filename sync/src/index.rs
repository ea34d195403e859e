//! # Index Builder
//!
//! Chooses which revisions of a mirrored repository get indexed and runs the
//! external indexer over them.
//!
//! `HEAD` is always indexed. Local branches and tags matching the repo's
//! globs are appended in that order, and the whole list is capped at
//! [`MAX_REVISIONS`] because the indexer refuses more.

use crate::git;
use config::Settings;
use errors::{IndexBuildError, JobError};
use glob::{MatchOptions, Pattern};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use storage::Repo;
use tokio::process::Command;
use tracing::{debug, info, warn};

pub const MAX_REVISIONS: usize = 64;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionSelection {
    pub revisions: Vec<String>,
    /// Length of the list before the cap was applied, when it was applied.
    pub truncated_from: Option<usize>
}

/// Whether `name` matches at least one of `globs`. Invalid globs never match.
pub fn matches_any(globs: &[String], name: &str) -> bool {
    globs.iter().any(|g| match Pattern::new(g) {
        Ok(pattern) => pattern.matches_with(name, MATCH_OPTIONS),
        Err(e) => {
            debug!(glob = %g, error = %e, "Ignoring invalid glob");
            false
        }
    })
}

pub fn select_revisions(
    branch_globs: Option<&[String]>,
    tag_globs: Option<&[String]>,
    branches: &[String],
    tags: &[String]
) -> RevisionSelection {
    let mut revisions = vec!["HEAD".to_string()];

    if let Some(globs) = branch_globs {
        revisions.extend(
            branches
                .iter()
                .filter(|b| matches_any(globs, b))
                .map(|b| format!("refs/heads/{b}"))
        );
    }
    if let Some(globs) = tag_globs {
        revisions.extend(
            tags.iter()
                .filter(|t| matches_any(globs, t))
                .map(|t| format!("refs/tags/{t}"))
        );
    }

    let total = revisions.len();
    let truncated_from = (total > MAX_REVISIONS).then(|| {
        revisions.truncate(MAX_REVISIONS);
        total
    });

    RevisionSelection {
        revisions,
        truncated_from
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexOutput {
    pub revisions: Vec<String>,
    pub stdout: String,
    pub stderr: String
}

/// Invokes the external indexer with a fixed argument contract.
#[derive(Debug, Clone)]
pub struct IndexBuilder {
    program: String,
    index_dir: PathBuf
}

impl IndexBuilder {
    pub fn new(program: impl Into<String>, index_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            index_dir: index_dir.into()
        }
    }

    pub fn index_dir(&self) -> &Path {
        &self.index_dir
    }

    /// Arguments for one indexer run. Each value is its own argument, so no
    /// shell quoting is involved.
    pub fn command_args(
        &self,
        repo: &Repo,
        repo_path: &Path,
        revisions: &[String],
        settings: &Settings
    ) -> Vec<String> {
        vec![
            "-allow_missing_branches".to_string(),
            "-index".to_string(),
            self.index_dir.display().to_string(),
            "-max_trigram_count".to_string(),
            settings.max_trigram_count.to_string(),
            "-file_limit".to_string(),
            settings.max_file_size.to_string(),
            "-branches".to_string(),
            revisions.join(","),
            "-tenant_id".to_string(),
            repo.org_id.to_string(),
            "-repo_id".to_string(),
            repo.id.to_string(),
            "-shard_prefix".to_string(),
            repo.shard_prefix(),
            repo_path.display().to_string(),
        ]
    }

    /// Selects revisions from the mirror's local refs and builds the index.
    pub async fn index_repository(
        &self,
        repo: &Repo,
        repo_path: &Path,
        settings: &Settings
    ) -> Result<IndexOutput, JobError> {
        let branches = match repo.metadata.branches {
            Some(_) => git::get_branches(repo_path).await?,
            None => Vec::new()
        };
        let tags = match repo.metadata.tags {
            Some(_) => git::get_tags(repo_path).await?,
            None => Vec::new()
        };

        let selection = select_revisions(
            repo.metadata.branches.as_deref(),
            repo.metadata.tags.as_deref(),
            &branches,
            &tags
        );
        if let Some(count) = selection.truncated_from {
            warn!(
                repo_id = repo.id,
                revision_count = count,
                "Too many revisions, truncating to {MAX_REVISIONS}"
            );
            observability::telemetry::revisions_truncated(repo.id);
        }

        let args = self.command_args(repo, repo_path, &selection.revisions, settings);
        let (stdout, stderr) = self.run(&args).await?;

        Ok(IndexOutput {
            revisions: selection.revisions,
            stdout,
            stderr
        })
    }

    /// Runs the indexer to completion. The child is killed if this future
    /// is dropped, which is how job timeouts stop it.
    pub async fn run(&self, args: &[String]) -> Result<(String, String), IndexBuildError> {
        tokio::fs::create_dir_all(&self.index_dir)
            .await
            .map_err(|e| IndexBuildError::Spawn {
                program: self.program.clone(),
                reason: format!("cannot create {}: {e}", self.index_dir.display())
            })?;

        debug!(program = %self.program, ?args, "Spawning indexer");
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| IndexBuildError::Spawn {
                program: self.program.clone(),
                reason: e.to_string()
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        for line in stdout.lines().chain(stderr.lines()) {
            info!(target: "indexer", "{line}");
        }

        if output.status.success() {
            Ok((stdout, stderr))
        } else {
            Err(IndexBuildError::NonZeroExit {
                code: output.status.code(),
                stderr
            })
        }
    }

    /// Deletes every shard file owned by `repo`. Returns how many were removed.
    pub async fn cleanup(&self, repo: &Repo) -> Result<usize, IndexBuildError> {
        let fail = |e: std::io::Error| IndexBuildError::Cleanup {
            repo_id: repo.id,
            reason: e.to_string()
        };

        let mut entries = match tokio::fs::read_dir(&self.index_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(fail(e))
        };

        let prefix = repo.shard_prefix();
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await.map_err(fail)? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if is_shard_of(name, &prefix) {
                info!(repo_id = repo.id, shard = %name, "Deleting shard file");
                tokio::fs::remove_file(entry.path()).await.map_err(fail)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// `1_5` owns `1_5_v16.00000.zoekt` but not `1_50_v16.00000.zoekt`.
fn is_shard_of(file_name: &str, prefix: &str) -> bool {
    file_name
        .strip_prefix(prefix)
        .is_some_and(|rest| rest.starts_with('_') || rest.starts_with('.'))
}
