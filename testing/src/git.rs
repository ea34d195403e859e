use git2::{Oid, Repository, RepositoryInitOptions, Signature};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A throwaway working repository on local disk, usable as a clone source.
pub struct GitRepoFixture {
    _dir: TempDir,
    path: PathBuf,
    repo: Repository
}

impl GitRepoFixture {
    /// Creates an empty repository whose default branch is `main`.
    pub fn new() -> anyhow::Result<Self> {
        let dir = TempDir::new()?;
        let path = dir.path().join("source");
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        let repo = Repository::init_opts(&path, &opts)?;
        Ok(Self {
            _dir: dir,
            path,
            repo
        })
    }

    /// Creates a repository with one commit on `main`.
    pub fn with_initial_commit() -> anyhow::Result<Self> {
        let fixture = Self::new()?;
        fixture.commit("README.md", "# fixture\n", "initial commit")?;
        Ok(fixture)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Clone URL for the fixture. Local paths are accepted by libgit2.
    pub fn url(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    /// Writes `file` and commits it on the current HEAD.
    pub fn commit(&self, file: &str, content: &str, message: &str) -> anyhow::Result<Oid> {
        std::fs::write(self.path.join(file), content)?;
        let mut index = self.repo.index()?;
        index.add_path(Path::new(file))?;
        index.write()?;
        let tree = self.repo.find_tree(index.write_tree()?)?;
        let sig = Signature::now("Fixture", "fixture@example.com")?;
        let parent = self.repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        Ok(self
            .repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?)
    }

    /// Creates a branch pointing at the current HEAD commit.
    pub fn branch(&self, name: &str) -> anyhow::Result<()> {
        let head = self.repo.head()?.peel_to_commit()?;
        self.repo.branch(name, &head, true)?;
        Ok(())
    }

    /// Creates a lightweight tag at the current HEAD commit.
    pub fn tag(&self, name: &str) -> anyhow::Result<()> {
        let head = self.repo.head()?.peel_to_commit()?;
        self.repo.tag_lightweight(name, head.as_object(), true)?;
        Ok(())
    }

    pub fn head_oid(&self) -> anyhow::Result<Oid> {
        Ok(self.repo.head()?.peel_to_commit()?.id())
    }
}
