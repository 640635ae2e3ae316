use std::path::Path;

use git2::{IndexAddOption, Repository, RepositoryInitOptions};
use linemark_types::CommitId;
use tempfile::TempDir;

pub struct TestRepo {
    pub repo: Repository,
    _dir: TempDir,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

type Result<T> = std::result::Result<T, Error>;

impl TestRepo {
    /// Creates an empty repository whose HEAD points at `main`.
    pub fn new() -> Result<Self> {
        let dir = TempDir::new()?;
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        let repo = Repository::init_opts(dir.path(), &opts)?;
        Ok(Self { _dir: dir, repo })
    }

    pub fn path(&self) -> &Path {
        self._dir.path()
    }

    pub fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let file_path = self._dir.path().join(path);
        if let Some(parent) = file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&file_path, content)?;
        Ok(())
    }

    pub fn delete_file(&self, path: &str) -> Result<()> {
        std::fs::remove_file(self._dir.path().join(path))?;
        Ok(())
    }

    pub fn delete_dir(&self, path: &str) -> Result<()> {
        std::fs::remove_dir_all(self._dir.path().join(path))?;
        Ok(())
    }

    pub fn rename_file(&self, old_path: &str, new_path: &str) -> Result<()> {
        let old_file_path = self._dir.path().join(old_path);
        let new_file_path = self._dir.path().join(new_path);
        if let Some(parent) = new_file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(&old_file_path, &new_file_path)?;
        Ok(())
    }

    /// Creates `link` pointing at the relative `target`, replacing whatever is at `link`.
    #[cfg(unix)]
    pub fn symlink(&self, target: &str, link: &str) -> Result<()> {
        let link_path = self._dir.path().join(link);
        if link_path.symlink_metadata().is_ok() {
            std::fs::remove_file(&link_path)?;
        }
        if let Some(parent) = link_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::os::unix::fs::symlink(target, &link_path)?;
        Ok(())
    }

    /// Stages every change in the working tree, including deletions, and commits on HEAD.
    pub fn commit(&self, message: &str) -> Result<CommitId> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = self.repo.find_tree(tree_id)?;

        let sig = git2::Signature::now("Test", "test@test.com")?;
        let parent = self.repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let parents: Vec<&git2::Commit> = parent.iter().collect();

        let oid = self
            .repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        Ok(CommitId::from(oid))
    }

    /// Creates `name` at the current HEAD commit and switches HEAD to it.
    pub fn create_branch(&self, name: &str) -> Result<()> {
        let head = self.repo.head()?.peel_to_commit()?;
        self.repo.branch(name, &head, false)?;
        self.repo.set_head(&format!("refs/heads/{name}"))?;
        Ok(())
    }
}
