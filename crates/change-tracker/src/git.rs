use std::path::PathBuf;
use std::process::Command;

use git2::{ErrorCode, ObjectType, Repository};
use linemark_types::CommitId;

use crate::path::PathType;
use crate::{Error, Result};

const SYMLINK_MODE: i32 = 0o120000;

/// Runs a git subcommand and returns its raw stdout.
///
/// `log` and `blame` porcelain go through this seam, so tests can swap in a
/// closure that replays canned output. Object lookups use `git2` directly.
pub trait GitRunner {
    fn run(&self, args: &[&str]) -> Result<Vec<u8>>;
}

impl<F> GitRunner for F
where
    F: Fn(&[&str]) -> Result<Vec<u8>>,
{
    fn run(&self, args: &[&str]) -> Result<Vec<u8>> {
        self(args)
    }
}

/// Shells out to the `git` binary found in `PATH`.
#[derive(Debug, Clone)]
pub struct GitCli {
    dir: PathBuf,
}

impl GitCli {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Opens the repository containing the working directory for object lookups.
    pub fn open(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.dir)?)
    }
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new(".")
    }
}

impl GitRunner for GitCli {
    fn run(&self, args: &[&str]) -> Result<Vec<u8>> {
        log::debug!("running git {}", args.join(" "));
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.dir)
            .output()?;
        if output.status.success() {
            return Ok(output.stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(Error::Command {
            args: args.join(" "),
            message: if stderr.is_empty() {
                output.status.to_string()
            } else {
                stderr
            },
        })
    }
}

/// `git log` for `range`, oldest commit first, one `%H` line per commit followed
/// by its name-status lines.
pub fn log(runner: &(impl GitRunner + ?Sized), range: &str) -> Result<String> {
    let out = runner.run(&[
        "log",
        "--reverse",
        "--no-merges",
        "--first-parent",
        "--format=%H",
        "--name-status",
        range,
    ])?;
    Ok(String::from_utf8_lossy(&out).into_owned())
}

/// Raw content of `path` at `revision`.
pub fn cat_file(repo: &Repository, revision: &str, path: &str) -> Result<Vec<u8>> {
    let tree = repo.revparse_single(revision)?.peel_to_tree()?;
    let entry = tree.get_path(std::path::Path::new(path))?;
    let blob = repo.find_blob(entry.id())?;
    Ok(blob.content().to_vec())
}

/// Type of the tree entry for `path` at `revision`.
pub fn ls_tree(repo: &Repository, revision: &str, path: &str) -> Result<PathType> {
    let tree = repo.revparse_single(revision)?.peel_to_tree()?;
    let entry = match tree.get_path(std::path::Path::new(path)) {
        Ok(entry) => entry,
        Err(e) if e.code() == ErrorCode::NotFound => return Ok(PathType::Missing),
        Err(e) => return Err(e.into()),
    };
    Ok(entry_type(entry.kind(), entry.filemode()))
}

fn entry_type(kind: Option<ObjectType>, mode: i32) -> PathType {
    match kind {
        Some(ObjectType::Tree) => PathType::Directory,
        Some(ObjectType::Blob) if mode == SYMLINK_MODE => PathType::Symlink,
        Some(ObjectType::Blob) => PathType::File,
        // submodules and anything else are not tracked content
        _ => PathType::Missing,
    }
}

pub fn head_commit(repo: &Repository) -> Result<CommitId> {
    Ok(repo.head()?.peel_to_commit()?.id().into())
}

/// Short name of the checked out branch, `HEAD` when detached.
pub fn current_branch(repo: &Repository) -> Result<String> {
    let head = repo.head()?;
    Ok(head.shorthand().unwrap_or("HEAD").to_string())
}

pub fn commit_message(repo: &Repository, commit: CommitId) -> Result<String> {
    let commit = repo.find_commit(commit.oid())?;
    Ok(String::from_utf8_lossy(commit.message_bytes()).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_repo::TestRepo;

    #[test]
    fn entry_types() {
        assert_eq!(entry_type(Some(ObjectType::Blob), 0o100644), PathType::File);
        assert_eq!(entry_type(Some(ObjectType::Blob), 0o100755), PathType::File);
        assert_eq!(entry_type(Some(ObjectType::Blob), SYMLINK_MODE), PathType::Symlink);
        assert_eq!(entry_type(Some(ObjectType::Tree), 0o040000), PathType::Directory);
        assert_eq!(entry_type(Some(ObjectType::Commit), 0o160000), PathType::Missing);
        assert_eq!(entry_type(None, 0), PathType::Missing);
    }

    #[test]
    fn runner_reports_stderr_on_failure() {
        let repo = TestRepo::new().unwrap();
        let git = GitCli::new(repo.path());
        let err = git.run(&["rev-parse", "--verify", "no-such-ref"]).unwrap_err();
        match err {
            Error::Command { args, message } => {
                assert_eq!(args, "rev-parse --verify no-such-ref");
                assert!(!message.is_empty());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn primitives_against_real_repo() {
        let repo = TestRepo::new().unwrap();
        repo.write_file("rules/a.yaml", "a: 1\n").unwrap();
        let commit = repo.commit("init").unwrap();
        let git = GitCli::new(repo.path()).open().unwrap();

        assert_eq!(head_commit(&git).unwrap(), commit);
        assert_eq!(current_branch(&git).unwrap(), "main");
        assert_eq!(commit_message(&git, commit).unwrap().trim(), "init");

        let rev = commit.to_string();
        assert_eq!(cat_file(&git, &rev, "rules/a.yaml").unwrap(), b"a: 1\n");
        assert!(cat_file(&git, &rev, "rules/missing.yaml").is_err());
        assert!(cat_file(&git, &commit.parent_rev(), "rules/a.yaml").is_err());
        assert_eq!(ls_tree(&git, &rev, "rules").unwrap(), PathType::Directory);
        assert_eq!(ls_tree(&git, &rev, "rules/a.yaml").unwrap(), PathType::File);
        assert_eq!(ls_tree(&git, &rev, "rules/b.yaml").unwrap(), PathType::Missing);
        assert_eq!(ls_tree(&git, &rev, "rules/a.yaml/x").unwrap(), PathType::Missing);
    }
}
