use std::cell::RefCell;
use std::collections::HashSet;

use git2::Repository;
use linemark_types::CommitId;
use tokio_util::sync::CancellationToken;

use crate::blame::FileBlames;
use crate::filter::PathFilter;
use crate::git::{self, GitRunner};
use crate::lines::{count_lines, join_link_target, removed_lines};
use crate::path::{BodyDiff, FileChange, FileStatus, LineSets, Path, PathDiff, PathType};
use crate::{Error, Result};

/// Longest symlink chain followed before giving up.
const MAX_SYMLINK_HOPS: usize = 40;

/// One name-status line of `git log`, tagged with its commit.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LogEntry {
    commit: CommitId,
    status: FileStatus,
    src: String,
    dst: String,
}

fn parse_log(output: &str) -> Result<Vec<LogEntry>> {
    let mut entries = Vec::new();
    let mut commit: Option<CommitId> = None;

    for line in output.lines() {
        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() == 1 {
            if !parts[0].is_empty() {
                commit = Some(parts[0].trim().parse()?);
            }
            continue;
        }
        let Some(commit) = commit else {
            log::warn!("name-status line without a commit: {line:?}");
            continue;
        };
        let Some(status) = FileStatus::from_field(parts[0]) else {
            log::debug!("skipping unsupported change {:?} for {}", parts[0], parts[1]);
            continue;
        };
        entries.push(LogEntry {
            commit,
            status,
            src: parts[1].to_string(),
            dst: parts[parts.len() - 1].to_string(),
        });
    }

    Ok(entries)
}

/// Computes per-file changes for a commit range.
///
/// History and blame go through `runner`, trees and blobs are read from `repo`.
/// Blames are indexed per effective path and commit, so repeated queries on one
/// tracker reuse them.
/// A path whose type, content or blame cannot be read degrades to partial data
/// instead of failing the whole range.
pub struct ChangeTracker<'a, R: GitRunner + ?Sized> {
    runner: &'a R,
    repo: &'a Repository,
    filter: PathFilter,
    cancel: CancellationToken,
    blames: RefCell<FileBlames>,
}

impl<'a, R: GitRunner + ?Sized> ChangeTracker<'a, R> {
    pub fn new(runner: &'a R, repo: &'a Repository) -> Self {
        Self {
            runner,
            repo,
            filter: PathFilter::default(),
            cancel: CancellationToken::new(),
            blames: RefCell::new(FileBlames::new()),
        }
    }

    pub fn with_filter(mut self, filter: PathFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Changes made on `head` since it diverged from `base`.
    pub fn changes(&self, base: &str, head: &str) -> Result<Vec<FileChange>> {
        self.changes_in_range(&format!("{base}..{head}"))
    }

    pub fn changes_in_range(&self, range: &str) -> Result<Vec<FileChange>> {
        let output = git::log(self.runner()?, range).map_err(|e| match e {
            Error::Cancelled => Error::Cancelled,
            e => Error::RangeEnumeration(Box::new(e)),
        })?;
        let entries = parse_log(&output).map_err(|e| Error::RangeEnumeration(Box::new(e)))?;

        let mut changes = self.collect_changes(entries)?;
        log::debug!("parsed git log for {range}: {} changes", changes.len());

        for change in &mut changes {
            self.resolve_change(change)?;
        }
        Ok(changes)
    }

    /// Folds log entries into one record per final path, following renames.
    fn collect_changes(&self, entries: Vec<LogEntry>) -> Result<Vec<FileChange>> {
        let mut changes: Vec<FileChange> = Vec::new();

        for entry in entries {
            log::debug!(
                "git change {:?} {} -> {} in {}",
                entry.status,
                entry.src,
                entry.dst,
                entry.commit.short()
            );
            if !self.filter.is_path_allowed(&entry.dst) {
                log::debug!("skipping {} due to include/exclude rules", entry.dst);
                continue;
            }
            let commit_rev = entry.commit.to_string();
            if self.path_type(&commit_rev, &entry.dst)? == PathType::Directory {
                log::debug!("skipping directory entry {}", entry.dst);
                continue;
            }

            let mut change = FileChange {
                commits: Vec::new(),
                status: entry.status,
                path: PathDiff {
                    before: Path::default(),
                    after: Path {
                        name: entry.dst.clone(),
                        ..Path::default()
                    },
                },
                body: BodyDiff::default(),
            };

            if let Some(idx) = changes.iter().position(|c| c.path.after.name == entry.src) {
                let prev = changes.remove(idx);
                log::debug!(
                    "found previous change for {} with {} commit(s)",
                    entry.src,
                    prev.commits.len()
                );
                change.commits = prev.commits;
                change.path.before = prev.path.before;
            } else {
                match entry.status {
                    FileStatus::Added | FileStatus::Copied => {
                        // A path that changed type shows up as added, but it still existed before.
                        let parent = entry.commit.parent_rev();
                        if self.path_type(&parent, &entry.src)? != PathType::Missing {
                            change.path.before.name = entry.src.clone();
                        }
                    }
                    FileStatus::Deleted
                    | FileStatus::Renamed
                    | FileStatus::Modified
                    | FileStatus::TypeChanged => {
                        change.path.before.name = entry.src.clone();
                    }
                }
            }

            change.commits.push(entry.commit);
            changes.push(change);
        }

        Ok(changes)
    }

    /// Fills in before/after state, bodies and modified lines for one record.
    fn resolve_change(&self, change: &mut FileChange) -> Result<()> {
        let (Some(first), Some(last)) = (change.commits.first(), change.commits.last()) else {
            return Ok(());
        };
        let before_rev = first.parent_rev();
        let after_rev = last.to_string();

        if !change.path.before.name.is_empty() {
            change.path.before = self.resolve_path(&before_rev, &change.path.before.name)?;
            change.body.before = self.content(&before_rev, &change.path.before)?;
        }
        if !change.path.after.name.is_empty() && change.status != FileStatus::Deleted {
            change.path.after = self.resolve_path(&after_rev, &change.path.after.name)?;
            change.body.after = self.content(&after_rev, &change.path.after)?;
        }

        let before = change.path.before.path_type;
        let after = change.path.after.path_type;
        change.body.modified_lines = match (before, after) {
            (PathType::Missing, PathType::Missing) => {
                log::debug!("{} was added and removed", change.path.after.name);
                Vec::new()
            }
            (PathType::Missing, _) => {
                log::debug!("{} was added", change.path.after.name);
                count_lines(&change.body.after)
            }
            (_, PathType::Missing) => {
                log::debug!("{} was removed", change.path.after.name);
                count_lines(&change.body.before)
            }
            (_, PathType::Symlink) => {
                log::debug!("{} is now a symlink", change.path.after.name);
                count_lines(&change.body.after)
            }
            _ => self.blamed_lines(change, &after_rev)?,
        };
        change.body.removed_lines = match (before, after) {
            (PathType::Missing, _) => Vec::new(),
            (_, PathType::Missing) => count_lines(&change.body.before),
            _ => removed_lines(&change.body.before, &change.body.after),
        };

        for path in [&mut change.path.before, &mut change.path.after] {
            if path.symlink_target == path.name {
                path.symlink_target.clear();
            }
        }

        log::debug!(
            "file change {} -> {} ({:?} -> {:?}), commits {:?}, modified lines {:?}",
            change.path.before.name,
            change.path.after.name,
            before,
            after,
            change.commits,
            change.body.modified_lines
        );
        Ok(())
    }

    /// Lines of the final body last touched by one of the record's commits.
    fn blamed_lines(&self, change: &FileChange, revision: &str) -> Result<Vec<u32>> {
        let path = change.path.after.effective_path();
        let mut index = self.blames.borrow_mut();
        let blamed = match index.load(self.runner()?, path, revision) {
            Ok(lines) => lines,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                log::warn!("failed to run git blame for {path}, treating it as unmodified: {e}");
                return Ok(Vec::new());
            }
        };

        let before: Vec<&[u8]> = change.body.before.split(|b| *b == b'\n').collect();
        let after: Vec<&[u8]> = change.body.after.split(|b| *b == b'\n').collect();

        let mut modified = Vec::with_capacity(blamed.len());
        for line in blamed {
            if !change.commits.contains(&line.commit) {
                continue;
            }
            let prev = before.get((line.prev_line as usize).wrapping_sub(1));
            let cur = after.get((line.line as usize).wrapping_sub(1));
            if let (Some(prev), Some(cur)) = (prev, cur)
                && prev == cur
            {
                continue;
            }
            modified.push(line.line);
        }

        if modified.is_empty()
            && change.path.before.effective_path() != change.path.after.effective_path()
        {
            log::debug!("{} was moved or renamed", change.path.after.name);
            return Ok(count_lines(&change.body.after));
        }
        Ok(modified)
    }

    /// Type and final symlink target of `name` at `revision`.
    fn resolve_path(&self, revision: &str, name: &str) -> Result<Path> {
        let path_type = self.path_type(revision, name)?;
        match self.resolve_symlink_target(revision, name, path_type) {
            Ok(symlink_target) => Ok(Path {
                name: name.to_string(),
                symlink_target,
                path_type,
            }),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                log::warn!("cannot resolve {name} at {revision}: {e}");
                Ok(Path {
                    name: name.to_string(),
                    symlink_target: String::new(),
                    path_type: PathType::Missing,
                })
            }
        }
    }

    /// Follows a symlink chain until a non-symlink or a missing path is reached.
    fn resolve_symlink_target(
        &self,
        revision: &str,
        name: &str,
        path_type: PathType,
    ) -> Result<String> {
        let mut current = name.to_string();
        let mut current_type = path_type;
        let mut visited = HashSet::new();

        while current_type == PathType::Symlink {
            if !visited.insert(current.clone()) || visited.len() > MAX_SYMLINK_HOPS {
                return Err(Error::SymlinkCycle(name.to_string()));
            }
            let raw = match git::cat_file(self.repo()?, revision, &current) {
                Ok(raw) => raw,
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    log::debug!("cannot read symlink {current} at {revision}: {e}");
                    return Ok(current);
                }
            };
            let target = join_link_target(&current, String::from_utf8_lossy(&raw).trim_end());
            log::debug!("symlink {current} points at {target}");
            current_type = self.path_type(revision, &target)?;
            current = target;
        }

        Ok(current)
    }

    fn path_type(&self, revision: &str, path: &str) -> Result<PathType> {
        match git::ls_tree(self.repo()?, revision, path) {
            Ok(t) => Ok(t),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                log::debug!("cannot get type of {path} at {revision}: {e}");
                Ok(PathType::Missing)
            }
        }
    }

    fn content(&self, revision: &str, path: &Path) -> Result<Vec<u8>> {
        if path.path_type == PathType::Missing {
            return Ok(Vec::new());
        }
        let path = path.effective_path();
        match git::cat_file(self.repo()?, revision, path) {
            Ok(body) => Ok(body),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                log::debug!("cannot read {path} at {revision}: {e}");
                Ok(Vec::new())
            }
        }
    }

    /// Hands out the runner unless the run was cancelled.
    fn runner(&self) -> Result<&'a R> {
        self.check_cancelled()?;
        Ok(self.runner)
    }

    fn repo(&self) -> Result<&'a Repository> {
        self.check_cancelled()?;
        Ok(self.repo)
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

/// Read-only lookup over the records of one tracked range.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    changes: Vec<FileChange>,
}

impl ChangeSet {
    pub fn new(changes: Vec<FileChange>) -> Self {
        Self { changes }
    }

    pub fn changes(&self) -> &[FileChange] {
        &self.changes
    }

    /// Record whose final name, effective path or original name is `path`.
    pub fn find(&self, path: &str) -> Option<&FileChange> {
        self.changes
            .iter()
            .find(|c| c.path.after.name == path || c.path.after.effective_path() == path)
            .or_else(|| self.changes.iter().find(|c| c.path.before.name == path))
    }

    /// Modified lines for `path`; untracked paths have none.
    pub fn line_sets(&self, path: &str) -> LineSets {
        self.find(path).map(FileChange::line_sets).unwrap_or_default()
    }
}
