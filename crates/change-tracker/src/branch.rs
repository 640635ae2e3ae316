use std::collections::HashSet;

use git2::Repository;
use linemark_types::CommitId;

use crate::Result;
use crate::git;
use crate::path::FileChange;

const SKIP_MARKERS: &[&str] = &["[skip ci]", "[no ci]"];

/// Number of distinct commits that touched any of `changes`.
pub fn count_commits(changes: &[FileChange]) -> usize {
    changes
        .iter()
        .flat_map(|c| c.commits.iter())
        .collect::<HashSet<&CommitId>>()
        .len()
}

/// True when any commit in `changes` asks CI to be skipped.
pub fn should_skip_ci(repo: &Repository, changes: &[FileChange]) -> Result<bool> {
    let mut seen = HashSet::new();
    for commit in changes.iter().flat_map(|c| c.commits.iter()) {
        if !seen.insert(*commit) {
            continue;
        }
        let message = git::commit_message(repo, *commit)?;
        if let Some(marker) = SKIP_MARKERS.iter().find(|m| message.contains(**m)) {
            log::info!("found a {marker} tag in commit {}, skipping all checks", commit.short());
            return Ok(true);
        }
    }
    Ok(false)
}
