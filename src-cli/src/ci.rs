use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use change_tracker::{
    ChangeSet, ChangeTracker, CommitId, FileChange, FileStatus, GitCli, PathFilter, git,
};
use review_comments::{
    Commenter, PendingComment, Severity, Summary, make_comments, mark_duplicates, submit,
};
use review_platforms::{BitbucketCommenter, GitHubCommenter, GitLabCommenter};

use crate::config::{Config, process_env};
use crate::{console, problems};

/// Shared state of one command invocation.
pub struct Session {
    pub git: GitCli,
    pub config: Config,
    pub cancel: CancellationToken,
}

pub struct CiOptions {
    pub problems: PathBuf,
    pub base_branch: Option<String>,
    pub fail_on: Severity,
    pub dry_run: bool,
}

/// One changed file as handed to the linter.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChangeEntry<'a> {
    path: &'a str,
    status: FileStatus,
    before: &'a change_tracker::Path,
    after: &'a change_tracker::Path,
    commits: &'a [CommitId],
    modified_lines: &'a [u32],
    removed_lines: &'a [u32],
}

fn change_entries(changes: &[FileChange]) -> Vec<ChangeEntry<'_>> {
    changes
        .iter()
        .map(|c| ChangeEntry {
            path: c.path.after.effective_path(),
            status: c.status,
            before: &c.path.before,
            after: &c.path.after,
            commits: &c.commits,
            modified_lines: &c.body.modified_lines,
            removed_lines: &c.body.removed_lines,
        })
        .collect()
}

impl Session {
    /// Runs the tracker off the async workers; every query blocks on git.
    async fn track(&self, base: &str) -> Result<Vec<FileChange>> {
        let git = self.git.clone();
        let filter: PathFilter = self.config.path_filter()?;
        let cancel = self.cancel.clone();
        let range_base = base.to_string();
        let changes = tokio::task::spawn_blocking(move || -> change_tracker::Result<_> {
            let repo = git.open()?;
            ChangeTracker::new(&git, &repo)
                .with_filter(filter)
                .with_cancellation(cancel)
                .changes(&range_base, "HEAD")
        })
        .await
        .context("change tracking task failed")?
        .with_context(|| format!("failed to find changes against {base}"))?;
        log::info!("found {} changed file(s) against {base}", changes.len());
        Ok(changes)
    }

    pub async fn changes(&self, base_branch: Option<&str>) -> Result<()> {
        let base = self.config.base_branch(base_branch, process_env);
        let changes = self.track(&base).await?;
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        serde_json::to_writer_pretty(&mut out, &change_entries(&changes))?;
        writeln!(out)?;
        Ok(())
    }

    pub async fn ci(&self, opts: &CiOptions) -> Result<ExitCode> {
        let repo = self.git.open().context("failed to open the git repository")?;
        let branch = git::current_branch(&repo).context("failed to get the current branch")?;
        let base = self.config.base_branch(opts.base_branch.as_deref(), process_env);
        if is_base_branch(&branch, &base) {
            log::info!("running from the base branch {base}, skipping checks");
            return Ok(ExitCode::SUCCESS);
        }

        let changes = self.track(&base).await?;
        let commits = change_tracker::count_commits(&changes);
        if commits > self.config.ci.max_commits {
            bail!(
                "found {commits} commits to check, more than the limit of {}",
                self.config.ci.max_commits
            );
        }
        if change_tracker::should_skip_ci(&repo, &changes)? {
            return Ok(ExitCode::SUCCESS);
        }

        let entries = problems::load(&opts.problems)?;
        log::info!("read {} problem(s) from {}", entries.len(), opts.problems.display());
        let changed_files = changes.len();
        let mut reports = problems::attribute(&ChangeSet::new(changes), entries);
        mark_duplicates(&mut reports);
        let listing = console::render(&reports);
        eprint!("{listing}");
        log::info!("{} problem(s) on modified lines", reports.len());

        let summary = Summary {
            reports,
            changed_files,
            commits,
            listing,
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        if opts.dry_run {
            log::info!("dry run, not updating any review");
        } else {
            let pending = make_comments(
                &summary.reports,
                &self.config.ci.docs_url,
                self.config.ci.show_duplicates,
            );
            let head = git::head_commit(&repo).context("failed to get the HEAD commit")?;
            self.report(&branch, &head.to_string(), &summary, &pending)
                .await?;
        }

        let failing = console::count_at_least(&summary.reports, opts.fail_on);
        if failing > 0 {
            log::error!("{failing} problem(s) with severity {} or higher", opts.fail_on);
            return Ok(ExitCode::FAILURE);
        }
        Ok(ExitCode::SUCCESS)
    }

    async fn report(
        &self,
        branch: &str,
        head: &str,
        summary: &Summary,
        pending: &[PendingComment],
    ) -> Result<()> {
        if let Some(config) = self.config.gitlab(branch, process_env)? {
            let commenter = GitLabCommenter::new(&config)?;
            sync(&commenter, summary, pending, &self.cancel).await?;
        }
        if let Some(config) = self.config.bitbucket(branch, head, process_env)? {
            let commenter = BitbucketCommenter::new(&config)?;
            sync(&commenter, summary, pending, &self.cancel).await?;
        }
        if let Some(config) = self.config.github(branch, process_env)? {
            let commenter = GitHubCommenter::new(&config)?;
            sync(&commenter, summary, pending, &self.cancel).await?;
        }
        Ok(())
    }
}

fn is_base_branch(branch: &str, base: &str) -> bool {
    branch == base || base.strip_prefix("origin/") == Some(branch)
}

/// Reconciles with every destination of `commenter`.
///
/// Platform failures are logged and left in the outcomes; only cancellation aborts.
async fn sync<C: Commenter>(
    commenter: &C,
    summary: &Summary,
    pending: &[PendingComment],
    cancel: &CancellationToken,
) -> Result<()> {
    let name = commenter.describe();
    let outcomes = match submit(commenter, summary, pending, cancel).await {
        Ok(outcomes) => outcomes,
        Err(review_comments::Error::Cancelled) => bail!("cancelled while reporting to {name}"),
        Err(e) => {
            log::error!("[{name}] failed to report problems: {e}");
            return Ok(());
        }
    };
    for outcome in &outcomes {
        for e in &outcome.errors {
            log::warn!("[{name}] {}: {e}", outcome.destination);
        }
    }
    if cancel.is_cancelled() {
        bail!("cancelled while reporting to {name}");
    }
    if outcomes.is_empty() {
        log::info!("[{name}] no open review found for this branch");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_repo::TestRepo;

    fn session(repo: &TestRepo, config: Config) -> Session {
        Session {
            git: GitCli::new(repo.path()),
            config,
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn base_branch_detection() {
        assert!(is_base_branch("main", "main"));
        assert!(is_base_branch("main", "origin/main"));
        assert!(!is_base_branch("feature", "main"));
    }

    #[tokio::test]
    async fn tracks_changes_against_base() {
        let repo = TestRepo::new().unwrap();
        repo.write_file("rules/a.yaml", "a\nb\nc\n").unwrap();
        repo.write_file("docs/readme.md", "hi\n").unwrap();
        repo.commit("init").unwrap();
        repo.create_branch("feature").unwrap();
        repo.write_file("rules/a.yaml", "a\nB\nc\n").unwrap();
        repo.write_file("docs/readme.md", "hello\n").unwrap();
        repo.commit("edit").unwrap();

        let config = Config::parse("[ci]\ninclude = [\"^rules/\"]\n").unwrap();
        let changes = session(&repo, config).track("main").await.unwrap();
        let entries = change_entries(&changes);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "rules/a.yaml");
        assert_eq!(entries[0].status, FileStatus::Modified);
        assert_eq!(entries[0].modified_lines, &[2]);
        assert_eq!(entries[0].commits.len(), 1);
    }

    #[tokio::test]
    async fn ci_fails_on_problems_at_threshold() {
        let repo = TestRepo::new().unwrap();
        repo.write_file("a.yaml", "1\n2\n3\n").unwrap();
        repo.commit("init").unwrap();
        repo.create_branch("feature").unwrap();
        repo.write_file("a.yaml", "1\n2\nthree\n").unwrap();
        repo.commit("edit").unwrap();
        repo.write_file(
            "problems.json",
            r#"[
                {"path": "a.yaml", "severity": "bug", "reporter": "r",
                 "text": "on change", "lines": {"first": 3, "last": 3}},
                {"path": "a.yaml", "severity": "fatal", "reporter": "r",
                 "text": "untouched", "lines": {"first": 1, "last": 1}}
            ]"#,
        )
        .unwrap();

        let session = session(&repo, Config::default());
        let mut opts = CiOptions {
            problems: repo.path().join("problems.json"),
            base_branch: Some("main".to_string()),
            fail_on: Severity::Bug,
            dry_run: true,
        };
        assert_eq!(session.ci(&opts).await.unwrap(), ExitCode::FAILURE);

        opts.fail_on = Severity::Fatal;
        assert_eq!(session.ci(&opts).await.unwrap(), ExitCode::SUCCESS);
    }

    #[tokio::test]
    async fn ci_honours_skip_marker() {
        let repo = TestRepo::new().unwrap();
        repo.write_file("a.yaml", "1\n").unwrap();
        repo.commit("init").unwrap();
        repo.create_branch("feature").unwrap();
        repo.write_file("a.yaml", "2\n").unwrap();
        repo.commit("wip [skip ci]").unwrap();

        let opts = CiOptions {
            problems: repo.path().join("missing.json"),
            base_branch: Some("main".to_string()),
            fail_on: Severity::Bug,
            dry_run: true,
        };
        let code = session(&repo, Config::default()).ci(&opts).await.unwrap();
        assert_eq!(code, ExitCode::SUCCESS);
    }
}
