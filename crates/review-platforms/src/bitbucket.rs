use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use review_comments::{
    CommentSeverity, Commenter, DiffCorrespondence, DiffLine, DiffPosition, DiffSide,
    ExistingComment, PendingComment, Report, Severity, Summary, errors_comment, report_line,
    translate_position,
};

use crate::http::ApiClient;
use crate::{Error, Result};

const PLATFORM: &str = "Bitbucket";
const MAX_COMMENT_LENGTH: usize = 32_768;
const REPORT_KEY: &str = "linemark";
const REPORT_DETAILS: &str =
    "linemark reports linter problems found on the lines modified by this pull request.";

#[derive(Debug, Clone)]
pub struct BitbucketConfig {
    pub uri: String,
    pub project: String,
    pub repository: String,
    pub token: String,
    pub timeout: Duration,
    pub max_comments: usize,
    pub branch: String,
    /// Head commit of `branch`, used to look up its pull request and to attach the
    /// Code Insights report.
    pub head_commit: String,
    /// Documentation site linked from the report and its annotations.
    pub docs_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PagedResponse<T> {
    #[serde(default = "Vec::new")]
    values: Vec<T>,
    #[serde(default)]
    is_last_page: bool,
    #[serde(default)]
    next_page_start: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullRequestRef {
    id: String,
    latest_commit: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullRequestInfo {
    id: u64,
    open: bool,
    from_ref: PullRequestRef,
    to_ref: PullRequestRef,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangePath {
    to_string: String,
}

#[derive(Debug, Deserialize)]
struct Change {
    path: ChangePath,
}

#[derive(Debug, Deserialize)]
struct FileDiffs {
    #[serde(default)]
    diffs: Vec<FileDiff>,
}

#[derive(Debug, Deserialize)]
struct FileDiff {
    #[serde(default)]
    hunks: Vec<DiffHunk>,
}

#[derive(Debug, Deserialize)]
struct DiffHunk {
    #[serde(default)]
    segments: Vec<DiffSegment>,
}

#[derive(Debug, Deserialize)]
struct DiffSegment {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    lines: Vec<SegmentLine>,
}

#[derive(Debug, Deserialize)]
struct SegmentLine {
    source: u32,
    destination: u32,
}

#[derive(Debug, Deserialize)]
struct CommentAuthor {
    name: String,
}

#[derive(Debug, Deserialize)]
struct PullRequestComment {
    id: u64,
    version: u64,
    #[serde(default)]
    state: String,
    #[serde(default)]
    severity: String,
    author: CommentAuthor,
    #[serde(default)]
    text: String,
    #[serde(default)]
    comments: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentAnchor {
    #[serde(default)]
    orphaned: bool,
    #[serde(default)]
    diff_type: String,
    path: Option<String>,
    line: Option<u32>,
    line_type: Option<String>,
    file_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Activity {
    action: String,
    #[serde(default)]
    comment_action: String,
    comment_anchor: Option<CommentAnchor>,
    comment: Option<PullRequestComment>,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
struct NewAnchor<'a> {
    path: &'a str,
    line: u32,
    line_type: &'static str,
    file_type: &'static str,
    diff_type: &'static str,
}

#[derive(Debug, Serialize)]
struct NewComment<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    severity: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    anchor: Option<NewAnchor<'a>>,
}

#[derive(Debug, Serialize)]
struct CommentUpdate {
    version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    severity: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<&'static str>,
}

#[derive(Debug, Deserialize)]
struct CommentVersion {
    version: u64,
}

/// Code Insights report attached to the head commit.
#[derive(Debug, Serialize)]
struct InsightReport<'a> {
    title: String,
    result: &'static str,
    reporter: &'static str,
    details: &'static str,
    link: &'a str,
    data: Vec<InsightData>,
}

#[derive(Debug, Serialize)]
struct InsightData {
    title: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    value: usize,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
struct Annotation {
    path: String,
    line: u32,
    message: String,
    severity: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    link: String,
}

#[derive(Debug, Serialize)]
struct Annotations {
    annotations: Vec<Annotation>,
}

/// The open pull request of the current branch and its per-file diffs.
#[derive(Debug, Clone)]
pub struct BitbucketPullRequest {
    id: u64,
    username: String,
    diffs: HashMap<String, DiffCorrespondence>,
}

impl fmt::Display for BitbucketPullRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pull request #{}", self.id)
    }
}

/// Comment handle used to update or delete a comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitbucketComment {
    id: u64,
    version: u64,
}

/// Comments on Bitbucket Server pull requests through the 1.0 REST API.
pub struct BitbucketCommenter {
    api: ApiClient,
    project: String,
    repository: String,
    branch: String,
    head_commit: String,
    max_comments: usize,
    docs_url: String,
}

impl BitbucketCommenter {
    pub fn new(config: &BitbucketConfig) -> Result<Self> {
        log::info!(
            "will report problems to Bitbucket at {} ({}/{}, branch {}, max comments {}, timeout {:?})",
            config.uri,
            config.project,
            config.repository,
            config.branch,
            config.max_comments,
            config.timeout
        );
        Ok(Self {
            api: ApiClient::new(&config.uri, &config.token, config.timeout)?,
            project: config.project.clone(),
            repository: config.repository.clone(),
            branch: config.branch.clone(),
            head_commit: config.head_commit.clone(),
            max_comments: config.max_comments,
            docs_url: config.docs_url.clone(),
        })
    }

    fn repo_path(&self) -> String {
        format!(
            "/rest/api/1.0/projects/{}/repos/{}",
            self.project, self.repository
        )
    }

    fn comments_path(&self, pr: u64) -> String {
        format!("{}/pull-requests/{pr}/comments", self.repo_path())
    }

    async fn paged<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut start = 0;
        loop {
            let page = self
                .api
                .get::<PagedResponse<T>>(path, &[("start", start.to_string())])
                .await?
                .body;
            items.extend(page.values);
            match page.next_page_start {
                Some(next) if !page.is_last_page && next > start => start = next,
                _ => break,
            }
        }
        Ok(items)
    }

    async fn whoami(&self) -> Result<String> {
        let name = self.api.get_text("/plugins/servlet/applinks/whoami").await?;
        Ok(name.trim_end_matches('\n').to_string())
    }

    async fn find_pull_request(&self) -> Result<Option<PullRequestInfo>> {
        let path = format!(
            "{}/commits/{}/pull-requests",
            self.repo_path(),
            self.head_commit
        );
        let prs: Vec<PullRequestInfo> = self.paged(&path).await?;
        Ok(prs.into_iter().find(|pr| {
            pr.open && pr.from_ref.id.trim_start_matches("refs/heads/") == self.branch
        }))
    }

    async fn file_diff(&self, pr: &PullRequestInfo, path: &str) -> Result<DiffCorrespondence> {
        let url = format!(
            "/rest/api/latest/projects/{}/repos/{}/commits/{}/diff/{path}",
            self.project, self.repository, pr.from_ref.latest_commit
        );
        let query = [
            ("contextLines", "10000".to_string()),
            ("since", pr.to_ref.latest_commit.clone()),
            ("whitespace", "show".to_string()),
            ("withComments", "false".to_string()),
        ];
        let diffs = self.api.get::<FileDiffs>(&url, &query).await?.body;
        Ok(correspondence_from_diffs(&diffs))
    }

    async fn current_version(&self, pr: u64, id: u64) -> Result<u64> {
        let path = format!("{}/{id}", self.comments_path(pr));
        Ok(self.api.get::<CommentVersion>(&path, &[]).await?.body.version)
    }

    async fn update(
        &self,
        pr: u64,
        id: u64,
        severity: Option<&'static str>,
        state: Option<&'static str>,
    ) -> Result<()> {
        let version = self.current_version(pr, id).await?;
        let path = format!("{}/{id}", self.comments_path(pr));
        let body = CommentUpdate {
            version,
            severity,
            state,
        };
        self.api.send(Method::PUT, &path, &[], Some(&body)).await?;
        Ok(())
    }

    async fn activities(&self, pr: &BitbucketPullRequest) -> Result<Vec<Activity>> {
        let path = format!("{}/pull-requests/{}/activities", self.repo_path(), pr.id);
        self.paged(&path).await
    }

    fn report_path(&self) -> String {
        format!(
            "/rest/insights/1.0/projects/{}/repos/{}/commits/{}/reports/{REPORT_KEY}",
            self.project, self.repository, self.head_commit
        )
    }

    /// Replaces the Code Insights report and its annotations on the head commit.
    async fn publish_insights(&self, summary: &Summary) -> Result<()> {
        let path = self.report_path();
        log::info!("creating Code Insights report for commit {}", self.head_commit);
        let report = insight_report(summary, &self.docs_url);
        self.api.send(Method::PUT, &path, &[], Some(&report)).await?;

        let annotations_path = format!("{path}/annotations");
        self.api
            .send::<()>(Method::DELETE, &annotations_path, &[], None)
            .await?;
        let annotations: Vec<Annotation> = summary
            .reports
            .iter()
            .filter_map(|r| annotation(r, &self.docs_url))
            .collect();
        if annotations.is_empty() {
            return Ok(());
        }
        log::info!("adding {} Code Insights annotation(s)", annotations.len());
        self.api
            .send(
                Method::POST,
                &annotations_path,
                &[],
                Some(&Annotations { annotations }),
            )
            .await?;
        Ok(())
    }
}

fn insight_report<'a>(summary: &Summary, link: &'a str) -> InsightReport<'a> {
    let number = |title, value| InsightData {
        title,
        kind: "NUMBER",
        value,
    };
    InsightReport {
        title: format!("linemark {}", summary.version),
        result: if summary.passed() { "PASS" } else { "FAIL" },
        reporter: "Changed lines linter report",
        details: REPORT_DETAILS,
        link,
        data: vec![
            number("Number of commits checked", summary.commits),
            number("Number of files changed", summary.changed_files),
            number("Number of problems found", summary.reports.len()),
        ],
    }
}

/// Annotation for one report, `None` when it is not on a modified line.
fn annotation(report: &Report, docs_url: &str) -> Option<Annotation> {
    let (line, modified) = report_line(report);
    if !modified {
        log::debug!(
            "problem on unmodified lines of {}, not annotating",
            report.path.name
        );
        return None;
    }
    let problem = &report.problem;
    let prefix = if report.path.is_symlink() {
        format!("Problem detected on symlinked file {}: ", report.path.name)
    } else {
        String::new()
    };
    let (severity, kind) = match problem.severity {
        Severity::Fatal => ("HIGH", "BUG"),
        Severity::Bug => ("MEDIUM", "BUG"),
        Severity::Warning | Severity::Information => ("LOW", "CODE_SMELL"),
    };
    Some(Annotation {
        path: report.path.effective_path().to_string(),
        line,
        message: format!("{prefix}{}: {}", problem.reporter, problem.text),
        severity,
        kind,
        link: format!(
            "{}/checks/{}.html",
            docs_url.trim_end_matches('/'),
            problem.reporter
        ),
    })
}

/// Builds the new-side correspondence from Bitbucket's JSON diff segments.
fn correspondence_from_diffs(diffs: &FileDiffs) -> DiffCorrespondence {
    let mut lines: Vec<DiffLine> = diffs
        .diffs
        .iter()
        .flat_map(|d| &d.hunks)
        .flat_map(|h| &h.segments)
        .filter(|s| s.kind == "ADDED" || s.kind == "CONTEXT")
        .flat_map(|s| {
            s.lines.iter().map(move |l| DiffLine {
                old: l.source,
                new: l.destination,
                was_modified: s.kind == "ADDED",
            })
        })
        .collect();
    lines.sort_by_key(|l| l.new);
    lines.dedup_by_key(|l| l.new);
    DiffCorrespondence::from_lines(lines)
}

fn is_own_open_comment<'a>(act: &'a Activity, username: &str) -> Option<&'a PullRequestComment> {
    let comment = act.comment.as_ref()?;
    (act.action == "COMMENTED"
        && act.comment_action == "ADDED"
        && comment.state == "OPEN"
        && comment.author.name == username)
        .then_some(comment)
}

fn existing_from_activity(
    act: &Activity,
    pr: &BitbucketPullRequest,
) -> Option<ExistingComment<BitbucketComment>> {
    let comment = is_own_open_comment(act, &pr.username)?;
    let anchor = act.comment_anchor.as_ref()?;
    if anchor.orphaned {
        return None;
    }
    let path = anchor.path.clone()?;
    let line = anchor.line?;
    let position = match (anchor.line_type.as_deref(), anchor.file_type.as_deref()) {
        (Some("REMOVED"), _) => DiffPosition::old(path, line),
        (Some("ADDED"), _) => DiffPosition::new(path, line),
        (_, Some("FROM")) => {
            // context anchored on the old file, find its new line
            let new_line = pr
                .diffs
                .get(&path)
                .and_then(|c| c.lines().iter().find(|l| l.old == line && !l.was_modified))
                .map_or(line, |l| l.new);
            DiffPosition::both(path, line, new_line)
        }
        _ => DiffPosition::both(path, line, line),
    };
    Some(ExistingComment {
        position,
        text: comment.text.clone(),
        replies: comment.comments.len(),
        severity: Some(if comment.severity == "BLOCKER" {
            CommentSeverity::Blocker
        } else {
            CommentSeverity::Normal
        }),
        anchored_to_commit: anchor.diff_type == "COMMIT",
        meta: BitbucketComment {
            id: comment.id,
            version: comment.version,
        },
    })
}

fn anchor_for(position: &DiffPosition) -> NewAnchor<'_> {
    let (line_type, file_type) = match position.side() {
        DiffSide::Old => ("REMOVED", "FROM"),
        DiffSide::New => ("ADDED", "TO"),
        DiffSide::Both => ("CONTEXT", "TO"),
    };
    NewAnchor {
        path: &position.path,
        line: position.line(),
        line_type,
        file_type,
        diff_type: "EFFECTIVE",
    }
}

#[async_trait]
impl Commenter for BitbucketCommenter {
    type Destination = BitbucketPullRequest;
    type Meta = BitbucketComment;

    fn describe(&self) -> &str {
        PLATFORM
    }

    fn max_comment_length(&self) -> usize {
        MAX_COMMENT_LENGTH
    }

    async fn destinations(&self) -> review_comments::Result<Vec<BitbucketPullRequest>> {
        let load = async {
            let username = self.whoami().await?;
            let Some(pr) = self.find_pull_request().await? else {
                log::info!("no open pull request found for branch {}", self.branch);
                return Ok(Vec::new());
            };
            log::info!("found open pull request #{} for {}", pr.id, self.branch);

            let changes_path = format!("{}/pull-requests/{}/changes", self.repo_path(), pr.id);
            let changes: Vec<Change> = self.paged(&changes_path).await?;
            let mut diffs = HashMap::with_capacity(changes.len());
            for change in changes {
                let correspondence = self.file_diff(&pr, &change.path.to_string).await?;
                diffs.insert(change.path.to_string, correspondence);
            }
            Ok::<_, Error>(vec![BitbucketPullRequest {
                id: pr.id,
                username,
                diffs,
            }])
        };
        load.await.map_err(|e| e.into_review(PLATFORM))
    }

    async fn list(
        &self,
        dst: &BitbucketPullRequest,
    ) -> review_comments::Result<Vec<ExistingComment<BitbucketComment>>> {
        let activities = self
            .activities(dst)
            .await
            .map_err(|e| e.into_review(PLATFORM))?;
        Ok(activities
            .iter()
            .filter_map(|act| existing_from_activity(act, dst))
            .collect())
    }

    fn position(&self, dst: &BitbucketPullRequest, pending: &PendingComment) -> Option<DiffPosition> {
        let Some(correspondence) = dst.diffs.get(&pending.path) else {
            log::debug!("skipping comment for {} which is not part of {dst}", pending.path);
            return None;
        };
        Some(translate_position(pending, Some(correspondence)))
    }

    async fn create(
        &self,
        dst: &BitbucketPullRequest,
        pending: &PendingComment,
        position: &DiffPosition,
    ) -> review_comments::Result<()> {
        let comment = NewComment {
            text: &pending.text,
            severity: Some(if pending.severity.is_high() {
                "BLOCKER"
            } else {
                "NORMAL"
            }),
            anchor: Some(anchor_for(position)),
        };
        self.api
            .send(Method::POST, &self.comments_path(dst.id), &[], Some(&comment))
            .await
            .map(|_| ())
            .map_err(|e| e.into_review(PLATFORM))
    }

    async fn delete(
        &self,
        dst: &BitbucketPullRequest,
        existing: &ExistingComment<BitbucketComment>,
    ) -> review_comments::Result<()> {
        let meta = &existing.meta;
        log::debug!("deleting stale comment {} at {}", meta.id, existing.position);
        let path = format!("{}/{}", self.comments_path(dst.id), meta.id);
        self.api
            .send::<()>(
                Method::DELETE,
                &path,
                &[("version", meta.version.to_string())],
                None,
            )
            .await
            .map(|_| ())
            .map_err(|e| e.into_review(PLATFORM))
    }

    async fn update_severity(
        &self,
        dst: &BitbucketPullRequest,
        existing: &ExistingComment<BitbucketComment>,
        severity: CommentSeverity,
    ) -> review_comments::Result<()> {
        let severity = match severity {
            CommentSeverity::Normal => "NORMAL",
            CommentSeverity::Blocker => "BLOCKER",
        };
        self.update(dst.id, existing.meta.id, Some(severity), None)
            .await
            .map_err(|e| e.into_review(PLATFORM))
    }

    async fn resolve_thread(
        &self,
        dst: &BitbucketPullRequest,
        existing: &ExistingComment<BitbucketComment>,
    ) -> review_comments::Result<()> {
        self.update(dst.id, existing.meta.id, None, Some("RESOLVED"))
            .await
            .map_err(|e| e.into_review(PLATFORM))
    }

    fn can_create(&self, done: usize) -> review_comments::Result<bool> {
        Ok(done < self.max_comments)
    }

    async fn general_comment(
        &self,
        dst: &BitbucketPullRequest,
        body: &str,
    ) -> review_comments::Result<()> {
        let post = async {
            let exists = self.activities(dst).await?.iter().any(|act| {
                act.comment_anchor.is_none()
                    && is_own_open_comment(act, &dst.username).is_some_and(|c| c.text == body)
            });
            if exists {
                log::debug!("general comment already exists on {dst}");
                return Ok(());
            }
            let comment = NewComment {
                text: body,
                severity: None,
                anchor: None,
            };
            self.api
                .send(Method::POST, &self.comments_path(dst.id), &[], Some(&comment))
                .await?;
            Ok::<_, Error>(())
        };
        post.await.map_err(|e| e.into_review(PLATFORM))
    }

    async fn summary(
        &self,
        dst: &BitbucketPullRequest,
        summary: &Summary,
        errors: &[String],
    ) -> review_comments::Result<()> {
        let insights = self
            .publish_insights(summary)
            .await
            .map_err(|e| e.into_review(PLATFORM));
        if !errors.is_empty() {
            self.general_comment(dst, &errors_comment(errors)).await?;
        }
        insights
    }
}
