use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use octocrab::Octocrab;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use review_comments::{
    Anchor, Commenter, DiffCorrespondence, DiffPosition, DiffSide, ExistingComment,
    PendingComment, Summary, errors_comment, parse_unified_diff, summary_comment, summary_header,
    texts_equal, translate_position,
};

use crate::{Error, Result};

const PLATFORM: &str = "GitHub";
const MAX_COMMENT_LENGTH: usize = 65_536;
const PER_PAGE: usize = 100;

#[derive(Debug, Clone)]
pub struct GitHubConfig {
    /// API root, `https://api.github.com` or `https://<host>/api/v3`.
    pub uri: String,
    pub owner: String,
    pub repo: String,
    pub token: String,
    pub timeout: Duration,
    pub max_comments: usize,
    pub branch: String,
    /// Pull request to report to; looked up from `branch` when unset.
    pub pull_request: Option<u64>,
    /// Documentation site linked from the review summary.
    pub docs_url: String,
}

#[derive(Debug, Deserialize)]
struct Account {
    login: String,
}

#[derive(Debug, Deserialize)]
struct PullRequestHead {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct PullRequest {
    number: u64,
    head: PullRequestHead,
}

#[derive(Debug, Deserialize)]
struct PullRequestFile {
    filename: String,
    /// Missing for binary or very large files.
    patch: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReviewComment {
    id: u64,
    #[serde(default)]
    body: String,
    path: String,
    /// `None` once the comment is outdated.
    line: Option<u32>,
    side: Option<String>,
    user: Account,
    in_reply_to_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct IssueComment {
    #[serde(default)]
    body: String,
    user: Account,
}

#[derive(Debug, Deserialize)]
struct Review {
    id: u64,
    #[serde(default)]
    body: String,
    user: Account,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
struct NewReviewComment<'a> {
    body: &'a str,
    commit_id: &'a str,
    path: &'a str,
    line: u32,
    side: &'static str,
}

#[derive(Debug, Serialize)]
struct NewReview<'a> {
    commit_id: &'a str,
    body: &'a str,
    event: &'static str,
}

#[derive(Debug, Serialize)]
struct Body<'a> {
    body: &'a str,
}

#[derive(Debug, Serialize)]
struct PageQuery {
    per_page: usize,
    page: usize,
}

/// An open pull request with the diff of every file it touches.
#[derive(Debug, Clone)]
pub struct GitHubPullRequest {
    number: u64,
    head_sha: String,
    login: String,
    diffs: Vec<(String, DiffCorrespondence)>,
}

impl fmt::Display for GitHubPullRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pull request #{}", self.number)
    }
}

impl GitHubPullRequest {
    fn diff_for(&self, path: &str) -> Option<&DiffCorrespondence> {
        self.diffs.iter().find(|(p, _)| p == path).map(|(_, c)| c)
    }
}

/// Reports to GitHub pull requests: one line comment per problem and a review
/// summarising the run.
pub struct GitHubCommenter {
    client: Octocrab,
    owner: String,
    repo: String,
    branch: String,
    pull_request: Option<u64>,
    timeout: Duration,
    max_comments: usize,
    docs_url: String,
}

impl GitHubCommenter {
    pub fn new(config: &GitHubConfig) -> Result<Self> {
        log::info!(
            "will report problems to GitHub at {} ({}/{}, branch {}, max comments {}, timeout {:?})",
            config.uri,
            config.owner,
            config.repo,
            config.branch,
            config.max_comments,
            config.timeout
        );
        let client = Octocrab::builder()
            .base_uri(config.uri.trim_end_matches('/'))?
            .personal_token(config.token.clone())
            .build()?;
        Ok(Self {
            client,
            owner: config.owner.clone(),
            repo: config.repo.clone(),
            branch: config.branch.clone(),
            pull_request: config.pull_request,
            timeout: config.timeout,
            max_comments: config.max_comments,
            docs_url: config.docs_url.clone(),
        })
    }

    fn repo_route(&self) -> String {
        format!("/repos/{}/{}", self.owner, self.repo)
    }

    async fn timed<T>(
        &self,
        operation: &str,
        call: impl Future<Output = octocrab::Result<T>>,
    ) -> Result<T> {
        log::info!("sending {operation}");
        match tokio::time::timeout(self.timeout, call).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(Error::Timeout {
                operation: operation.to_string(),
                seconds: self.timeout.as_secs(),
            }),
        }
    }

    async fn get<T: DeserializeOwned, Q: Serialize + ?Sized>(
        &self,
        route: &str,
        query: Option<&Q>,
    ) -> Result<T> {
        self.timed(&format!("GET {route}"), self.client.get(route, query))
            .await
    }

    /// Follows `page` until a short page comes back.
    async fn paginated<T: DeserializeOwned>(&self, route: &str) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut page = 1;
        loop {
            let query = PageQuery {
                per_page: PER_PAGE,
                page,
            };
            let batch: Vec<T> = self.get(route, Some(&query)).await?;
            let last = batch.len() < PER_PAGE;
            items.extend(batch);
            if last {
                break;
            }
            page += 1;
        }
        Ok(items)
    }

    async fn post<B: Serialize + ?Sized>(&self, route: &str, body: &B) -> Result<()> {
        log::debug!("request payload: {}", serde_json::to_string(body)?);
        let _: serde_json::Value = self
            .timed(&format!("POST {route}"), self.client.post(route, Some(body)))
            .await?;
        Ok(())
    }

    async fn pull_requests(&self) -> Result<Vec<PullRequest>> {
        let route = format!("{}/pulls", self.repo_route());
        if let Some(number) = self.pull_request {
            let pr: PullRequest = self
                .get(&format!("{route}/{number}"), None::<&()>)
                .await?;
            return Ok(vec![pr]);
        }
        log::debug!("finding pull requests for branch {}", self.branch);
        let head = format!("{}:{}", self.owner, self.branch);
        let query = [("state", "open"), ("head", head.as_str())];
        self.get(&route, Some(&query)).await
    }

    async fn load_pull_request(&self, pr: PullRequest, login: &str) -> Result<GitHubPullRequest> {
        let route = format!("{}/pulls/{}/files", self.repo_route(), pr.number);
        let files: Vec<PullRequestFile> = self.paginated(&route).await?;
        let diffs = files
            .into_iter()
            .map(|f| {
                let correspondence = f
                    .patch
                    .as_deref()
                    .map(parse_unified_diff)
                    .unwrap_or_default();
                (f.filename, correspondence)
            })
            .collect();
        Ok(GitHubPullRequest {
            number: pr.number,
            head_sha: pr.head.sha,
            login: login.to_string(),
            diffs,
        })
    }

    /// Creates the summary review, or rewrites the one an earlier run left.
    async fn upsert_review(&self, pr: &GitHubPullRequest, body: &str) -> Result<()> {
        let route = format!("{}/pulls/{}/reviews", self.repo_route(), pr.number);
        let reviews: Vec<Review> = self.paginated(&route).await?;
        let header = summary_header(&self.docs_url);
        let existing = reviews
            .iter()
            .find(|r| r.user.login == pr.login && r.body.starts_with(&header));
        match existing {
            Some(review) => {
                log::info!("updating pull request review {} on {pr}", review.id);
                let route = format!("{route}/{}", review.id);
                let _: serde_json::Value = self
                    .timed(
                        &format!("PUT {route}"),
                        self.client.put(&route, Some(&Body { body })),
                    )
                    .await?;
                Ok(())
            }
            None => {
                log::info!("creating pull request review on {pr} for {}", pr.head_sha);
                let review = NewReview {
                    commit_id: &pr.head_sha,
                    body,
                    event: "COMMENT",
                };
                self.post(&route, &review).await
            }
        }
    }
}

/// Own line comments still attached to the diff, with their reply counts.
fn existing_comments(
    comments: &[ReviewComment],
    login: &str,
) -> Vec<ExistingComment<u64>> {
    comments
        .iter()
        .filter(|c| c.in_reply_to_id.is_none() && c.user.login == login)
        .filter_map(|c| {
            let line = c.line?;
            let position = match c.side.as_deref() {
                Some("LEFT") => DiffPosition::old(&c.path, line),
                _ => DiffPosition::new(&c.path, line),
            };
            Some(ExistingComment {
                position,
                text: c.body.clone(),
                replies: comments
                    .iter()
                    .filter(|r| r.in_reply_to_id == Some(c.id))
                    .count(),
                severity: None,
                anchored_to_commit: false,
                meta: c.id,
            })
        })
        .collect()
}

/// GitHub puts comments on unchanged lines on the right side of the diff.
fn place(pr: &GitHubPullRequest, pending: &PendingComment) -> Option<DiffPosition> {
    let Some(correspondence) = pr.diff_for(&pending.path) else {
        log::debug!("skipping comment for {} which is not part of {pr}", pending.path);
        return None;
    };
    let position = translate_position(pending, Some(correspondence));
    Some(match position.side() {
        DiffSide::Both => DiffPosition::new(&position.path, position.line()),
        _ => position,
    })
}

fn review_comment<'a>(
    pr: &'a GitHubPullRequest,
    pending: &'a PendingComment,
    position: &'a DiffPosition,
) -> NewReviewComment<'a> {
    let side = match (position.side(), pending.anchor) {
        (DiffSide::Old, _) | (_, Anchor::Before) => "LEFT",
        _ => "RIGHT",
    };
    NewReviewComment {
        body: &pending.text,
        commit_id: &pr.head_sha,
        path: &position.path,
        line: position.line(),
        side,
    }
}

#[async_trait]
impl Commenter for GitHubCommenter {
    type Destination = GitHubPullRequest;
    type Meta = u64;

    fn describe(&self) -> &str {
        PLATFORM
    }

    fn max_comment_length(&self) -> usize {
        MAX_COMMENT_LENGTH
    }

    async fn destinations(&self) -> review_comments::Result<Vec<GitHubPullRequest>> {
        let load = async {
            let me: Account = self.get("/user", None::<&()>).await?;
            let prs = self.pull_requests().await?;
            let mut dsts = Vec::with_capacity(prs.len());
            for pr in prs {
                log::info!("found GitHub pull request #{} for {}", pr.number, self.branch);
                dsts.push(self.load_pull_request(pr, &me.login).await?);
            }
            Ok::<_, Error>(dsts)
        };
        load.await.map_err(|e| e.into_review(PLATFORM))
    }

    async fn list(
        &self,
        dst: &GitHubPullRequest,
    ) -> review_comments::Result<Vec<ExistingComment<u64>>> {
        let route = format!("{}/pulls/{}/comments", self.repo_route(), dst.number);
        let comments: Vec<ReviewComment> = self
            .paginated(&route)
            .await
            .map_err(|e| e.into_review(PLATFORM))?;
        Ok(existing_comments(&comments, &dst.login))
    }

    fn position(&self, dst: &GitHubPullRequest, pending: &PendingComment) -> Option<DiffPosition> {
        place(dst, pending)
    }

    async fn create(
        &self,
        dst: &GitHubPullRequest,
        pending: &PendingComment,
        position: &DiffPosition,
    ) -> review_comments::Result<()> {
        let route = format!("{}/pulls/{}/comments", self.repo_route(), dst.number);
        self.post(&route, &review_comment(dst, pending, position))
            .await
            .map_err(|e| e.into_review(PLATFORM))
    }

    async fn delete(
        &self,
        _dst: &GitHubPullRequest,
        existing: &ExistingComment<u64>,
    ) -> review_comments::Result<()> {
        log::debug!("deleting stale comment {} at {}", existing.meta, existing.position);
        let route = format!("{}/pulls/comments/{}", self.repo_route(), existing.meta);
        let delete = async {
            let response = self
                .timed(
                    &format!("DELETE {route}"),
                    self.client._delete(route.as_str(), None::<&()>),
                )
                .await?;
            if !response.status().is_success() {
                octocrab::map_github_error(response).await?;
            }
            Ok::<_, Error>(())
        };
        delete.await.map_err(|e| e.into_review(PLATFORM))
    }

    async fn resolve_thread(
        &self,
        dst: &GitHubPullRequest,
        existing: &ExistingComment<u64>,
    ) -> review_comments::Result<()> {
        // Threads can only be resolved via GraphQL; the thread stays open for the humans in it.
        log::debug!(
            "leaving stale comment {} on {dst} open, it has replies",
            existing.meta
        );
        Ok(())
    }

    fn can_create(&self, done: usize) -> review_comments::Result<bool> {
        Ok(done < self.max_comments)
    }

    async fn general_comment(
        &self,
        dst: &GitHubPullRequest,
        body: &str,
    ) -> review_comments::Result<()> {
        let route = format!("{}/issues/{}/comments", self.repo_route(), dst.number);
        let post = async {
            let comments: Vec<IssueComment> = self.paginated(&route).await?;
            if comments
                .iter()
                .any(|c| c.user.login == dst.login && texts_equal(&c.body, body))
            {
                log::debug!("general comment already exists on {dst}");
                return Ok(());
            }
            self.post(&route, &Body { body }).await
        };
        post.await.map_err(|e| e.into_review(PLATFORM))
    }

    async fn summary(
        &self,
        dst: &GitHubPullRequest,
        summary: &Summary,
        errors: &[String],
    ) -> review_comments::Result<()> {
        let body = summary_comment(summary, &self.docs_url);
        let review = self
            .upsert_review(dst, &body)
            .await
            .map_err(|e| e.into_review(PLATFORM));
        if !errors.is_empty() {
            self.general_comment(dst, &errors_comment(errors)).await?;
        }
        review
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use review_comments::Severity;

    fn pull_request() -> GitHubPullRequest {
        GitHubPullRequest {
            number: 12,
            head_sha: "abc".into(),
            login: "linemark-bot".into(),
            diffs: vec![(
                "a.yaml".into(),
                parse_unified_diff("@@ -1,3 +1,4 @@\n+X\n+Y\n a\n-b\n c\n"),
            )],
        }
    }

    fn pending(path: &str, line: u32, anchor: Anchor) -> PendingComment {
        PendingComment {
            path: path.into(),
            line,
            text: "T".into(),
            severity: Severity::Bug,
            anchor,
            modified_line: true,
        }
    }

    #[test]
    fn places_on_the_side_github_expects() {
        let pr = pull_request();
        assert_eq!(
            place(&pr, &pending("a.yaml", 1, Anchor::After)),
            Some(DiffPosition::new("a.yaml", 1))
        );
        // unchanged line goes to the right side
        assert_eq!(
            place(&pr, &pending("a.yaml", 3, Anchor::After)),
            Some(DiffPosition::new("a.yaml", 3))
        );
        assert_eq!(
            place(&pr, &pending("a.yaml", 2, Anchor::Before)),
            Some(DiffPosition::old("a.yaml", 2))
        );
        assert_eq!(place(&pr, &pending("b.yaml", 1, Anchor::After)), None);
    }

    #[test]
    fn review_comment_payload() {
        let pr = pull_request();
        let removed = pending("a.yaml", 2, Anchor::Before);
        let position = DiffPosition::old("a.yaml", 2);
        assert_eq!(
            serde_json::to_value(review_comment(&pr, &removed, &position)).unwrap(),
            serde_json::json!({
                "body": "T",
                "commit_id": "abc",
                "path": "a.yaml",
                "line": 2,
                "side": "LEFT"
            })
        );

        let added = pending("a.yaml", 1, Anchor::After);
        let position = DiffPosition::new("a.yaml", 1);
        assert_eq!(review_comment(&pr, &added, &position).side, "RIGHT");
    }

    #[test]
    fn reads_back_own_attached_comments() {
        let comments: Vec<ReviewComment> = serde_json::from_value(serde_json::json!([
            {"id": 1, "body": "mine", "path": "a.yaml", "line": 4, "side": "RIGHT",
             "user": {"login": "linemark-bot"}, "in_reply_to_id": null},
            {"id": 2, "body": "reply", "path": "a.yaml", "line": 4, "side": "RIGHT",
             "user": {"login": "alice"}, "in_reply_to_id": 1},
            {"id": 3, "body": "removed", "path": "a.yaml", "line": 2, "side": "LEFT",
             "user": {"login": "linemark-bot"}},
            {"id": 4, "body": "outdated", "path": "a.yaml", "line": null, "side": "RIGHT",
             "user": {"login": "linemark-bot"}},
            {"id": 5, "body": "theirs", "path": "a.yaml", "line": 7, "side": "RIGHT",
             "user": {"login": "alice"}}
        ]))
        .unwrap();
        let existing = existing_comments(&comments, "linemark-bot");
        assert_eq!(existing.len(), 2);
        assert_eq!(existing[0].position, DiffPosition::new("a.yaml", 4));
        assert_eq!(existing[0].replies, 1);
        assert_eq!(existing[0].meta, 1);
        assert_eq!(existing[1].position, DiffPosition::old("a.yaml", 2));
        assert_eq!(existing[1].replies, 0);
    }

    #[test]
    fn pull_request_display() {
        assert_eq!(pull_request().to_string(), "pull request #12");
    }
}
