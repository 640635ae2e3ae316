use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use review_comments::{
    Commenter, DiffPosition, ExistingComment, PendingComment, parse_unified_diff,
    texts_equal, translate_position,
};

use crate::http::ApiClient;
use crate::{Error, Result};

const PLATFORM: &str = "GitLab";
const MAX_COMMENT_LENGTH: usize = 1_000_000;

#[derive(Debug, Clone)]
pub struct GitLabConfig {
    /// Instance root, e.g. `https://gitlab.com`.
    pub uri: String,
    pub project: u64,
    pub token: String,
    pub timeout: Duration,
    pub max_comments: usize,
    /// Source branch whose merge requests receive comments.
    pub branch: String,
}

#[derive(Debug, Clone, Deserialize)]
struct User {
    id: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct MergeRequest {
    iid: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct DiffVersion {
    head_commit_sha: String,
    base_commit_sha: String,
    start_commit_sha: String,
}

#[derive(Debug, Clone, Deserialize)]
struct FileDiff {
    old_path: String,
    new_path: String,
    #[serde(default)]
    diff: String,
}

#[derive(Debug, Clone, Deserialize)]
struct Discussion {
    id: String,
    #[serde(default)]
    notes: Vec<Note>,
}

#[derive(Debug, Clone, Deserialize)]
struct Note {
    id: u64,
    #[serde(default)]
    body: String,
    author: User,
    #[serde(default)]
    system: bool,
    #[serde(default)]
    resolved: bool,
    position: Option<NotePosition>,
}

#[derive(Debug, Clone, Deserialize)]
struct NotePosition {
    old_path: Option<String>,
    new_path: Option<String>,
    old_line: Option<u32>,
    new_line: Option<u32>,
}

#[derive(Debug, Serialize)]
struct NewDiscussion<'a> {
    body: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    position: Option<NewPosition<'a>>,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
struct NewPosition<'a> {
    position_type: &'static str,
    base_sha: &'a str,
    head_sha: &'a str,
    start_sha: &'a str,
    old_path: &'a str,
    new_path: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    old_line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    new_line: Option<u32>,
}

/// An open merge request together with everything needed to place comments on it.
#[derive(Debug, Clone)]
pub struct GitLabMergeRequest {
    iid: u64,
    user_id: u64,
    version: DiffVersion,
    diffs: Vec<FileDiff>,
    discussions: Vec<Discussion>,
}

impl fmt::Display for GitLabMergeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "merge request !{}", self.iid)
    }
}

impl GitLabMergeRequest {
    fn diff_for(&self, path: &str) -> Option<&FileDiff> {
        self.diffs
            .iter()
            .find(|d| d.new_path == path)
            .or_else(|| self.diffs.iter().find(|d| d.old_path == path))
    }
}

/// Note handle used to delete or resolve a comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitLabNote {
    discussion_id: String,
    note_id: u64,
}

/// Comments on GitLab merge requests through the v4 REST API.
pub struct GitLabCommenter {
    api: ApiClient,
    project: u64,
    branch: String,
    max_comments: usize,
}

impl GitLabCommenter {
    pub fn new(config: &GitLabConfig) -> Result<Self> {
        log::info!(
            "will report problems to GitLab at {} (project {}, branch {}, max comments {}, timeout {:?})",
            config.uri,
            config.project,
            config.branch,
            config.max_comments,
            config.timeout
        );
        let base = format!("{}/api/v4", config.uri.trim_end_matches('/'));
        Ok(Self {
            api: ApiClient::new(&base, &config.token, config.timeout)?,
            project: config.project,
            branch: config.branch.clone(),
            max_comments: config.max_comments,
        })
    }

    fn mr_path(&self, iid: u64) -> String {
        format!("/projects/{}/merge_requests/{iid}", self.project)
    }

    async fn paginated<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut page = 1;
        loop {
            let mut query = query.to_vec();
            query.push(("page", page.to_string()));
            let resp = self.api.get::<Vec<T>>(path, &query).await?;
            items.extend(resp.body);
            match resp.next_page {
                Some(next) if next > page => page = next,
                _ => break,
            }
        }
        Ok(items)
    }

    async fn load_merge_request(&self, iid: u64, user_id: u64) -> Result<GitLabMergeRequest> {
        let path = self.mr_path(iid);
        log::debug!("getting versions, diffs and discussions of merge request !{iid}");
        let versions: Vec<DiffVersion> = self.paginated(&format!("{path}/versions"), &[]).await?;
        let version = versions
            .into_iter()
            .next()
            .ok_or_else(|| Error::Invalid(format!("no versions found for merge request !{iid}")))?;
        let diffs = self.paginated(&format!("{path}/diffs"), &[]).await?;
        let discussions = self.paginated(&format!("{path}/discussions"), &[]).await?;
        Ok(GitLabMergeRequest {
            iid,
            user_id,
            version,
            diffs,
            discussions,
        })
    }

    async fn set_resolved(
        &self,
        mr: &GitLabMergeRequest,
        discussion_id: &str,
        resolved: bool,
    ) -> Result<()> {
        let path = format!("{}/discussions/{discussion_id}", self.mr_path(mr.iid));
        self.api
            .send::<()>(Method::PUT, &path, &[("resolved", resolved.to_string())], None)
            .await?;
        Ok(())
    }

    /// Reopens a resolved own thread carrying the same comment, if there is one.
    async fn unresolve_if_present(
        &self,
        mr: &GitLabMergeRequest,
        pending: &PendingComment,
        position: &DiffPosition,
    ) -> Result<bool> {
        let resolved = mr.discussions.iter().find_map(|disc| {
            let note = disc.notes.first()?;
            let comment = note_to_existing(&disc.id, note)?;
            let own = !note.system && note.author.id == mr.user_id && note.resolved;
            (own
                && comment.position.same_place(position)
                && texts_equal(&comment.text, &pending.text))
            .then_some(comment)
        });
        let Some(comment) = resolved else {
            return Ok(false);
        };
        log::debug!(
            "un-resolving discussion {} note {}",
            comment.meta.discussion_id,
            comment.meta.note_id
        );
        self.set_resolved(mr, &comment.meta.discussion_id, false).await?;
        Ok(true)
    }
}

fn note_to_existing(discussion_id: &str, note: &Note) -> Option<ExistingComment<GitLabNote>> {
    let pos = note.position.as_ref()?;
    let path = pos.new_path.clone().or_else(|| pos.old_path.clone())?;
    let position = DiffPosition {
        path,
        old_line: pos.old_line,
        new_line: pos.new_line,
    };
    if position.line() == 0 {
        return None;
    }
    Some(ExistingComment {
        position,
        text: note.body.clone(),
        replies: 0,
        severity: None,
        anchored_to_commit: false,
        meta: GitLabNote {
            discussion_id: discussion_id.to_string(),
            note_id: note.id,
        },
    })
}

/// Open line comments this user started, one per discussion.
fn existing_comments(mr: &GitLabMergeRequest) -> Vec<ExistingComment<GitLabNote>> {
    mr.discussions
        .iter()
        .filter_map(|disc| {
            let note = disc.notes.first()?;
            if note.system || note.author.id != mr.user_id || note.resolved {
                return None;
            }
            let mut comment = note_to_existing(&disc.id, note)?;
            comment.replies = disc.notes.len() - 1;
            Some(comment)
        })
        .collect()
}

/// Position of `pending` in the merge request diff of its file.
fn place(mr: &GitLabMergeRequest, pending: &PendingComment) -> Option<DiffPosition> {
    let Some(diff) = mr.diff_for(&pending.path) else {
        log::debug!("skipping comment for {} with no GitLab diff", pending.path);
        return None;
    };
    let correspondence = parse_unified_diff(&diff.diff);
    let mut position = translate_position(pending, Some(&correspondence));
    position.path = diff.new_path.clone();
    // renamed files only accept positions on the new side
    if diff.old_path != diff.new_path && position.new_line.is_some() {
        position.old_line = None;
    }
    Some(position)
}

fn new_position<'a>(
    mr: &'a GitLabMergeRequest,
    diff: &'a FileDiff,
    position: &DiffPosition,
) -> NewPosition<'a> {
    NewPosition {
        position_type: "text",
        base_sha: &mr.version.base_commit_sha,
        head_sha: &mr.version.head_commit_sha,
        start_sha: &mr.version.start_commit_sha,
        old_path: &diff.old_path,
        new_path: &diff.new_path,
        old_line: position.old_line,
        new_line: position.new_line,
    }
}

#[async_trait]
impl Commenter for GitLabCommenter {
    type Destination = GitLabMergeRequest;
    type Meta = GitLabNote;

    fn describe(&self) -> &str {
        PLATFORM
    }

    fn max_comment_length(&self) -> usize {
        MAX_COMMENT_LENGTH
    }

    async fn destinations(&self) -> review_comments::Result<Vec<GitLabMergeRequest>> {
        let load = async {
            let user = self.api.get::<User>("/user", &[]).await?.body;
            log::debug!("finding merge requests for branch {}", self.branch);
            let mrs: Vec<MergeRequest> = self
                .paginated(
                    &format!("/projects/{}/merge_requests", self.project),
                    &[
                        ("state", "opened".to_string()),
                        ("source_branch", self.branch.clone()),
                    ],
                )
                .await?;
            let mut dsts = Vec::with_capacity(mrs.len());
            for mr in mrs {
                log::info!("found open GitLab merge request !{} for {}", mr.iid, self.branch);
                dsts.push(self.load_merge_request(mr.iid, user.id).await?);
            }
            Ok::<_, Error>(dsts)
        };
        load.await.map_err(|e| e.into_review(PLATFORM))
    }

    async fn list(
        &self,
        dst: &GitLabMergeRequest,
    ) -> review_comments::Result<Vec<ExistingComment<GitLabNote>>> {
        Ok(existing_comments(dst))
    }

    fn position(&self, dst: &GitLabMergeRequest, pending: &PendingComment) -> Option<DiffPosition> {
        place(dst, pending)
    }

    async fn create(
        &self,
        dst: &GitLabMergeRequest,
        pending: &PendingComment,
        position: &DiffPosition,
    ) -> review_comments::Result<()> {
        match self.unresolve_if_present(dst, pending, position).await {
            Ok(true) => {
                log::debug!("existing comment at {position} was un-resolved");
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => log::warn!("failed to un-resolve existing comment at {position}, creating a new one: {e}"),
        }

        let Some(diff) = dst.diff_for(&position.path) else {
            return Err(review_comments::Error::platform(
                PLATFORM,
                format!("{} is not part of the diff of {dst}", position.path),
            ));
        };
        let discussion = NewDiscussion {
            body: &pending.text,
            position: Some(new_position(dst, diff, position)),
        };
        let path = format!("{}/discussions", self.mr_path(dst.iid));
        self.api
            .send(Method::POST, &path, &[], Some(&discussion))
            .await
            .map(|_| ())
            .map_err(|e| e.into_review(PLATFORM))
    }

    async fn delete(
        &self,
        dst: &GitLabMergeRequest,
        existing: &ExistingComment<GitLabNote>,
    ) -> review_comments::Result<()> {
        let meta = &existing.meta;
        log::debug!(
            "deleting stale discussion {} note {}",
            meta.discussion_id,
            meta.note_id
        );
        let path = format!(
            "{}/discussions/{}/notes/{}",
            self.mr_path(dst.iid),
            meta.discussion_id,
            meta.note_id
        );
        self.api
            .send::<()>(Method::DELETE, &path, &[], None)
            .await
            .map(|_| ())
            .map_err(|e| e.into_review(PLATFORM))
    }

    async fn resolve_thread(
        &self,
        dst: &GitLabMergeRequest,
        existing: &ExistingComment<GitLabNote>,
    ) -> review_comments::Result<()> {
        self.set_resolved(dst, &existing.meta.discussion_id, true)
            .await
            .map_err(|e| e.into_review(PLATFORM))
    }

    fn can_create(&self, done: usize) -> review_comments::Result<bool> {
        Ok(done < self.max_comments)
    }

    async fn general_comment(
        &self,
        dst: &GitLabMergeRequest,
        body: &str,
    ) -> review_comments::Result<()> {
        let exists = dst.discussions.iter().flat_map(|d| &d.notes).any(|note| {
            !note.system
                && note.author.id == dst.user_id
                && note.position.is_none()
                && note.body == body
        });
        if exists {
            log::debug!("general comment already exists on {dst}");
            return Ok(());
        }
        let discussion = NewDiscussion {
            body,
            position: None,
        };
        let path = format!("{}/discussions", self.mr_path(dst.iid));
        self.api
            .send(Method::POST, &path, &[], Some(&discussion))
            .await
            .map(|_| ())
            .map_err(|e| e.into_review(PLATFORM))
    }
}
