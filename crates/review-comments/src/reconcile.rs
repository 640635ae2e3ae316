use std::fmt;
use std::future::Future;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::model::{
    CommentSeverity, DiffPosition, ExistingComment, PendingComment, Summary, texts_equal,
};
use crate::render::{errors_comment, too_many_comments_message, truncate_comment};
use crate::{Error, Result};

/// A review platform the reconciler can keep comments in sync with.
///
/// Platform quirks such as severity vocabularies, position types and pagination stay
/// inside the implementation. The reconciler only sees [`DiffPosition`]s and
/// [`ExistingComment`]s.
#[async_trait]
pub trait Commenter: Send + Sync {
    /// One review that receives comments, e.g. a merge request.
    type Destination: Send + Sync + fmt::Display;
    /// Opaque data needed to address an existing comment again.
    type Meta: Send + Sync;

    fn describe(&self) -> &str;

    /// Longest comment body the platform accepts, in characters.
    fn max_comment_length(&self) -> usize;

    async fn destinations(&self) -> Result<Vec<Self::Destination>>;

    async fn list(&self, dst: &Self::Destination) -> Result<Vec<ExistingComment<Self::Meta>>>;

    /// Where `pending` goes in `dst`, `None` when the review has no place for it.
    fn position(&self, dst: &Self::Destination, pending: &PendingComment) -> Option<DiffPosition>;

    async fn create(
        &self,
        dst: &Self::Destination,
        pending: &PendingComment,
        position: &DiffPosition,
    ) -> Result<()>;

    async fn delete(
        &self,
        dst: &Self::Destination,
        existing: &ExistingComment<Self::Meta>,
    ) -> Result<()>;

    /// Only platforms with a blocking concept need this.
    async fn update_severity(
        &self,
        _dst: &Self::Destination,
        _existing: &ExistingComment<Self::Meta>,
        _severity: CommentSeverity,
    ) -> Result<()> {
        Ok(())
    }

    async fn resolve_thread(
        &self,
        dst: &Self::Destination,
        existing: &ExistingComment<Self::Meta>,
    ) -> Result<()>;

    /// Quota check, asked before every creation with the number created so far.
    fn can_create(&self, done: usize) -> Result<bool>;

    /// Posts a comment that is not tied to any line. Implementations skip posting
    /// when an identical general comment already exists.
    async fn general_comment(&self, dst: &Self::Destination, body: &str) -> Result<()>;

    /// Publishes the run as a whole once the line comments of `dst` are in sync.
    ///
    /// `errors` are the failures of that pass. The default posts them back as one
    /// general comment.
    async fn summary(
        &self,
        dst: &Self::Destination,
        _summary: &Summary,
        errors: &[String],
    ) -> Result<()> {
        if errors.is_empty() {
            return Ok(());
        }
        self.general_comment(dst, &errors_comment(errors)).await
    }

    fn is_equal(
        &self,
        existing: &ExistingComment<Self::Meta>,
        pending: &PendingComment,
        position: &DiffPosition,
    ) -> bool {
        !existing.anchored_to_commit
            && existing.position.same_place(position)
            && texts_equal(&existing.text, &pending.text)
    }
}

/// What one reconciliation pass did to a destination.
#[derive(Debug, Default)]
pub struct Outcome {
    pub destination: String,
    pub created: usize,
    pub kept: usize,
    pub deleted: usize,
    pub resolved: usize,
    /// Comments not created because of the cap, a quota failure or a missing position.
    pub skipped: usize,
    pub errors: Vec<Error>,
}

impl Outcome {
    fn new(destination: String) -> Self {
        Self {
            destination,
            ..Self::default()
        }
    }
}

async fn guarded<T>(cancel: &CancellationToken, call: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        res = call => res,
    }
}

/// Converges the comments on `dst` to `pending`.
///
/// Existing comments are listed once. Failing create, delete or resolve calls are
/// collected in [`Outcome::errors`] and the pass carries on. Only a failure to list
/// the existing comments fails the whole pass.
pub async fn reconcile<C: Commenter + ?Sized>(
    commenter: &C,
    dst: &C::Destination,
    pending: &[PendingComment],
    cancel: &CancellationToken,
) -> Result<Outcome> {
    let reporter = commenter.describe();
    let mut outcome = Outcome::new(dst.to_string());

    log::info!("[{reporter}] listing existing comments on {dst}");
    let existing = guarded(cancel, commenter.list(dst)).await?;
    log::debug!("[{reporter}] found {} existing comment(s) on {dst}", existing.len());

    let max_length = commenter.max_comment_length();
    let mut desired: Vec<(PendingComment, DiffPosition)> = Vec::with_capacity(pending.len());
    for comment in pending {
        let mut comment = comment.clone();
        comment.text = truncate_comment(&comment.text, max_length);
        match commenter.position(dst, &comment) {
            Some(position) => desired.push((comment, position)),
            None => {
                log::debug!(
                    "[{reporter}] no place for a comment on {}:{}, skipping",
                    comment.path,
                    comment.line
                );
                outcome.skipped += 1;
            }
        }
    }

    let mut allowed = 0;
    let mut overflow = 0;
    let mut quota_failed = false;
    for (comment, position) in &desired {
        if existing
            .iter()
            .any(|e| commenter.is_equal(e, comment, position))
        {
            log::debug!("[{reporter}] comment already exists at {position}");
            outcome.kept += 1;
            continue;
        }
        if quota_failed {
            outcome.skipped += 1;
            continue;
        }
        match commenter.can_create(outcome.created) {
            Ok(true) => {}
            Ok(false) => {
                log::debug!("[{reporter}] cannot create new comment at {position}");
                overflow += 1;
                continue;
            }
            Err(e) => {
                log::warn!("[{reporter}] comment quota check failed, not creating more comments: {e}");
                quota_failed = true;
                outcome.skipped += 1;
                continue;
            }
        }
        if cancel.is_cancelled() {
            outcome.errors.push(Error::Cancelled);
            return Ok(outcome);
        }

        allowed += 1;
        log::info!("[{reporter}] creating a new comment at {position}");
        match guarded(cancel, commenter.create(dst, comment, position)).await {
            Ok(()) => outcome.created += 1,
            Err(Error::Cancelled) => {
                outcome.errors.push(Error::Cancelled);
                return Ok(outcome);
            }
            Err(e) => {
                log::error!("[{reporter}] failed to create a comment at {position}: {e}");
                outcome.errors.push(e);
            }
        }
    }

    if overflow > 0 {
        outcome.skipped += overflow;
        let notice = too_many_comments_message(allowed + overflow, allowed);
        if let Err(e) = guarded(cancel, commenter.general_comment(dst, &notice)).await {
            log::error!("[{reporter}] failed to post the comment limit notice: {e}");
            outcome.errors.push(e);
        }
    }

    for stale in &existing {
        if desired
            .iter()
            .any(|(comment, position)| commenter.is_equal(stale, comment, position))
        {
            continue;
        }
        if cancel.is_cancelled() {
            outcome.errors.push(Error::Cancelled);
            return Ok(outcome);
        }

        let position = &stale.position;
        if stale.replies == 0 {
            log::info!("[{reporter}] deleting a stale comment at {position}");
            match guarded(cancel, commenter.delete(dst, stale)).await {
                Ok(()) => outcome.deleted += 1,
                Err(e) => {
                    log::error!("[{reporter}] failed to delete a stale comment at {position}: {e}");
                    outcome.errors.push(e);
                }
            }
            continue;
        }

        if !stale.is_high() {
            log::info!("[{reporter}] raising severity of a stale comment at {position}");
            let update = commenter.update_severity(dst, stale, CommentSeverity::Blocker);
            if let Err(e) = guarded(cancel, update).await {
                log::error!("[{reporter}] failed to update severity at {position}: {e}");
                outcome.errors.push(e);
            }
        }
        log::info!("[{reporter}] resolving a stale comment thread at {position}");
        match guarded(cancel, commenter.resolve_thread(dst, stale)).await {
            Ok(()) => outcome.resolved += 1,
            Err(e) => {
                log::error!("[{reporter}] failed to resolve a stale thread at {position}: {e}");
                outcome.errors.push(e);
            }
        }
    }

    log::info!(
        "[{reporter}] {dst}: created {}, kept {}, deleted {}, resolved {}, skipped {}, errors {}",
        outcome.created,
        outcome.kept,
        outcome.deleted,
        outcome.resolved,
        outcome.skipped,
        outcome.errors.len()
    );
    Ok(outcome)
}

/// Reconciles `pending` with every destination of `commenter`, then hands each one
/// the run `summary`.
///
/// A destination that fails is recorded and the next one is tried. Errors of the
/// pass reach the platform through [`Commenter::summary`].
pub async fn submit<C: Commenter + ?Sized>(
    commenter: &C,
    summary: &Summary,
    pending: &[PendingComment],
    cancel: &CancellationToken,
) -> Result<Vec<Outcome>> {
    let reporter = commenter.describe();
    log::info!("[{reporter}] will now report problems");
    let destinations = guarded(cancel, commenter.destinations()).await?;

    let mut outcomes = Vec::with_capacity(destinations.len());
    for dst in &destinations {
        log::info!("[{reporter}] found a report destination {dst}");
        let mut outcome = match reconcile(commenter, dst, pending, cancel).await {
            Ok(outcome) => outcome,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                log::error!("[{reporter}] failed to update {dst}: {e}");
                let mut outcome = Outcome::new(dst.to_string());
                outcome.errors.push(e);
                outcome
            }
        };

        if !cancel.is_cancelled() {
            let errors: Vec<String> = outcome
                .errors
                .iter()
                .filter(|e| !matches!(e, Error::Cancelled))
                .map(ToString::to_string)
                .collect();
            log::info!(
                "[{reporter}] creating report summary for {dst} with {} problem(s)",
                summary.reports.len()
            );
            let publish = commenter.summary(dst, summary, &errors);
            if let Err(e) = guarded(cancel, publish).await {
                log::warn!("[{reporter}] failed to publish the summary on {dst}: {e}");
                outcome.errors.push(e);
            }
        }
        outcomes.push(outcome);
    }

    log::info!("[{reporter}] finished reporting problems");
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::diff_position::translate_position;
    use crate::model::{Anchor, Severity};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Create(String, u32),
        Delete(u32),
        UpdateSeverity(u32),
        Resolve(u32),
        General(String),
        Summary(usize, Vec<String>),
    }

    #[derive(Default)]
    struct FakeCommenter {
        comments: Mutex<Vec<ExistingComment<u32>>>,
        calls: Mutex<Vec<Call>>,
        next_id: Mutex<u32>,
        cap: Option<usize>,
        quota_error: bool,
        max_length: Option<usize>,
        fail_create_on: Option<String>,
        fail_list: bool,
        custom_summary: bool,
    }

    impl FakeCommenter {
        fn with_comments(comments: Vec<ExistingComment<u32>>) -> Self {
            let next_id = comments.iter().map(|c| c.meta).max().unwrap_or(0) + 1;
            Self {
                comments: Mutex::new(comments),
                next_id: Mutex::new(next_id),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn clear_calls(&self) {
            self.calls.lock().unwrap().clear();
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }

        fn remove(&self, id: u32) {
            self.comments.lock().unwrap().retain(|c| c.meta != id);
        }
    }

    #[async_trait]
    impl Commenter for FakeCommenter {
        type Destination = u32;
        type Meta = u32;

        fn describe(&self) -> &str {
            "fake"
        }

        fn max_comment_length(&self) -> usize {
            self.max_length.unwrap_or(65_536)
        }

        async fn destinations(&self) -> Result<Vec<u32>> {
            Ok(vec![1])
        }

        async fn list(&self, _dst: &u32) -> Result<Vec<ExistingComment<u32>>> {
            if self.fail_list {
                return Err(Error::platform("fake", "list failed"));
            }
            Ok(self.comments.lock().unwrap().clone())
        }

        fn position(&self, _dst: &u32, pending: &PendingComment) -> Option<DiffPosition> {
            if pending.path == "gone.yaml" {
                return None;
            }
            Some(translate_position(pending, None))
        }

        async fn create(
            &self,
            _dst: &u32,
            pending: &PendingComment,
            position: &DiffPosition,
        ) -> Result<()> {
            if self.fail_create_on.as_deref() == Some(pending.path.as_str()) {
                return Err(Error::platform("fake", format!("cannot comment on {}", pending.path)));
            }
            self.record(Call::Create(position.path.clone(), position.line()));
            let mut next_id = self.next_id.lock().unwrap();
            let id = *next_id;
            *next_id += 1;
            self.comments.lock().unwrap().push(ExistingComment {
                position: position.clone(),
                text: pending.text.clone(),
                replies: 0,
                severity: Some(if pending.severity.is_high() {
                    CommentSeverity::Blocker
                } else {
                    CommentSeverity::Normal
                }),
                anchored_to_commit: false,
                meta: id,
            });
            Ok(())
        }

        async fn delete(&self, _dst: &u32, existing: &ExistingComment<u32>) -> Result<()> {
            self.record(Call::Delete(existing.meta));
            self.remove(existing.meta);
            Ok(())
        }

        async fn update_severity(
            &self,
            _dst: &u32,
            existing: &ExistingComment<u32>,
            _severity: CommentSeverity,
        ) -> Result<()> {
            self.record(Call::UpdateSeverity(existing.meta));
            Ok(())
        }

        async fn resolve_thread(&self, _dst: &u32, existing: &ExistingComment<u32>) -> Result<()> {
            self.record(Call::Resolve(existing.meta));
            self.remove(existing.meta);
            Ok(())
        }

        fn can_create(&self, done: usize) -> Result<bool> {
            if self.quota_error {
                return Err(Error::platform("fake", "quota unavailable"));
            }
            Ok(self.cap.is_none_or(|cap| done < cap))
        }

        async fn general_comment(&self, _dst: &u32, body: &str) -> Result<()> {
            self.record(Call::General(body.to_string()));
            Ok(())
        }

        async fn summary(&self, dst: &u32, summary: &Summary, errors: &[String]) -> Result<()> {
            if !self.custom_summary {
                if errors.is_empty() {
                    return Ok(());
                }
                return self.general_comment(dst, &errors_comment(errors)).await;
            }
            self.record(Call::Summary(summary.reports.len(), errors.to_vec()));
            Ok(())
        }
    }

    fn pending(path: &str, line: u32, text: &str) -> PendingComment {
        PendingComment {
            path: path.into(),
            line,
            text: text.into(),
            severity: Severity::Warning,
            anchor: Anchor::After,
            modified_line: true,
        }
    }

    fn existing(id: u32, path: &str, line: u32, text: &str) -> ExistingComment<u32> {
        ExistingComment {
            position: DiffPosition::both(path, line, line),
            text: text.into(),
            replies: 0,
            severity: Some(CommentSeverity::Normal),
            anchored_to_commit: false,
            meta: id,
        }
    }

    #[tokio::test]
    async fn second_run_is_a_no_op() {
        let commenter = FakeCommenter::default();
        let cancel = CancellationToken::new();
        let wanted = vec![
            pending("a.yaml", 1, "A"),
            pending("a.yaml", 5, "B"),
            pending("b.yaml", 2, "C"),
        ];

        let first = reconcile(&commenter, &1, &wanted, &cancel).await.unwrap();
        assert_eq!(first.created, 3);
        assert_eq!(commenter.calls().len(), 3);

        commenter.clear_calls();
        let second = reconcile(&commenter, &1, &wanted, &cancel).await.unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.kept, 3);
        assert!(commenter.calls().is_empty());
    }

    #[tokio::test]
    async fn matching_existing_comment_is_kept() {
        let commenter = FakeCommenter::with_comments(vec![existing(1, "x.yaml", 10, "\nT\n")]);
        let outcome = reconcile(
            &commenter,
            &1,
            &[pending("x.yaml", 10, "T")],
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.kept, 1);
        assert!(commenter.calls().is_empty());
    }

    #[tokio::test]
    async fn cap_overflow_posts_one_notice() {
        let commenter = FakeCommenter {
            cap: Some(2),
            ..FakeCommenter::default()
        };
        let wanted: Vec<PendingComment> = (1..=5)
            .map(|line| pending("a.yaml", line, "T"))
            .collect();
        let outcome = reconcile(&commenter, &1, &wanted, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.created, 2);
        assert_eq!(outcome.skipped, 3);

        let calls = commenter.calls();
        let notices: Vec<&String> = calls
            .iter()
            .filter_map(|c| match c {
                Call::General(body) => Some(body),
                _ => None,
            })
            .collect();
        assert_eq!(notices.len(), 1);
        assert!(notices[0].contains("would create 5 comment(s)"));
        assert!(notices[0].contains("3 comment(s) were skipped"));
    }

    #[tokio::test]
    async fn stale_comment_without_replies_is_deleted() {
        let commenter = FakeCommenter::with_comments(vec![existing(7, "x.yaml", 3, "old")]);
        let outcome = reconcile(&commenter, &1, &[], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.deleted, 1);
        assert_eq!(commenter.calls(), vec![Call::Delete(7)]);
    }

    #[tokio::test]
    async fn stale_high_severity_thread_is_resolved_not_deleted() {
        let mut comment = existing(7, "x.yaml", 3, "old");
        comment.replies = 2;
        comment.severity = Some(CommentSeverity::Blocker);
        let commenter = FakeCommenter::with_comments(vec![comment]);

        let outcome = reconcile(&commenter, &1, &[], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.resolved, 1);
        assert_eq!(outcome.deleted, 0);
        assert_eq!(commenter.calls(), vec![Call::Resolve(7)]);
    }

    #[tokio::test]
    async fn stale_normal_thread_is_raised_then_resolved() {
        let mut comment = existing(7, "x.yaml", 3, "old");
        comment.replies = 1;
        let commenter = FakeCommenter::with_comments(vec![comment]);

        reconcile(&commenter, &1, &[], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            commenter.calls(),
            vec![Call::UpdateSeverity(7), Call::Resolve(7)]
        );
    }

    #[tokio::test]
    async fn commit_anchored_comment_is_replaced() {
        let mut comment = existing(7, "x.yaml", 3, "T");
        comment.anchored_to_commit = true;
        let commenter = FakeCommenter::with_comments(vec![comment]);

        let outcome = reconcile(
            &commenter,
            &1,
            &[pending("x.yaml", 3, "T")],
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.created, 1);
        assert_eq!(outcome.deleted, 1);
        assert_eq!(
            commenter.calls(),
            vec![Call::Create("x.yaml".into(), 3), Call::Delete(7)]
        );
    }

    #[tokio::test]
    async fn different_side_is_not_equal() {
        let mut comment = existing(7, "x.yaml", 3, "T");
        comment.position = DiffPosition::new("x.yaml", 3);
        let commenter = FakeCommenter::with_comments(vec![comment]);

        let outcome = reconcile(
            &commenter,
            &1,
            &[pending("x.yaml", 3, "T")],
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.created, 1);
        assert_eq!(outcome.deleted, 1);
    }

    #[tokio::test]
    async fn failures_are_collected_and_summarised() {
        let commenter = FakeCommenter {
            fail_create_on: Some("bad.yaml".into()),
            ..FakeCommenter::with_comments(vec![existing(9, "old.yaml", 1, "stale")])
        };
        let wanted = vec![pending("bad.yaml", 1, "A"), pending("good.yaml", 1, "B")];

        let outcomes = submit(&commenter, &Summary::default(), &wanted, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].created, 1);
        assert_eq!(outcomes[0].deleted, 1);
        assert_eq!(outcomes[0].errors.len(), 1);

        let calls = commenter.calls();
        assert_eq!(calls[0], Call::Create("good.yaml".into(), 1));
        assert_eq!(calls[1], Call::Delete(9));
        match &calls[2] {
            Call::General(body) => {
                assert!(body.contains("- `fake request failed: cannot comment on bad.yaml`"))
            }
            other => panic!("unexpected call: {other:?}"),
        }
    }

    #[tokio::test]
    async fn list_failure_is_recorded_per_destination() {
        let commenter = FakeCommenter {
            fail_list: true,
            ..FakeCommenter::default()
        };
        let outcomes = submit(
            &commenter,
            &Summary::default(),
            &[pending("a.yaml", 1, "A")],
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(outcomes[0].errors.len(), 1);
        assert_eq!(outcomes[0].created, 0);
        assert!(matches!(commenter.calls()[0], Call::General(_)));
    }

    #[tokio::test]
    async fn summary_runs_once_per_destination_after_comments() {
        let commenter = FakeCommenter {
            custom_summary: true,
            fail_create_on: Some("bad.yaml".into()),
            ..FakeCommenter::default()
        };
        let wanted = vec![pending("good.yaml", 1, "A"), pending("bad.yaml", 2, "B")];
        submit(&commenter, &Summary::default(), &wanted, &CancellationToken::new())
            .await
            .unwrap();

        let calls = commenter.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], Call::Create("good.yaml".into(), 1));
        assert_eq!(
            calls[1],
            Call::Summary(
                0,
                vec!["fake request failed: cannot comment on bad.yaml".to_string()]
            )
        );
    }

    #[tokio::test]
    async fn quota_error_degrades_to_skipped() {
        let commenter = FakeCommenter {
            quota_error: true,
            ..FakeCommenter::default()
        };
        let outcome = reconcile(
            &commenter,
            &1,
            &[pending("a.yaml", 1, "A"), pending("a.yaml", 2, "B")],
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.created, 0);
        assert_eq!(outcome.skipped, 2);
        assert!(outcome.errors.is_empty());
        assert!(commenter.calls().is_empty());
    }

    #[tokio::test]
    async fn unplaceable_comment_is_skipped() {
        let commenter = FakeCommenter::default();
        let outcome = reconcile(
            &commenter,
            &1,
            &[pending("gone.yaml", 1, "A")],
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.skipped, 1);
        assert!(commenter.calls().is_empty());
    }

    #[tokio::test]
    async fn long_comments_are_truncated() {
        let commenter = FakeCommenter {
            max_length: Some(20),
            ..FakeCommenter::default()
        };
        let text = "x".repeat(100);
        reconcile(
            &commenter,
            &1,
            &[pending("a.yaml", 1, &text)],
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        let stored = commenter.comments.lock().unwrap()[0].text.clone();
        assert_eq!(stored.chars().count(), 20);
        assert!(stored.ends_with("(truncated)"));
    }

    #[tokio::test]
    async fn cancelled_run_stops_early() {
        let commenter = FakeCommenter::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = reconcile(&commenter, &1, &[pending("a.yaml", 1, "A")], &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(commenter.calls().is_empty());
    }
}
