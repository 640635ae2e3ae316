mod diff_position;
mod model;
mod reconcile;
mod render;

pub use diff_position::{DiffCorrespondence, DiffLine, parse_unified_diff, translate_position};
pub use model::{
    Anchor, CommentSeverity, DiffPosition, DiffSide, Duplicate, ExistingComment, LineRange,
    ModifiedLines, PendingComment, Problem, Report, ReportPath, Severity, Summary,
    mark_duplicates, texts_equal,
};
pub use reconcile::{Commenter, Outcome, reconcile, submit};
pub use render::{
    dedup_reports, errors_comment, make_comments, report_line, summary_comment, summary_header,
    too_many_comments_message, truncate_comment,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{platform} request failed: {message}")]
    Platform { platform: String, message: String },

    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    #[error("Invalid severity: {0}")]
    InvalidSeverity(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn platform(platform: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Platform {
            platform: platform.into(),
            message: message.into(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
