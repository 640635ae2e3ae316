mod bitbucket;
mod github;
mod gitlab;
mod http;

pub use bitbucket::{BitbucketCommenter, BitbucketConfig, BitbucketPullRequest};
pub use github::{GitHubCommenter, GitHubConfig, GitHubPullRequest};
pub use gitlab::{GitLabCommenter, GitLabConfig, GitLabMergeRequest};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{method} {path} returned {status}: {body}")]
    Status {
        method: String,
        path: String,
        status: u16,
        body: String,
    },

    #[error("GitHub API error: {0}")]
    GitHub(#[from] octocrab::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    #[error("{0}")]
    Invalid(String),
}

impl Error {
    /// Converts into the reconciler's error, tagged with the platform name.
    pub fn into_review(self, platform: &str) -> review_comments::Error {
        match self {
            Error::Timeout { operation, seconds } => {
                review_comments::Error::Timeout { operation, seconds }
            }
            e => review_comments::Error::platform(platform, e.to_string()),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
