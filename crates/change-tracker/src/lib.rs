mod blame;
mod branch;
mod changes;
mod filter;
pub mod git;
mod lines;
mod path;

pub use blame::{FileBlames, LineBlame, blame, parse_blame_porcelain};
pub use branch::{count_commits, should_skip_ci};
pub use changes::{ChangeSet, ChangeTracker};
pub use filter::PathFilter;
pub use git::{GitCli, GitRunner};
pub use lines::{clean_path, count_lines, removed_lines};
pub use linemark_types::CommitId;
pub use path::{BodyDiff, FileChange, FileStatus, LineSets, Path, PathDiff, PathType};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("git {args} failed: {message}")]
    Command { args: String, message: String },

    #[error("Failed to run git: {0}")]
    Io(#[from] std::io::Error),

    #[error("git2 error: {0}")]
    Git(#[from] git2::Error),

    #[error("Failed to parse git blame output: {0}")]
    BlameParse(String),

    #[error("Failed to get the list of modified files from git: {0}")]
    RangeEnumeration(#[source] Box<Error>),

    #[error("Symlink cycle detected while resolving {0}")]
    SymlinkCycle(String),

    #[error("Invalid commit id: {0}")]
    CommitId(#[from] linemark_types::InvalidCommitIdError),

    #[error("Invalid path pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
