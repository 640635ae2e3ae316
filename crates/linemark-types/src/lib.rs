mod commit_id;

pub use commit_id::{CommitId, InvalidCommitIdError};
