use std::str::FromStr;

use git2::Oid;

/// Full object id of a commit as printed by `git log --format=%H`.
#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct CommitId(Oid);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidCommitIdError(String);

impl std::fmt::Display for InvalidCommitIdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid commit id: {:?}", self.0)
    }
}

impl std::error::Error for InvalidCommitIdError {}

impl std::fmt::Debug for CommitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for CommitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl CommitId {
    pub fn oid(self) -> Oid {
        self.0
    }

    /// Abbreviated form used in log lines.
    pub fn short(self) -> String {
        let mut s = self.0.to_string();
        s.truncate(12);
        s
    }

    /// `<sha>^`, naming the parent of this commit.
    pub fn parent_rev(self) -> String {
        format!("{}^", self.0)
    }
}

impl From<Oid> for CommitId {
    fn from(oid: Oid) -> Self {
        Self(oid)
    }
}

impl From<CommitId> for Oid {
    fn from(commit_id: CommitId) -> Self {
        commit_id.0
    }
}

impl FromStr for CommitId {
    type Err = InvalidCommitIdError;

    /// Only full 40 character hex ids are accepted, abbreviated ids are ambiguous.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 40 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(InvalidCommitIdError(s.to_string()));
        }
        Oid::from_str(s)
            .map(Self)
            .map_err(|_| InvalidCommitIdError(s.to_string()))
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for CommitId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for CommitId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
