use serde::Serialize;

use linemark_types::CommitId;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PathType {
    #[default]
    Missing,
    Directory,
    File,
    Symlink,
}

/// Name-status letter reported by `git log --name-status`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Added,
    Copied,
    Deleted,
    Renamed,
    Modified,
    TypeChanged,
}

impl FileStatus {
    /// Parses the first letter of a status field; `R100` and `C075` carry a similarity score.
    pub fn from_field(field: &str) -> Option<Self> {
        match field.chars().next()? {
            'A' => Some(Self::Added),
            'C' => Some(Self::Copied),
            'D' => Some(Self::Deleted),
            'R' => Some(Self::Renamed),
            'M' => Some(Self::Modified),
            'T' => Some(Self::TypeChanged),
            _ => None,
        }
    }
}

/// A path as seen at one point in history.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Path {
    pub name: String,
    /// Final target when `name` is a symlink, empty otherwise.
    pub symlink_target: String,
    #[serde(rename = "type")]
    pub path_type: PathType,
}

impl Path {
    /// The content-bearing path: the symlink target when there is one.
    pub fn effective_path(&self) -> &str {
        if !self.symlink_target.is_empty() && self.symlink_target != self.name {
            &self.symlink_target
        } else {
            &self.name
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PathDiff {
    pub before: Path,
    pub after: Path,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BodyDiff {
    #[serde(skip)]
    pub before: Vec<u8>,
    #[serde(skip)]
    pub after: Vec<u8>,
    /// Line numbers in `after`, or in `before` for a pure deletion.
    pub modified_lines: Vec<u32>,
    /// Line numbers in `before` that were removed or replaced.
    pub removed_lines: Vec<u32>,
}

/// Everything that happened to one final path across the tracked range.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChange {
    /// Every commit that touched this path, oldest first, including commits made
    /// under names the path was later renamed from.
    pub commits: Vec<CommitId>,
    pub status: FileStatus,
    pub path: PathDiff,
    pub body: BodyDiff,
}

/// Modified line sets on each side of a change.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LineSets {
    pub before: Vec<u32>,
    pub after: Vec<u32>,
}

impl FileChange {
    pub fn is_deleted(&self) -> bool {
        self.path.before.path_type != PathType::Missing
            && self.path.after.path_type == PathType::Missing
    }

    pub fn line_sets(&self) -> LineSets {
        if self.is_deleted() {
            LineSets {
                before: self.body.modified_lines.clone(),
                after: Vec::new(),
            }
        } else {
            LineSets {
                before: self.body.removed_lines.clone(),
                after: self.body.modified_lines.clone(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_path_prefers_distinct_target() {
        let plain = Path {
            name: "a.yaml".into(),
            symlink_target: String::new(),
            path_type: PathType::File,
        };
        assert_eq!(plain.effective_path(), "a.yaml");

        let link = Path {
            name: "link.yaml".into(),
            symlink_target: "rules/a.yaml".into(),
            path_type: PathType::Symlink,
        };
        assert_eq!(link.effective_path(), "rules/a.yaml");

        let self_target = Path {
            name: "a.yaml".into(),
            symlink_target: "a.yaml".into(),
            path_type: PathType::File,
        };
        assert_eq!(self_target.effective_path(), "a.yaml");
    }

    #[test]
    fn status_from_field() {
        assert_eq!(FileStatus::from_field("R100"), Some(FileStatus::Renamed));
        assert_eq!(FileStatus::from_field("C075"), Some(FileStatus::Copied));
        assert_eq!(FileStatus::from_field("T"), Some(FileStatus::TypeChanged));
        assert_eq!(FileStatus::from_field("U"), None);
        assert_eq!(FileStatus::from_field(""), None);
    }
}
