use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// How bad a problem is, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[serde(alias = "info")]
    Information,
    Warning,
    Bug,
    Fatal,
}

impl Severity {
    /// Problems that block a review on platforms with a blocking concept.
    pub fn is_high(self) -> bool {
        self >= Severity::Bug
    }

    pub fn icon(self) -> &'static str {
        match self {
            Severity::Information => ":information_source:",
            Severity::Warning => ":warning:",
            Severity::Bug | Severity::Fatal => ":stop_sign:",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Information => "Information",
            Severity::Warning => "Warning",
            Severity::Bug => "Bug",
            Severity::Fatal => "Fatal",
        })
    }
}

impl FromStr for Severity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "info" | "information" => Ok(Severity::Information),
            "warning" => Ok(Severity::Warning),
            "bug" => Ok(Severity::Bug),
            "fatal" => Ok(Severity::Fatal),
            _ => Err(Error::InvalidSeverity(s.to_string())),
        }
    }
}

/// Which version of the file a problem talks about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Anchor {
    Before,
    #[default]
    After,
}

/// Inclusive, 1-based line range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LineRange {
    pub first: u32,
    pub last: u32,
}

impl LineRange {
    pub fn new(first: u32, last: u32) -> Self {
        Self { first, last }
    }

    pub fn single(line: u32) -> Self {
        Self::new(line, line)
    }

    pub fn contains(&self, line: u32) -> bool {
        self.first <= line && line <= self.last
    }
}

/// A problem raised by the linter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    pub severity: Severity,
    pub reporter: String,
    pub text: String,
    #[serde(default)]
    pub details: String,
    pub lines: LineRange,
    #[serde(default)]
    pub anchor: Anchor,
}

/// The path a problem was detected on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportPath {
    pub name: String,
    /// Set when `name` is a symlink alias of another file.
    pub symlink_target: String,
}

impl ReportPath {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            symlink_target: String::new(),
        }
    }

    pub fn effective_path(&self) -> &str {
        if self.is_symlink() {
            &self.symlink_target
        } else {
            &self.name
        }
    }

    pub fn is_symlink(&self) -> bool {
        !self.symlink_target.is_empty() && self.symlink_target != self.name
    }
}

/// Modified line numbers on each side of a file change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModifiedLines {
    pub before: Vec<u32>,
    pub after: Vec<u32>,
}

impl ModifiedLines {
    pub fn for_anchor(&self, anchor: Anchor) -> &[u32] {
        match anchor {
            Anchor::Before => &self.before,
            Anchor::After => &self.after,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub path: ReportPath,
    /// Name of the rule the problem was found in, empty when the linter did not say.
    pub rule: String,
    pub modified_lines: ModifiedLines,
    pub problem: Problem,
    /// Other reports of the same issue folded into this one.
    pub duplicates: Vec<Duplicate>,
    /// Folded into another report and not commented on by itself.
    pub is_duplicate: bool,
}

impl Report {
    pub fn new(path: ReportPath, modified_lines: ModifiedLines, problem: Problem) -> Self {
        Self {
            path,
            rule: String::new(),
            modified_lines,
            problem,
            duplicates: Vec::new(),
            is_duplicate: false,
        }
    }

    /// Same check complaining about the same thing, wherever it was found.
    pub fn is_same_issue(&self, other: &Report) -> bool {
        self.problem.reporter == other.problem.reporter
            && self.problem.text == other.problem.text
            && self.problem.severity == other.problem.severity
    }
}

/// Where a suppressed duplicate was reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Duplicate {
    pub rule: String,
    pub path: String,
    pub line: u32,
}

/// Marks every repeat of an already reported issue as a duplicate of the first one.
///
/// A report that already collected duplicates is never folded into another.
pub fn mark_duplicates(reports: &mut [Report]) {
    for i in 0..reports.len() {
        if reports[i].is_duplicate {
            continue;
        }
        for j in 0..reports.len() {
            if i == j || reports[j].is_duplicate || !reports[j].duplicates.is_empty() {
                continue;
            }
            if reports[i].is_same_issue(&reports[j]) {
                reports[j].is_duplicate = true;
                let duplicate = Duplicate {
                    rule: reports[j].rule.clone(),
                    path: reports[j].path.name.clone(),
                    line: reports[j].problem.lines.first,
                };
                reports[i].duplicates.push(duplicate);
            }
        }
    }
}

/// The result of one run, for platforms that publish an overall report.
#[derive(Debug, Clone, Default)]
pub struct Summary {
    pub reports: Vec<Report>,
    pub changed_files: usize,
    pub commits: usize,
    /// Every report as printed on the console.
    pub listing: String,
    pub version: String,
}

impl Summary {
    pub fn count(&self, severity: Severity) -> usize {
        self.reports
            .iter()
            .filter(|r| r.problem.severity == severity)
            .count()
    }

    /// No problem blocks the review.
    pub fn passed(&self) -> bool {
        !self.reports.iter().any(|r| r.problem.severity.is_high())
    }
}

/// A rendered comment waiting to be placed on a review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingComment {
    pub path: String,
    pub line: u32,
    pub text: String,
    pub severity: Severity,
    pub anchor: Anchor,
    /// Whether `line` is one of the modified lines of its side.
    pub modified_line: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiffSide {
    Old,
    New,
    Both,
}

/// A location inside a review diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffPosition {
    pub path: String,
    pub old_line: Option<u32>,
    pub new_line: Option<u32>,
}

impl DiffPosition {
    pub fn old(path: impl Into<String>, line: u32) -> Self {
        Self {
            path: path.into(),
            old_line: Some(line),
            new_line: None,
        }
    }

    pub fn new(path: impl Into<String>, line: u32) -> Self {
        Self {
            path: path.into(),
            old_line: None,
            new_line: Some(line),
        }
    }

    pub fn both(path: impl Into<String>, old_line: u32, new_line: u32) -> Self {
        Self {
            path: path.into(),
            old_line: Some(old_line),
            new_line: Some(new_line),
        }
    }

    pub fn side(&self) -> DiffSide {
        match (self.old_line, self.new_line) {
            (Some(_), None) => DiffSide::Old,
            (Some(_), Some(_)) => DiffSide::Both,
            (None, _) => DiffSide::New,
        }
    }

    /// The line a reader sees the comment on.
    pub fn line(&self) -> u32 {
        match self.side() {
            DiffSide::Old => self.old_line,
            DiffSide::New | DiffSide::Both => self.new_line,
        }
        .unwrap_or_default()
    }

    pub fn same_place(&self, other: &DiffPosition) -> bool {
        self.path == other.path && self.side() == other.side() && self.line() == other.line()
    }
}

impl fmt::Display for DiffPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.path, self.line())
    }
}

/// Severity vocabulary of platforms that can mark a comment as blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommentSeverity {
    Normal,
    Blocker,
}

/// A comment read back from a review platform.
///
/// `meta` is whatever the platform needs to address the comment again and is
/// never inspected by the reconciler.
#[derive(Debug, Clone)]
pub struct ExistingComment<M> {
    pub position: DiffPosition,
    pub text: String,
    /// Number of replies in the comment's thread.
    pub replies: usize,
    /// `None` on platforms without a severity concept.
    pub severity: Option<CommentSeverity>,
    /// Anchored to one historical commit rather than to the review diff.
    pub anchored_to_commit: bool,
    pub meta: M,
}

impl<M> ExistingComment<M> {
    pub fn is_high(&self) -> bool {
        self.severity == Some(CommentSeverity::Blocker)
    }
}

/// Comment bodies compare equal when they differ only in surrounding newlines.
pub fn texts_equal(a: &str, b: &str) -> bool {
    a.trim_matches('\n') == b.trim_matches('\n')
}
