use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use change_tracker::ChangeSet;
use review_comments::{ModifiedLines, Problem, Report, ReportPath};

/// One problem as emitted by the linter.
#[derive(Debug, Clone, Deserialize)]
pub struct ProblemEntry {
    pub path: String,
    /// Rule the problem was found in.
    #[serde(default)]
    pub rule: String,
    #[serde(flatten)]
    pub problem: Problem,
}

pub fn load(path: &Path) -> Result<Vec<ProblemEntry>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read problems from {}", path.display()))?;
    parse(&text).with_context(|| format!("failed to parse problems from {}", path.display()))
}

pub fn parse(text: &str) -> Result<Vec<ProblemEntry>> {
    Ok(serde_json::from_str(text)?)
}

/// Keeps the problems that touch a modified line of a changed file.
pub fn attribute(changes: &ChangeSet, entries: Vec<ProblemEntry>) -> Vec<Report> {
    let mut reports = Vec::new();
    for entry in entries {
        let Some(change) = changes.find(&entry.path) else {
            log::debug!("{} is not part of this change, ignoring its problems", entry.path);
            continue;
        };
        let sets = change.line_sets();
        let modified_lines = ModifiedLines {
            before: sets.before,
            after: sets.after,
        };
        let lines = entry.problem.lines;
        let touched = modified_lines
            .for_anchor(entry.problem.anchor)
            .iter()
            .any(|l| lines.contains(*l));
        if !touched {
            log::debug!(
                "{}:{}-{} problem from {} is on unmodified lines",
                entry.path,
                lines.first,
                lines.last,
                entry.problem.reporter
            );
            continue;
        }
        let path = ReportPath {
            name: entry.path,
            symlink_target: change.path.after.symlink_target.clone(),
        };
        let mut report = Report::new(path, modified_lines, entry.problem);
        report.rule = entry.rule;
        reports.push(report);
    }
    reports
}
