use crate::model::{PendingComment, Report, Severity, Summary};

const TRUNCATION_MARKER: &str = "\n\n… (truncated)";

/// Groups reports that would land on the same comment.
///
/// Reports share a group when severity, reporter, effective path, line range and
/// anchor all match. Within a group an exact repeat of an already kept text and
/// details pair is dropped. Reports marked as duplicates are left out unless
/// `show_duplicates` is set.
pub fn dedup_reports(reports: &[Report], show_duplicates: bool) -> Vec<Vec<&Report>> {
    let mut groups: Vec<Vec<&Report>> = Vec::new();

    for report in reports {
        if report.is_duplicate && !show_duplicates {
            continue;
        }
        let group = groups.iter_mut().find(|g| {
            let head = &g[0];
            head.problem.severity == report.problem.severity
                && head.problem.reporter == report.problem.reporter
                && head.path.effective_path() == report.path.effective_path()
                && head.problem.lines == report.problem.lines
                && head.problem.anchor == report.problem.anchor
        });
        match group {
            None => groups.push(vec![report]),
            Some(group) => {
                let duplicate = group.iter().any(|kept| {
                    kept.problem.text == report.problem.text
                        && kept.problem.details == report.problem.details
                });
                if !duplicate {
                    group.push(report);
                }
            }
        }
    }

    groups
}

/// Every report in the group carries the same non-empty details.
fn identical_details(group: &[&Report]) -> bool {
    group.len() > 1
        && !group[0].problem.details.is_empty()
        && group
            .iter()
            .all(|r| r.problem.details == group[0].problem.details)
}

/// Renders one pending comment per group of `reports`.
///
/// `docs_url` is the base of the documentation site linked from each comment.
pub fn make_comments(
    reports: &[Report],
    docs_url: &str,
    show_duplicates: bool,
) -> Vec<PendingComment> {
    dedup_reports(reports, show_duplicates)
        .into_iter()
        .map(|group| render_group(&group, docs_url, show_duplicates))
        .collect()
}

/// The line a report is shown on and whether that line was modified.
///
/// That is the last modified line of the anchor side inside the problem's range,
/// or the last line of the range when none of them was modified.
pub fn report_line(report: &Report) -> (u32, bool) {
    let problem = &report.problem;
    let modified = report.modified_lines.for_anchor(problem.anchor);
    match (problem.lines.first..=problem.lines.last)
        .rev()
        .find(|l| modified.contains(l))
    {
        Some(line) => (line, true),
        None => (problem.lines.last, false),
    }
}

fn render_group(group: &[&Report], docs_url: &str, show_duplicates: bool) -> PendingComment {
    let head = group[0];
    let problem = &head.problem;
    let shared_details = identical_details(group);

    let mut buf = format!(
        "{} **{}** reported by [linemark]({docs_url}) **{}** check.\n\n",
        problem.severity.icon(),
        problem.severity,
        problem.reporter
    );
    for report in group {
        buf.push_str("------\n\n");
        buf.push_str(&report.problem.text);
        buf.push_str("\n\n");
        if !shared_details && !report.problem.details.is_empty() {
            write_details(&mut buf, &report.problem.details);
        }
        if report.path.is_symlink() {
            buf.push_str(&format!(
                ":leftwards_arrow_with_hook: This problem was detected on a symlinked file `{}`.\n\n",
                report.path.name
            ));
        }
    }
    if shared_details {
        buf.push_str("------\n\n");
        write_details(&mut buf, &problem.details);
    }
    if !show_duplicates && !head.duplicates.is_empty() {
        buf.push_str("------\n\n");
        buf.push_str(&format!(
            "The same issue was reported {} more time(s), duplicates were suppressed.\n\n",
            head.duplicates.len()
        ));
        buf.push_str("<details>\n<summary>Show affected rules</summary>\n\n");
        for dup in &head.duplicates {
            if dup.rule.is_empty() {
                buf.push_str(&format!("- `{}:{}`\n", dup.path, dup.line));
            } else {
                buf.push_str(&format!("- `{}` at `{}:{}`\n", dup.rule, dup.path, dup.line));
            }
        }
        buf.push_str("\n</details>\n\n");
    }
    buf.push_str(&format!(
        "------\n\n:information_source: To see documentation covering this check and instructions \
         on how to resolve it [click here]({}/checks/{}.html).\n",
        docs_url.trim_end_matches('/'),
        problem.reporter
    ));

    let (line, modified_line) = report_line(head);
    PendingComment {
        path: head.path.effective_path().to_string(),
        line,
        text: buf,
        severity: problem.severity,
        anchor: problem.anchor,
        modified_line,
    }
}

fn write_details(buf: &mut String, details: &str) {
    buf.push_str("<details>\n<summary>More information</summary>\n");
    buf.push_str(details);
    buf.push_str("\n</details>\n\n");
}

/// First line of the review summary, used to find a summary posted by an earlier run.
pub fn summary_header(docs_url: &str) -> String {
    format!("### This pull request was validated by [linemark]({docs_url}).\n")
}

/// Review body describing the whole run: problem counts, stats and the full listing.
pub fn summary_comment(summary: &Summary, docs_url: &str) -> String {
    let mut buf = summary_header(docs_url);

    if summary.reports.is_empty() {
        buf.push_str(":heavy_check_mark: No problems found\n");
    } else {
        buf.push_str(":heavy_exclamation_mark: Problems found.\n");
        buf.push_str("| Severity | Number of problems |\n| --- | --- |\n");
        for severity in [
            Severity::Fatal,
            Severity::Bug,
            Severity::Warning,
            Severity::Information,
        ] {
            let count = summary.count(severity);
            if count > 0 {
                buf.push_str(&format!("| {severity} | {count} |\n"));
            }
        }
    }

    buf.push_str("<details><summary>Stats</summary>\n<p>\n\n");
    buf.push_str("| Stat | Value |\n| --- | --- |\n");
    buf.push_str(&format!("| Version | {} |\n", summary.version));
    buf.push_str(&format!("| Number of commits checked | {} |\n", summary.commits));
    buf.push_str(&format!("| Number of files changed | {} |\n", summary.changed_files));
    buf.push_str(&format!("| Number of problems found | {} |\n", summary.reports.len()));
    buf.push_str("\n</p>\n</details>\n\n");

    buf.push_str("<details><summary>Problems</summary>\n<p>\n\n");
    if summary.reports.is_empty() {
        buf.push_str("No problems reported");
    } else {
        buf.push_str("```\n");
        buf.push_str(&summary.listing);
        buf.push_str("```\n");
    }
    buf.push_str("\n</p>\n</details>\n\n");
    buf
}

/// Cuts `text` to at most `max_chars` characters, ending with a truncation marker.
pub fn truncate_comment(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(TRUNCATION_MARKER.chars().count());
    let end = text
        .char_indices()
        .nth(keep)
        .map_or(text.len(), |(idx, _)| idx);
    format!("{}{TRUNCATION_MARKER}", &text[..end])
}

/// Notice posted when the creation cap stopped some comments.
pub fn too_many_comments_message(wanted: usize, limit: usize) -> String {
    format!(
        "This linemark run would create {wanted} comment(s), which is more than the limit \
         configured for linemark ({limit}).\n{} comment(s) were skipped and won't be visible \
         on this review.",
        wanted.saturating_sub(limit)
    )
}

/// Summary of errors hit while updating a review.
pub fn errors_comment(errors: &[String]) -> String {
    let mut buf = String::from(
        "There were some errors when linemark was trying to create a report.\n\
         Some review comments might be outdated or missing.\n\
         List of all errors:\n\n",
    );
    for err in errors {
        buf.push_str(&format!("- `{err}`\n"));
    }
    buf
}
