use review_comments::{Report, Severity};

/// Plain-text rendering of the problems kept for this change.
pub fn render(reports: &[Report]) -> String {
    let mut sorted: Vec<&Report> = reports.iter().collect();
    sorted.sort_by(|a, b| {
        (a.path.name.as_str(), a.problem.lines.first)
            .cmp(&(b.path.name.as_str(), b.problem.lines.first))
    });

    let mut out = String::new();
    for report in sorted {
        let problem = &report.problem;
        let location = if problem.lines.first == problem.lines.last {
            format!("{}:{}", report.path.name, problem.lines.first)
        } else {
            format!(
                "{}:{}-{}",
                report.path.name, problem.lines.first, problem.lines.last
            )
        };
        out.push_str(&format!(
            "{location} {}: {} ({})\n",
            problem.severity, problem.text, problem.reporter
        ));
        if report.path.is_symlink() {
            out.push_str(&format!("  symlinked to {}\n", report.path.symlink_target));
        }
    }
    out
}

/// Counts reports at or above `threshold`.
pub fn count_at_least(reports: &[Report], threshold: Severity) -> usize {
    reports
        .iter()
        .filter(|r| r.problem.severity >= threshold)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use review_comments::{Anchor, LineRange, ModifiedLines, Problem, ReportPath};

    fn report(path: &str, first: u32, last: u32, severity: Severity) -> Report {
        Report::new(
            ReportPath::new(path),
            ModifiedLines::default(),
            Problem {
                severity,
                reporter: "alerts/for".to_string(),
                text: "too short".to_string(),
                details: String::new(),
                lines: LineRange::new(first, last),
                anchor: Anchor::After,
            },
        )
    }

    #[test]
    fn renders_sorted_problems() {
        let reports = vec![
            report("b.yaml", 2, 2, Severity::Warning),
            report("a.yaml", 4, 6, Severity::Bug),
        ];
        assert_eq!(
            render(&reports),
            "a.yaml:4-6 Bug: too short (alerts/for)\nb.yaml:2 Warning: too short (alerts/for)\n"
        );
    }

    #[test]
    fn symlinked_paths_name_their_target() {
        let mut linked = report("alias.yaml", 3, 3, Severity::Bug);
        linked.path.symlink_target = "rules/real.yaml".to_string();
        assert_eq!(
            render(&[linked]),
            "alias.yaml:3 Bug: too short (alerts/for)\n  symlinked to rules/real.yaml\n"
        );
    }

    #[test]
    fn counts_by_threshold() {
        let reports = vec![
            report("a.yaml", 1, 1, Severity::Warning),
            report("a.yaml", 2, 2, Severity::Bug),
            report("a.yaml", 3, 3, Severity::Fatal),
        ];
        assert_eq!(count_at_least(&reports, Severity::Bug), 2);
        assert_eq!(count_at_least(&reports, Severity::Information), 3);
    }
}
