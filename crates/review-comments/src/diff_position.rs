use std::sync::LazyLock;

use regex::Regex;

use crate::model::{Anchor, DiffPosition, PendingComment};

static HUNK_HEADER: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@")
        .inspect_err(|e| log::error!("invalid hunk header pattern: {e}"))
        .ok()
});

/// One line present on the new side of a diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffLine {
    pub old: u32,
    pub new: u32,
    /// Added by the diff rather than carried over as context.
    pub was_modified: bool,
}

/// Ordered old/new line correspondence of one file diff.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffCorrespondence {
    lines: Vec<DiffLine>,
}

impl DiffCorrespondence {
    pub fn from_lines(lines: Vec<DiffLine>) -> Self {
        Self { lines }
    }

    pub fn lines(&self) -> &[DiffLine] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Where new-side `line` sits in this diff.
    ///
    /// Lines the diff does not enumerate are unmodified and are placed relative to
    /// the closest entry before them, or the first entry when none precedes them.
    pub fn correspondence_for(&self, line: u32) -> Option<DiffLine> {
        let first = self.lines.first()?;

        let mut anchor = *first;
        for (i, dl) in self.lines.iter().enumerate() {
            if dl.new == line {
                return Some(*dl);
            }
            if dl.new > line {
                if i > 0 {
                    anchor = self.lines[i - 1];
                }
                return Some(unmodified_from(anchor, line));
            }
            anchor = *dl;
        }
        Some(unmodified_from(anchor, line))
    }
}

fn unmodified_from(anchor: DiffLine, line: u32) -> DiffLine {
    let old = i64::from(anchor.old) + i64::from(line) - i64::from(anchor.new);
    DiffLine {
        old: u32::try_from(old.max(0)).unwrap_or_default(),
        new: line,
        was_modified: false,
    }
}

struct Hunk {
    old_remaining: Option<u32>,
    new_remaining: Option<u32>,
}

impl Hunk {
    fn open(&self) -> bool {
        !matches!((self.old_remaining, self.new_remaining), (Some(0), Some(0)))
    }

    fn take_old(&mut self) {
        if let Some(n) = self.old_remaining.as_mut() {
            *n = n.saturating_sub(1);
        }
    }

    fn take_new(&mut self) {
        if let Some(n) = self.new_remaining.as_mut() {
            *n = n.saturating_sub(1);
        }
    }
}

/// Parses the body of a unified diff for a single file.
///
/// File header lines (`diff`, `---`, `+++`, `index`) outside of hunks are ignored,
/// so a diff with or without them yields the same correspondence. A hunk header that
/// does not match the grammar keeps the running counters and parsing continues.
pub fn parse_unified_diff(diff: &str) -> DiffCorrespondence {
    let mut lines = Vec::new();
    let mut old_line: u32 = 0;
    let mut new_line: u32 = 0;
    let mut hunk: Option<Hunk> = None;

    for line in diff.lines() {
        if line.starts_with("@@") {
            match parse_hunk_header(line) {
                Some((old_start, old_count, new_start, new_count)) => {
                    old_line = old_start.saturating_sub(1);
                    new_line = new_start.saturating_sub(1);
                    hunk = Some(Hunk {
                        old_remaining: Some(old_count),
                        new_remaining: Some(new_count),
                    });
                }
                None => {
                    log::debug!("skipping malformed hunk header: {line:?}");
                    hunk = Some(Hunk {
                        old_remaining: None,
                        new_remaining: None,
                    });
                }
            }
            continue;
        }

        let Some(current) = hunk.as_mut().filter(|h| h.open()) else {
            continue;
        };

        if line.starts_with('\\') {
            continue;
        }
        if line.starts_with('-') {
            old_line += 1;
            current.take_old();
        } else if line.starts_with('+') {
            new_line += 1;
            current.take_new();
            lines.push(DiffLine {
                old: old_line,
                new: new_line,
                was_modified: true,
            });
        } else {
            old_line += 1;
            new_line += 1;
            current.take_old();
            current.take_new();
            lines.push(DiffLine {
                old: old_line,
                new: new_line,
                was_modified: false,
            });
        }
    }

    DiffCorrespondence::from_lines(lines)
}

/// Returns `(old_start, old_count, new_start, new_count)`; omitted counts are 1.
fn parse_hunk_header(line: &str) -> Option<(u32, u32, u32, u32)> {
    let caps = HUNK_HEADER.as_ref()?.captures(line)?;
    let number = |idx: usize, default: Option<u32>| -> Option<u32> {
        match caps.get(idx) {
            Some(m) => m.as_str().parse().ok(),
            None => default,
        }
    };
    Some((
        number(1, None)?,
        number(2, Some(1))?,
        number(3, None)?,
        number(4, Some(1))?,
    ))
}

/// Places `pending` in a diff.
///
/// `pending.line` is a new-side line unless the comment is anchored before the
/// change, in which case it names a line of the old file. Without a diff for the file, or when the line cannot be located, the comment goes
/// on the same line number on both sides.
pub fn translate_position(
    pending: &PendingComment,
    correspondence: Option<&DiffCorrespondence>,
) -> DiffPosition {
    let Some(dl) = correspondence.and_then(|c| c.correspondence_for(pending.line)) else {
        return DiffPosition::both(&pending.path, pending.line, pending.line);
    };
    // Before-anchored lines are already numbered on the old side.
    if pending.anchor == Anchor::Before {
        return DiffPosition::old(&pending.path, pending.line);
    }
    if dl.was_modified {
        DiffPosition::new(&pending.path, dl.new)
    } else {
        DiffPosition::both(&pending.path, dl.old, dl.new)
    }
}
