use similar::{ChangeTag, TextDiff};

/// All line numbers of `body`, 1-based. A trailing newline does not start a new line.
pub fn count_lines(body: &[u8]) -> Vec<u32> {
    if body.is_empty() {
        return Vec::new();
    }
    let mut total = body.iter().filter(|b| **b == b'\n').count();
    if body.last() != Some(&b'\n') {
        total += 1;
    }
    (1..=total as u32).collect()
}

/// Lines of `before` that do not survive into `after`.
pub fn removed_lines(before: &[u8], after: &[u8]) -> Vec<u32> {
    let before = String::from_utf8_lossy(before);
    let after = String::from_utf8_lossy(after);
    let diff = TextDiff::from_lines(before.as_ref(), after.as_ref());
    diff.iter_all_changes()
        .filter(|change| change.tag() == ChangeTag::Delete)
        .filter_map(|change| change.old_index())
        .map(|idx| idx as u32 + 1)
        .collect()
}

/// Lexically normalizes a slash separated path, resolving `.` and `..`.
pub fn clean_path(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else if !rooted {
                    parts.push("..");
                }
            }
            _ => parts.push(part),
        }
    }
    let joined = parts.join("/");
    match (rooted, joined.is_empty()) {
        (true, _) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Resolves a symlink's stored `target` relative to the directory holding `link`.
pub(crate) fn join_link_target(link: &str, target: &str) -> String {
    if target.starts_with('/') {
        return clean_path(target);
    }
    match link.rsplit_once('/') {
        Some((dir, _)) => clean_path(&format!("{dir}/{target}")),
        None => clean_path(target),
    }
}
