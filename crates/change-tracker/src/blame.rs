use std::collections::HashMap;

use linemark_types::CommitId;

use crate::git::GitRunner;
use crate::{Error, Result};

/// Attribution of one line of a file at one revision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LineBlame {
    /// Name of the file in the commit that introduced the line.
    pub filename: String,
    pub commit: CommitId,
    /// Line number in `commit`'s version of the file.
    pub prev_line: u32,
    pub line: u32,
}

/// Header keys emitted by `--line-porcelain` that carry no attribution data we use.
const IGNORED_KEYS: &[&str] = &[
    "author",
    "author-mail",
    "author-time",
    "author-tz",
    "committer",
    "committer-mail",
    "committer-time",
    "committer-tz",
    "summary",
    "previous",
    "boundary",
];

/// Blames every line of `path` as of `revision`.
pub fn blame(runner: &(impl GitRunner + ?Sized), path: &str, revision: &str) -> Result<Vec<LineBlame>> {
    log::debug!("running git blame for {path} at {revision}");
    let output = runner.run(&["blame", "--line-porcelain", revision, "--", path])?;
    parse_blame_porcelain(&output)
}

/// Parses `git blame --line-porcelain` output.
///
/// A header line that does not carry numeric line numbers is a hard error, a wrong
/// attribution would silently hide problems.
pub fn parse_blame_porcelain(output: &[u8]) -> Result<Vec<LineBlame>> {
    let mut lines = Vec::new();
    let mut current: Option<(CommitId, u32, u32)> = None;
    let mut filename = String::new();

    for raw in output.split(|b| *b == b'\n') {
        if raw.first() == Some(&b'\t') {
            let Some((commit, prev_line, line)) = current.take() else {
                return Err(Error::BlameParse(
                    "content line without a preceding header".to_string(),
                ));
            };
            lines.push(LineBlame {
                filename: filename.clone(),
                commit,
                prev_line,
                line,
            });
            continue;
        }
        if raw.is_empty() {
            continue;
        }

        let text = String::from_utf8_lossy(raw);
        let key = text.split(' ').next().unwrap_or_default();
        if key == "filename" {
            filename = text["filename ".len().min(text.len())..].to_string();
            continue;
        }
        if IGNORED_KEYS.contains(&key) {
            continue;
        }

        let parts: Vec<&str> = text.split(' ').collect();
        if parts.len() < 3 {
            return Err(Error::BlameParse(format!(
                "failed to parse line number from line: {text:?}"
            )));
        }
        let commit: CommitId = parts[0]
            .parse()
            .map_err(|e| Error::BlameParse(format!("{e} in line {text:?}")))?;
        let prev_line = parse_line_number(parts[1], &text)?;
        let line = parse_line_number(parts[2], &text)?;
        current = Some((commit, prev_line, line));
    }

    Ok(lines)
}

fn parse_line_number(value: &str, text: &str) -> Result<u32> {
    value.parse().map_err(|e| {
        Error::BlameParse(format!("failed to parse line number from {text:?}: {e}"))
    })
}

/// Blame results for many files, keyed by path.
///
/// Each path remembers the revision it was blamed at, asking for another
/// revision replaces the entry.
#[derive(Debug, Default)]
pub struct FileBlames {
    files: HashMap<String, (String, Vec<LineBlame>)>,
}

impl FileBlames {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blames `path` at `revision` unless that result is already indexed.
    pub fn load(
        &mut self,
        runner: &(impl GitRunner + ?Sized),
        path: &str,
        revision: &str,
    ) -> Result<&[LineBlame]> {
        let cached = self.files.get(path).is_some_and(|(rev, _)| rev == revision);
        if !cached {
            let lines = blame(runner, path, revision)?;
            self.insert(path, revision, lines);
        } else {
            log::debug!("reusing blame of {path} at {revision}");
        }
        Ok(self.get(path).unwrap_or_default())
    }

    pub fn insert(
        &mut self,
        path: impl Into<String>,
        revision: impl Into<String>,
        lines: Vec<LineBlame>,
    ) {
        self.files.insert(path.into(), (revision.into(), lines));
    }

    pub fn get(&self, path: &str) -> Option<&[LineBlame]> {
        self.files.get(path).map(|(_, lines)| lines.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_repo::TestRepo;

    use crate::git::GitCli;

    const C1: &str = "1111111111111111111111111111111111111111";
    const C2: &str = "2222222222222222222222222222222222222222";

    fn porcelain() -> String {
        format!(
            "{C1} 1 1 2\n\
             author Alice\n\
             author-mail <alice@example.com>\n\
             author-time 1700000000\n\
             author-tz +0000\n\
             committer Alice\n\
             committer-mail <alice@example.com>\n\
             committer-time 1700000000\n\
             committer-tz +0000\n\
             summary init\n\
             boundary\n\
             filename rules.yaml\n\
             \tgroups:\n\
             {C1} 2 2\n\
             author Alice\n\
             summary init\n\
             filename rules.yaml\n\
             \t- name: foo\n\
             {C2} 3 3 1\n\
             author Bob\n\
             summary edit\n\
             previous {C1} rules.yaml\n\
             filename rules.yaml\n\
             \t  rules: []\n"
        )
    }

    #[test]
    fn parses_line_porcelain() {
        let lines = parse_blame_porcelain(porcelain().as_bytes()).unwrap();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].line, 1);
        assert_eq!(lines[0].commit.to_string(), C1);
        assert_eq!(lines[0].filename, "rules.yaml");
        assert_eq!(lines[2].line, 3);
        assert_eq!(lines[2].prev_line, 3);
        assert_eq!(lines[2].commit.to_string(), C2);
    }

    #[test]
    fn malformed_line_number_is_an_error() {
        let out = format!("{C1} x 1 1\nfilename a\n\tfoo\n");
        let err = parse_blame_porcelain(out.as_bytes()).unwrap_err();
        assert!(matches!(err, Error::BlameParse(_)));

        let out = format!("{C1} 1\n\tfoo\n");
        assert!(parse_blame_porcelain(out.as_bytes()).is_err());
    }

    #[test]
    fn empty_output_is_empty_blame() {
        assert!(parse_blame_porcelain(b"").unwrap().is_empty());
    }

    #[test]
    fn file_blames_keep_the_blamed_revision() {
        let mut index = FileBlames::new();
        let lines = parse_blame_porcelain(porcelain().as_bytes()).unwrap();
        index.insert("rules.yaml", C2, lines.clone());

        // cached entries are served without running git
        let runner = |_: &[&str]| -> Result<Vec<u8>> { panic!("git should not run") };
        assert_eq!(index.load(&runner, "rules.yaml", C2).unwrap(), lines.as_slice());
        assert!(index.get("other.yaml").is_none());

        let failing = |args: &[&str]| -> Result<Vec<u8>> {
            Err(Error::Command {
                args: args.join(" "),
                message: "no such path".to_string(),
            })
        };
        assert!(index.load(&failing, "rules.yaml", C1).is_err());
        assert_eq!(index.get("rules.yaml"), Some(lines.as_slice()));
    }

    #[test]
    fn blame_against_real_repo() {
        let repo = TestRepo::new().unwrap();
        repo.write_file("a.txt", "1\n2\n3\n").unwrap();
        let first = repo.commit("first").unwrap();
        repo.write_file("a.txt", "1\ntwo\n3\n").unwrap();
        let second = repo.commit("second").unwrap();

        let git = GitCli::new(repo.path());
        let mut index = FileBlames::new();
        let lines = index.load(&git, "a.txt", &second.to_string()).unwrap();
        let commits: Vec<CommitId> = lines.iter().map(|l| l.commit).collect();
        assert_eq!(commits, vec![first, second, first]);

        let older = index.load(&git, "a.txt", &first.to_string()).unwrap();
        assert!(older.iter().all(|l| l.commit == first));

        assert!(blame(&git, "missing.txt", &second.to_string()).is_err());
    }
}
