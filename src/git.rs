//! Local repository model: the snapshot the bridge works from, and the
//! [`RepoProvider`] boundary used to read and change it.

use std::path::{Path, PathBuf};

use crate::error::Result;

/// Live handle to an on-disk repository (the working tree root).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Repo {
    root: PathBuf,
}

impl Repo {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The repository control directory the change watcher observes.
    pub fn git_dir(&self) -> PathBuf {
        self.root.join(".git")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileStatus {
    pub path: String,
    pub x: char,
    pub y: char,
    pub is_untracked: bool,
    pub is_conflict: bool,
}

impl FileStatus {
    /// Added, modified, deleted or renamed, in the index or the work tree.
    pub fn is_uncommitted_change(&self) -> bool {
        !self.is_untracked
            && !self.is_conflict
            && [self.x, self.y]
                .iter()
                .any(|c| matches!(c, 'A' | 'M' | 'D' | 'R' | 'C' | 'T'))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatusSummary {
    pub branch: String,
    pub entries: Vec<FileStatus>,
}

impl StatusSummary {
    pub fn is_dirty(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn uncommitted_files(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.is_uncommitted_change())
            .count()
    }

    pub fn conflict_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_conflict).count()
    }
}

/// Everything the bridge needs to know about the local repository.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepoSnapshot {
    pub repo: Repo,
    pub branch: String,
    /// Local branch names.
    pub branches: Vec<String>,
    pub is_dirty: bool,
    /// Added, modified and removed files; untracked files are not counted.
    pub uncommitted_files: usize,
    /// Distinct `commit:` reflog subjects of the current branch, oldest
    /// first. The last one is the most significant.
    pub commit_messages: Vec<String>,
    /// Commits recorded in the branch reflog, duplicates included.
    pub non_merge_commit_count: usize,
    pub conflict_count: usize,
}

impl RepoSnapshot {
    pub fn latest_commit_message(&self) -> Option<&str> {
        self.commit_messages.last().map(String::as_str)
    }
}

pub trait RepoProvider: Send + Sync {
    /// `None` if `directory` is not the root of a Git working tree.
    fn open(&self, directory: &Path) -> Result<Option<Repo>>;

    fn snapshot(&self, directory: &Path) -> Result<Option<RepoSnapshot>>;

    fn branch_exists(&self, repo: &Repo, branch: &str) -> Result<bool>;

    fn stage_all(&self, repo: &Repo) -> Result<()>;

    fn commit(&self, repo: &Repo, message: &str) -> Result<()>;

    fn checkout(&self, repo: &Repo, branch: &str) -> Result<()>;

    /// Append `text` to the message of HEAD unless it already contains it.
    fn append_to_last_commit_message(&self, repo: &Repo, text: &str) -> Result<()>;
}

/// Parse `git status --porcelain=v1 -z -b` output.
pub fn parse_status_v1(stdout: &[u8]) -> StatusSummary {
    let items: Vec<&[u8]> = stdout
        .split(|b| *b == 0)
        .filter(|s| !s.is_empty())
        .collect();

    let mut summary = StatusSummary::default();
    let mut i = 0;
    while i < items.len() {
        let s = String::from_utf8_lossy(items[i]).to_string();
        i += 1;

        if let Some(branch_line) = s.strip_prefix("## ") {
            summary.branch = parse_branch_line(branch_line);
            continue;
        }
        if s.len() < 4 {
            continue;
        }

        let mut chars = s.chars();
        let x = chars.next().unwrap_or(' ');
        let y = chars.next().unwrap_or(' ');
        let path = s[3..].to_string();

        if x == '?' && y == '?' {
            summary.entries.push(FileStatus {
                path,
                x,
                y,
                is_untracked: true,
                is_conflict: false,
            });
            continue;
        }
        if x == '!' {
            continue;
        }
        // Renames and copies carry the source path as the next item.
        if x == 'R' || x == 'C' {
            i += 1;
        }
        summary.entries.push(FileStatus {
            path,
            x,
            y,
            is_untracked: false,
            is_conflict: is_conflict_status(x, y),
        });
    }
    summary
}

fn parse_branch_line(rest: &str) -> String {
    let rest = rest.trim();
    if let Some(unborn) = rest
        .strip_prefix("No commits yet on ")
        .or_else(|| rest.strip_prefix("Initial commit on "))
    {
        return unborn.trim().to_string();
    }
    if rest.starts_with("HEAD (no branch)") {
        return "HEAD".to_string();
    }
    let head = rest.rsplit_once(" [").map_or(rest, |(left, _)| left);
    head.split("...").next().unwrap_or(head).trim().to_string()
}

fn is_conflict_status(x: char, y: char) -> bool {
    matches!(
        (x, y),
        ('U', 'U') | ('A', 'A') | ('D', 'D') | ('A', 'U') | ('U', 'A') | ('D', 'U') | ('U', 'D')
    )
}

/// Reflog subjects (newest first, as `git log -g` prints them) to the
/// distinct commit messages in chronological order plus the commit count.
pub fn commit_messages_from_reflog<'a>(
    subjects_newest_first: impl DoubleEndedIterator<Item = &'a str>,
) -> (Vec<String>, usize) {
    let mut messages: Vec<String> = Vec::new();
    let mut count = 0;
    for subject in subjects_newest_first.rev() {
        let Some(message) = strip_commit_prefix(subject) else {
            continue;
        };
        count += 1;
        let message = message.trim_matches('\n').trim().to_string();
        if let Some(pos) = messages.iter().position(|m| *m == message) {
            // Keep the most recent position of a repeated message.
            messages.remove(pos);
        }
        messages.push(message);
    }
    (messages, count)
}

fn strip_commit_prefix(subject: &str) -> Option<&str> {
    const PREFIX: &str = "commit: ";
    let head = subject.get(..PREFIX.len())?;
    head.eq_ignore_ascii_case(PREFIX)
        .then(|| &subject[PREFIX.len()..])
}

/// `existing` with `text` appended on its own line, or `None` if already there.
pub fn message_with_appended(existing: &str, text: &str) -> Option<String> {
    if existing.contains(text) {
        return None;
    }
    if existing.ends_with('\n') {
        Some(format!("{existing}{text}"))
    } else {
        Some(format!("{existing}\n{text}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_counts() {
        let out = b"## feature...origin/feature [ahead 2]\0M  src/a.rs\0 M src/b.rs\0?? new.txt\0UU both.rs\0R  to.rs\0from.rs\0D  gone.rs\0";
        let status = parse_status_v1(out);
        assert_eq!(status.branch, "feature");
        assert!(status.is_dirty());
        assert_eq!(status.entries.len(), 6);
        assert_eq!(status.conflict_count(), 1);
        // a.rs, b.rs, to.rs, gone.rs
        assert_eq!(status.uncommitted_files(), 4);
    }

    #[test]
    fn test_parse_status_clean_and_unborn() {
        let status = parse_status_v1(b"## No commits yet on main\0");
        assert_eq!(status.branch, "main");
        assert!(!status.is_dirty());
        assert_eq!(parse_status_v1(b"## master\0").branch, "master");
    }

    #[test]
    fn test_commit_messages_chronological_and_distinct() {
        let reflog = [
            "commit: third",
            "checkout: moving from main to topic",
            "commit: first",
            "commit (amend): amended",
            "COMMIT: second",
            "commit: first",
        ];
        let (messages, count) = commit_messages_from_reflog(reflog.iter().copied());
        assert_eq!(messages, vec!["second", "first", "third"]);
        assert_eq!(count, 4);
    }

    #[test]
    fn test_message_with_appended() {
        assert_eq!(
            message_with_appended("Fix build", "topic_3").as_deref(),
            Some("Fix build\ntopic_3")
        );
        assert_eq!(
            message_with_appended("Fix build\n", "topic_3").as_deref(),
            Some("Fix build\ntopic_3")
        );
        assert_eq!(message_with_appended("Fix build topic_3", "topic_3"), None);
    }
}
