use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use crate::error::{BridgeError, Result};
use crate::git::{
    Repo, RepoProvider, RepoSnapshot, commit_messages_from_reflog, message_with_appended,
    parse_status_v1,
};

fn run_git(program: &Path, cwd: &Path, args: &[&str]) -> io::Result<Output> {
    Command::new(program)
        .arg("-C")
        .arg(cwd)
        .args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .env("GCM_INTERACTIVE", "never")
        .env("GIT_PAGER", "cat")
        .env("PAGER", "cat")
        .env("GIT_EDITOR", ":")
        .env("EDITOR", ":")
        .env("GIT_SEQUENCE_EDITOR", ":")
        .env("GIT_MERGE_AUTOEDIT", "no")
        .output()
}

fn stderr_text(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).trim().to_string()
}

/// [`RepoProvider`] backed by the `git` executable.
#[derive(Clone, Debug)]
pub struct GitCli {
    program: PathBuf,
}

impl GitCli {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn git(&self, cwd: &Path, args: &[&str]) -> Result<Output> {
        tracing::trace!(cwd = %cwd.display(), ?args, "git");
        Ok(run_git(&self.program, cwd, args)?)
    }

    /// Run and require success; stdout on success.
    fn git_ok(&self, cwd: &Path, args: &[&str]) -> Result<String> {
        let out = self.git(cwd, args)?;
        if out.status.success() {
            Ok(String::from_utf8_lossy(&out.stdout).to_string())
        } else {
            Err(BridgeError::Git(stderr_text(&out)))
        }
    }

    fn local_branches(&self, root: &Path) -> Result<Vec<String>> {
        let text = self.git_ok(
            root,
            &["for-each-ref", "refs/heads", "--format", "%(refname:short)"],
        )?;
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Reflog subjects of `branch`, newest first. Unborn branches have none.
    fn reflog_subjects(&self, root: &Path, branch: &str) -> Result<Vec<String>> {
        let refname = format!("refs/heads/{branch}");
        let out = self.git(root, &["log", "-g", "--no-color", "--format=%gs", &refname])?;
        if !out.status.success() {
            tracing::debug!(branch, stderr = %stderr_text(&out), "no reflog");
            return Ok(Vec::new());
        }
        Ok(String::from_utf8_lossy(&out.stdout)
            .lines()
            .map(str::to_string)
            .collect())
    }
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new("git")
    }
}

impl RepoProvider for GitCli {
    fn open(&self, directory: &Path) -> Result<Option<Repo>> {
        if !directory.join(".git").exists() {
            return Ok(None);
        }
        let out = self.git(directory, &["rev-parse", "--is-inside-work-tree"])?;
        if !out.status.success() {
            tracing::debug!(dir = %directory.display(), "not a git repository");
            return Ok(None);
        }
        Ok(Some(Repo::new(directory)))
    }

    fn snapshot(&self, directory: &Path) -> Result<Option<RepoSnapshot>> {
        let Some(repo) = self.open(directory)? else {
            return Ok(None);
        };
        let out = self.git(repo.root(), &["status", "--porcelain=v1", "-z", "-b"])?;
        if !out.status.success() {
            return Err(BridgeError::Git(stderr_text(&out)));
        }
        let status = parse_status_v1(&out.stdout);
        let branches = self.local_branches(repo.root())?;
        let subjects = self.reflog_subjects(repo.root(), &status.branch)?;
        let (commit_messages, non_merge_commit_count) =
            commit_messages_from_reflog(subjects.iter().map(String::as_str));

        Ok(Some(RepoSnapshot {
            is_dirty: status.is_dirty(),
            uncommitted_files: status.uncommitted_files(),
            conflict_count: status.conflict_count(),
            branch: status.branch,
            branches,
            commit_messages,
            non_merge_commit_count,
            repo,
        }))
    }

    fn branch_exists(&self, repo: &Repo, branch: &str) -> Result<bool> {
        let refname = format!("refs/heads/{branch}");
        let out = self.git(repo.root(), &["show-ref", "--verify", "--quiet", &refname])?;
        match out.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(BridgeError::Git(stderr_text(&out))),
        }
    }

    fn stage_all(&self, repo: &Repo) -> Result<()> {
        self.git_ok(repo.root(), &["add", "--all"]).map(drop)
    }

    fn commit(&self, repo: &Repo, message: &str) -> Result<()> {
        let msg = message.trim();
        if msg.is_empty() {
            return Err(BridgeError::InvalidArgument("Empty commit message".to_string()));
        }
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(msg.as_bytes())?;
        let path = file.path().to_string_lossy().to_string();
        self.git_ok(repo.root(), &["commit", "-F", &path]).map(drop)
    }

    fn checkout(&self, repo: &Repo, branch: &str) -> Result<()> {
        self.git_ok(repo.root(), &["checkout", branch]).map(drop)
    }

    fn append_to_last_commit_message(&self, repo: &Repo, text: &str) -> Result<()> {
        let existing = self.git_ok(repo.root(), &["log", "-1", "--format=%B"])?;
        let existing = existing.trim_end_matches('\n');
        let Some(message) = message_with_appended(existing, text) else {
            return Ok(());
        };
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(message.as_bytes())?;
        let path = file.path().to_string_lossy().to_string();
        // --only: amend the message without picking up anything staged since.
        self.git_ok(
            repo.root(),
            &["commit", "--amend", "--only", "--allow-empty", "-F", &path],
        )
        .map(drop)
    }
}
