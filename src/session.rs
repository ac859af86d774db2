//! User-facing actions over one working directory.
//!
//! A [`Session`] owns everything a front end needs: the selected directory,
//! the single-flight executor, the refresher and the git-tfs workflows. Every
//! state-changing action runs through [`TaskRunner::execute`] and reports on
//! the [`EventBus`]; queries return their results directly.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::command::{CommandRunner, Tool};
use crate::config::Settings;
use crate::error::{BridgeError, Result};
use crate::events::{Event, EventBus, OperationOutcome};
use crate::git::{Repo, RepoProvider};
use crate::gittfs::GitTfs;
use crate::mapping::MappingGuard;
use crate::refresh::{CombinedSnapshot, Refresher};
use crate::shelveset::{
    ShelvesetData, default_shelveset_name, normalize_branch_name, suggested_branch_name,
};
use crate::task::TaskRunner;
use crate::tfs::{ServerSnapshot, Shelveset, TfsServer, UserInfo};
use crate::watcher::{ChangeWatcher, MIN_REFRESH_INTERVAL, SELF_TRIGGER_SETTLE, WatchContext};

/// Yes/no questions asked in the middle of an action. May block.
pub trait Prompt: Send + Sync {
    fn confirm(&self, question: &str) -> bool;
}

/// A fixed answer.
impl Prompt for bool {
    fn confirm(&self, _question: &str) -> bool {
        *self
    }
}

#[derive(Clone, Debug, Default)]
pub struct ShelveRequest {
    pub name: String,
    /// Defaults to the latest commit message when empty.
    pub comment: String,
    /// Commit uncommitted changes (with `comment` as message) before shelving.
    pub commit_dirty: bool,
}

#[derive(Clone, Debug, Default)]
pub struct UnshelveRequest {
    pub name: String,
    pub branch: String,
    /// Shelveset owner; `None` means the authenticated user.
    pub user: Option<String>,
}

pub struct Session {
    server: Arc<dyn TfsServer>,
    repos: Arc<dyn RepoProvider>,
    bus: EventBus,
    tasks: Arc<TaskRunner>,
    refresher: Arc<Refresher>,
    gittfs: GitTfs,
    settings: Mutex<Settings>,
    settings_path: Option<PathBuf>,
    directory: Mutex<Option<PathBuf>>,
}

impl Session {
    pub fn new(
        settings: Settings,
        server: Arc<dyn TfsServer>,
        repos: Arc<dyn RepoProvider>,
        bus: EventBus,
    ) -> Result<Self> {
        let tool = settings.bridge_tool()?;
        Self::with_tool(settings, tool, server, repos, bus)
    }

    /// Like [`Session::new`] with an explicit bridge tool.
    pub fn with_tool(
        settings: Settings,
        tool: Tool,
        server: Arc<dyn TfsServer>,
        repos: Arc<dyn RepoProvider>,
        bus: EventBus,
    ) -> Result<Self> {
        let tfs_uri = settings.tfs_uri()?.to_string();
        let gittfs = GitTfs::new(
            CommandRunner::new(bus.clone()),
            MappingGuard::new(server.clone(), bus.clone()),
            bus.clone(),
            tool,
            settings.git_program(),
            tfs_uri,
        );
        Ok(Self {
            tasks: Arc::new(TaskRunner::new(bus.clone())),
            refresher: Arc::new(Refresher::new(server.clone(), repos.clone(), bus.clone())),
            server,
            repos,
            bus,
            gittfs,
            settings: Mutex::new(settings),
            settings_path: None,
            directory: Mutex::new(None),
        })
    }

    /// Save settings to `path` whenever they change.
    pub fn persist_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.settings_path = Some(path.into());
        self
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn settings(&self) -> Settings {
        self.settings.lock().clone()
    }

    pub fn directory(&self) -> Option<PathBuf> {
        self.directory.lock().clone()
    }

    pub fn snapshot(&self) -> CombinedSnapshot {
        self.refresher.latest()
    }

    /// Select `directory`, cloning the repository into it if the user agrees.
    pub async fn open_directory(&self, directory: &Path, prompt: &dyn Prompt) -> OperationOutcome {
        self.tasks
            .execute(false, |cancel| async move {
                self.open_directory_inner(directory, prompt, &cancel).await
            })
            .await
    }

    async fn open_directory_inner(
        &self,
        directory: &Path,
        prompt: &dyn Prompt,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if directory.as_os_str().is_empty() {
            return Err(BridgeError::InvalidArgument("directory is empty".to_string()));
        }
        let dir = normalize_directory(directory)?;
        *self.directory.lock() = Some(dir.clone());

        let snapshot = self.refresher.refresh(&dir, cancel).await?;
        let Some(server) = snapshot.server else {
            self.bus.info(format!(
                "'{}' is not mapped to a TFS workspace",
                dir.display()
            ));
            return Ok(());
        };

        if snapshot.repo.is_none() {
            let question = format!(
                "'{}' is not a GIT repository. Clone '{}' into it?",
                dir.display(),
                server.mapped_server_folder
            );
            if !prompt.confirm(&question) {
                return Err(BridgeError::Git("Not a GIT repository".to_string()));
            }
            self.get_latest(&server, &dir, cancel).await?;
            self.gittfs
                .clone_repo(&server.mapped_server_folder, &dir, cancel)
                .await?;
            self.refresher.refresh(&dir, cancel).await?;
        }

        self.remember_directory(&dir);
        Ok(())
    }

    /// Re-read repository and server state.
    pub async fn refresh(&self) -> OperationOutcome {
        self.tasks
            .execute(false, |cancel| async move {
                let dir = self.require_directory()?;
                self.refresher.refresh(&dir, &cancel).await.map(|_| ())
            })
            .await
    }

    pub async fn pull(&self) -> OperationOutcome {
        self.tasks
            .execute(true, |cancel| async move {
                let (dir, server) = self.require_workspace()?;
                self.gittfs.pull(&server, &dir, &cancel).await?;
                self.get_latest(&server, &dir, &cancel).await?;
                self.refresher.refresh(&dir, &cancel).await.map(|_| ())
            })
            .await
    }

    pub async fn shelve(&self, request: ShelveRequest, prompt: &dyn Prompt) -> OperationOutcome {
        self.tasks
            .execute(true, |cancel| async move {
                self.shelve_inner(request, prompt, &cancel).await
            })
            .await
    }

    async fn shelve_inner(
        &self,
        request: ShelveRequest,
        prompt: &dyn Prompt,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (dir, server) = self.require_workspace()?;
        let name = request.name.trim().to_string();
        if name.is_empty() {
            return Err(BridgeError::InvalidArgument(
                "shelveset name is empty".to_string(),
            ));
        }

        let user = self.server_call(|s| s.current_user()).await?;
        let existing = {
            let (name, user) = (name.clone(), user.clone());
            self.server_call(move |s| s.query_shelvesets(Some(&name), Some(&user)))
                .await?
        };
        if !existing.is_empty()
            && !prompt.confirm(&format!(
                "Shelveset {name} already exists for user {user}. Overwrite?"
            ))
        {
            tracing::debug!(%name, "overwrite declined");
            return Ok(());
        }

        let repo = self.require_repo(&dir).await?;
        let snapshot = self.refresher.latest().repo;
        let comment = match request.comment.trim() {
            "" => snapshot
                .as_ref()
                .and_then(|s| s.latest_commit_message())
                .unwrap_or_default()
                .to_string(),
            comment => comment.to_string(),
        };

        if comment.is_empty() {
            return Err(BridgeError::InvalidArgument("comment is empty".to_string()));
        }

        self.bus
            .publish(Event::ShelvesetPending(ShelvesetData::new(&name, None)));

        let dirty = snapshot.as_ref().is_some_and(|s| s.is_dirty);
        if request.commit_dirty && dirty {
            self.bus.info("Staging changes...");
            self.repo_call(repo.clone(), |r, repo| r.stage_all(repo))
                .await?;
            self.bus.info("Changes are staged");

            self.bus.info("Committing changes...");
            let message = comment.clone();
            self.repo_call(repo.clone(), move |r, repo| r.commit(repo, &message))
                .await?;
            self.bus.info("Changes are committed");
        }

        self.gittfs
            .shelve(&server, &dir, &name, &comment, cancel)
            .await?;

        self.bus
            .info(format!("Adding {name} to the commit message..."));
        let text = name.clone();
        if let Err(err) = self
            .repo_call(repo, move |r, repo| r.append_to_last_commit_message(repo, &text))
            .await
        {
            tracing::warn!(error = %err, "rewriting commit message failed");
            self.bus.warning("Cannot rewrite comment");
        }

        self.refresher.refresh(&dir, cancel).await?;
        self.bus
            .publish(Event::ShelvesetCreated(ShelvesetData::new(name, Some(user))));
        Ok(())
    }

    pub async fn checkin(&self, comment: &str) -> OperationOutcome {
        self.tasks
            .execute(true, |cancel| async move {
                let (dir, server) = self.require_workspace()?;
                let comment = match comment.trim() {
                    "" => self
                        .refresher
                        .latest()
                        .repo
                        .and_then(|s| s.latest_commit_message().map(str::to_string))
                        .unwrap_or_default(),
                    comment => comment.to_string(),
                };
                self.gittfs.checkin(&server, &dir, &comment, &cancel).await?;
                self.refresher.refresh(&dir, &cancel).await.map(|_| ())
            })
            .await
    }

    pub async fn unshelve(&self, request: UnshelveRequest) -> OperationOutcome {
        self.tasks
            .execute(true, |cancel| async move {
                self.unshelve_inner(request, &cancel).await
            })
            .await
    }

    async fn unshelve_inner(&self, request: UnshelveRequest, cancel: &CancellationToken) -> Result<()> {
        let (dir, server) = self.require_workspace()?;
        let name = request.name.trim().to_string();
        let branch = normalize_branch_name(&request.branch);
        if name.is_empty() {
            return Err(BridgeError::InvalidArgument(
                "shelveset name is empty".to_string(),
            ));
        }
        if branch.is_empty() {
            return Err(BridgeError::InvalidArgument("branch name is empty".to_string()));
        }

        let other_owner = request.user.filter(|u| !u.trim().is_empty());
        let owner = match &other_owner {
            Some(owner) => owner.clone(),
            None => self.server_call(|s| s.current_user()).await?,
        };
        let found = {
            let (name, owner) = (name.clone(), owner.clone());
            self.server_call(move |s| s.query_shelvesets(Some(&name), Some(&owner)))
                .await?
        };
        if found.is_empty() {
            return Err(BridgeError::InvalidArgument(format!(
                "Shelveset {name} does not exist. Please select an existing one"
            )));
        }

        let repo = self.require_repo(&dir).await?;
        let exists = {
            let branch = branch.clone();
            self.repo_call(repo.clone(), move |r, repo| r.branch_exists(repo, &branch))
                .await?
        };
        if exists {
            return Err(BridgeError::InvalidArgument(format!(
                "Branch {branch} already exists. Please choose another name"
            )));
        }

        self.bus.publish(Event::ShelvesetPending(ShelvesetData::new(
            &name,
            Some(owner),
        )));
        self.gittfs
            .unshelve(&server, &dir, &name, &branch, other_owner.as_deref(), cancel)
            .await?;

        self.bus.info(format!("Checking branch {branch} out..."));
        {
            let branch = branch.clone();
            self.repo_call(repo, move |r, repo| r.checkout(repo, &branch))
                .await?;
        }
        self.bus.info(format!("Branch {branch} is checked out"));

        self.refresher.refresh(&dir, cancel).await.map(|_| ())
    }

    /// Shelvesets of `user` (default: the authenticated user), newest first.
    pub async fn shelvesets(&self, user: Option<&str>) -> Result<Vec<Shelveset>> {
        let owner = match user.filter(|u| !u.trim().is_empty()) {
            Some(user) => user.to_string(),
            None => self.server_call(|s| s.current_user()).await?,
        };
        let mut list = self
            .server_call(move |s| s.query_shelvesets(None, Some(&owner)))
            .await?;
        sort_newest_first(&mut list);
        Ok(list)
    }

    /// Users whose display or account name contains `pattern`, ignoring case.
    pub async fn users(&self, pattern: &str) -> Result<Vec<UserInfo>> {
        let users = self.server_call(|s| s.users()).await?;
        Ok(filter_users(users, pattern))
    }

    pub fn shelveset_url(&self, name: &str, owner: &str) -> Result<String> {
        let settings = self.settings.lock();
        crate::shelveset::shelveset_url(settings.tfs_uri()?, name, owner)
    }

    /// Shelveset name for the current branch, from the configured template.
    pub fn suggested_shelveset_name(&self, commit_dirty: bool) -> Option<String> {
        let repo = self.refresher.latest().repo?;
        let template = self.settings.lock().shelveset_template().to_string();
        Some(default_shelveset_name(
            &template,
            &repo.branch,
            repo.non_merge_commit_count,
            commit_dirty && repo.is_dirty,
        ))
    }

    /// Local branch to unshelve `shelveset` into.
    pub async fn suggested_branch(&self, shelveset: &Shelveset) -> Result<String> {
        let user = self.server_call(|s| s.current_user()).await?;
        let other = (!shelveset.owner.eq_ignore_ascii_case(&user))
            .then_some(shelveset.owner_display_name.as_str());
        Ok(suggested_branch_name(&shelveset.name, other))
    }

    /// Refresh whenever git touches the index of the selected directory.
    pub fn watch(&self) -> Result<ChangeWatcher> {
        self.watch_with_interval(MIN_REFRESH_INTERVAL)
    }

    pub fn watch_with_interval(&self, min_interval: Duration) -> Result<ChangeWatcher> {
        ChangeWatcher::start(WatchContext {
            directory: self.require_directory()?,
            refresher: self.refresher.clone(),
            tasks: self.tasks.clone(),
            bus: self.bus.clone(),
            min_interval,
            settle: SELF_TRIGGER_SETTLE,
        })
    }

    pub fn cancel(&self) {
        self.tasks.cancel();
    }

    /// Cancel the running operation, if any, and wait for it to unwind.
    pub async fn shutdown(&self) {
        if self.tasks.is_running() {
            self.tasks.cancel();
        }
        self.tasks.shutdown().await;
    }

    fn require_directory(&self) -> Result<PathBuf> {
        self.directory()
            .ok_or_else(|| BridgeError::InvalidArgument("no directory is selected".to_string()))
    }

    fn require_workspace(&self) -> Result<(PathBuf, ServerSnapshot)> {
        let dir = self.require_directory()?;
        let server = self.refresher.latest().server.ok_or_else(|| {
            BridgeError::InvalidArgument(format!(
                "'{}' is not mapped to a TFS workspace",
                dir.display()
            ))
        })?;
        Ok((dir, server))
    }

    async fn require_repo(&self, dir: &Path) -> Result<Repo> {
        let repos = self.repos.clone();
        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || repos.open(&dir))
            .await??
            .ok_or_else(|| BridgeError::Git("Not a GIT repository".to_string()))
    }

    async fn get_latest(
        &self,
        server: &ServerSnapshot,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.bus.info("Getting latest version...");
        let workspace = server.workspace.clone();
        let dir = dir.to_path_buf();
        let cancel = cancel.clone();
        self.server_call(move |s| s.get_latest(&workspace, &dir, &cancel))
            .await?;
        self.bus.info("Latest version is received");
        Ok(())
    }

    async fn server_call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn TfsServer) -> Result<T> + Send + 'static,
    {
        let server = self.server.clone();
        tokio::task::spawn_blocking(move || f(server.as_ref())).await?
    }

    async fn repo_call<T, F>(&self, repo: Repo, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn RepoProvider, &Repo) -> Result<T> + Send + 'static,
    {
        let repos = self.repos.clone();
        tokio::task::spawn_blocking(move || f(repos.as_ref(), &repo)).await?
    }

    fn remember_directory(&self, dir: &Path) {
        let mut settings = self.settings.lock();
        settings.remember_directory(dir);
        if let Some(path) = &self.settings_path
            && let Err(err) = settings.save(path)
        {
            tracing::warn!(path = %path.display(), error = %err, "cannot save settings");
        }
    }
}

/// Absolute form of `dir` with `.` and `..` resolved lexically and no
/// trailing separator, so it compares equal to workspace mappings.
fn normalize_directory(dir: &Path) -> Result<PathBuf> {
    let absolute = std::path::absolute(dir)?;
    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    Ok(normalized)
}

/// ISO-8601 timestamps order lexicographically.
fn sort_newest_first(list: &mut [Shelveset]) {
    list.sort_by(|a, b| b.created.cmp(&a.created));
}

fn filter_users(users: Vec<UserInfo>, pattern: &str) -> Vec<UserInfo> {
    let pattern = pattern.trim().to_lowercase();
    if pattern.is_empty() {
        return users;
    }
    users
        .into_iter()
        .filter(|u| {
            u.name.to_lowercase().contains(&pattern) || u.code.to_lowercase().contains(&pattern)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shelveset(name: &str, created: &str) -> Shelveset {
        Shelveset {
            name: name.to_string(),
            owner: "DOMAIN\\jo".to_string(),
            owner_display_name: "Jo".to_string(),
            comment: None,
            created: created.to_string(),
        }
    }

    #[test]
    fn test_shelvesets_sorted_newest_first() {
        let mut list = vec![
            shelveset("old", "2023-05-01T10:00:00Z"),
            shelveset("new", "2024-02-01T08:00:00Z"),
            shelveset("mid", "2023-11-30T23:59:59Z"),
        ];
        sort_newest_first(&mut list);
        let names: Vec<_> = list.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["new", "mid", "old"]);
    }

    #[test]
    fn test_user_filter_matches_name_or_account() {
        let users = vec![
            UserInfo {
                name: "Ann Lee".to_string(),
                code: "CORP\\alee".to_string(),
            },
            UserInfo {
                name: "Bob Stone".to_string(),
                code: "CORP\\bstone".to_string(),
            },
        ];
        assert_eq!(filter_users(users.clone(), "LEE").len(), 1);
        assert_eq!(filter_users(users.clone(), "corp\\b")[0].name, "Bob Stone");
        assert_eq!(filter_users(users.clone(), "  ").len(), 2);
        assert!(filter_users(users, "zed").is_empty());
    }

    #[test]
    fn test_normalize_directory_resolves_relative_paths() {
        let cwd = std::env::current_dir().unwrap();
        assert_eq!(
            normalize_directory(Path::new("repo/./sub/../")).unwrap(),
            cwd.join("repo")
        );
        assert_eq!(
            normalize_directory(Path::new("/work/a/")).unwrap(),
            PathBuf::from("/work/a")
        );
    }

    #[test]
    fn test_bool_prompt() {
        assert!(true.confirm("?"));
        assert!(!false.confirm("?"));
    }
}
