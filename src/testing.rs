//! In-memory server and repository doubles shared by the unit tests.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{BridgeError, Result};
use crate::git::{Repo, RepoProvider, RepoSnapshot};
use crate::tfs::{
    Shelveset, TfsServer, UserInfo, WorkspaceHandle, WorkspaceInfo, WorkspaceMapping,
    computer_name,
};

pub(crate) const USER: &str = "DOMAIN\\jo";

#[derive(Default)]
struct ServerState {
    workspaces: Vec<WorkspaceInfo>,
    shelvesets: Vec<Shelveset>,
    users: Vec<UserInfo>,
    calls: Vec<String>,
    fail_create: u32,
    fail_delete_mapping: bool,
    fail_delete_workspace: bool,
    fail_get_latest: bool,
}

/// Fake server. Every call is recorded, and optionally appended to a journal
/// file that fake bridge scripts also write to, so orderings across the
/// process boundary can be asserted.
pub(crate) struct FakeServer {
    state: Mutex<ServerState>,
    journal: Option<PathBuf>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ServerState::default()),
            journal: None,
        }
    }

    /// A server with one local workspace `DEV1` mapping `server_folder` to `dir`.
    pub fn with_mapping(server_folder: &str, dir: &Path) -> Self {
        let server = Self::new();
        server.add_workspace(WorkspaceInfo {
            name: "DEV1".to_string(),
            owner: USER.to_string(),
            computer: computer_name(),
            folders: vec![WorkspaceMapping::new(server_folder, dir)],
        });
        server
    }

    pub fn journal(mut self, path: &Path) -> Self {
        self.journal = Some(path.to_path_buf());
        self
    }

    pub fn add_workspace(&self, ws: WorkspaceInfo) {
        self.state.lock().workspaces.push(ws);
    }

    pub fn add_shelveset(&self, name: &str, owner: &str) {
        self.state.lock().shelvesets.push(Shelveset {
            name: name.to_string(),
            owner: owner.to_string(),
            owner_display_name: owner.to_string(),
            comment: None,
            created: "2024-01-01T00:00:00Z".to_string(),
        });
    }

    pub fn add_user(&self, name: &str, code: &str) {
        self.state.lock().users.push(UserInfo {
            name: name.to_string(),
            code: code.to_string(),
        });
    }

    /// Make the next `n` mapping creations fail.
    pub fn fail_create(&self, n: u32) {
        self.state.lock().fail_create = n;
    }

    pub fn fail_delete_mapping(&self) {
        self.state.lock().fail_delete_mapping = true;
    }

    pub fn fail_delete_workspace(&self) {
        self.state.lock().fail_delete_workspace = true;
    }

    pub fn fail_get_latest(&self) {
        self.state.lock().fail_get_latest = true;
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.split(' ').next() == Some(call))
            .count()
    }

    pub fn workspace_names(&self) -> Vec<String> {
        self.state
            .lock()
            .workspaces
            .iter()
            .map(|w| w.name.clone())
            .collect()
    }

    fn record(&self, state: &mut ServerState, call: String) {
        if let Some(path) = &self.journal
            && let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path)
        {
            let _ = writeln!(file, "{call}");
        }
        state.calls.push(call);
    }
}

impl TfsServer for FakeServer {
    fn current_user(&self) -> Result<String> {
        Ok(USER.to_string())
    }

    fn workspace_for(&self, directory: &Path) -> Result<Option<WorkspaceInfo>> {
        let mut state = self.state.lock();
        self.record(&mut state, format!("workspace_for {}", directory.display()));
        Ok(state
            .workspaces
            .iter()
            .find(|w| w.server_folder_for(directory).is_some())
            .cloned())
    }

    fn delete_mapping(&self, workspace: &WorkspaceHandle, mapping: &WorkspaceMapping) -> Result<()> {
        let mut state = self.state.lock();
        self.record(&mut state, format!("delete_mapping {}", mapping.server_folder));
        if state.fail_delete_mapping {
            return Err(BridgeError::Server("TF14045: cannot unmap".to_string()));
        }
        let ws = state
            .workspaces
            .iter_mut()
            .find(|w| w.name == workspace.name)
            .ok_or_else(|| BridgeError::Server(format!("no workspace {}", workspace.name)))?;
        ws.folders.retain(|m| m != mapping);
        Ok(())
    }

    fn create_mapping(&self, workspace: &WorkspaceHandle, mapping: &WorkspaceMapping) -> Result<()> {
        let mut state = self.state.lock();
        self.record(&mut state, format!("create_mapping {}", mapping.server_folder));
        if state.fail_create > 0 {
            state.fail_create -= 1;
            return Err(BridgeError::Server(
                "TF14061: The workspace git-tfs-1 already maps this folder".to_string(),
            ));
        }
        let ws = state
            .workspaces
            .iter_mut()
            .find(|w| w.name == workspace.name)
            .ok_or_else(|| BridgeError::Server(format!("no workspace {}", workspace.name)))?;
        ws.folders.push(mapping.clone());
        Ok(())
    }

    fn query_workspaces(&self, owner: &str, computer: &str) -> Result<Vec<WorkspaceInfo>> {
        let mut state = self.state.lock();
        self.record(&mut state, format!("query_workspaces {owner}"));
        Ok(state
            .workspaces
            .iter()
            .filter(|w| w.owner == owner && w.computer == computer)
            .cloned()
            .collect())
    }

    fn delete_workspace(&self, name: &str, _owner: &str) -> Result<()> {
        let mut state = self.state.lock();
        self.record(&mut state, format!("delete_workspace {name}"));
        if state.fail_delete_workspace {
            return Err(BridgeError::Server("TF14091: access denied".to_string()));
        }
        state.workspaces.retain(|w| w.name != name);
        Ok(())
    }

    fn get_latest(
        &self,
        _workspace: &WorkspaceHandle,
        directory: &Path,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        let mut state = self.state.lock();
        self.record(&mut state, format!("get_latest {}", directory.display()));
        if state.fail_get_latest {
            return Err(BridgeError::Server("TF400324: server unavailable".to_string()));
        }
        Ok(())
    }

    fn query_shelvesets(&self, name: Option<&str>, owner: Option<&str>) -> Result<Vec<Shelveset>> {
        let mut state = self.state.lock();
        self.record(&mut state, format!("query_shelvesets {}", name.unwrap_or("*")));
        Ok(state
            .shelvesets
            .iter()
            .filter(|s| name.is_none_or(|n| s.name == n))
            .filter(|s| owner.is_none_or(|o| s.owner == o))
            .cloned()
            .collect())
    }

    fn users(&self) -> Result<Vec<UserInfo>> {
        Ok(self.state.lock().users.clone())
    }
}

/// Fake repositories keyed by directory.
pub(crate) struct FakeRepos {
    repos: Mutex<HashMap<PathBuf, RepoSnapshot>>,
    calls: Mutex<Vec<String>>,
}

impl FakeRepos {
    pub fn new() -> Self {
        Self {
            repos: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_repo(dir: &Path, branch: &str) -> Self {
        let repos = Self::new();
        repos.insert(snapshot(dir, branch));
        repos
    }

    pub fn insert(&self, snap: RepoSnapshot) {
        self.repos
            .lock()
            .insert(snap.repo.root().to_path_buf(), snap);
    }

    pub fn update(&self, dir: &Path, f: impl FnOnce(&mut RepoSnapshot)) {
        if let Some(snap) = self.repos.lock().get_mut(dir) {
            f(snap);
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

pub(crate) fn snapshot(dir: &Path, branch: &str) -> RepoSnapshot {
    RepoSnapshot {
        repo: Repo::new(dir),
        branch: branch.to_string(),
        branches: vec![branch.to_string()],
        is_dirty: false,
        uncommitted_files: 0,
        commit_messages: vec!["Initial".to_string()],
        non_merge_commit_count: 1,
        conflict_count: 0,
    }
}

impl RepoProvider for FakeRepos {
    fn open(&self, directory: &Path) -> Result<Option<Repo>> {
        Ok(self.repos.lock().get(directory).map(|s| s.repo.clone()))
    }

    fn snapshot(&self, directory: &Path) -> Result<Option<RepoSnapshot>> {
        Ok(self.repos.lock().get(directory).cloned())
    }

    fn branch_exists(&self, repo: &Repo, branch: &str) -> Result<bool> {
        Ok(self
            .repos
            .lock()
            .get(repo.root())
            .is_some_and(|s| s.branches.iter().any(|b| b == branch)))
    }

    fn stage_all(&self, _repo: &Repo) -> Result<()> {
        self.record("stage_all".to_string());
        Ok(())
    }

    fn commit(&self, repo: &Repo, message: &str) -> Result<()> {
        self.record(format!("commit {message}"));
        self.update(repo.root(), |s| {
            s.is_dirty = false;
            s.uncommitted_files = 0;
            s.commit_messages.push(message.to_string());
            s.non_merge_commit_count += 1;
        });
        Ok(())
    }

    fn checkout(&self, repo: &Repo, branch: &str) -> Result<()> {
        self.record(format!("checkout {branch}"));
        self.update(repo.root(), |s| {
            if !s.branches.iter().any(|b| b == branch) {
                s.branches.push(branch.to_string());
            }
            s.branch = branch.to_string();
        });
        Ok(())
    }

    fn append_to_last_commit_message(&self, _repo: &Repo, text: &str) -> Result<()> {
        self.record(format!("append {text}"));
        Ok(())
    }
}

/// Lines of the shared journal file.
pub(crate) fn read_journal(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

/// Write an executable-by-`sh` script that stands in for git-tfs: it appends
/// its first argument to `journal`, then runs `body`.
#[cfg(unix)]
pub(crate) fn bridge_script(dir: &Path, journal: &Path, body: &str) -> crate::command::Tool {
    let script = dir.join("git-tfs.sh");
    let text = format!(
        "#!/bin/sh\necho \"$1\" >> '{}'\n{}\n",
        journal.display(),
        body
    );
    std::fs::write(&script, text).unwrap();
    crate::command::Tool {
        program: PathBuf::from("sh"),
        leading_args: vec![script.display().to_string()],
    }
}
