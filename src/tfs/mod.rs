//! TFS server boundary.
//!
//! [`TfsServer`] is everything the bridge needs from the server: workspace
//! mappings, get-latest, shelvesets and identities. Calls are blocking; async
//! callers go through `spawn_blocking`. [`TfClient`] is the production
//! adapter (the `tf` command-line client plus the REST API).

mod client;
mod rest;
mod tf_cli;

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use crate::error::Result;

pub use client::TfClient;

/// Workspaces created by git-tfs for its own temporary use start with this.
pub const BRIDGE_WORKSPACE_PREFIX: &str = "git-tfs";

/// A server path mapped to a local directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkspaceMapping {
    pub server_folder: String,
    pub local_directory: PathBuf,
}

impl WorkspaceMapping {
    pub fn new(server_folder: impl Into<String>, local_directory: impl Into<PathBuf>) -> Self {
        Self {
            server_folder: server_folder.into(),
            local_directory: local_directory.into(),
        }
    }
}

/// Identifies a workspace on the server.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WorkspaceHandle {
    pub name: String,
    pub owner: String,
}

impl WorkspaceHandle {
    /// `name;owner`, the workspace spec understood by `tf`.
    pub fn spec(&self) -> String {
        if self.owner.is_empty() {
            self.name.clone()
        } else {
            format!("{};{}", self.name, self.owner)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkspaceInfo {
    pub name: String,
    pub owner: String,
    pub computer: String,
    pub folders: Vec<WorkspaceMapping>,
}

impl WorkspaceInfo {
    pub fn handle(&self) -> WorkspaceHandle {
        WorkspaceHandle {
            name: self.name.clone(),
            owner: self.owner.clone(),
        }
    }

    /// Server folder of the most specific mapping that contains `local`.
    pub fn server_folder_for(&self, local: &Path) -> Option<&str> {
        self.folders
            .iter()
            .filter(|m| path_contains(&m.local_directory, local))
            .max_by_key(|m| m.local_directory.components().count())
            .map(|m| m.server_folder.as_str())
    }

    /// Server paths are case-insensitive.
    pub fn maps_server_folder(&self, server_folder: &str) -> bool {
        self.folders
            .iter()
            .any(|m| server_paths_equal(&m.server_folder, server_folder))
    }
}

/// Server-side view of the selected directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerSnapshot {
    pub workspace: WorkspaceHandle,
    pub workspace_name: String,
    pub mapped_server_folder: String,
    /// First path segment after `$/`.
    pub project: Option<String>,
}

impl ServerSnapshot {
    /// `None` when none of the workspace's folders covers `directory`.
    pub fn from_workspace(workspace: &WorkspaceInfo, directory: &Path) -> Option<Self> {
        let folder = workspace.server_folder_for(directory)?;
        Some(Self {
            workspace: workspace.handle(),
            workspace_name: workspace.name.clone(),
            mapped_server_folder: folder.to_string(),
            project: project_of(folder),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shelveset {
    pub name: String,
    /// Account name (`DOMAIN\user`) when the server reports one.
    pub owner: String,
    pub owner_display_name: String,
    pub comment: Option<String>,
    /// ISO-8601 timestamp as reported by the server.
    pub created: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserInfo {
    pub name: String,
    /// Account name used as shelveset owner.
    pub code: String,
}

pub trait TfsServer: Send + Sync {
    /// Account name of the authenticated user.
    fn current_user(&self) -> Result<String>;

    /// The local workspace that maps `directory`, if any.
    fn workspace_for(&self, directory: &Path) -> Result<Option<WorkspaceInfo>>;

    fn delete_mapping(&self, workspace: &WorkspaceHandle, mapping: &WorkspaceMapping) -> Result<()>;

    fn create_mapping(&self, workspace: &WorkspaceHandle, mapping: &WorkspaceMapping) -> Result<()>;

    fn query_workspaces(&self, owner: &str, computer: &str) -> Result<Vec<WorkspaceInfo>>;

    fn delete_workspace(&self, name: &str, owner: &str) -> Result<()>;

    /// Bring `directory` up to date with the server. Stops early on `cancel`.
    fn get_latest(
        &self,
        workspace: &WorkspaceHandle,
        directory: &Path,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// `None` filters match everything.
    fn query_shelvesets(&self, name: Option<&str>, owner: Option<&str>) -> Result<Vec<Shelveset>>;

    /// Members of the collection's valid-users group.
    fn users(&self) -> Result<Vec<UserInfo>>;

    fn server_snapshot(&self, directory: &Path) -> Result<Option<ServerSnapshot>> {
        Ok(self
            .workspace_for(directory)?
            .and_then(|ws| ServerSnapshot::from_workspace(&ws, directory)))
    }
}

pub fn project_of(server_folder: &str) -> Option<String> {
    server_folder
        .strip_prefix("$/")?
        .split('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub fn server_paths_equal(a: &str, b: &str) -> bool {
    a.trim_end_matches('/')
        .eq_ignore_ascii_case(b.trim_end_matches('/'))
}

/// Host name as TFS records it for local workspaces.
pub fn computer_name() -> String {
    std::env::var("COMPUTERNAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string())
}

fn path_contains(parent: &Path, child: &Path) -> bool {
    // Windows paths are case-insensitive; compare component-wise.
    let mut child = child.components();
    for p in parent.components() {
        match child.next() {
            Some(c) if c.as_os_str().eq_ignore_ascii_case(p.as_os_str()) => {}
            _ => return false,
        }
    }
    true
}
