//! git-tfs workflows.
//!
//! Each workflow is a fixed invocation of the bridge tool. Everything except
//! clone runs inside [`MappingGuard::with_disabled_mapping`].

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use crate::command::{BridgeCommand, CommandRunner, Tool};
use crate::error::{BridgeError, Result};
use crate::events::EventBus;
use crate::mapping::MappingGuard;
use crate::tfs::ServerSnapshot;

#[derive(Clone)]
pub struct GitTfs {
    runner: CommandRunner,
    guard: MappingGuard,
    bus: EventBus,
    tool: Tool,
    git: PathBuf,
    tfs_uri: String,
}

impl GitTfs {
    pub fn new(
        runner: CommandRunner,
        guard: MappingGuard,
        bus: EventBus,
        tool: Tool,
        git: impl Into<PathBuf>,
        tfs_uri: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            guard,
            bus,
            tool,
            git: git.into(),
            tfs_uri: tfs_uri.into(),
        }
    }

    /// Clone `server_folder` and install its `.git` into `directory`.
    ///
    /// git-tfs clones into a scratch directory next to the target (same
    /// volume, so the final move is a rename). The working files in
    /// `directory` are left alone: they come from the TFS workspace.
    pub async fn clone_repo(
        &self,
        server_folder: &str,
        directory: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        require("server folder", server_folder)?;
        let parent = directory
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| {
                BridgeError::InvalidArgument(format!(
                    "'{}' has no parent directory",
                    directory.display()
                ))
            })?;

        self.bus.info("Creating temp directory...");
        let temp = tempfile::Builder::new()
            .prefix(".git-tfs-clone-")
            .tempdir_in(parent)?;
        self.bus
            .info(format!("Temp directory is '{}'", temp.path().display()));

        let clone = self
            .tool
            .command(["clone", self.tfs_uri.as_str(), server_folder])
            .current_dir(temp.path());
        self.runner.execute(&clone, cancel).await?;

        let workspace = single_subdirectory(temp.path())?;
        self.bus.info(format!(
            "Temp workspace directory is '{}'",
            workspace.display()
        ));

        match self.cleanup(&workspace, cancel).await {
            Ok(()) => {}
            Err(BridgeError::Canceled) => return Err(BridgeError::Canceled),
            Err(err) => {
                tracing::debug!(error = %err, "cleanup failed");
                self.bus.warning("Cannot cleanup");
            }
        }

        tokio::fs::create_dir_all(directory).await?;
        let final_git = directory.join(".git");
        if tokio::fs::try_exists(&final_git).await? {
            self.bus
                .info(format!("Deleting '{}'...", final_git.display()));
            tokio::fs::remove_dir_all(&final_git).await?;
        }

        self.bus.info(format!(
            "Moving '.git' folder from temp directory '{}' to the permanent one '{}'...",
            workspace.display(),
            final_git.display()
        ));
        tokio::fs::rename(workspace.join(".git"), &final_git).await?;

        let temp_path = temp.path().to_path_buf();
        self.bus
            .info(format!("Deleting temp directory '{}'...", temp_path.display()));
        let removed = tokio::task::spawn_blocking(move || temp.close()).await;
        if !matches!(removed, Ok(Ok(()))) {
            self.bus.warning(format!(
                "Cannot delete temp directory '{}'. Please delete it manually",
                temp_path.display()
            ));
        }

        self.bus.success(format!(
            "Repository is cloned to '{}'!",
            directory.display()
        ));
        Ok(())
    }

    async fn cleanup(&self, workspace: &Path, cancel: &CancellationToken) -> Result<()> {
        let cleanup = self.tool.command(["cleanup"]).current_dir(workspace);
        self.runner.execute(&cleanup, cancel).await?;
        let gc = BridgeCommand::new(&self.git)
            .arg("gc")
            .current_dir(workspace);
        self.runner.execute(&gc, cancel).await
    }

    pub async fn pull(
        &self,
        server: &ServerSnapshot,
        directory: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.guarded(server, directory, cancel, vec!["pull".to_string()])
            .await
    }

    pub async fn shelve(
        &self,
        server: &ServerSnapshot,
        directory: &Path,
        name: &str,
        comment: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        require("shelveset name", name)?;
        require("comment", comment)?;
        let args = vec![
            "shelve".to_string(),
            name.to_string(),
            "--force".to_string(),
            "--comment".to_string(),
            comment.to_string(),
        ];
        self.guarded(server, directory, cancel, args).await
    }

    pub async fn checkin(
        &self,
        server: &ServerSnapshot,
        directory: &Path,
        comment: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        require("comment", comment)?;
        let args = vec![
            "checkin".to_string(),
            "--force".to_string(),
            format!("--comment={comment}"),
        ];
        self.guarded(server, directory, cancel, args).await
    }

    /// Unshelve `name` (owned by `user`, default: the current user) into a
    /// new local `branch`.
    pub async fn unshelve(
        &self,
        server: &ServerSnapshot,
        directory: &Path,
        name: &str,
        branch: &str,
        user: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        require("shelveset name", name)?;
        require("branch name", branch)?;
        let mut args = vec![
            "unshelve".to_string(),
            name.to_string(),
            branch.to_string(),
        ];
        if let Some(user) = user.filter(|u| !u.is_empty()) {
            args.push(format!("-u={user}"));
        }
        args.push("--force".to_string());
        self.guarded(server, directory, cancel, args).await
    }

    async fn guarded(
        &self,
        server: &ServerSnapshot,
        directory: &Path,
        cancel: &CancellationToken,
        args: Vec<String>,
    ) -> Result<()> {
        let command = self.tool.command(args).current_dir(directory);
        self.guard
            .with_disabled_mapping(server, directory, cancel, || {
                self.runner.execute(&command, cancel)
            })
            .await
    }
}

fn require(what: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        Err(BridgeError::InvalidArgument(format!("{what} is empty")))
    } else {
        Ok(())
    }
}

/// git-tfs clones into a single new directory; anything else is unexpected.
fn single_subdirectory(path: &Path) -> Result<PathBuf> {
    let dirs: Vec<PathBuf> = std::fs::read_dir(path)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.is_dir())
        .collect();
    match dirs.as_slice() {
        [single] => Ok(single.clone()),
        _ => Err(BridgeError::CloneLayout {
            path: path.to_path_buf(),
            found: dirs.len(),
        }),
    }
}
