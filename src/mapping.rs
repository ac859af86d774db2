//! Workspace mapping guard.
//!
//! git-tfs refuses to work in a directory that a TFS workspace also maps, so
//! every bridge operation runs with the mapping temporarily removed. The guard
//! deletes the mapping, runs the body, and then restores the mapping no
//! matter how the body ended: success, error, cancellation or panic. Restoring
//! is retried with a fixed backoff; when every attempt fails the user gets
//! instructions to restore it by hand.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::error::{BridgeError, Result};
use crate::events::EventBus;
use crate::retry::{RetryOutcome, RetryPolicy, retry_bounded};
use crate::tfs::{
    BRIDGE_WORKSPACE_PREFIX, ServerSnapshot, TfsServer, WorkspaceHandle, WorkspaceMapping,
    computer_name, server_paths_equal,
};

#[derive(Clone)]
pub struct MappingGuard {
    server: Arc<dyn TfsServer>,
    bus: EventBus,
    policy: RetryPolicy,
}

impl MappingGuard {
    pub fn new(server: Arc<dyn TfsServer>, bus: EventBus) -> Self {
        Self::with_policy(server, bus, RetryPolicy::default())
    }

    pub fn with_policy(server: Arc<dyn TfsServer>, bus: EventBus, policy: RetryPolicy) -> Self {
        Self {
            server,
            bus,
            policy,
        }
    }

    /// Run `body` while `local_directory` is unmapped from the workspace.
    ///
    /// If deleting the mapping fails the body does not run. Otherwise the
    /// mapping is always restored before this returns; the body's error (or
    /// panic) takes precedence over a failed restore, which is then reported
    /// on the bus instead.
    pub async fn with_disabled_mapping<T, F, Fut>(
        &self,
        server: &ServerSnapshot,
        local_directory: &Path,
        cancel: &CancellationToken,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if server.mapped_server_folder.is_empty() {
            return Err(BridgeError::InvalidArgument(
                "server folder is not set".to_string(),
            ));
        }
        if local_directory.as_os_str().is_empty() {
            return Err(BridgeError::InvalidArgument(
                "local directory is not set".to_string(),
            ));
        }
        if cancel.is_cancelled() {
            return Err(BridgeError::Canceled);
        }

        let mapping = WorkspaceMapping::new(server.mapped_server_folder.clone(), local_directory);
        let workspace = server.workspace.clone();

        self.bus.info("Deleting TFS mapping...");
        {
            let workspace = workspace.clone();
            let mapping = mapping.clone();
            self.blocking(move |s| s.delete_mapping(&workspace, &mapping))
                .await?;
        }
        tracing::debug!(folder = %mapping.server_folder, "mapping deleted");

        let body_result = AssertUnwindSafe(async move { body().await })
            .catch_unwind()
            .await;

        let restored = self.restore(&workspace, &mapping).await;

        match body_result {
            Ok(Ok(value)) => restored.map(|()| value),
            Ok(Err(err)) => {
                if let Err(restore_err) = &restored {
                    self.bus.error(restore_err.to_string());
                }
                Err(err)
            }
            Err(panic) => {
                if let Err(restore_err) = &restored {
                    self.bus.error(restore_err.to_string());
                }
                std::panic::resume_unwind(panic)
            }
        }
    }

    async fn restore(&self, workspace: &WorkspaceHandle, mapping: &WorkspaceMapping) -> Result<()> {
        self.bus.info("Restoring TFS mapping...");
        let max_attempts = self.policy.max_attempts.max(1);

        let outcome = retry_bounded(self.policy, |attempt| async move {
            let result = self.restore_once(workspace, mapping).await;
            if let Err(err) = &result {
                tracing::debug!(attempt, error = %err, "restore attempt failed");
                self.bus.warning(format!(
                    "Cannot restore TFS mapping. Attempt {attempt} of {max_attempts}..."
                ));
            }
            result
        })
        .await;

        match outcome {
            RetryOutcome::Succeeded { attempts, .. } => {
                tracing::debug!(attempts, "mapping restored");
                self.bus.success("Successfully restored TFS mapping");
                Ok(())
            }
            RetryOutcome::Exhausted {
                last_error,
                attempts,
            } => Err(BridgeError::MappingNotRestored {
                server_folder: mapping.server_folder.clone(),
                local_directory: mapping.local_directory.clone(),
                attempts,
                last_error: last_error.to_string(),
            }),
        }
    }

    /// One restore attempt: clear stale bridge workspaces, recreate, verify.
    async fn restore_once(&self, workspace: &WorkspaceHandle, mapping: &WorkspaceMapping) -> Result<()> {
        let workspace = workspace.clone();
        let mapping = mapping.clone();
        let bus = self.bus.clone();
        self.blocking(move |server| {
            remove_stale_workspaces(server, &bus, &workspace, &mapping);
            server.create_mapping(&workspace, &mapping)?;

            let resolved = server
                .workspace_for(&mapping.local_directory)?
                .filter(|ws| ws.name == workspace.name)
                .and_then(|ws| {
                    ws.server_folder_for(&mapping.local_directory)
                        .map(|f| server_paths_equal(f, &mapping.server_folder))
                });
            if resolved == Some(true) {
                Ok(())
            } else {
                Err(BridgeError::Server(format!(
                    "mapping for '{}' was created but does not resolve",
                    mapping.local_directory.display()
                )))
            }
        })
        .await
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn TfsServer) -> Result<T> + Send + 'static,
    {
        let server = self.server.clone();
        tokio::task::spawn_blocking(move || f(server.as_ref())).await?
    }
}

/// Delete workspaces git-tfs left behind that still map the same server path.
///
/// Best effort: failures are warnings.
fn remove_stale_workspaces(
    server: &dyn TfsServer,
    bus: &EventBus,
    ours: &WorkspaceHandle,
    mapping: &WorkspaceMapping,
) {
    let stale = server.current_user().and_then(|owner| {
        server.query_workspaces(&owner, &computer_name())
    });
    let workspaces = match stale {
        Ok(list) => list,
        Err(err) => {
            bus.warning(format!("Cannot query temporary workspaces: {err}"));
            return;
        }
    };

    for ws in workspaces.iter().filter(|ws| {
        ws.name != ours.name
            && ws
                .name
                .to_ascii_lowercase()
                .starts_with(BRIDGE_WORKSPACE_PREFIX)
            && ws.maps_server_folder(&mapping.server_folder)
    }) {
        bus.info(format!("Deleting temporary workspace {}...", ws.name));
        if let Err(err) = server.delete_workspace(&ws.name, &ws.owner) {
            bus.warning(format!("Cannot delete workspace {}: {err}", ws.name));
        }
    }
}
