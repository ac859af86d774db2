//! Combined repository + server state refresh.
//!
//! Both snapshots are fetched concurrently and published together as one
//! [`Event::Snapshot`]. A binary semaphore admits one refresh at a time, so a
//! published pair always comes from the same refresh and pairs are published
//! in the order their refreshes ran.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::{BridgeError, Result};
use crate::events::{Event, EventBus};
use crate::git::{RepoProvider, RepoSnapshot};
use crate::tfs::{ServerSnapshot, TfsServer};

/// `None` on either side is a valid state: not a repository, or not mapped.
#[derive(Clone, Debug, Default)]
pub struct CombinedSnapshot {
    pub repo: Option<Arc<RepoSnapshot>>,
    pub server: Option<ServerSnapshot>,
}

pub struct Refresher {
    server: Arc<dyn TfsServer>,
    repos: Arc<dyn RepoProvider>,
    bus: EventBus,
    gate: Semaphore,
    latest: Mutex<CombinedSnapshot>,
}

impl Refresher {
    pub fn new(server: Arc<dyn TfsServer>, repos: Arc<dyn RepoProvider>, bus: EventBus) -> Self {
        Self {
            server,
            repos,
            bus,
            gate: Semaphore::new(1),
            latest: Mutex::new(CombinedSnapshot::default()),
        }
    }

    /// The most recently published snapshot.
    pub fn latest(&self) -> CombinedSnapshot {
        self.latest.lock().clone()
    }

    pub async fn refresh(
        &self,
        directory: &Path,
        cancel: &CancellationToken,
    ) -> Result<CombinedSnapshot> {
        let _permit = tokio::select! {
            _ = cancel.cancelled() => return Err(BridgeError::Canceled),
            permit = self.gate.acquire() => permit
                .map_err(|_| BridgeError::Join("refresh gate closed".to_string()))?,
        };
        tracing::trace!(dir = %directory.display(), "refreshing info");

        let repo_task = {
            let repos = self.repos.clone();
            let dir = directory.to_path_buf();
            tokio::task::spawn_blocking(move || repos.snapshot(&dir))
        };
        let server_task = {
            let server = self.server.clone();
            let dir = directory.to_path_buf();
            tokio::task::spawn_blocking(move || server.server_snapshot(&dir))
        };
        let (repo, server) = tokio::join!(repo_task, server_task);

        let snapshot = CombinedSnapshot {
            repo: repo??.map(Arc::new),
            server: server??,
        };
        tracing::debug!(
            repo = snapshot.repo.is_some(),
            server = snapshot.server.is_some(),
            "info refreshed"
        );
        // Still holding the permit: publish order matches refresh order.
        *self.latest.lock() = snapshot.clone();
        self.bus.publish(Event::Snapshot(snapshot.clone()));
        Ok(snapshot)
    }
}
