//! Refresh on repository changes.
//!
//! Git creates `.git/index.lock` whenever it touches the index, which makes it
//! a cheap signal that someone (an IDE, a terminal) changed the repository.
//! The OS watcher only forwards lock-file paths into a channel;
//! [`run_watch_loop`] decides when to refresh.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{BridgeError, Result};
use crate::events::EventBus;
use crate::git::Repo;
use crate::refresh::Refresher;
use crate::task::TaskRunner;

const LOCK_FILE: &str = "index.lock";
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(3);
/// Lock-file events this soon after a refresh are attributed to it.
pub const SELF_TRIGGER_SETTLE: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct WatchContext {
    pub directory: PathBuf,
    pub refresher: Arc<Refresher>,
    pub tasks: Arc<TaskRunner>,
    pub bus: EventBus,
    pub min_interval: Duration,
    pub settle: Duration,
}

/// OS watcher plus the loop consuming its events. Dropping it stops both.
pub struct ChangeWatcher {
    _watcher: RecommendedWatcher,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ChangeWatcher {
    /// Watch `<directory>/.git` recursively. Must be called inside a runtime.
    pub fn start(ctx: WatchContext) -> Result<Self> {
        let git_dir = Repo::new(&ctx.directory).git_dir();
        let (tx, rx) = mpsc::channel::<PathBuf>(64);

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                let Ok(event) = res else {
                    return;
                };
                if matches!(event.kind, EventKind::Access(_)) {
                    return;
                }
                for path in event.paths.into_iter().filter(|p| is_lock_file(p)) {
                    // A full channel already guarantees a refresh.
                    let _ = tx.try_send(path);
                }
            },
            Config::default(),
        )
        .map_err(watch_error)?;
        watcher
            .watch(&git_dir, RecursiveMode::Recursive)
            .map_err(watch_error)?;
        tracing::debug!(dir = %git_dir.display(), "watching");

        let stop = CancellationToken::new();
        let task = tokio::spawn(run_watch_loop(rx, ctx, stop.clone()));
        Ok(Self {
            _watcher: watcher,
            stop,
            task: Some(task),
        })
    }

    /// Stop and wait for an in-progress refresh to finish.
    pub async fn stop(mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Consume lock-file events until `stop` fires or the sender is gone.
///
/// Events are ignored while a single-flight task runs. Refreshes are at least
/// `min_interval` apart; events arriving in between are coalesced into one
/// refresh at the end of the interval. The refresh runs git itself, so events
/// arriving within `settle` after it completes are discarded.
pub async fn run_watch_loop(
    mut rx: mpsc::Receiver<PathBuf>,
    ctx: WatchContext,
    stop: CancellationToken,
) {
    let mut last_refresh: Option<Instant> = None;
    let mut ignore_until: Option<Instant> = None;

    loop {
        let mut path = tokio::select! {
            _ = stop.cancelled() => break,
            next = rx.recv() => match next {
                Some(path) => path,
                None => break,
            },
        };

        if ignore_until.is_some_and(|until| Instant::now() < until) {
            tracing::trace!(path = %path.display(), "change attributed to own refresh");
            continue;
        }

        if let Some(last) = last_refresh {
            let due = last + ctx.min_interval;
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep_until(due) => {}
            }
        }
        while let Ok(latest) = rx.try_recv() {
            path = latest;
        }

        if ctx.tasks.is_running() {
            tracing::trace!(path = %path.display(), "task running, change ignored");
            continue;
        }

        last_refresh = Some(Instant::now());
        let cancel = ctx.tasks.current_token();
        match ctx.refresher.refresh(&ctx.directory, &cancel).await {
            Ok(_) => ctx
                .bus
                .info(format!("{} changed. Info is refreshed", path.display())),
            Err(err) if err.is_canceled() => {}
            Err(err) => ctx.bus.warning(format!("Cannot refresh info: {err}")),
        }

        ignore_until = Some(Instant::now() + ctx.settle);
        while rx.try_recv().is_ok() {}
    }
    tracing::debug!("watch loop stopped");
}

fn is_lock_file(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|name| name.eq_ignore_ascii_case(LOCK_FILE))
}

fn watch_error(err: notify::Error) -> BridgeError {
    BridgeError::Io(std::io::Error::other(err.to_string()))
}
