//! Single-flight task execution.
//!
//! At most one logical operation is in progress. Starting a new one cancels
//! the previous operation's token instead of queueing behind it, the same
//! replace-previous policy the background loaders use for stale requests.
//! Every run publishes `Started`, exactly one terminal outcome and then
//! `Finished`, no matter how the work ends.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{BridgeError, Result};
use crate::events::{Event, EventBus, OperationOutcome};

pub struct TaskRunner {
    bus: EventBus,
    current: Mutex<Option<CancellationToken>>,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl TaskRunner {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            current: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    /// Run `work` as the current operation, superseding any previous one.
    ///
    /// Errors and panics inside `work` become [`OperationOutcome::Failed`];
    /// they never reach the caller. If the token handed to `work` was
    /// canceled the outcome is [`OperationOutcome::Canceled`] even when
    /// `work` returned `Ok`.
    pub async fn execute<F, Fut>(&self, notify_on_success: bool, work: F) -> OperationOutcome
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let token = self.replace_token();
        let _flight = InFlight::enter(self);

        self.bus.outcome(OperationOutcome::Started);

        let work_token = token.clone();
        let result = AssertUnwindSafe(async move { work(work_token).await })
            .catch_unwind()
            .await;

        let outcome = match result {
            _ if token.is_cancelled() => OperationOutcome::Canceled,
            Ok(Ok(())) => OperationOutcome::Succeeded,
            Ok(Err(BridgeError::Canceled)) => OperationOutcome::Canceled,
            Ok(Err(err)) => OperationOutcome::Failed(Arc::new(err)),
            Err(payload) => {
                OperationOutcome::Failed(Arc::new(BridgeError::Panicked(panic_message(&*payload))))
            }
        };

        match &outcome {
            OperationOutcome::Succeeded if notify_on_success => {
                self.bus.success("Task has been executed successfully!");
            }
            OperationOutcome::Failed(err) => self.bus.error(err.to_string()),
            _ => {}
        }
        self.bus.outcome(outcome.clone());
        self.bus.publish(Event::Finished);
        outcome
    }

    /// Cancel whatever is running. The next `execute` gets a fresh token.
    pub fn cancel(&self) {
        if let Some(token) = self.current.lock().take() {
            token.cancel();
        }
        self.bus.warning("Operation canceled");
    }

    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    /// The live token, or a new one if the last was canceled.
    ///
    /// Work that runs alongside the current operation (watcher refreshes)
    /// uses this so that a user cancel stops it too.
    pub fn current_token(&self) -> CancellationToken {
        let mut current = self.current.lock();
        match current.as_ref() {
            Some(token) if !token.is_cancelled() => token.clone(),
            _ => {
                let token = CancellationToken::new();
                *current = Some(token.clone());
                token
            }
        }
    }

    /// Cancel and wait until no work is in flight.
    pub async fn shutdown(&self) {
        if let Some(token) = self.current.lock().take() {
            token.cancel();
        }
        loop {
            let idle = self.idle.notified();
            if !self.is_running() {
                return;
            }
            idle.await;
        }
    }

    fn replace_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = self.current.lock().replace(token.clone()) {
            previous.cancel();
        }
        token
    }
}

/// Keeps `in_flight` accurate even if the `execute` future is dropped.
struct InFlight<'a>(&'a TaskRunner);

impl<'a> InFlight<'a> {
    fn enter(runner: &'a TaskRunner) -> Self {
        runner.in_flight.fetch_add(1, Ordering::SeqCst);
        Self(runner)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
