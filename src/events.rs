//! Typed publish/subscribe channel from the core to the front end.
//!
//! The core never calls into UI code. Everything a front end needs to render
//! (log lines, task state, snapshots, created shelvesets) is published here as
//! an [`Event`] and fanned out to every subscriber.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::error::BridgeError;
use crate::refresh::CombinedSnapshot;
use crate::shelveset::ShelvesetData;

/// Slow subscribers lag (and skip) rather than block publishers.
const EVENT_CAPACITY: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogMessage {
    pub kind: MessageKind,
    pub text: String,
}

/// State transitions of the single-flight task.
#[derive(Clone, Debug)]
pub enum OperationOutcome {
    Started,
    Succeeded,
    Failed(Arc<BridgeError>),
    Canceled,
}

impl OperationOutcome {
    pub fn is_succeeded(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

#[derive(Clone, Debug)]
pub enum Event {
    Log(LogMessage),
    Outcome(OperationOutcome),
    /// Always follows the terminal outcome of a task.
    Finished,
    /// Repository and server state fetched together.
    Snapshot(CombinedSnapshot),
    /// A shelve was confirmed and is about to run.
    ShelvesetPending(ShelvesetData),
    ShelvesetCreated(ShelvesetData),
}

/// Process-wide fan-out bus. Cloning shares the same channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: Event) {
        // No subscribers is fine: nobody is looking.
        let _ = self.tx.send(event);
    }

    pub fn outcome(&self, outcome: OperationOutcome) {
        self.publish(Event::Outcome(outcome));
    }

    /// Publish a log line and mirror it into `tracing`.
    pub fn log(&self, kind: MessageKind, text: impl Into<String>) {
        let text = text.into();
        match kind {
            MessageKind::Info => tracing::debug!("{text}"),
            MessageKind::Success => tracing::info!("{text}"),
            MessageKind::Warning => tracing::warn!("{text}"),
            MessageKind::Error => tracing::error!("{text}"),
        }
        self.publish(Event::Log(LogMessage { kind, text }));
    }

    pub fn info(&self, text: impl Into<String>) {
        self.log(MessageKind::Info, text);
    }

    pub fn success(&self, text: impl Into<String>) {
        self.log(MessageKind::Success, text);
    }

    pub fn warning(&self, text: impl Into<String>) {
        self.log(MessageKind::Warning, text);
    }

    pub fn error(&self, text: impl Into<String>) {
        self.log(MessageKind::Error, text);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything currently buffered for `rx`, without waiting.
#[cfg(test)]
pub(crate) fn drain(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Log lines of the given kind among `events`.
#[cfg(test)]
pub(crate) fn log_texts(events: &[Event], kind: MessageKind) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Log(m) if m.kind == kind => Some(m.text.clone()),
            _ => None,
        })
        .collect()
}
