//! Local notifications about fleet-wide player movement.
//!
//! Handlers register per event kind with a priority. A single dispatcher task
//! invokes them, lowest priority first and in registration order within a
//! priority, so slow handlers never hold up pub/sub delivery.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Something observed about a player anywhere in the fleet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    Joined {
        player: String,
    },
    Left {
        player: String,
        /// Backend the player was last known on, if this node knew it.
        previous_server: Option<String>,
    },
    ChangedServer {
        player: String,
        previous: Option<String>,
        server: String,
    },
    /// A non-blank message on any channel this node listens on.
    Message {
        channel: String,
        payload: String,
    },
}

impl NetworkEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            NetworkEvent::Joined { .. } => EventKind::Joined,
            NetworkEvent::Left { .. } => EventKind::Left,
            NetworkEvent::ChangedServer { .. } => EventKind::ChangedServer,
            NetworkEvent::Message { .. } => EventKind::Message,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Joined,
    Left,
    ChangedServer,
    Message,
}

/// Handler ordering. `Lowest` runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Lowest,
    Low,
    Normal,
    High,
    Highest,
}

pub type Handler = Arc<dyn Fn(&NetworkEvent) + Send + Sync>;

/// Event kind -> ordered handlers.
#[derive(Default, Clone)]
pub struct Subscribers {
    table: HashMap<EventKind, Vec<(Priority, Handler)>>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&mut self, kind: EventKind, priority: Priority, handler: F) -> &mut Self
    where
        F: Fn(&NetworkEvent) + Send + Sync + 'static,
    {
        let handlers = self.table.entry(kind).or_default();
        let at = handlers.partition_point(|(p, _)| *p <= priority);
        handlers.insert(at, (priority, Arc::new(handler)));
        self
    }

    /// Invoke every handler for the event's kind, in order.
    ///
    /// A panicking handler is logged and skipped; the rest still run.
    pub fn dispatch(&self, event: &NetworkEvent) {
        if let Some(handlers) = self.table.get(&event.kind()) {
            for (priority, handler) in handlers {
                if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                    error!(kind = ?event.kind(), ?priority, "notification handler panicked");
                }
            }
        }
    }
}

/// Raises notifications without waiting for handlers.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<NetworkEvent>,
}

impl Notifier {
    /// Start the dispatcher task. It runs until every `Notifier` clone is
    /// dropped or the handle is aborted.
    pub fn spawn(subscribers: Subscribers) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<NetworkEvent>();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                subscribers.dispatch(&event);
            }
            debug!("notification dispatcher stopped");
        });
        (Self { tx }, handle)
    }

    pub fn raise(&self, event: NetworkEvent) {
        if self.tx.send(event).is_err() {
            debug!("notification dropped, dispatcher stopped");
        }
    }
}
