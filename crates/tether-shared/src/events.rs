//! In-process event bus.
//!
//! One [`EventBus`] is owned by the root composition object and cloned into
//! every component that publishes or listens. A [`Subscription`] unsubscribes
//! when dropped.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

use crate::constants::EVENT_BUS_CAPACITY;
use crate::data::CharacterData;
use crate::protocol::ConnectionDto;
use crate::types::{ServerId, UserData};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Events published on the bus.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A session finished its handshake.
    Connected {
        server: ServerId,
        connection: Arc<ConnectionDto>,
    },
    /// A session lost or closed its connection.
    Disconnected { server: ServerId },
    /// A new local snapshot was built.
    DataChanged(Arc<CharacterData>),
    /// The set of visible peers may have changed.
    VisibilityChanged,
    /// Download slot count or bandwidth share changed.
    DownloadLimitChanged,
    /// The server reports a queued download as ready.
    DownloadReady { request_id: String },
    /// User-facing notification.
    Notification {
        title: String,
        body: String,
        severity: Severity,
        duration: Duration,
    },
    /// A peer should be paused locally (e.g. exceeded performance limits).
    PausePeer { server: ServerId, user: UserData },
    /// Server-initiated hub call not handled by the session itself.
    HubMessage {
        server: ServerId,
        method: String,
        payload: Vec<Value>,
    },
}

impl SyncEvent {
    pub fn notification(
        title: impl Into<String>,
        body: impl Into<String>,
        severity: Severity,
        duration: Duration,
    ) -> Self {
        SyncEvent::Notification {
            title: title.into(),
            body: body.into(),
            severity,
            duration,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: SyncEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    receiver: broadcast::Receiver<SyncEvent>,
}

impl Subscription {
    /// Next event, or `None` once the bus is gone. Events missed because
    /// this subscriber fell behind are logged and skipped.
    pub async fn recv(&mut self) -> Option<SyncEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged; events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking poll, used by tests and tick-driven consumers.
    pub fn try_recv(&mut self) -> Option<SyncEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
