//! Persistent bidirectional RPC channel to a server's hub.
//!
//! Frames are JSON objects over a WebSocket. A reader task demultiplexes
//! call results back to their waiting callers and forwards server-initiated
//! calls as [`HubEvent`]s. A writer task owns the sink; callers talk to it
//! through an mpsc channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::HubError;

/// Wire frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HubFrame {
    /// Call expecting a `Result` frame with the same id.
    Invoke {
        id: u64,
        method: String,
        args: Vec<Value>,
    },
    /// Fire-and-forget call.
    Send { method: String, args: Vec<Value> },
    Result {
        id: u64,
        #[serde(default)]
        result: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Server-initiated call.
    Event { method: String, args: Vec<Value> },
}

/// Things the connection reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    Message { method: String, args: Vec<Value> },
    /// The connection is gone. Carries the close reason when one was given.
    Closed(Option<String>),
}

#[async_trait]
pub trait HubConnection: Send + Sync {
    async fn send(&self, method: &str, args: Vec<Value>) -> Result<(), HubError>;

    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, HubError>;

    /// Close the connection. Idempotent.
    async fn stop(&self);
}

/// Opens hub connections. The session owns one and uses it for every
/// (re)connect.
#[async_trait]
pub trait HubConnector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &str,
        token: &str,
    ) -> Result<(Arc<dyn HubConnection>, mpsc::Receiver<HubEvent>), HubError>;
}

const EVENT_CHANNEL_CAPACITY: usize = 256;
const OUTGOING_CHANNEL_CAPACITY: usize = 64;

type PendingCalls = DashMap<u64, oneshot::Sender<Result<Value, HubError>>>;

/// WebSocket connector.
#[derive(Debug, Default, Clone)]
pub struct WsHubConnector;

#[async_trait]
impl HubConnector for WsHubConnector {
    async fn connect(
        &self,
        endpoint: &str,
        token: &str,
    ) -> Result<(Arc<dyn HubConnection>, mpsc::Receiver<HubEvent>), HubError> {
        let mut request = endpoint
            .into_client_request()
            .map_err(|e| HubError::Connect(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| HubError::Connect(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, _response) = match tokio_tungstenite::connect_async(request).await {
            Ok(ok) => ok,
            Err(WsError::Http(response)) if response.status() == StatusCode::UNAUTHORIZED => {
                return Err(HubError::Unauthorized);
            }
            Err(e) => return Err(HubError::Connect(e.to_string())),
        };
        debug!(endpoint, "Hub websocket established");

        let (mut sink, mut source) = stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTGOING_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let pending: Arc<PendingCalls> = Arc::new(DashMap::new());
        let cancel = CancellationToken::new();

        // Writer
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    msg = out_rx.recv() => match msg {
                        Some(msg) => {
                            if let Err(e) = sink.send(msg).await {
                                warn!(error = %e, "Hub write failed");
                                writer_cancel.cancel();
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        // Reader
        let reader_cancel = cancel.clone();
        let reader_pending = pending.clone();
        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    _ = reader_cancel.cancelled() => break Some("stopped".to_string()),
                    msg = source.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            route_frame(&text, &reader_pending, &event_tx).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            break frame.map(|f| f.reason.to_string());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break Some(e.to_string()),
                        None => break None,
                    },
                }
            };
            reader_cancel.cancel();
            // Dropping the senders fails every outstanding call with `Closed`.
            reader_pending.clear();
            let _ = event_tx.send(HubEvent::Closed(reason)).await;
        });

        let connection = WsHubConnection {
            outgoing: out_tx,
            pending,
            next_id: AtomicU64::new(1),
            cancel,
        };
        Ok((Arc::new(connection), event_rx))
    }
}

async fn route_frame(text: &str, pending: &PendingCalls, events: &mpsc::Sender<HubEvent>) {
    let frame: HubFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "Dropping malformed hub frame");
            return;
        }
    };
    match frame {
        HubFrame::Result { id, result, error } => {
            if let Some((_, reply)) = pending.remove(&id) {
                let outcome = match error {
                    Some(message) => Err(HubError::Remote {
                        method: format!("#{id}"),
                        message,
                    }),
                    None => Ok(result),
                };
                let _ = reply.send(outcome);
            } else {
                trace!(id, "Result for unknown call");
            }
        }
        HubFrame::Event { method, args } | HubFrame::Send { method, args } => {
            let _ = events.send(HubEvent::Message { method, args }).await;
        }
        HubFrame::Invoke { method, .. } => {
            debug!(method = %method, "Ignoring server invoke; clients do not answer calls");
        }
    }
}

struct WsHubConnection {
    outgoing: mpsc::Sender<Message>,
    pending: Arc<PendingCalls>,
    next_id: AtomicU64,
    cancel: CancellationToken,
}

impl WsHubConnection {
    async fn write(&self, frame: &HubFrame) -> Result<(), HubError> {
        if self.cancel.is_cancelled() {
            return Err(HubError::Closed);
        }
        let text = serde_json::to_string(frame)?;
        self.outgoing
            .send(Message::Text(text))
            .await
            .map_err(|_| HubError::Closed)
    }
}

#[async_trait]
impl HubConnection for WsHubConnection {
    async fn send(&self, method: &str, args: Vec<Value>) -> Result<(), HubError> {
        self.write(&HubFrame::Send {
            method: method.to_string(),
            args,
        })
        .await
    }

    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, HubError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        let frame = HubFrame::Invoke {
            id,
            method: method.to_string(),
            args,
        };
        if let Err(e) = self.write(&frame).await {
            self.pending.remove(&id);
            return Err(e);
        }
        match rx.await {
            Ok(Err(HubError::Remote { message, .. })) => Err(HubError::Remote {
                method: method.to_string(),
                message,
            }),
            Ok(result) => result,
            Err(_) => Err(HubError::Closed),
        }
    }

    async fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for WsHubConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
