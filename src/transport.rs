//! Transport façade: a narrow bidirectional byte-stream boundary to a single
//! remote endpoint. Not on the membership/election critical path — used by
//! external collaborators to ship application messages outside the mesh.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// A message delivered to [`TransportCallbacks::on_message`].
#[derive(Debug, Clone)]
pub enum TransportMessage {
    Text(String),
    Binary(Vec<u8>),
}

/// Callbacks a collaborator implements to observe connection lifecycle and
/// inbound traffic. Mirrors the original's `on_connect`/`on_disconnect`/
/// `on_message`/`on_error` callback set.
#[async_trait]
pub trait TransportCallbacks: Send + Sync {
    async fn on_open(&self) {}
    async fn on_message(&self, _message: TransportMessage) {}
    async fn on_close(&self, _reason: Option<String>) {}
    async fn on_error(&self, _message: &str) {}
}

/// No-op callback set for callers with no interest in events.
pub struct NoopTransportCallbacks;

#[async_trait]
impl TransportCallbacks for NoopTransportCallbacks {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Disconnected,
    Connected,
}

/// Abstract bidirectional byte-stream boundary. The core depends only on
/// this trait; [`WebSocketTransport`] is the one concrete implementation
/// this crate ships.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(self: Arc<Self>, url: &str) -> Result<()>;
    async fn send_text(&self, text: &str) -> Result<()>;
    async fn send_binary(&self, data: &[u8]) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// `tokio-tungstenite`-backed WebSocket client, grounded on the original's
/// upgrade-framed single-remote client.
///
/// Reconnection is deliberately not handled here (full RPC semantics with
/// automatic retry is out of scope): a dropped connection surfaces via
/// `on_close`, and it is the collaborator's job to call `connect` again.
pub struct WebSocketTransport {
    callbacks: Arc<dyn TransportCallbacks>,
    outbound: RwLock<Option<mpsc::UnboundedSender<Message>>>,
    state: RwLock<ConnectionState>,
}

impl WebSocketTransport {
    pub fn new(callbacks: Arc<dyn TransportCallbacks>) -> Self {
        Self {
            callbacks,
            outbound: RwLock::new(None),
            state: RwLock::new(ConnectionState::Disconnected),
        }
    }

    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ConnectionState::Connected
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(self: Arc<Self>, url: &str) -> Result<()> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| Error::Transport {
                message: format!("connect to {url} failed: {e}"),
            })?;

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        *self.outbound.write().await = Some(tx);
        *self.state.write().await = ConnectionState::Connected;
        info!(url, "transport connected");
        self.callbacks.on_open().await;

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = write.send(message).await {
                    warn!(error = %e, "transport send failed, closing writer");
                    break;
                }
            }
        });

        let this = Arc::clone(&self);
        tokio::spawn(async move {
            let mut close_reason = None;
            loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        this.callbacks.on_message(TransportMessage::Text(text.to_string())).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        this.callbacks.on_message(TransportMessage::Binary(data.to_vec())).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        close_reason = frame.map(|f| f.reason.to_string());
                        break;
                    }
                    Some(Ok(_)) => continue, // ping/pong handled by tungstenite internally
                    Some(Err(e)) => {
                        debug!(error = %e, "transport read error");
                        this.callbacks.on_error(&e.to_string()).await;
                        close_reason = Some(e.to_string());
                        break;
                    }
                    None => break,
                }
            }
            *this.state.write().await = ConnectionState::Disconnected;
            *this.outbound.write().await = None;
            this.callbacks.on_close(close_reason).await;
        });

        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        let guard = self.outbound.read().await;
        let sender = guard.as_ref().ok_or_else(|| Error::Transport {
            message: "send_text on a closed transport".to_string(),
        })?;
        sender
            .send(Message::Text(text.to_string().into()))
            .map_err(|_| Error::Transport {
                message: "transport writer task is gone".to_string(),
            })
    }

    async fn send_binary(&self, data: &[u8]) -> Result<()> {
        let guard = self.outbound.read().await;
        let sender = guard.as_ref().ok_or_else(|| Error::Transport {
            message: "send_binary on a closed transport".to_string(),
        })?;
        sender
            .send(Message::Binary(data.to_vec().into()))
            .map_err(|_| Error::Transport {
                message: "transport writer task is gone".to_string(),
            })
    }

    async fn close(&self) -> Result<()> {
        let sender = self.outbound.write().await.take();
        if let Some(sender) = sender {
            let _ = sender.send(Message::Close(None));
        }
        *self.state.write().await = ConnectionState::Disconnected;
        Ok(())
    }
}
