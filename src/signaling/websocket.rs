//! WebSocket signaling transport
//!
//! Connects to the relay server and exchanges JSON envelopes:
//! - one writer task, so messages leave in send order
//! - one reader task, dispatching envelopes addressed to us

use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use async_trait::async_trait;

use super::messages::SignalingEnvelope;
use super::port::{MessageHandler, SignalingPort};
use crate::error::SignalingError;
use crate::session::ParticipantId;

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
}

pub struct WebSocketSignaling {
    server_url: Url,
    local_id: ParticipantId,
    state: Arc<RwLock<ClientState>>,
    tx: mpsc::Sender<String>,
    handlers: Arc<RwLock<Vec<MessageHandler>>>,
}

impl WebSocketSignaling {
    /// Opens the socket; `http(s)` URLs are mapped to `ws(s)`
    pub async fn connect(
        server_url: &str,
        local_id: impl Into<ParticipantId>,
    ) -> Result<Self, SignalingError> {
        let server_url = websocket_url(server_url)?;
        let local_id = local_id.into();

        tracing::info!("Connecting to signaling server: {}", server_url);

        let (ws_stream, _) = connect_async(server_url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel::<String>(100);

        let state = Arc::new(RwLock::new(ClientState { is_connected: true }));
        let handlers: Arc<RwLock<Vec<MessageHandler>>> = Arc::new(RwLock::new(Vec::new()));

        let read_state = Arc::clone(&state);
        let read_handlers = Arc::clone(&handlers);
        let read_local_id = local_id.clone();
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match SignalingEnvelope::from_json(&text) {
                        Ok(envelope) if envelope.to == read_local_id => {
                            let snapshot: Vec<MessageHandler> =
                                read_handlers.read().iter().cloned().collect();
                            for handler in snapshot {
                                handler(envelope.clone());
                            }
                        }
                        Ok(envelope) => {
                            tracing::debug!("Dropping envelope addressed to {}", envelope.to);
                        }
                        Err(e) => tracing::warn!("Unparseable signaling message: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            read_state.write().is_connected = false;
        });

        let write_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            write_state.write().is_connected = false;
        });

        Ok(Self {
            server_url,
            local_id,
            state,
            tx,
            handlers,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }
}

#[async_trait]
impl SignalingPort for WebSocketSignaling {
    async fn send(&self, envelope: SignalingEnvelope) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }
        let text = envelope.to_json()?;
        self.tx
            .send(text)
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    fn on_message(&self, handler: MessageHandler) {
        self.handlers.write().push(handler);
    }
}

impl std::fmt::Debug for WebSocketSignaling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketSignaling")
            .field("server_url", &self.server_url.as_str())
            .field("local_id", &self.local_id)
            .field("state", &*self.state.read())
            .finish()
    }
}

fn websocket_url(raw: &str) -> Result<Url, SignalingError> {
    let mut url = Url::parse(raw).map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SignalingError::ConnectionFailed(format!(
                "unsupported scheme: {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SignalingError::ConnectionFailed(format!("cannot use scheme {scheme}")))?;
    Ok(url)
}
