//! WebSocket-Relay als Broadcast-Pfad
//!
//! Verwaltet die WebSocket-Verbindung zum Relay:
//! - Kanäle per `join`/`leave` betreten und verlassen
//! - `broadcast` Frames an alle Teilnehmer eines Kanals
//! - Heartbeat alle 25 Sekunden

use super::messages::{channel_name, RelayFrame, SignalingMessage};
use super::transport::{PathSubscription, SignalPath, SignalingError};
use crate::call::CallId;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

type Routes = Arc<Mutex<HashMap<String, Vec<(u64, mpsc::UnboundedSender<SignalingMessage>)>>>>;

// ============================================================================
// RELAY STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct RelayState {
    is_connected: bool,
}

// ============================================================================
// WEBSOCKET RELAY
// ============================================================================

/// WebSocket Client für das Broadcast-Relay
pub struct WebSocketRelay {
    url: String,
    state: Arc<RwLock<RelayState>>,
    tx: mpsc::Sender<String>,
    routes: Routes,
    next_route: AtomicU64,
    tasks: Vec<JoinHandle<()>>,
}

impl WebSocketRelay {
    /// Verbindet mit dem Relay und startet Read-, Write- und Heartbeat-Task
    pub async fn connect(url: &str) -> Result<Arc<Self>, SignalingError> {
        let parsed =
            url::Url::parse(url).map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(SignalingError::ConnectionFailed(format!(
                "unsupported scheme '{}'",
                parsed.scheme()
            )));
        }

        tracing::info!("Connecting to signaling relay: {}", url);

        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel::<String>(100);

        let state = Arc::new(RwLock::new(RelayState { is_connected: true }));
        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));

        // Read-Task
        let read_state = Arc::clone(&state);
        let read_routes = Arc::clone(&routes);
        let read_task = tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<RelayFrame>(&text) {
                        Ok(frame) => Self::handle_frame(frame, &read_routes),
                        Err(e) => tracing::debug!("Ignoring unknown relay frame: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("Relay closed the connection");
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

        // Write-Task
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
        });

        // Heartbeat-Task
        let heartbeat_state = Arc::clone(&state);
        let heartbeat_tx = tx.clone();
        let heartbeat_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                if !heartbeat_state.read().is_connected {
                    break;
                }
                let Ok(ping) = serde_json::to_string(&RelayFrame::Ping) else {
                    break;
                };
                if heartbeat_tx.send(ping).await.is_err() {
                    break;
                }
            }
        });

        Ok(Arc::new(Self {
            url: url.to_string(),
            state,
            tx,
            routes,
            next_route: AtomicU64::new(0),
            tasks: vec![read_task, write_task, heartbeat_task],
        }))
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    fn handle_frame(frame: RelayFrame, routes: &Routes) {
        match frame {
            RelayFrame::Broadcast { channel, payload } => {
                let mut routes = routes.lock();
                if let Some(sinks) = routes.get_mut(&channel) {
                    sinks.retain(|(_, sink)| sink.send(payload.clone()).is_ok());
                }
            }
            RelayFrame::Error { message } => {
                tracing::warn!("Relay error: {}", message);
            }
            RelayFrame::Pong => {}
            other => tracing::debug!("Unexpected relay frame: {:?}", other),
        }
    }

    /// Sendet einen Frame (non-blocking, verwendet try_send)
    fn send_frame(tx: &mpsc::Sender<String>, frame: &RelayFrame) -> Result<(), SignalingError> {
        let text =
            serde_json::to_string(frame).map_err(|e| SignalingError::SendFailed(e.to_string()))?;
        tx.try_send(text)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }
}

#[async_trait]
impl SignalPath for WebSocketRelay {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn publish(&self, message: &SignalingMessage) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }

        let frame = RelayFrame::Broadcast {
            channel: channel_name(&message.call_id),
            payload: message.clone(),
        };
        let text =
            serde_json::to_string(&frame).map_err(|e| SignalingError::SendFailed(e.to_string()))?;
        self.tx
            .send(text)
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    async fn subscribe(
        &self,
        call_id: &CallId,
        sink: mpsc::UnboundedSender<SignalingMessage>,
    ) -> Result<PathSubscription, SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }

        let channel = channel_name(call_id);
        let route_id = self.next_route.fetch_add(1, Ordering::Relaxed);

        let first = {
            let mut routes = self.routes.lock();
            let sinks = routes.entry(channel.clone()).or_default();
            sinks.push((route_id, sink));
            sinks.len() == 1
        };
        if first {
            Self::send_frame(&self.tx, &RelayFrame::Join {
                channel: channel.clone(),
            })?;
        }

        let routes = Arc::clone(&self.routes);
        let tx = self.tx.clone();
        Ok(PathSubscription::new(Vec::new()).with_cleanup(move || {
            let last = {
                let mut routes = routes.lock();
                match routes.get_mut(&channel) {
                    Some(sinks) => {
                        sinks.retain(|(id, _)| *id != route_id);
                        let empty = sinks.is_empty();
                        if empty {
                            routes.remove(&channel);
                        }
                        empty
                    }
                    None => false,
                }
            };
            if last {
                if let Err(e) = Self::send_frame(&tx, &RelayFrame::Leave { channel }) {
                    tracing::debug!("Could not leave relay channel: {}", e);
                }
            }
        }))
    }
}

impl Drop for WebSocketRelay {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl std::fmt::Debug for WebSocketRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketRelay")
            .field("url", &self.url)
            .field("state", &*self.state.read())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
