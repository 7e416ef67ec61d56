//! Signaling Module - Redundante Zustellung zwischen zwei Peers
//!
//! Dieses Modul verwaltet den Nachrichtenaustausch für die Verhandlung:
//! - Broadcast-Pfad (In-Process Hub oder WebSocket-Relay)
//! - Dauerhafter Polling-Fallback über die Call-Datenbank
//! - Zusammenführung und Deduplizierung beim Empfänger

mod broadcast;
mod fallback;
mod messages;
mod transport;
mod websocket;

pub use broadcast::BroadcastHub;
pub use fallback::PolledSignalPath;
pub use messages::*;
pub use transport::{
    PathSubscription, RedundantSignaling, SignalPath, SignalSubscription, SignalingError,
};
pub use websocket::WebSocketRelay;
