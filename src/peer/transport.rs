//! Abstraktion der Peer-to-Peer Transport-Primitive
//!
//! Eine Implementierung kapselt genau eine Verbindung. Ereignisse (lokale
//! Kandidaten, Zustandswechsel, Remote-Tracks) kommen über einen Channel.

use crate::ice::IceServerSet;
use crate::media::{MediaKind, MediaTrack};
use crate::signaling::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::PeerError;

/// Zustand der Medienverbindung
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    /// Vorübergehend, beendet den Call nicht
    Disconnected,
    /// Endgültig, führt nach der Grace-Periode zum Auflegen
    Failed,
    Closed,
}

/// Ereignisse einer Transport-Instanz
#[derive(Debug, Clone)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    /// ICE Gathering abgeschlossen
    GatheringComplete,
    StateChanged(ConnectionState),
    RemoteTrack { id: String, kind: MediaKind },
}

/// Eine Peer Connection
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), PeerError>;

    /// Tauscht einen gesendeten Track aus, ohne neu zu verhandeln
    async fn replace_track(&self, old: &MediaTrack, new: &MediaTrack) -> Result<(), PeerError>;

    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    async fn set_local_description(&self, description: SessionDescription)
        -> Result<(), PeerError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError>;

    /// Aktuelle lokale Description inkl. bisher gesammelter Kandidaten
    async fn local_description(&self) -> Option<SessionDescription>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    async fn close(&self) -> Result<(), PeerError>;
}

/// Erzeugt Transport-Instanzen mit der aufgelösten ICE-Konfiguration
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        ice: &IceServerSet,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, PeerError>;
}
