//! Peer Module - Eine Medienverbindung pro Call
//!
//! Dieses Modul verwaltet:
//! - Transport-Abstraktion (webrtc-rs oder In-Process Loopback)
//! - Offer/Answer/ICE-Verhandlung über das Signaling
//! - Mute, Video und Kamerawechsel

mod loopback;
mod manager;
mod rtc;
mod transport;

use crate::media::MediaError;
use crate::signaling::SignalingError;
use thiserror::Error;

pub use loopback::LoopbackNetwork;
pub use manager::{
    ManagerTimings, PeerConnectionManager, PeerDeps, RemoteTrack, SessionEvent, SessionOptions,
};
pub use rtc::{rtc_configuration, RtcTransportFactory};
pub use transport::{ConnectionState, PeerTransport, TransportEvent, TransportFactory};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Invalid session description: {0}")]
    InvalidSdp(String),

    #[error("Unknown track: {0}")]
    UnknownTrack(String),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("No active call")]
    NoActiveCall,

    #[error("Call already started")]
    AlreadyStarted,

    #[error("No video track")]
    NoVideoTrack,

    #[error("No other camera available")]
    NoAlternateCamera,

    #[error("Call was ended during setup")]
    Cancelled,
}
