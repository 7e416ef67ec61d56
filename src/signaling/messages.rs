//! Message Types für das Signaling-Protokoll
//!
//! Umschlag (`SignalingMessage`) für Offer, Answer, ICE Candidate und
//! Hangup zwischen genau zwei Peers, sowie die Frames des WebSocket-Relays.

use crate::call::{CallId, UserId};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use super::SignalingError;

// ============================================================================
// ENVELOPE
// ============================================================================

/// Art der Signaling-Nachricht
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
    Hangup,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
            Self::Hangup => "hangup",
        }
    }
}

impl FromStr for SignalKind {
    type Err = crate::call::InvalidValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "offer" => Ok(Self::Offer),
            "answer" => Ok(Self::Answer),
            "ice-candidate" => Ok(Self::IceCandidate),
            "hangup" => Ok(Self::Hangup),
            other => Err(crate::call::InvalidValue {
                field: "signal kind",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fingerprint für die Deduplizierung über beide Zustellwege
pub type DedupKey = [u8; 32];

/// Signaling-Umschlag, geroutet über die Call-ID
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    pub call_id: CallId,
    pub sender_id: UserId,
    pub kind: SignalKind,
    /// Serialisierte Session Description bzw. ICE Candidate (JSON), leer bei Hangup
    pub payload: String,
    pub seq: u64,
    pub sent_at: DateTime<Utc>,
}

impl SignalingMessage {
    pub fn new(
        call_id: CallId,
        sender_id: UserId,
        kind: SignalKind,
        payload: String,
        seq: u64,
    ) -> Self {
        Self {
            call_id,
            sender_id,
            kind,
            payload,
            seq,
            sent_at: Utc::now(),
        }
    }

    /// Erstellt eine Nachricht mit JSON-Payload
    pub fn with_payload<T: Serialize>(
        call_id: CallId,
        sender_id: UserId,
        kind: SignalKind,
        payload: &T,
        seq: u64,
    ) -> Result<Self, SignalingError> {
        let payload = serde_json::to_string(payload)
            .map_err(|e| SignalingError::InvalidPayload(e.to_string()))?;
        Ok(Self::new(call_id, sender_id, kind, payload, seq))
    }

    /// Dekodiert die JSON-Payload
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, SignalingError> {
        serde_json::from_str(&self.payload).map_err(|e| {
            SignalingError::InvalidPayload(format!("{} payload: {}", self.kind, e))
        })
    }

    /// SHA-256 über (Call-ID, Sender, Art, Payload)
    ///
    /// Sequenznummer und Zeitstempel fließen nicht ein.
    pub fn dedup_key(&self) -> DedupKey {
        let mut hasher = Sha256::new();
        hasher.update(self.call_id.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.sender_id.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.kind.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.payload.as_bytes());
        hasher.finalize().into()
    }
}

/// Broadcast-Kanal eines Calls
pub fn channel_name(call_id: &CallId) -> String {
    format!("call:{}", call_id)
}

// ============================================================================
// NEGOTIATION PAYLOADS
// ============================================================================

/// Art der Session Description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session Description (Payload von Offer/Answer)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE Candidate (Payload von `ice-candidate`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

// ============================================================================
// RELAY FRAMES (WebSocket)
// ============================================================================

/// Frames zwischen Client und WebSocket-Relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayFrame {
    /// Kanal betreten
    Join { channel: String },

    /// Kanal verlassen
    Leave { channel: String },

    /// Nachricht an alle Teilnehmer des Kanals
    Broadcast {
        channel: String,
        payload: SignalingMessage,
    },

    /// Heartbeat
    Ping,

    /// Heartbeat Antwort
    Pong,

    /// Fehler vom Relay
    Error { message: String },
}

// ============================================================================
// TESTS
// ============================================================================
