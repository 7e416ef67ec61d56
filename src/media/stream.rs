//! Lokale Medien: Constraints, Tracks und Streams

use crate::call::CallType;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use super::MediaError;

// ============================================================================
// CONSTRAINTS
// ============================================================================

/// Art eines Tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

/// Kamera-Ausrichtung
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    /// Frontkamera
    User,
    /// Rückkamera
    Environment,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoConstraints {
    pub max_width: u32,
    pub max_height: u32,
    pub max_frame_rate: u32,
    pub facing: FacingMode,
    /// Bestimmte Kamera, sonst nach `facing`
    pub device_id: Option<String>,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            max_width: 1280,
            max_height: 720,
            max_frame_rate: 30,
            facing: FacingMode::User,
            device_id: None,
        }
    }
}

/// Anforderung an lokale Medien
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: Option<AudioConstraints>,
    pub video: Option<VideoConstraints>,
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        Self {
            audio: Some(AudioConstraints::default()),
            video: None,
        }
    }

    pub fn audio_video() -> Self {
        Self {
            audio: Some(AudioConstraints::default()),
            video: Some(VideoConstraints::default()),
        }
    }

    /// Nur eine bestimmte Kamera (Kamerawechsel)
    pub fn camera(device_id: &str) -> Self {
        Self {
            audio: None,
            video: Some(VideoConstraints {
                device_id: Some(device_id.to_string()),
                ..VideoConstraints::default()
            }),
        }
    }

    pub fn for_call(call_type: CallType) -> Self {
        match call_type {
            CallType::Audio => Self::audio_only(),
            CallType::Video => Self::audio_video(),
        }
    }

    pub fn wants_video(&self) -> bool {
        self.video.is_some()
    }
}

// ============================================================================
// TRACKS & STREAMS
// ============================================================================

/// Aufgenommene PCM-Samples eines Audio-Tracks (48 kHz mono)
pub trait SampleSource: Send + Sync {
    /// Nächster vollständiger 20ms Frame, `None` solange keiner bereit ist
    fn read_frame(&self) -> Option<Vec<f32>>;
}

/// Lokaler Media-Track
///
/// Klone teilen sich Enabled/Stopped-Flags (wie Handles auf denselben Track).
#[derive(Clone)]
pub struct MediaTrack {
    pub id: String,
    pub kind: MediaKind,
    pub label: String,
    pub device_id: Option<String>,
    enabled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    source: Option<Arc<dyn SampleSource>>,
}

impl MediaTrack {
    pub fn new(kind: MediaKind, label: impl Into<String>, device_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            label: label.into(),
            device_id,
            enabled: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(false)),
            source: None,
        }
    }

    /// Hängt eine Sample-Quelle an (echtes Mikrofon)
    pub fn with_source(mut self, source: Arc<dyn SampleSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn source(&self) -> Option<Arc<dyn SampleSource>> {
        self.source.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Stoppt den Track, gibt `false` zurück wenn er schon gestoppt war
    pub fn stop(&self) -> bool {
        let was_running = !self.stopped.swap(true, Ordering::SeqCst);
        if was_running {
            tracing::debug!("Stopped {} track {}", self.kind, self.label);
        }
        was_running
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("label", &self.label)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .field("has_source", &self.source.is_some())
            .finish()
    }
}

/// Lokaler Stream (Menge von Tracks)
#[derive(Debug, Clone)]
pub struct MediaStream {
    pub id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tracks,
        }
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind == MediaKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind == MediaKind::Video)
    }

    pub fn has_video(&self) -> bool {
        self.video_tracks().next().is_some()
    }

    /// Passt der Stream zu den Constraints (gleiche Track-Arten)?
    pub fn satisfies(&self, constraints: &MediaConstraints) -> bool {
        let has_audio = self.audio_tracks().next().is_some();
        has_audio == constraints.audio.is_some() && self.has_video() == constraints.wants_video()
    }

    /// Ersetzt einen Track (Kamerawechsel), gibt den alten zurück
    pub fn replace_track(&mut self, old_id: &str, new: MediaTrack) -> Option<MediaTrack> {
        let slot = self.tracks.iter_mut().find(|t| t.id == old_id)?;
        Some(std::mem::replace(slot, new))
    }

    /// Stoppt alle Tracks (idempotent)
    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

// ============================================================================
// DEVICES
// ============================================================================

/// Ein Eingabegerät (Mikrofon oder Kamera)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: String,
    pub label: String,
    pub kind: MediaKind,
    pub facing: Option<FacingMode>,
}

/// Zugriff auf Kamera und Mikrofon
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn enumerate(&self) -> Result<Vec<DeviceInfo>, MediaError>;

    /// Öffnet einen Stream gemäß `constraints`
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaStream, MediaError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraints_for_call_type() {
        let video = MediaConstraints::for_call(CallType::Video);
        let limits = video.video.as_ref().unwrap();
        assert_eq!((limits.max_width, limits.max_height, limits.max_frame_rate), (1280, 720, 30));
        assert!(video.audio.as_ref().unwrap().echo_cancellation);
        assert!(!MediaConstraints::for_call(CallType::Audio).wants_video());
    }

    #[test]
    fn test_track_clones_share_state() {
        let track = MediaTrack::new(MediaKind::Audio, "mic", None);
        let handle = track.clone();

        handle.set_enabled(false);
        assert!(!track.is_enabled());

        assert!(track.stop());
        assert!(!handle.stop());
        assert!(handle.is_stopped());
    }

    #[test]
    fn test_stream_satisfies() {
        let stream = MediaStream::new(vec![MediaTrack::new(MediaKind::Audio, "mic", None)]);
        assert!(stream.satisfies(&MediaConstraints::audio_only()));
        assert!(!stream.satisfies(&MediaConstraints::audio_video()));
    }

    #[test]
    fn test_replace_track() {
        let old = MediaTrack::new(MediaKind::Video, "front", Some("cam-0".into()));
        let mut stream = MediaStream::new(vec![old.clone()]);
        let new = MediaTrack::new(MediaKind::Video, "back", Some("cam-1".into()));

        let replaced = stream.replace_track(&old.id, new.clone()).unwrap();
        assert_eq!(replaced.id, old.id);
        assert_eq!(stream.video_tracks().next().unwrap().id, new.id);
        assert!(stream.replace_track("missing", new).is_none());
    }
}
