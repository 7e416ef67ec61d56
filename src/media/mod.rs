//! Media Module - Lokale Kamera- und Mikrofon-Streams
//!
//! Dieses Modul verwaltet:
//! - Constraints, Tracks und Streams
//! - Gerätezugriff (synthetisch oder cpal-Mikrofon)
//! - Pre-Warming vor dem Annehmen

#[cfg(feature = "native-audio")]
mod native;
pub mod pcmu;
mod prewarm;
mod stream;
mod synthetic;

use thiserror::Error;

#[cfg(feature = "native-audio")]
pub use native::{CpalMediaDevices, FRAME_SIZE, SAMPLE_RATE};
pub use prewarm::{MediaPrewarm, PrewarmPhase};
pub use stream::{
    AudioConstraints, DeviceInfo, FacingMode, MediaConstraints, MediaDevices, MediaKind,
    MediaStream, MediaTrack, SampleSource, VideoConstraints,
};
pub use synthetic::SyntheticMediaDevices;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Permission denied for {0}")]
    PermissionDenied(MediaKind),

    #[error("No {0} device available")]
    DeviceUnavailable(MediaKind),

    #[error("Capture failed: {0}")]
    Capture(String),
}
