//! Synthetische Geräte
//!
//! Liefert Tracks ohne echte Hardware. Verfügbarkeit und Berechtigungen
//! lassen sich pro Medienart steuern, dadurch sind Fehlerpfade testbar.

use super::stream::{
    DeviceInfo, FacingMode, MediaConstraints, MediaDevices, MediaKind, MediaStream, MediaTrack,
};
use super::MediaError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug)]
struct DeviceState {
    devices: Vec<DeviceInfo>,
    denied: Vec<MediaKind>,
}

/// Geräte ohne Hardware
#[derive(Debug)]
pub struct SyntheticMediaDevices {
    state: Mutex<DeviceState>,
    acquisitions: AtomicUsize,
}

impl SyntheticMediaDevices {
    /// Ein Mikrofon, Front- und Rückkamera
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DeviceState {
                devices: vec![
                    DeviceInfo {
                        id: "mic-0".into(),
                        label: "Synthetic Microphone".into(),
                        kind: MediaKind::Audio,
                        facing: None,
                    },
                    DeviceInfo {
                        id: "cam-front".into(),
                        label: "Synthetic Front Camera".into(),
                        kind: MediaKind::Video,
                        facing: Some(FacingMode::User),
                    },
                    DeviceInfo {
                        id: "cam-back".into(),
                        label: "Synthetic Back Camera".into(),
                        kind: MediaKind::Video,
                        facing: Some(FacingMode::Environment),
                    },
                ],
                denied: Vec::new(),
            }),
            acquisitions: AtomicUsize::new(0),
        }
    }

    /// Entfernt alle Geräte einer Art
    pub fn without(self, kind: MediaKind) -> Self {
        self.state.lock().devices.retain(|d| d.kind != kind);
        self
    }

    /// Verweigert die Berechtigung für eine Art
    pub fn deny(&self, kind: MediaKind) {
        let mut state = self.state.lock();
        if !state.denied.contains(&kind) {
            state.denied.push(kind);
        }
    }

    /// Anzahl erfolgreicher `acquire` Aufrufe
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    fn open(
        state: &DeviceState,
        kind: MediaKind,
        pick: impl Fn(&DeviceInfo) -> bool,
    ) -> Result<MediaTrack, MediaError> {
        if state.denied.contains(&kind) {
            return Err(MediaError::PermissionDenied(kind));
        }
        let device = state
            .devices
            .iter()
            .filter(|d| d.kind == kind)
            .find(|&d| pick(d))
            .or_else(|| state.devices.iter().find(|d| d.kind == kind))
            .ok_or(MediaError::DeviceUnavailable(kind))?;

        Ok(MediaTrack::new(kind, device.label.clone(), Some(device.id.clone())))
    }
}

impl Default for SyntheticMediaDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDevices for SyntheticMediaDevices {
    async fn enumerate(&self) -> Result<Vec<DeviceInfo>, MediaError> {
        Ok(self.state.lock().devices.clone())
    }

    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaStream, MediaError> {
        let mut tracks = Vec::new();
        {
            let state = self.state.lock();
            if constraints.audio.is_some() {
                tracks.push(Self::open(&state, MediaKind::Audio, |_| true)?);
            }
            if let Some(video) = &constraints.video {
                tracks.push(Self::open(&state, MediaKind::Video, |d| match &video.device_id {
                    Some(id) => &d.id == id,
                    None => d.facing == Some(video.facing),
                })?);
            }
        }

        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(MediaStream::new(tracks))
    }
}
