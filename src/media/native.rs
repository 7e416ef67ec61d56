//! Native Mikrofon-Aufnahme (Feature `native-audio`)
//!
//! Verwendet cpal für Cross-Platform Audio Input. Der cpal-Stream ist nicht
//! Send und lebt deshalb auf einem eigenen Thread, bis der Track gestoppt
//! wird. Die Samples (mono, 48 kHz) liest der Transport über die
//! `SampleSource` des Tracks. Video wird nicht unterstützt.

use super::stream::{
    DeviceInfo, MediaConstraints, MediaDevices, MediaKind, MediaStream, MediaTrack, SampleSource,
};
use super::MediaError;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz ist der Standard für beste Qualität)
pub const SAMPLE_RATE: u32 = 48000;

/// Frame Size in Samples (20ms @ 48kHz = 960 samples)
pub const FRAME_SIZE: usize = 960;

const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

// ============================================================================
// CAPTURE BUFFER
// ============================================================================

/// Ringpuffer zwischen cpal-Callback und RTP-Track
struct CaptureBuffer {
    samples: Mutex<HeapRb<f32>>,
}

impl CaptureBuffer {
    fn new() -> Self {
        Self {
            samples: Mutex::new(HeapRb::new(RING_BUFFER_SIZE)),
        }
    }

    /// Volle Puffer verwerfen neue Samples
    fn push(&self, samples: impl IntoIterator<Item = f32>) {
        let mut buffer = self.samples.lock();
        for sample in samples {
            let _ = buffer.try_push(sample);
        }
    }
}

impl SampleSource for CaptureBuffer {
    fn read_frame(&self) -> Option<Vec<f32>> {
        let mut buffer = self.samples.lock();
        if buffer.occupied_len() < FRAME_SIZE {
            return None;
        }
        Some((0..FRAME_SIZE).filter_map(|_| buffer.try_pop()).collect())
    }
}

// ============================================================================
// CPAL DEVICES
// ============================================================================

/// Geräte über cpal (nur Mikrofon)
#[derive(Debug, Default)]
pub struct CpalMediaDevices;

impl CpalMediaDevices {
    pub fn new() -> Self {
        Self
    }

    /// Öffnet das Standard-Mikrofon, die Samples hängen als Quelle am Track
    fn open_microphone() -> Result<MediaTrack, MediaError> {
        let buffer = Arc::new(CaptureBuffer::new());
        let source: Arc<dyn SampleSource> = Arc::clone(&buffer);
        let track = MediaTrack::new(MediaKind::Audio, "Default Microphone", None).with_source(source);

        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), MediaError>>();
        let thread_track = track.clone();
        std::thread::Builder::new()
            .name("mic-capture".into())
            .spawn(move || {
                let stream = match Self::build_input_stream(&thread_track, buffer) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                while !thread_track.is_stopped() {
                    std::thread::sleep(STOP_POLL_INTERVAL);
                }
                drop(stream);
                tracing::info!("Audio capture stopped");
            })
            .map_err(|e| MediaError::Capture(e.to_string()))?;

        ready_rx
            .recv()
            .map_err(|_| MediaError::Capture("capture thread exited".to_string()))??;
        Ok(track)
    }

    fn build_input_stream(
        track: &MediaTrack,
        buffer: Arc<CaptureBuffer>,
    ) -> Result<cpal::Stream, MediaError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(MediaError::DeviceUnavailable(MediaKind::Audio))?;
        let config = find_best_input_config(&device)?;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let track = track.clone();
        let source_sample_rate = config.sample_rate.0;
        let channels = usize::from(config.channels.max(1));

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    // Stumm geschaltet
                    if data.is_empty() || !track.is_enabled() {
                        return;
                    }
                    let mono: Vec<f32> = data
                        .chunks(channels)
                        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
                        .collect();
                    buffer.push(resample(&mono, source_sample_rate, SAMPLE_RATE));
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(|e| MediaError::Capture(e.to_string()))?;

        stream
            .play()
            .map_err(|e| MediaError::Capture(e.to_string()))?;
        Ok(stream)
    }
}

#[async_trait]
impl MediaDevices for CpalMediaDevices {
    async fn enumerate(&self) -> Result<Vec<DeviceInfo>, MediaError> {
        tokio::task::spawn_blocking(|| -> Result<Vec<DeviceInfo>, MediaError> {
            let host = cpal::default_host();
            let devices = host
                .input_devices()
                .map_err(|e| MediaError::Capture(e.to_string()))?;
            Ok(devices
                .enumerate()
                .map(|(i, device)| {
                    let label = device.name().unwrap_or_else(|_| format!("Microphone {}", i));
                    DeviceInfo {
                        id: format!("mic-{}", i),
                        label,
                        kind: MediaKind::Audio,
                        facing: None,
                    }
                })
                .collect())
        })
        .await
        .map_err(|e| MediaError::Capture(e.to_string()))?
    }

    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaStream, MediaError> {
        if constraints.wants_video() {
            return Err(MediaError::DeviceUnavailable(MediaKind::Video));
        }
        if constraints.audio.is_none() {
            return Ok(MediaStream::new(Vec::new()));
        }

        let track = tokio::task::spawn_blocking(Self::open_microphone)
            .await
            .map_err(|e| MediaError::Capture(e.to_string()))??;
        Ok(MediaStream::new(vec![track]))
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Einfaches Linear-Resampling
fn resample(data: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate {
        return data.to_vec();
    }
    let ratio = target_rate as f32 / source_rate as f32;
    let new_len = (data.len() as f32 * ratio) as usize;
    (0..new_len)
        .map(|i| {
            let src_idx = i as f32 / ratio;
            let idx = src_idx as usize;
            let frac = src_idx - idx as f32;
            let s1 = data.get(idx).copied().unwrap_or(0.0);
            let s2 = data.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}

fn find_best_input_config(device: &Device) -> Result<StreamConfig, MediaError> {
    let configs = device
        .supported_input_configs()
        .map_err(|e| MediaError::Capture(e.to_string()))?;
    select_best_config(configs.collect())
}

/// Priorität: 48kHz > höchste Rate, F32 > andere
fn select_best_config(
    configs: Vec<SupportedStreamConfigRange>,
) -> Result<StreamConfig, MediaError> {
    let target_rate = cpal::SampleRate(SAMPLE_RATE);
    let in_range = |c: &SupportedStreamConfigRange| {
        c.min_sample_rate() <= target_rate && c.max_sample_rate() >= target_rate
    };

    if let Some(config) = configs
        .iter()
        .find(|c| in_range(*c) && c.sample_format() == SampleFormat::F32)
    {
        return Ok(config.with_sample_rate(target_rate).into());
    }

    if let Some(config) = configs.iter().find(|c| c.sample_format() == SampleFormat::F32) {
        let rate = if in_range(config) {
            target_rate
        } else {
            config.max_sample_rate()
        };
        return Ok(config.with_sample_rate(rate).into());
    }

    Err(MediaError::Capture(
        "No suitable audio configuration found".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resample_doubles_length() {
        let out = resample(&[0.0, 1.0, 0.0, 1.0], 24_000, 48_000);
        assert_eq!(out.len(), 8);
        assert!((out[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_resample_passthrough() {
        assert_eq!(resample(&[0.25, 0.5], 48_000, 48_000), vec![0.25, 0.5]);
    }

    #[test]
    fn test_capture_buffer_hands_out_full_frames() {
        let buffer = CaptureBuffer::new();
        buffer.push(vec![0.5; FRAME_SIZE - 1]);
        assert!(buffer.read_frame().is_none());

        buffer.push([0.5]);
        let frame = buffer.read_frame().unwrap();
        assert_eq!(frame.len(), FRAME_SIZE);
        assert!(buffer.read_frame().is_none());
    }
}
