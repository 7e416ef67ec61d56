//! WebRTC Transport (webrtc-rs)
//!
//! Eine `RTCPeerConnection` pro Call, konfiguriert mit dem aufgelösten
//! ICE-Server Set. Lokale Tracks werden als RTP-Tracks angehängt, ein
//! Audio-Track mit `SampleSource` wird als PCMU gesendet.

use super::transport::{ConnectionState, PeerTransport, TransportEvent, TransportFactory};
use super::PeerError;
use crate::ice::{IceServerSet, IceTransportPolicy};
use crate::media::pcmu::{self, FRAME_DURATION, PCMU_CLOCK_RATE};
use crate::media::{MediaKind, MediaTrack, SampleSource};
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

const STREAM_ID: &str = "social-calls";

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Übersetzt das Server-Set in eine `RTCConfiguration`
pub fn rtc_configuration(ice: &IceServerSet) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice
            .servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect(),
        ice_transport_policy: match ice.policy {
            IceTransportPolicy::All => RTCIceTransportPolicy::All,
            IceTransportPolicy::Relay => RTCIceTransportPolicy::Relay,
        },
        ice_candidate_pool_size: ice.pool_size,
        ..Default::default()
    }
}

fn map_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        _ => None,
    }
}

fn webrtc_error(e: webrtc::Error) -> PeerError {
    PeerError::WebRtc(e.to_string())
}

// ============================================================================
// FACTORY
// ============================================================================

/// Erzeugt webrtc-rs Peer Connections
pub struct RtcTransportFactory {
    api: API,
}

impl RtcTransportFactory {
    pub fn new() -> Result<Self, PeerError> {
        // Media Engine mit Standard-Codecs (Opus, VP8, ...)
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(webrtc_error)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry =
            register_default_interceptors(registry, &mut media_engine).map_err(webrtc_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api })
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        ice: &IceServerSet,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, PeerError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(rtc_configuration(ice))
                .await
                .map_err(webrtc_error)?,
        );

        register_handlers(&pc, events);

        Ok(Arc::new(RtcTransport {
            pc,
            senders: Mutex::new(HashMap::new()),
            pumps: Mutex::new(HashMap::new()),
        }))
    }
}

/// Registriert Event Handler für die Peer Connection
fn register_handlers(pc: &Arc<RTCPeerConnection>, events: mpsc::UnboundedSender<TransportEvent>) {
    // Connection State Handler
    let state_events = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!("Peer connection state: {:?}", s);
        if let Some(state) = map_state(s) {
            let _ = state_events.send(TransportEvent::StateChanged(state));
        }
        Box::pin(async {})
    }));

    // ICE Candidate Handler (None = Gathering abgeschlossen)
    let candidate_events = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        match candidate {
            Some(c) => match c.to_json() {
                Ok(init) => {
                    let _ = candidate_events.send(TransportEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(e) => tracing::warn!("Could not serialize local candidate: {}", e),
            },
            None => {
                let _ = candidate_events.send(TransportEvent::GatheringComplete);
            }
        }
        Box::pin(async {})
    }));

    // Track Handler (eingehende Medien)
    let track_events = events;
    let track_counter = Arc::new(AtomicU64::new(0));
    pc.on_track(Box::new(move |track, _, _| {
        let kind = match track.kind() {
            RTPCodecType::Video => MediaKind::Video,
            _ => MediaKind::Audio,
        };
        let n = track_counter.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Received remote {} track", kind);
        let _ = track_events.send(TransportEvent::RemoteTrack {
            id: format!("remote-{}-{}", kind, n),
            kind,
        });
        Box::pin(async {})
    }));
}

// ============================================================================
// TRANSPORT
// ============================================================================

struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    /// Sender pro lokalem Track (für replace_track)
    senders: Mutex<HashMap<String, Arc<RTCRtpSender>>>,
    /// Sample-Pumpen pro Track mit Quelle
    pumps: Mutex<HashMap<String, JoinHandle<()>>>,
}

/// Liest Frames aus der Quelle und schreibt sie als PCMU-Samples, bis der
/// Track gestoppt wird
fn spawn_sample_pump(
    track: MediaTrack,
    source: Arc<dyn SampleSource>,
    rtp: Arc<TrackLocalStaticSample>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(FRAME_DURATION);
        while !track.is_stopped() {
            ticker.tick().await;
            while let Some(frame) = source.read_frame() {
                let sample = Sample {
                    data: Bytes::from(pcmu::encode_frame(&frame)),
                    duration: FRAME_DURATION,
                    ..Default::default()
                };
                if let Err(e) = rtp.write_sample(&sample).await {
                    tracing::warn!("Writing audio sample failed: {}", e);
                    return;
                }
            }
        }
        tracing::debug!("Sample pump for track {} stopped", track.id);
    })
}

impl RtcTransport {
    fn local_track(&self, track: &MediaTrack) -> Arc<dyn TrackLocal + Send + Sync> {
        if let (MediaKind::Audio, Some(source)) = (track.kind, track.source()) {
            let rtp = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: "audio/PCMU".to_string(),
                    clock_rate: PCMU_CLOCK_RATE,
                    channels: 1,
                    ..Default::default()
                },
                track.id.clone(),
                STREAM_ID.to_string(),
            ));
            let pump = spawn_sample_pump(track.clone(), source, Arc::clone(&rtp));
            if let Some(previous) = self.pumps.lock().insert(track.id.clone(), pump) {
                previous.abort();
            }
            return rtp;
        }

        let capability = match track.kind {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        Arc::new(TrackLocalStaticRTP::new(
            capability,
            track.id.clone(),
            STREAM_ID.to_string(),
        ))
    }

    fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
        match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(|e| PeerError::InvalidSdp(e.to_string()))
    }

    fn from_rtc(description: RTCSessionDescription) -> Option<SessionDescription> {
        match description.sdp_type {
            RTCSdpType::Offer => Some(SessionDescription::offer(description.sdp)),
            RTCSdpType::Answer => Some(SessionDescription::answer(description.sdp)),
            _ => None,
        }
    }
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), PeerError> {
        let sender = self
            .pc
            .add_track(self.local_track(track))
            .await
            .map_err(webrtc_error)?;
        self.senders.lock().insert(track.id.clone(), sender);
        Ok(())
    }

    async fn replace_track(&self, old: &MediaTrack, new: &MediaTrack) -> Result<(), PeerError> {
        let sender = self
            .senders
            .lock()
            .remove(&old.id)
            .ok_or_else(|| PeerError::UnknownTrack(old.id.clone()))?;
        sender
            .replace_track(Some(self.local_track(new)))
            .await
            .map_err(webrtc_error)?;
        if let Some(pump) = self.pumps.lock().remove(&old.id) {
            pump.abort();
        }
        self.senders.lock().insert(new.id.clone(), sender);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self.pc.create_offer(None).await.map_err(webrtc_error)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await.map_err(webrtc_error)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.pc
            .set_local_description(Self::to_rtc(description)?)
            .await
            .map_err(webrtc_error)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.pc
            .set_remote_description(Self::to_rtc(description)?)
            .await
            .map_err(webrtc_error)
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        Self::from_rtc(self.pc.local_description().await?)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(webrtc_error)
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.senders.lock().clear();
        for (_, pump) in self.pumps.lock().drain() {
            pump.abort();
        }
        self.pc.close().await.map_err(webrtc_error)
    }
}

impl Drop for RtcTransport {
    fn drop(&mut self) {
        for (_, pump) in self.pumps.get_mut().drain() {
            pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ice::fallback_ice_servers;
    use std::time::Duration;

    #[test]
    fn test_rtc_configuration_maps_policy_and_credentials() {
        let set = IceServerSet {
            servers: fallback_ice_servers(),
            pool_size: 10,
            policy: IceTransportPolicy::Relay,
        };
        let config = rtc_configuration(&set);

        assert_eq!(config.ice_transport_policy, RTCIceTransportPolicy::Relay);
        assert_eq!(config.ice_candidate_pool_size, 10);
        assert_eq!(config.ice_servers.len(), set.servers.len());
        assert_eq!(config.ice_servers[1].username, "openrelayproject");
        assert!(config.ice_servers[0].username.is_empty());
    }

    #[tokio::test]
    async fn test_offer_contains_audio_section() {
        let factory = RtcTransportFactory::new().unwrap();
        let set = IceServerSet {
            servers: Vec::new(),
            pool_size: 0,
            policy: IceTransportPolicy::All,
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = factory.create(&set, tx).await.unwrap();

        let track = MediaTrack::new(MediaKind::Audio, "mic", None);
        transport.add_track(&track).await.unwrap();
        let offer = transport.create_offer().await.unwrap();

        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=audio"));
        transport.close().await.unwrap();
    }

    /// Liefert eine feste Anzahl stiller Frames
    struct CountingSource {
        remaining: AtomicU64,
        reads: AtomicU64,
    }

    impl SampleSource for CountingSource {
        fn read_frame(&self) -> Option<Vec<f32>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let left = self.remaining.load(Ordering::SeqCst);
            if left == 0 {
                return None;
            }
            self.remaining.store(left - 1, Ordering::SeqCst);
            Some(vec![0.0; 960])
        }
    }

    #[tokio::test]
    async fn test_audio_source_is_pumped_until_track_stops() {
        let factory = RtcTransportFactory::new().unwrap();
        let set = IceServerSet {
            servers: Vec::new(),
            pool_size: 0,
            policy: IceTransportPolicy::All,
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = factory.create(&set, tx).await.unwrap();

        let source = Arc::new(CountingSource {
            remaining: AtomicU64::new(3),
            reads: AtomicU64::new(0),
        });
        let track = MediaTrack::new(MediaKind::Audio, "mic", None).with_source(source.clone());
        transport.add_track(&track).await.unwrap();

        let offer = transport.create_offer().await.unwrap();
        assert!(offer.sdp.contains("PCMU"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(source.remaining.load(Ordering::SeqCst), 0);

        track.stop();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let reads = source.reads.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(source.reads.load(Ordering::SeqCst), reads);
        transport.close().await.unwrap();
    }
}
