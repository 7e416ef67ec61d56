//! In-Process Loopback Transport
//!
//! Verbindet zwei Transport-Instanzen im selben Prozess. Die SDP enthält die
//! Endpoint-ID (`o=loopback <id>`) und eine `m=`-Zeile pro Track, Kandidaten
//! tragen die ID als ufrag. Die Verbindung steht, sobald beide Seiten lokale
//! und entfernte Description gesetzt und mindestens einen Kandidaten der
//! Gegenseite erhalten haben.

use super::transport::{ConnectionState, PeerTransport, TransportEvent, TransportFactory};
use super::PeerError;
use crate::ice::{IceServerSet, IceTransportPolicy};
use crate::media::{MediaKind, MediaTrack};
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use uuid::Uuid;

const CANDIDATES_PER_ENDPOINT: u16 = 2;

struct Shared {
    endpoints: Mutex<HashMap<String, Weak<LoopbackTransport>>>,
    reachable: AtomicBool,
    /// Kein Kandidat und kein Gathering-Abschluss
    gathering_stalled: AtomicBool,
    created: AtomicUsize,
    next_port: AtomicU16,
    last_ice: Mutex<Option<IceServerSet>>,
}

impl Shared {
    fn endpoint(&self, id: &str) -> Option<Arc<LoopbackTransport>> {
        self.endpoints.lock().get(id).and_then(Weak::upgrade)
    }
}

/// Netz für Loopback-Transports (zugleich deren Factory)
#[derive(Clone)]
pub struct LoopbackNetwork {
    shared: Arc<Shared>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                endpoints: Mutex::new(HashMap::new()),
                reachable: AtomicBool::new(true),
                gathering_stalled: AtomicBool::new(false),
                created: AtomicUsize::new(0),
                next_port: AtomicU16::new(50_000),
                last_ice: Mutex::new(None),
            }),
        }
    }

    /// Unerreichbar: Verbindungen enden in `Failed`
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Lässt das ICE-Gathering neuer Descriptions hängen
    pub fn set_gathering_stalled(&self, stalled: bool) {
        self.shared.gathering_stalled.store(stalled, Ordering::SeqCst);
    }

    /// Anzahl offener (nicht geschlossener) Transports
    pub fn open_transports(&self) -> usize {
        self.shared
            .endpoints
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .filter(|t| !t.state.lock().closed)
            .count()
    }

    pub fn created(&self) -> usize {
        self.shared.created.load(Ordering::SeqCst)
    }

    /// ICE-Konfiguration des zuletzt erzeugten Transports
    pub fn last_ice(&self) -> Option<IceServerSet> {
        self.shared.last_ice.lock().clone()
    }
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LoopbackNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackNetwork")
            .field("created", &self.created())
            .field("open", &self.open_transports())
            .finish()
    }
}

#[async_trait]
impl TransportFactory for LoopbackNetwork {
    async fn create(
        &self,
        ice: &IceServerSet,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, PeerError> {
        let transport = Arc::new(LoopbackTransport {
            id: Uuid::new_v4().simple().to_string(),
            shared: Arc::clone(&self.shared),
            events,
            relay_unavailable: ice.policy == IceTransportPolicy::Relay && !ice.has_turn(),
            state: Mutex::new(EndpointState::default()),
        });

        self.shared
            .endpoints
            .lock()
            .insert(transport.id.clone(), Arc::downgrade(&transport));
        self.shared.created.fetch_add(1, Ordering::SeqCst);
        *self.shared.last_ice.lock() = Some(ice.clone());

        tracing::debug!("Created loopback transport {}", transport.id);
        Ok(transport)
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

#[derive(Default)]
struct EndpointState {
    tracks: Vec<MediaKind>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_id: Option<String>,
    remote_candidates: usize,
    /// Connecting/Connected bzw. Failed wurde bereits gemeldet
    settled: bool,
    closed: bool,
}

struct LoopbackTransport {
    id: String,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<TransportEvent>,
    relay_unavailable: bool,
    state: Mutex<EndpointState>,
}

impl LoopbackTransport {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.state.lock().closed {
            return Err(PeerError::WebRtc("transport is closed".to_string()));
        }
        Ok(())
    }

    fn render_sdp(&self, kind: SdpKind) -> SessionDescription {
        let mut sdp = format!("v=0\r\no=loopback {} 0 IN IP4 127.0.0.1\r\ns=-\r\n", self.id);
        for track in &self.state.lock().tracks {
            sdp.push_str(&format!("m={} 9 UDP/TLS/RTP/SAVPF 96\r\n", track));
        }
        SessionDescription { kind, sdp }
    }

    /// Endpoint-ID der Gegenseite, wenn diese Seite verbindungsbereit ist
    fn ready_for(&self) -> Option<String> {
        let state = self.state.lock();
        if state.closed || state.settled || state.local.is_none() || state.remote_candidates == 0 {
            return None;
        }
        state.remote_id.clone()
    }

    fn settle(&self) -> bool {
        let mut state = self.state.lock();
        if state.settled || state.closed {
            return false;
        }
        state.settled = true;
        true
    }

    fn try_connect(&self) {
        let Some(peer_id) = self.ready_for() else {
            return;
        };
        let Some(peer) = self.shared.endpoint(&peer_id) else {
            return;
        };
        if peer.ready_for().as_deref() != Some(self.id.as_str()) {
            return;
        }

        let reachable = self.shared.reachable.load(Ordering::SeqCst)
            && !self.relay_unavailable
            && !peer.relay_unavailable;
        let outcome = if reachable {
            ConnectionState::Connected
        } else {
            ConnectionState::Failed
        };

        for endpoint in [self, peer.as_ref()] {
            if endpoint.settle() {
                endpoint.emit(TransportEvent::StateChanged(ConnectionState::Connecting));
                endpoint.emit(TransportEvent::StateChanged(outcome));
            }
        }
        tracing::debug!("Loopback {} <-> {}: {:?}", self.id, peer.id, outcome);
    }

    fn remote_closed(&self) {
        let state = self.state.lock();
        if state.settled && !state.closed {
            self.emit(TransportEvent::StateChanged(ConnectionState::Disconnected));
        }
    }
}

fn parse_sdp(sdp: &str) -> Result<(String, Vec<MediaKind>), PeerError> {
    let mut origin = None;
    let mut kinds = Vec::new();
    for line in sdp.lines() {
        if let Some(rest) = line.strip_prefix("o=loopback ") {
            origin = rest.split_whitespace().next().map(str::to_string);
        } else if line.starts_with("m=audio") {
            kinds.push(MediaKind::Audio);
        } else if line.starts_with("m=video") {
            kinds.push(MediaKind::Video);
        }
    }
    let origin = origin.ok_or_else(|| PeerError::InvalidSdp("missing loopback origin".to_string()))?;
    Ok((origin, kinds))
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), PeerError> {
        self.ensure_open()?;
        self.state.lock().tracks.push(track.kind);
        Ok(())
    }

    async fn replace_track(&self, old: &MediaTrack, new: &MediaTrack) -> Result<(), PeerError> {
        self.ensure_open()?;
        if old.kind != new.kind || !self.state.lock().tracks.contains(&old.kind) {
            return Err(PeerError::UnknownTrack(old.id.clone()));
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        Ok(self.render_sdp(SdpKind::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        let has_offer = matches!(
            self.state.lock().remote,
            Some(SessionDescription {
                kind: SdpKind::Offer,
                ..
            })
        );
        if !has_offer {
            return Err(PeerError::WebRtc("no remote offer".to_string()));
        }
        Ok(self.render_sdp(SdpKind::Answer))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.ensure_open()?;
        self.state.lock().local = Some(description);
        if self.shared.gathering_stalled.load(Ordering::SeqCst) {
            return Ok(());
        }

        // Gathering: Host-Kandidaten, danach Abschluss
        for n in 0..CANDIDATES_PER_ENDPOINT {
            let port = self.shared.next_port.fetch_add(1, Ordering::Relaxed);
            self.emit(TransportEvent::LocalCandidate(IceCandidate {
                candidate: format!(
                    "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host",
                    n + 1,
                    port
                ),
                sdp_mid: Some(n.to_string()),
                sdp_mline_index: Some(n),
                username_fragment: Some(self.id.clone()),
            }));
        }
        self.emit(TransportEvent::GatheringComplete);

        self.try_connect();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.ensure_open()?;
        let (remote_id, kinds) = parse_sdp(&description.sdp)?;
        {
            let mut state = self.state.lock();
            state.remote = Some(description);
            state.remote_id = Some(remote_id.clone());
        }

        for (n, kind) in kinds.into_iter().enumerate() {
            self.emit(TransportEvent::RemoteTrack {
                id: format!("{}-{}-{}", remote_id, kind, n),
                kind,
            });
        }

        self.try_connect();
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.ensure_open()?;
        {
            let mut state = self.state.lock();
            let Some(remote_id) = state.remote_id.as_deref() else {
                return Err(PeerError::WebRtc(
                    "remote description not set".to_string(),
                ));
            };
            if candidate.username_fragment.as_deref() != Some(remote_id) {
                return Err(PeerError::WebRtc(format!(
                    "candidate for unknown ufrag: {:?}",
                    candidate.username_fragment
                )));
            }
            state.remote_candidates += 1;
        }

        self.try_connect();
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        let remote_id = {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.remote_id.clone()
        };

        self.emit(TransportEvent::StateChanged(ConnectionState::Closed));
        if let Some(peer) = remote_id.and_then(|id| self.shared.endpoint(&id)) {
            peer.remote_closed();
        }
        self.shared.endpoints.lock().remove(&self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ice::fallback_ice_servers;

    fn ice() -> IceServerSet {
        IceServerSet {
            servers: fallback_ice_servers(),
            pool_size: 10,
            policy: IceTransportPolicy::All,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn candidates(events: &[TransportEvent]) -> Vec<IceCandidate> {
        events
            .iter()
            .filter_map(|e| match e {
                TransportEvent::LocalCandidate(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    fn states(events: &[TransportEvent]) -> Vec<ConnectionState> {
        events
            .iter()
            .filter_map(|e| match e {
                TransportEvent::StateChanged(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    async fn pair(
        network: &LoopbackNetwork,
    ) -> (
        Arc<dyn PeerTransport>,
        mpsc::UnboundedReceiver<TransportEvent>,
        Arc<dyn PeerTransport>,
        mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = network.create(&ice(), a_tx).await.unwrap();
        let b = network.create(&ice(), b_tx).await.unwrap();
        (a, a_rx, b, b_rx)
    }

    #[tokio::test]
    async fn test_full_negotiation_connects_both_sides() {
        let network = LoopbackNetwork::new();
        let (a, mut a_rx, b, mut b_rx) = pair(&network).await;

        a.add_track(&MediaTrack::new(MediaKind::Audio, "mic", None))
            .await
            .unwrap();
        a.add_track(&MediaTrack::new(MediaKind::Video, "cam", None))
            .await
            .unwrap();
        b.add_track(&MediaTrack::new(MediaKind::Audio, "mic", None))
            .await
            .unwrap();

        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        let a_events = drain(&mut a_rx);
        let b_events = drain(&mut b_rx);
        for c in candidates(&a_events) {
            b.add_ice_candidate(c).await.unwrap();
        }
        for c in candidates(&b_events) {
            a.add_ice_candidate(c).await.unwrap();
        }

        let remote_kinds: Vec<_> = b_events
            .iter()
            .filter_map(|e| match e {
                TransportEvent::RemoteTrack { kind, .. } => Some(*kind),
                _ => None,
            })
            .collect();
        assert_eq!(remote_kinds, vec![MediaKind::Audio, MediaKind::Video]);

        assert_eq!(
            states(&drain(&mut a_rx)),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
        assert_eq!(
            states(&drain(&mut b_rx)),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
    }

    #[tokio::test]
    async fn test_candidate_before_remote_description_is_rejected() {
        let network = LoopbackNetwork::new();
        let (a, mut a_rx, b, _b_rx) = pair(&network).await;

        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer).await.unwrap();
        let candidate = candidates(&drain(&mut a_rx)).remove(0);

        assert!(b.add_ice_candidate(candidate).await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_network_fails() {
        let network = LoopbackNetwork::new();
        network.set_reachable(false);
        let (a, mut a_rx, b, mut b_rx) = pair(&network).await;

        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();
        for c in candidates(&drain(&mut a_rx)) {
            b.add_ice_candidate(c).await.unwrap();
        }
        for c in candidates(&drain(&mut b_rx)) {
            a.add_ice_candidate(c).await.unwrap();
        }

        assert_eq!(
            states(&drain(&mut a_rx)),
            vec![ConnectionState::Connecting, ConnectionState::Failed]
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_tracked() {
        let network = LoopbackNetwork::new();
        let (a, mut a_rx, _b, _b_rx) = pair(&network).await;
        assert_eq!(network.open_transports(), 2);
        assert_eq!(network.created(), 2);

        a.close().await.unwrap();
        a.close().await.unwrap();
        assert_eq!(network.open_transports(), 1);
        assert_eq!(states(&drain(&mut a_rx)), vec![ConnectionState::Closed]);
        assert!(a.create_offer().await.is_err());
    }

    #[tokio::test]
    async fn test_answer_requires_offer() {
        let network = LoopbackNetwork::new();
        let (a, _a_rx, _b, _b_rx) = pair(&network).await;
        assert!(a.create_answer().await.is_err());
        assert!(a
            .set_remote_description(SessionDescription::offer("v=0".to_string()))
            .await
            .is_err());
    }
}
