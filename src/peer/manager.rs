//! Peer Connection Manager
//!
//! Führt genau eine Medienverbindung durch Offer/Answer/ICE bis zum
//! verbundenen Zustand. Der Initiator erzeugt das Offer, die Gegenseite
//! wartet darauf und antwortet. Kandidaten, die vor der Remote Description
//! eintreffen, werden gepuffert. Ein Hangup beendet die Session sofort,
//! unabhängig von der Reihenfolge.

use super::transport::{ConnectionState, PeerTransport, TransportEvent, TransportFactory};
use super::PeerError;
use crate::call::{CallId, CallType, SessionTeardown};
use crate::ice::IceConfigProvider;
use crate::media::{
    DeviceInfo, MediaConstraints, MediaDevices, MediaKind, MediaPrewarm, MediaStream,
};
use crate::signaling::{
    IceCandidate, RedundantSignaling, SdpKind, SessionDescription, SignalKind,
    SignalSubscription, SignalingMessage,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

// ============================================================================
// TYPES
// ============================================================================

/// Zeitgrenzen der Verhandlung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerTimings {
    /// Danach wird mit den bis dahin gesammelten Kandidaten weitergemacht
    pub ice_gathering_timeout: Duration,
    /// Nie verbunden nach dieser Zeit = Failed
    pub connect_timeout: Duration,
    /// Wartezeit zwischen `failed` und automatischem Auflegen
    pub failed_grace: Duration,
}

impl Default for ManagerTimings {
    fn default() -> Self {
        Self {
            ice_gathering_timeout: Duration::from_millis(3000),
            connect_timeout: Duration::from_secs(30),
            failed_grace: Duration::from_millis(3000),
        }
    }
}

/// Gemeinsame Abhängigkeiten aller Sessions
#[derive(Clone)]
pub struct PeerDeps {
    pub signaling: Arc<RedundantSignaling>,
    pub ice: Arc<IceConfigProvider>,
    pub devices: Arc<dyn MediaDevices>,
    pub factory: Arc<dyn TransportFactory>,
    pub prewarm: Arc<MediaPrewarm>,
    pub timings: ManagerTimings,
}

/// Parameter einer einzelnen Session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub call_id: CallId,
    pub call_type: CallType,
    /// Erzeugt das Offer (Anrufer)
    pub initiator: bool,
    /// Nur TURN-Relay Kandidaten verwenden
    pub force_relay: bool,
}

/// Eingehender Remote-Track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: MediaKind,
}

/// Ereignisse einer Session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    LocalStream(MediaStream),
    RemoteTrack(RemoteTrack),
    /// Video nicht verfügbar, Call läuft nur mit Audio
    AudioFallback,
    /// Gegenseite hat aufgelegt, lokale Ressourcen sind bereits freigegeben
    RemoteHangup,
    /// Endgültiger Fehler, der Call sollte beendet werden
    Failed(String),
}

struct Session {
    transport: Arc<dyn PeerTransport>,
    local_stream: MediaStream,
}

// ============================================================================
// MANAGER
// ============================================================================

/// Besitzt die Peer Connection eines Calls
pub struct PeerConnectionManager {
    options: SessionOptions,
    deps: PeerDeps,
    session: Mutex<Option<Session>>,
    remote_tracks: Mutex<Vec<RemoteTrack>>,
    pending_candidates: Mutex<Vec<IceCandidate>>,
    remote_description_set: AtomicBool,
    gathering_complete: watch::Sender<bool>,
    state_tx: watch::Sender<ConnectionState>,
    muted_tx: watch::Sender<bool>,
    video_off_tx: watch::Sender<bool>,
    event_tx: broadcast::Sender<SessionEvent>,
    started: AtomicBool,
    ended: AtomicBool,
    connected_once: AtomicBool,
    failure_reported: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerConnectionManager {
    pub fn new(deps: PeerDeps, options: SessionOptions) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            options,
            deps,
            session: Mutex::new(None),
            remote_tracks: Mutex::new(Vec::new()),
            pending_candidates: Mutex::new(Vec::new()),
            remote_description_set: AtomicBool::new(false),
            gathering_complete: watch::channel(false).0,
            state_tx: watch::channel(ConnectionState::New).0,
            muted_tx: watch::channel(false).0,
            video_off_tx: watch::channel(false).0,
            event_tx,
            started: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            connected_once: AtomicBool::new(false),
            failure_reported: AtomicBool::new(false),
            shutdown: watch::channel(false).0,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    pub fn call_id(&self) -> &CallId {
        &self.options.call_id
    }

    pub fn is_initiator(&self) -> bool {
        self.options.initiator
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_muted(&self) -> bool {
        *self.muted_tx.borrow()
    }

    pub fn watch_muted(&self) -> watch::Receiver<bool> {
        self.muted_tx.subscribe()
    }

    pub fn is_video_off(&self) -> bool {
        *self.video_off_tx.borrow()
    }

    pub fn watch_video_off(&self) -> watch::Receiver<bool> {
        self.video_off_tx.subscribe()
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    pub fn local_stream(&self) -> Option<MediaStream> {
        self.session.lock().as_ref().map(|s| s.local_stream.clone())
    }

    pub fn remote_tracks(&self) -> Vec<RemoteTrack> {
        self.remote_tracks.lock().clone()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }

    fn transport(&self) -> Option<Arc<dyn PeerTransport>> {
        self.session
            .lock()
            .as_ref()
            .map(|s| Arc::clone(&s.transport))
    }

    // ========================================================================
    // START
    // ========================================================================

    /// Startet die Session
    ///
    /// Holt lokale Medien (Pre-Warm oder neu), baut die Verbindung mit der
    /// aktuellen ICE-Konfiguration auf und sendet als Initiator das Offer.
    pub async fn start_call(self: &Arc<Self>) -> Result<(), PeerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(PeerError::AlreadyStarted);
        }
        if self.is_ended() {
            return Err(PeerError::Cancelled);
        }

        tracing::info!(
            "Starting {} session for call {} ({})",
            self.options.call_type,
            self.options.call_id,
            if self.options.initiator { "initiator" } else { "answerer" }
        );
        self.state_tx.send_replace(ConnectionState::Connecting);
        self.emit(SessionEvent::StateChanged(ConnectionState::Connecting));

        // Früh abonnieren, damit kein Offer verloren geht
        let subscription = self.deps.signaling.subscribe(&self.options.call_id).await;

        let local_stream = self.acquire_media().await?;

        let ice = self
            .deps
            .ice
            .get_ice_servers(self.options.force_relay)
            .await;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = match self.deps.factory.create(&ice, events_tx).await {
            Ok(transport) => transport,
            Err(e) => {
                local_stream.stop_all();
                return Err(e);
            }
        };

        for track in local_stream.tracks() {
            if let Err(e) = transport.add_track(track).await {
                local_stream.stop_all();
                let _ = transport.close().await;
                return Err(e);
            }
        }

        let stored = {
            let mut session = self.session.lock();
            if self.is_ended() {
                false
            } else {
                *session = Some(Session {
                    transport: Arc::clone(&transport),
                    local_stream: local_stream.clone(),
                });
                true
            }
        };
        if !stored {
            // Während des Aufbaus beendet
            local_stream.stop_all();
            let _ = transport.close().await;
            return Err(PeerError::Cancelled);
        }

        self.emit(SessionEvent::LocalStream(local_stream));
        self.spawn_event_loop(events_rx);
        self.spawn_signal_pump(subscription);
        self.spawn_connect_watchdog();

        if self.options.initiator {
            if let Err(e) = self.send_offer(&transport).await {
                if !self.is_ended() {
                    tracing::error!("Failed to create offer for {}: {}", self.options.call_id, e);
                    self.fail(format!("offer failed: {}", e));
                }
                return Err(e);
            }
        }

        Ok(())
    }

    /// Lokale Medien; ein Video-Call fällt bei Kamerafehlern auf Audio zurück
    async fn acquire_media(&self) -> Result<MediaStream, PeerError> {
        let constraints = MediaConstraints::for_call(self.options.call_type);
        if let Some(stream) = self.deps.prewarm.take(&constraints) {
            return Ok(stream);
        }

        match self.deps.devices.acquire(&constraints).await {
            Ok(stream) => Ok(stream),
            Err(e) if constraints.wants_video() => {
                tracing::warn!("Video unavailable ({}), falling back to audio only", e);
                let stream = self
                    .deps
                    .devices
                    .acquire(&MediaConstraints::audio_only())
                    .await?;
                self.video_off_tx.send_replace(true);
                self.emit(SessionEvent::AudioFallback);
                Ok(stream)
            }
            Err(e) => {
                tracing::error!("Cannot access microphone: {}", e);
                Err(e.into())
            }
        }
    }

    // ========================================================================
    // NEGOTIATION
    // ========================================================================

    async fn send_signal<T: Serialize>(
        &self,
        kind: SignalKind,
        payload: &T,
    ) -> Result<(), PeerError> {
        let message = self
            .deps
            .signaling
            .message(&self.options.call_id, kind, payload)?;
        self.deps.signaling.publish(message).await;
        Ok(())
    }

    /// Setzt die lokale Description und wartet (begrenzt) auf das Gathering
    async fn apply_local(
        &self,
        transport: &Arc<dyn PeerTransport>,
        description: SessionDescription,
    ) -> Result<SessionDescription, PeerError> {
        self.gathering_complete.send_replace(false);
        transport.set_local_description(description.clone()).await?;

        let mut gathering = self.gathering_complete.subscribe();
        let mut shutdown = self.shutdown.subscribe();
        let gathered = tokio::select! {
            result = tokio::time::timeout(
                self.deps.timings.ice_gathering_timeout,
                gathering.wait_for(|done| *done),
            ) => result.is_ok(),
            _ = shutdown.wait_for(|down| *down) => false,
        };
        // Während des Wartens beendet, nichts mehr senden
        if self.is_ended() {
            return Err(PeerError::Cancelled);
        }
        if !gathered {
            tracing::debug!("ICE gathering timed out, continuing with gathered candidates");
        }

        Ok(transport.local_description().await.unwrap_or(description))
    }

    async fn send_offer(&self, transport: &Arc<dyn PeerTransport>) -> Result<(), PeerError> {
        let offer = transport.create_offer().await?;
        let offer = self.apply_local(transport, offer).await?;
        self.send_signal(SignalKind::Offer, &offer).await?;
        tracing::info!("Sent offer for call {}", self.options.call_id);
        Ok(())
    }

    async fn on_remote_hangup(&self) {
        tracing::info!("Remote hangup for call {}", self.options.call_id);
        // Erst aufräumen, dann die UI informieren
        self.end_call().await;
        self.emit(SessionEvent::RemoteHangup);
    }

    /// Verarbeitet eine Verhandlungs-Nachricht, `false` beendet die Schleife
    async fn handle_signal(&self, message: SignalingMessage) -> bool {
        let Some(transport) = self.transport() else {
            return false;
        };

        let result = match message.kind {
            SignalKind::Offer => self.on_offer(&transport, &message).await,
            SignalKind::Answer => self.on_answer(&transport, &message).await,
            SignalKind::IceCandidate => {
                self.on_candidate(&transport, &message).await;
                Ok(())
            }
            SignalKind::Hangup => Ok(()),
        };

        if self.is_ended() {
            return false;
        }
        if let Err(e) = result {
            tracing::error!(
                "Negotiation failed on call {} ({}): {}",
                self.options.call_id,
                message.kind,
                e
            );
            self.fail(format!("negotiation failed: {}", e));
        }
        true
    }

    async fn on_offer(
        &self,
        transport: &Arc<dyn PeerTransport>,
        message: &SignalingMessage,
    ) -> Result<(), PeerError> {
        if self.options.initiator || self.remote_description_set.load(Ordering::SeqCst) {
            tracing::debug!("Ignoring offer #{} from {}", message.seq, message.sender_id);
            return Ok(());
        }

        let offer: SessionDescription = message.decode()?;
        if offer.kind != SdpKind::Offer {
            return Err(PeerError::InvalidSdp("expected offer".to_string()));
        }
        transport.set_remote_description(offer).await?;
        self.remote_description_set.store(true, Ordering::SeqCst);
        self.flush_candidates(transport).await;

        let answer = transport.create_answer().await?;
        let answer = self.apply_local(transport, answer).await?;
        self.send_signal(SignalKind::Answer, &answer).await?;
        tracing::info!("Sent answer for call {}", self.options.call_id);
        Ok(())
    }

    async fn on_answer(
        &self,
        transport: &Arc<dyn PeerTransport>,
        message: &SignalingMessage,
    ) -> Result<(), PeerError> {
        if !self.options.initiator || self.remote_description_set.load(Ordering::SeqCst) {
            tracing::debug!("Ignoring answer #{} from {}", message.seq, message.sender_id);
            return Ok(());
        }

        let answer: SessionDescription = message.decode()?;
        if answer.kind != SdpKind::Answer {
            return Err(PeerError::InvalidSdp("expected answer".to_string()));
        }
        transport.set_remote_description(answer).await?;
        self.remote_description_set.store(true, Ordering::SeqCst);
        self.flush_candidates(transport).await;
        tracing::info!("Applied answer for call {}", self.options.call_id);
        Ok(())
    }

    async fn on_candidate(&self, transport: &Arc<dyn PeerTransport>, message: &SignalingMessage) {
        let candidate: IceCandidate = match message.decode() {
            Ok(candidate) => candidate,
            Err(e) => {
                tracing::warn!("Dropping malformed candidate: {}", e);
                return;
            }
        };

        if !self.remote_description_set.load(Ordering::SeqCst) {
            tracing::debug!("Buffering candidate until remote description is set");
            self.pending_candidates.lock().push(candidate);
            return;
        }

        if let Err(e) = transport.add_ice_candidate(candidate).await {
            tracing::warn!("Failed to add remote candidate: {}", e);
        }
    }

    async fn flush_candidates(&self, transport: &Arc<dyn PeerTransport>) {
        let pending = std::mem::take(&mut *self.pending_candidates.lock());
        if pending.is_empty() {
            return;
        }
        tracing::debug!("Applying {} buffered candidate(s)", pending.len());
        for candidate in pending {
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                tracing::warn!("Failed to add buffered candidate: {}", e);
            }
        }
    }

    // ========================================================================
    // BACKGROUND TASKS
    // ========================================================================

    fn spawn_event_loop(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        let weak = Arc::downgrade(self);
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.changed() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let Some(this) = weak.upgrade() else {
                    break;
                };
                this.on_transport_event(event).await;
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Empfängt Signaling-Nachrichten. Hangups werden sofort verarbeitet,
    /// die Verhandlung läuft seriell in einem eigenen Task.
    fn spawn_signal_pump(self: &Arc<Self>, mut subscription: SignalSubscription) {
        let (negotiation_tx, mut negotiation_rx) = mpsc::unbounded_channel::<SignalingMessage>();

        let weak = Arc::downgrade(self);
        let mut shutdown = self.shutdown.subscribe();
        let pump = tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = shutdown.changed() => break,
                    message = subscription.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };
                if message.kind == SignalKind::Hangup {
                    if let Some(this) = weak.upgrade() {
                        this.on_remote_hangup().await;
                    }
                    break;
                }
                if negotiation_tx.send(message).is_err() {
                    break;
                }
            }
            // Subscription wird hier gedroppt (Kanal verlassen, Polling beendet)
        });

        let weak = Arc::downgrade(self);
        let mut shutdown = self.shutdown.subscribe();
        let negotiation = tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = shutdown.changed() => break,
                    message = negotiation_rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };
                let Some(this) = weak.upgrade() else {
                    break;
                };
                if !this.handle_signal(message).await {
                    break;
                }
            }
        });

        let mut tasks = self.tasks.lock();
        tasks.push(pump);
        tasks.push(negotiation);
    }

    fn spawn_connect_watchdog(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let timeout = self.deps.timings.connect_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(this) = weak.upgrade() {
                if !this.connected_once.load(Ordering::SeqCst) && !this.is_ended() {
                    tracing::warn!(
                        "Call {} still not connected after {:?}",
                        this.options.call_id,
                        timeout
                    );
                    this.fail("connection timed out".to_string());
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    fn spawn_failed_grace(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let grace = self.deps.timings.failed_grace;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(this) = weak.upgrade() {
                if this.state() == ConnectionState::Failed {
                    this.fail("ICE connection failed".to_string());
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    async fn on_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                tracing::debug!("Local candidate: {}", candidate.candidate);
                if let Err(e) = self.send_signal(SignalKind::IceCandidate, &candidate).await {
                    tracing::warn!("Failed to publish local candidate: {}", e);
                }
            }
            TransportEvent::GatheringComplete => {
                self.gathering_complete.send_replace(true);
            }
            TransportEvent::StateChanged(state) => self.on_state(state),
            TransportEvent::RemoteTrack { id, kind } => {
                tracing::info!("Remote {} track on call {}", kind, self.options.call_id);
                let track = RemoteTrack { id, kind };
                self.remote_tracks.lock().push(track.clone());
                self.emit(SessionEvent::RemoteTrack(track));
            }
        }
    }

    fn on_state(self: &Arc<Self>, state: ConnectionState) {
        if self.is_ended() {
            return;
        }
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            self.emit(SessionEvent::StateChanged(state));
        }

        match state {
            ConnectionState::Connected => {
                self.connected_once.store(true, Ordering::SeqCst);
                tracing::info!("Call {} connected", self.options.call_id);
            }
            ConnectionState::Disconnected => {
                tracing::warn!("Call {} disconnected, waiting for recovery", self.options.call_id);
            }
            ConnectionState::Failed => {
                tracing::warn!(
                    "Call {} failed, hanging up after {:?}",
                    self.options.call_id,
                    self.deps.timings.failed_grace
                );
                self.spawn_failed_grace();
            }
            _ => {}
        }
    }

    /// Meldet einen endgültigen Fehler (einmalig)
    fn fail(&self, reason: String) {
        if self.is_ended() || self.failure_reported.swap(true, Ordering::SeqCst) {
            return;
        }
        let previous = self.state_tx.send_replace(ConnectionState::Failed);
        if previous != ConnectionState::Failed {
            self.emit(SessionEvent::StateChanged(ConnectionState::Failed));
        }
        // Abgelaufene Credentials als mögliche Ursache
        self.deps.ice.clear_cache();
        tracing::error!("Call {} failed: {}", self.options.call_id, reason);
        self.emit(SessionEvent::Failed(reason));
    }

    // ========================================================================
    // CONTROLS
    // ========================================================================

    /// Schaltet das Mikrofon stumm bzw. wieder an, gibt den neuen Zustand zurück
    pub fn toggle_mute(&self) -> Result<bool, PeerError> {
        let session = self.session.lock();
        let session = session.as_ref().ok_or(PeerError::NoActiveCall)?;
        let muted = !self.is_muted();
        for track in session.local_stream.audio_tracks() {
            track.set_enabled(!muted);
        }
        self.muted_tx.send_replace(muted);
        tracing::debug!("Microphone {}", if muted { "muted" } else { "unmuted" });
        Ok(muted)
    }

    /// Schaltet das Video aus bzw. an, gibt `true` zurück wenn es aus ist
    pub fn toggle_video(&self) -> Result<bool, PeerError> {
        let session = self.session.lock();
        let session = session.as_ref().ok_or(PeerError::NoActiveCall)?;
        if !session.local_stream.has_video() {
            return Err(PeerError::NoVideoTrack);
        }
        let video_off = !self.is_video_off();
        for track in session.local_stream.video_tracks() {
            track.set_enabled(!video_off);
        }
        self.video_off_tx.send_replace(video_off);
        Ok(video_off)
    }

    /// Wechselt zur nächsten Kamera (Track-Austausch ohne Neuverhandlung)
    pub async fn switch_camera(&self) -> Result<(), PeerError> {
        let (transport, current) = {
            let session = self.session.lock();
            let session = session.as_ref().ok_or(PeerError::NoActiveCall)?;
            let current = session
                .local_stream
                .video_tracks()
                .next()
                .cloned()
                .ok_or(PeerError::NoVideoTrack)?;
            (Arc::clone(&session.transport), current)
        };

        let cameras: Vec<DeviceInfo> = self
            .deps
            .devices
            .enumerate()
            .await?
            .into_iter()
            .filter(|d| d.kind == MediaKind::Video)
            .collect();
        let next = cameras
            .iter()
            .position(|d| Some(&d.id) == current.device_id.as_ref())
            .map(|i| &cameras[(i + 1) % cameras.len()])
            .or_else(|| cameras.first())
            .filter(|d| Some(&d.id) != current.device_id.as_ref())
            .ok_or(PeerError::NoAlternateCamera)?;

        let stream = self
            .deps
            .devices
            .acquire(&MediaConstraints::camera(&next.id))
            .await?;
        let replacement = stream
            .video_tracks()
            .next()
            .cloned()
            .ok_or(PeerError::NoVideoTrack)?;
        replacement.set_enabled(!self.is_video_off());

        if let Err(e) = transport.replace_track(&current, &replacement).await {
            replacement.stop();
            return Err(e);
        }

        let updated = {
            let mut session = self.session.lock();
            session.as_mut().and_then(|s| {
                s.local_stream
                    .replace_track(&current.id, replacement.clone())
                    .map(|_| s.local_stream.clone())
            })
        };
        let Some(updated) = updated else {
            replacement.stop();
            return Err(PeerError::NoActiveCall);
        };

        current.stop();
        tracing::info!("Switched camera to {}", next.label);
        self.emit(SessionEvent::LocalStream(updated));
        Ok(())
    }

    // ========================================================================
    // TEARDOWN
    // ========================================================================

    /// Beendet die Session: Tracks stoppen, Verbindung schließen, Signaling
    /// verlassen. Mehrfacher Aufruf ist ein No-op.
    pub async fn end_call(&self) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(true);

        let session = self.session.lock().take();
        if let Some(session) = session {
            session.local_stream.stop_all();
            if let Err(e) = session.transport.close().await {
                tracing::warn!("Error closing transport: {}", e);
            }
        }
        self.pending_candidates.lock().clear();

        self.state_tx.send_replace(ConnectionState::Closed);
        self.emit(SessionEvent::StateChanged(ConnectionState::Closed));
        tracing::info!("Session for call {} ended", self.options.call_id);
    }
}

#[async_trait]
impl SessionTeardown for PeerConnectionManager {
    async fn teardown(&self) {
        self.end_call().await;
    }
}

impl Drop for PeerConnectionManager {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(session) = self.session.get_mut().take() {
            session.local_stream.stop_all();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let transport = session.transport;
                handle.spawn(async move {
                    let _ = transport.close().await;
                });
            }
        }
        tracing::debug!("Session for call {} dropped", self.options.call_id);
    }
}

impl std::fmt::Debug for PeerConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnectionManager")
            .field("call_id", &self.options.call_id)
            .field("initiator", &self.options.initiator)
            .field("state", &self.state())
            .field("muted", &self.is_muted())
            .field("video_off", &self.is_video_off())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::UserId;
    use crate::ice::IceSettings;
    use crate::media::SyntheticMediaDevices;
    use crate::peer::LoopbackNetwork;
    use crate::signaling::{BroadcastHub, SignalPath};

    struct Side {
        manager: Arc<PeerConnectionManager>,
        events: broadcast::Receiver<SessionEvent>,
    }

    fn deps(
        user: &str,
        hub: &Arc<BroadcastHub>,
        network: &LoopbackNetwork,
        devices: Arc<SyntheticMediaDevices>,
    ) -> PeerDeps {
        let paths: Vec<Arc<dyn SignalPath>> = vec![hub.clone()];
        PeerDeps {
            signaling: Arc::new(RedundantSignaling::new(UserId::from(user), paths)),
            ice: Arc::new(IceConfigProvider::new(None, IceSettings::default())),
            devices,
            factory: Arc::new(network.clone()),
            prewarm: MediaPrewarm::new(Duration::from_secs(5)),
            timings: ManagerTimings::default(),
        }
    }

    fn side(deps: PeerDeps, call_id: &CallId, call_type: CallType, initiator: bool) -> Side {
        let manager = PeerConnectionManager::new(
            deps,
            SessionOptions {
                call_id: call_id.clone(),
                call_type,
                initiator,
                force_relay: false,
            },
        );
        let events = manager.subscribe();
        Side { manager, events }
    }

    async fn next_failure(events: &mut broadcast::Receiver<SessionEvent>) -> String {
        loop {
            match tokio::time::timeout(Duration::from_secs(60), events.recv())
                .await
                .unwrap()
                .unwrap()
            {
                SessionEvent::Failed(reason) => break reason,
                _ => continue,
            }
        }
    }

    async fn wait_for_remote_hangup(events: &mut broadcast::Receiver<SessionEvent>) {
        loop {
            match tokio::time::timeout(Duration::from_secs(60), events.recv())
                .await
                .unwrap()
                .unwrap()
            {
                SessionEvent::RemoteHangup => break,
                _ => continue,
            }
        }
    }

    async fn wait_for_state(manager: &PeerConnectionManager, state: ConnectionState) {
        let mut rx = manager.watch_state();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
            .await
            .unwrap()
            .unwrap();
    }

    async fn connected_pair(
        call_type: CallType,
        callee_devices: SyntheticMediaDevices,
    ) -> (Side, Side, LoopbackNetwork) {
        let hub = BroadcastHub::new();
        let network = LoopbackNetwork::new();
        let call_id = CallId::generate();

        let caller = side(
            deps("alice", &hub, &network, Arc::new(SyntheticMediaDevices::new())),
            &call_id,
            call_type,
            true,
        );
        let callee = side(
            deps("bob", &hub, &network, Arc::new(callee_devices)),
            &call_id,
            call_type,
            false,
        );

        // Angerufener zuerst, der Broadcast-Hub speichert nichts
        callee.manager.start_call().await.unwrap();
        caller.manager.start_call().await.unwrap();

        wait_for_state(&caller.manager, ConnectionState::Connected).await;
        wait_for_state(&callee.manager, ConnectionState::Connected).await;
        (caller, callee, network)
    }

    #[tokio::test]
    async fn test_offer_answer_reaches_connected() {
        let (caller, callee, network) =
            connected_pair(CallType::Video, SyntheticMediaDevices::new()).await;

        assert!(caller.manager.is_connected());
        assert_eq!(network.open_transports(), 2);
        assert_eq!(callee.manager.local_stream().unwrap().tracks().len(), 2);
        let kinds: Vec<_> = caller.manager.remote_tracks().iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![MediaKind::Audio, MediaKind::Video]);
    }

    #[tokio::test]
    async fn test_video_falls_back_to_audio() {
        let (caller, mut callee, _network) = connected_pair(
            CallType::Video,
            SyntheticMediaDevices::new().without(MediaKind::Video),
        )
        .await;

        assert!(callee.manager.is_video_off());
        assert!(!callee.manager.local_stream().unwrap().has_video());
        let kinds: Vec<_> = caller.manager.remote_tracks().iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![MediaKind::Audio]);

        let mut saw_fallback = false;
        while let Ok(event) = callee.events.try_recv() {
            saw_fallback |= matches!(event, SessionEvent::AudioFallback);
        }
        assert!(saw_fallback);
        assert!(matches!(
            callee.manager.toggle_video(),
            Err(PeerError::NoVideoTrack)
        ));
    }

    #[tokio::test]
    async fn test_audio_call_without_microphone_fails() {
        let hub = BroadcastHub::new();
        let network = LoopbackNetwork::new();
        let devices = Arc::new(SyntheticMediaDevices::new());
        devices.deny(MediaKind::Audio);
        let caller = side(
            deps("alice", &hub, &network, devices),
            &CallId::generate(),
            CallType::Audio,
            true,
        );

        let result = caller.manager.start_call().await;
        assert!(matches!(result, Err(PeerError::Media(_))));
        assert_eq!(network.created(), 0);
    }

    #[tokio::test]
    async fn test_end_call_is_idempotent() {
        let (caller, callee, network) =
            connected_pair(CallType::Audio, SyntheticMediaDevices::new()).await;
        let stream = caller.manager.local_stream().unwrap();

        caller.manager.end_call().await;
        caller.manager.end_call().await;

        assert!(stream.tracks().iter().all(|t| t.is_stopped()));
        assert_eq!(caller.manager.state(), ConnectionState::Closed);
        assert!(caller.manager.local_stream().is_none());
        assert_eq!(network.open_transports(), 1);
        assert!(matches!(
            caller.manager.toggle_mute(),
            Err(PeerError::NoActiveCall)
        ));
        drop(callee);
    }

    #[tokio::test]
    async fn test_remote_hangup_cleans_up_before_event() {
        let (caller, mut callee, network) =
            connected_pair(CallType::Audio, SyntheticMediaDevices::new()).await;

        caller
            .manager
            .deps
            .signaling
            .publish_hangup(caller.manager.call_id())
            .await;

        let cleaned_up = loop {
            match tokio::time::timeout(Duration::from_secs(5), callee.events.recv())
                .await
                .unwrap()
                .unwrap()
            {
                SessionEvent::RemoteHangup => break callee.manager.local_stream().is_none(),
                _ => continue,
            }
        };
        assert!(cleaned_up);
        assert!(callee.manager.is_ended());
        caller.manager.end_call().await;
        assert_eq!(network.open_transports(), 0);
    }

    #[tokio::test]
    async fn test_mute_and_video_toggle_tracks() {
        let (caller, _callee, _network) =
            connected_pair(CallType::Video, SyntheticMediaDevices::new()).await;
        let stream = caller.manager.local_stream().unwrap();

        assert!(caller.manager.toggle_mute().unwrap());
        assert!(!stream.audio_tracks().next().unwrap().is_enabled());
        assert!(!caller.manager.toggle_mute().unwrap());
        assert!(stream.audio_tracks().next().unwrap().is_enabled());

        assert!(caller.manager.toggle_video().unwrap());
        assert!(!stream.video_tracks().next().unwrap().is_enabled());
    }

    #[tokio::test]
    async fn test_switch_camera_replaces_track() {
        let (caller, _callee, _network) =
            connected_pair(CallType::Video, SyntheticMediaDevices::new()).await;
        let before = caller.manager.local_stream().unwrap();
        let front = before.video_tracks().next().unwrap().clone();
        assert_eq!(front.device_id.as_deref(), Some("cam-front"));

        caller.manager.switch_camera().await.unwrap();

        let after = caller.manager.local_stream().unwrap();
        let back = after.video_tracks().next().unwrap();
        assert_eq!(back.device_id.as_deref(), Some("cam-back"));
        assert!(front.is_stopped());
        assert!(!back.is_stopped());
    }

    #[tokio::test]
    async fn test_unreachable_peer_fails_after_grace() {
        let hub = BroadcastHub::new();
        let network = LoopbackNetwork::new();
        network.set_reachable(false);
        let call_id = CallId::generate();
        let mut fast = deps("alice", &hub, &network, Arc::new(SyntheticMediaDevices::new()));
        fast.timings.failed_grace = Duration::from_millis(50);
        let mut caller = side(fast, &call_id, CallType::Audio, true);
        let callee = side(
            deps("bob", &hub, &network, Arc::new(SyntheticMediaDevices::new())),
            &call_id,
            CallType::Audio,
            false,
        );

        callee.manager.start_call().await.unwrap();
        caller.manager.start_call().await.unwrap();

        let reason = next_failure(&mut caller.events).await;
        assert_eq!(reason, "ICE connection failed");
        assert_eq!(caller.manager.state(), ConnectionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_alone_does_not_hang_up() {
        let (mut caller, callee, _network) =
            connected_pair(CallType::Audio, SyntheticMediaDevices::new()).await;

        // Gegenseite verschwindet ohne Hangup
        callee.manager.end_call().await;
        wait_for_state(&caller.manager, ConnectionState::Disconnected).await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(caller.manager.state(), ConnectionState::Disconnected);
        assert!(!caller.manager.is_ended());
        assert!(caller.manager.local_stream().is_some());
        while let Ok(event) = caller.events.try_recv() {
            assert!(!matches!(
                event,
                SessionEvent::Failed(_) | SessionEvent::RemoteHangup
            ));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_offer_times_out() {
        let hub = BroadcastHub::new();
        let network = LoopbackNetwork::new();
        let mut caller = side(
            deps("alice", &hub, &network, Arc::new(SyntheticMediaDevices::new())),
            &CallId::generate(),
            CallType::Audio,
            true,
        );

        let started = tokio::time::Instant::now();
        caller.manager.start_call().await.unwrap();

        let reason = next_failure(&mut caller.events).await;
        assert_eq!(reason, "connection timed out");
        assert!(started.elapsed() >= ManagerTimings::default().connect_timeout);
        assert_eq!(caller.manager.state(), ConnectionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hangup_before_offer_is_terminal() {
        let hub = BroadcastHub::new();
        let network = LoopbackNetwork::new();
        let call_id = CallId::generate();
        let caller = side(
            deps("alice", &hub, &network, Arc::new(SyntheticMediaDevices::new())),
            &call_id,
            CallType::Audio,
            true,
        );
        let mut callee = side(
            deps("bob", &hub, &network, Arc::new(SyntheticMediaDevices::new())),
            &call_id,
            CallType::Audio,
            false,
        );

        callee.manager.start_call().await.unwrap();
        caller.manager.deps.signaling.publish_hangup(&call_id).await;
        wait_for_remote_hangup(&mut callee.events).await;
        assert!(callee.manager.is_ended());

        // Das Offer kommt zu spät
        caller.manager.start_call().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(callee.manager.state(), ConnectionState::Closed);
        assert!(callee.manager.local_stream().is_none());
        assert!(!caller.manager.is_connected());
        assert_eq!(network.open_transports(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hangup_during_gathering_sends_no_answer() {
        let hub = BroadcastHub::new();
        let network = LoopbackNetwork::new();
        network.set_gathering_stalled(true);
        let call_id = CallId::generate();
        let caller = side(
            deps("alice", &hub, &network, Arc::new(SyntheticMediaDevices::new())),
            &call_id,
            CallType::Audio,
            true,
        );
        let mut callee = side(
            deps("bob", &hub, &network, Arc::new(SyntheticMediaDevices::new())),
            &call_id,
            CallType::Audio,
            false,
        );
        let (tx, mut wire) = mpsc::unbounded_channel();
        let _wiretap = hub.subscribe(&call_id, tx).await.unwrap();

        callee.manager.start_call().await.unwrap();
        // Offer geht erst nach dem Gathering-Timeout raus
        caller.manager.start_call().await.unwrap();
        caller.manager.deps.signaling.publish_hangup(&call_id).await;
        let hung_up = tokio::time::Instant::now();

        wait_for_remote_hangup(&mut callee.events).await;
        assert!(hung_up.elapsed() < ManagerTimings::default().ice_gathering_timeout);

        tokio::time::sleep(Duration::from_secs(10)).await;
        let mut kinds = Vec::new();
        while let Ok(message) = wire.try_recv() {
            kinds.push(message.kind);
        }
        assert_eq!(kinds, vec![SignalKind::Offer, SignalKind::Hangup]);
    }
}
