//! Social Calls - Call-Signaling und Verhandlung
//!
//! Audio/Video-Calls zwischen zwei Teilnehmern einer Konversation:
//! - Call-Records in SQLite als einzige Quelle der Wahrheit
//! - Redundantes Signaling (Broadcast + Polling-Fallback)
//! - STUN/TURN Konfiguration mit Credential-Cache
//! - WebRTC Peer Connection pro Call

pub mod call;
pub mod config;
pub mod database;
pub mod ice;
pub mod media;
pub mod peer;
pub mod presenter;
pub mod signaling;

use call::{
    Call, CallController, CallError, CallEvent, CallId, CallType, ConversationId, SessionTeardown,
    UserId,
};
use config::{CallConfig, ConfigError};
use database::{CallDatabase, DatabaseError};
use ice::{CredentialSource, HttpCredentialSource, IceConfigProvider};
use media::{MediaConstraints, MediaDevices, MediaPrewarm};
use parking_lot::Mutex;
use peer::{
    ConnectionState, PeerConnectionManager, PeerDeps, PeerError, RtcTransportFactory,
    SessionEvent, SessionOptions, TransportFactory,
};
use presenter::{CallPresenter, CallView};
use signaling::{
    PolledSignalPath, RedundantSignaling, SignalPath, SignalingError, WebSocketRelay,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Initialisiert das Logging (`RUST_LOG` hat Vorrang), mehrfacher Aufruf ist harmlos
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("call_core=debug,webrtc=warn"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CallAppError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Call error: {0}")]
    Call(#[from] CallError),

    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("No active call")]
    NoActiveCall,
}

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Verdrahtet Controller, Signaling, ICE und Medien für einen Benutzer
pub struct CallApp {
    config: CallConfig,
    db: Arc<CallDatabase>,
    controller: Arc<CallController>,
    deps: PeerDeps,
    session: Mutex<Option<Arc<PeerConnectionManager>>>,
    presenter: Mutex<CallPresenter>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CallApp {
    pub fn builder(user_id: impl Into<UserId>) -> CallAppBuilder {
        CallAppBuilder::new(user_id.into())
    }

    pub fn user_id(&self) -> &UserId {
        self.controller.user_id()
    }

    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    pub fn database(&self) -> &Arc<CallDatabase> {
        &self.db
    }

    pub fn controller(&self) -> &Arc<CallController> {
        &self.controller
    }

    pub fn prewarm(&self) -> &Arc<MediaPrewarm> {
        &self.deps.prewarm
    }

    /// Peer Connection des laufenden Calls
    pub fn session(&self) -> Option<Arc<PeerConnectionManager>> {
        self.session.lock().clone()
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// Startet den Realtime-Listener und das Pre-Warming bei eingehenden Calls
    pub fn start(self: &Arc<Self>) -> Result<(), CallAppError> {
        let mut events = self.controller.subscribe();
        self.controller.start_listening()?;

        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                let event = events.recv().await;
                let Some(app) = weak.upgrade() else {
                    break;
                };
                match event {
                    Ok(CallEvent::Incoming(call)) => {
                        // Medien schon vor dem Annehmen anfordern
                        app.deps.prewarm.start(
                            Arc::clone(&app.deps.devices),
                            MediaConstraints::for_call(call.call_type),
                        );
                    }
                    Ok(CallEvent::Ended(call)) => app.release_session(&call.id),
                    Ok(CallEvent::Updated(_)) => {}
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });
        self.track(handle);

        tracing::info!("CallApp started for {}", self.user_id());
        Ok(())
    }

    // ========================================================================
    // CALLS
    // ========================================================================

    /// Ruft `callee_id` an und startet die Verhandlung als Initiator
    pub async fn start_call(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        callee_id: UserId,
        call_type: CallType,
    ) -> Result<Call, CallAppError> {
        let call = self
            .controller
            .start_call(conversation_id, callee_id, call_type)
            .await?;
        self.open_session(&call, true).await?;
        Ok(call)
    }

    /// Nimmt einen eingehenden Call an und wartet auf das Offer
    pub async fn accept_call(self: &Arc<Self>, call_id: &CallId) -> Result<Call, CallAppError> {
        let call = self.controller.accept_call(call_id).await?;
        self.open_session(&call, false).await?;
        Ok(call)
    }

    pub async fn decline_call(self: &Arc<Self>, call_id: &CallId) -> Result<Call, CallAppError> {
        let call = self.controller.decline_call(call_id).await?;
        self.deps.prewarm.discard();
        Ok(call)
    }

    /// Legt den aktuellen Call auf
    pub async fn hangup(self: &Arc<Self>) -> Result<Call, CallAppError> {
        let call_id = self
            .controller
            .active_call()
            .map(|c| c.id)
            .or_else(|| self.session().map(|s| s.call_id().clone()))
            .ok_or(CallAppError::NoActiveCall)?;
        Ok(self.controller.end_call(&call_id).await?)
    }

    pub fn toggle_mute(&self) -> Result<bool, CallAppError> {
        let session = self.session().ok_or(CallAppError::NoActiveCall)?;
        Ok(session.toggle_mute()?)
    }

    pub fn toggle_video(&self) -> Result<bool, CallAppError> {
        let session = self.session().ok_or(CallAppError::NoActiveCall)?;
        Ok(session.toggle_video()?)
    }

    pub async fn switch_camera(&self) -> Result<(), CallAppError> {
        let session = self.session().ok_or(CallAppError::NoActiveCall)?;
        Ok(session.switch_camera().await?)
    }

    /// Aktuelle Darstellung für die UI
    pub fn call_view(&self) -> CallView {
        let connection = self
            .session()
            .map(|s| s.state())
            .unwrap_or(ConnectionState::New);
        let incoming = self.controller.incoming_call();
        let active = self.controller.active_call();
        self.presenter
            .lock()
            .view(incoming.as_ref(), active.as_ref(), connection)
    }

    pub fn toggle_minimize(&self) -> bool {
        let view = self.call_view();
        self.presenter.lock().toggle_minimize(&view.screen)
    }

    /// Legt einen laufenden Call auf und stoppt alle Tasks
    pub async fn shutdown(self: &Arc<Self>) {
        let running = self
            .controller
            .active_call()
            .filter(|c| !c.status.is_terminal());
        if let Some(call) = running {
            if let Err(e) = self.controller.end_call(&call.id).await {
                tracing::warn!("Failed to end call {} on shutdown: {}", call.id, e);
            }
        }
        if let Some(session) = self.session.lock().take() {
            // end_call ist idempotent
            tokio::spawn(async move { session.end_call().await });
        }
        self.deps.prewarm.discard();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        tracing::info!("CallApp for {} shut down", self.user_id());
    }

    // ========================================================================
    // SESSION
    // ========================================================================

    async fn open_session(
        self: &Arc<Self>,
        call: &Call,
        initiator: bool,
    ) -> Result<(), CallAppError> {
        let manager = PeerConnectionManager::new(
            self.deps.clone(),
            SessionOptions {
                call_id: call.id.clone(),
                call_type: call.call_type,
                initiator,
                force_relay: self.config.force_relay(),
            },
        );

        let teardown: Arc<dyn SessionTeardown> = Arc::<PeerConnectionManager>::clone(&manager);
        self.controller.attach_session(call.id.clone(), teardown).await;
        self.session.lock().replace(Arc::clone(&manager));
        self.spawn_forwarder(&manager);

        if let Err(e) = manager.start_call().await {
            tracing::error!("Session for call {} failed to start: {}", call.id, e);
            if let Err(end_err) = self.controller.end_call(&call.id).await {
                tracing::warn!("Failed to end call {}: {}", call.id, end_err);
            }
            self.release_session(&call.id);
            return Err(e.into());
        }
        Ok(())
    }

    /// Leitet Verbindungsereignisse an den Controller weiter
    fn spawn_forwarder(&self, manager: &Arc<PeerConnectionManager>) {
        let mut events = manager.subscribe();
        let controller = Arc::clone(&self.controller);
        let call_id = manager.call_id().clone();

        let handle = tokio::spawn(async move {
            loop {
                let result = match events.recv().await {
                    Ok(SessionEvent::StateChanged(ConnectionState::Connected)) => {
                        controller
                            .report_connection(&call_id, ConnectionState::Connected)
                            .await
                    }
                    // Failed erst nach der Gnadenfrist
                    Ok(SessionEvent::Failed(reason)) => {
                        tracing::warn!("Session of call {} failed: {}", call_id, reason);
                        controller
                            .report_connection(&call_id, ConnectionState::Failed)
                            .await
                    }
                    Ok(SessionEvent::RemoteHangup) => {
                        let result = controller.on_remote_hangup(&call_id).await;
                        if let Err(e) = &result {
                            tracing::warn!("Remote hangup on call {}: {}", call_id, e);
                        }
                        break;
                    }
                    Ok(_) => Ok(()),
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!("Session events lagged by {}", missed);
                        Ok(())
                    }
                    Err(RecvError::Closed) => break,
                };
                if let Err(e) = result {
                    tracing::warn!("Failed to report state of call {}: {}", call_id, e);
                }
            }
        });
        self.track(handle);
    }

    fn release_session(&self, call_id: &CallId) {
        let mut slot = self.session.lock();
        if slot.as_ref().is_some_and(|s| s.call_id() == call_id) {
            slot.take();
        }
    }
}

impl std::fmt::Debug for CallApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallApp")
            .field("user_id", self.user_id())
            .field("active_call", &self.controller.active_call().map(|c| c.id))
            .field("has_session", &self.session.lock().is_some())
            .finish()
    }
}

impl Drop for CallApp {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

// ============================================================================
// BUILDER
// ============================================================================

/// Baut eine `CallApp`; nicht gesetzte Teile kommen aus der Konfiguration
pub struct CallAppBuilder {
    user_id: UserId,
    config: CallConfig,
    db: Option<Arc<CallDatabase>>,
    paths: Vec<Arc<dyn SignalPath>>,
    credentials: Option<Arc<dyn CredentialSource>>,
    ice: Option<Arc<IceConfigProvider>>,
    devices: Option<Arc<dyn MediaDevices>>,
    factory: Option<Arc<dyn TransportFactory>>,
}

impl CallAppBuilder {
    fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            config: CallConfig::default(),
            db: None,
            paths: Vec::new(),
            credentials: None,
            ice: None,
            devices: None,
            factory: None,
        }
    }

    pub fn config(mut self, config: CallConfig) -> Self {
        self.config = config;
        self
    }

    pub fn database(mut self, db: Arc<CallDatabase>) -> Self {
        self.db = Some(db);
        self
    }

    /// Zusätzlicher Signaling-Pfad (z.B. ein In-Process Hub)
    pub fn signal_path(mut self, path: Arc<dyn SignalPath>) -> Self {
        self.paths.push(path);
        self
    }

    pub fn credentials(mut self, source: Arc<dyn CredentialSource>) -> Self {
        self.credentials = Some(source);
        self
    }

    /// Gemeinsamer ICE-Cache mehrerer Apps im selben Prozess
    pub fn ice_provider(mut self, ice: Arc<IceConfigProvider>) -> Self {
        self.ice = Some(ice);
        self
    }

    pub fn devices(mut self, devices: Arc<dyn MediaDevices>) -> Self {
        self.devices = Some(devices);
        self
    }

    pub fn transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub async fn build(self) -> Result<Arc<CallApp>, CallAppError> {
        let config = self.config;
        config.timings.validate()?;

        let db = match self.db {
            Some(db) => db,
            None => Arc::new(match &config.database_path {
                Some(path) => CallDatabase::open(path)?,
                None => CallDatabase::open_default()?,
            }),
        };

        let mut paths = self.paths;
        if let Some(url) = &config.signaling_url {
            match WebSocketRelay::connect(url).await {
                Ok(relay) => paths.push(relay),
                // Der Polling-Pfad reicht allein aus
                Err(e) => tracing::warn!("Signaling relay unavailable, polling only: {}", e),
            }
        }
        paths.push(PolledSignalPath::new(Arc::clone(&db), config.poll_interval()));
        let signaling = Arc::new(RedundantSignaling::new(self.user_id.clone(), paths));

        let ice = match self.ice {
            Some(ice) => ice,
            None => {
                let source = self.credentials.or_else(|| {
                    let endpoint = config.turn_endpoint.as_deref()?;
                    match HttpCredentialSource::new(
                        endpoint,
                        config.turn_api_key.clone(),
                        config.ice_settings().fetch_timeout,
                    ) {
                        Ok(source) => Some(Arc::new(source) as Arc<dyn CredentialSource>),
                        Err(e) => {
                            tracing::warn!("TURN credentials disabled: {}", e);
                            None
                        }
                    }
                });
                Arc::new(IceConfigProvider::new(source, config.ice_settings()))
            }
        };

        let devices = match self.devices {
            Some(devices) => devices,
            None => default_devices(),
        };
        let factory = match self.factory {
            Some(factory) => factory,
            None => Arc::new(RtcTransportFactory::new()?),
        };

        let controller = CallController::new(
            self.user_id.clone(),
            Arc::clone(&db),
            Arc::clone(&signaling),
            config.controller_timings(),
        );
        let deps = PeerDeps {
            signaling,
            ice,
            devices,
            factory,
            prewarm: MediaPrewarm::new(config.prewarm_window()),
            timings: config.manager_timings(),
        };

        Ok(Arc::new(CallApp {
            presenter: Mutex::new(CallPresenter::new(self.user_id)),
            config,
            db,
            controller,
            deps,
            session: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }))
    }
}

#[cfg(feature = "native-audio")]
fn default_devices() -> Arc<dyn MediaDevices> {
    Arc::new(media::CpalMediaDevices::new())
}

#[cfg(not(feature = "native-audio"))]
fn default_devices() -> Arc<dyn MediaDevices> {
    tracing::warn!("No native media backend, using synthetic devices");
    Arc::new(media::SyntheticMediaDevices::new())
}
