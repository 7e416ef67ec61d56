//! Call Lifecycle Controller
//!
//! Einzige Autorität über den Status eines Calls. Der persistierte Record ist
//! die Quelle der Wahrheit, beide Seiten reagieren auf dessen Change-Feed.
//! Lokal gehalten werden nur abgeleitete Sichten (`active_call`,
//! `incoming_call`).

use super::model::{Call, CallId, CallStatus, CallType, ConversationId, NewCall, UserId};
use super::CallError;
use crate::database::{CallChange, CallDatabase, ChangeKind};
use crate::peer::ConnectionState;
use crate::signaling::RedundantSignaling;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerTimings {
    /// Ab diesem Alter gilt ein klingelnder Call als Geister-Call
    pub stale_after: Duration,
    /// Danach wird ein unbeantworteter Call `missed`
    pub ring_timeout: Duration,
    /// So lange bleibt ein beendeter Call sichtbar
    pub ended_display: Duration,
    /// Beendete Calls älter als das werden beim Start gelöscht
    pub history_retention: Duration,
}

impl Default for ControllerTimings {
    fn default() -> Self {
        Self {
            stale_after: super::STALE_CALL_AFTER,
            ring_timeout: Duration::from_secs(60),
            ended_display: Duration::from_millis(500),
            history_retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Events für die UI
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Neuer eingehender Call
    Incoming(Call),
    /// Status oder Zeitstempel haben sich geändert
    Updated(Call),
    /// Call ist beendet, lokale Ressourcen sind freigegeben
    Ended(Call),
}

/// Lokale Medien-Session eines Calls, die beim Beenden abgebaut wird
#[async_trait]
pub trait SessionTeardown: Send + Sync {
    async fn teardown(&self);
}

// ============================================================================
// CONTROLLER
// ============================================================================

pub struct CallController {
    user_id: UserId,
    db: Arc<CallDatabase>,
    signaling: Arc<RedundantSignaling>,
    timings: ControllerTimings,
    active_tx: watch::Sender<Option<Call>>,
    incoming_tx: watch::Sender<Option<Call>>,
    event_tx: broadcast::Sender<CallEvent>,
    session: Mutex<Option<(CallId, Arc<dyn SessionTeardown>)>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CallController {
    pub fn new(
        user_id: UserId,
        db: Arc<CallDatabase>,
        signaling: Arc<RedundantSignaling>,
        timings: ControllerTimings,
    ) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            user_id,
            db,
            signaling,
            timings,
            active_tx: watch::channel(None).0,
            incoming_tx: watch::channel(None).0,
            event_tx,
            session: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    /// Aktueller (ausgehender oder angenommener) Call
    pub fn active_call(&self) -> Option<Call> {
        self.active_tx.borrow().clone()
    }

    pub fn watch_active(&self) -> watch::Receiver<Option<Call>> {
        self.active_tx.subscribe()
    }

    /// Klingelnder eingehender Call
    pub fn incoming_call(&self) -> Option<Call> {
        self.incoming_tx.borrow().clone()
    }

    pub fn watch_incoming(&self) -> watch::Receiver<Option<Call>> {
        self.incoming_tx.subscribe()
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.event_tx.send(event);
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    fn is_stale(&self, call: &Call) -> bool {
        call.is_stale(Utc::now(), self.timings.stale_after)
    }

    // ========================================================================
    // OPERATIONS
    // ========================================================================

    /// Startet einen Call an `callee_id` in `conversation_id`
    pub async fn start_call(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        callee_id: UserId,
        call_type: CallType,
    ) -> Result<Call, CallError> {
        if callee_id == self.user_id {
            return Err(CallError::SelfCall);
        }
        for user_id in [&self.user_id, &callee_id] {
            if !self.db.is_member(&conversation_id, user_id)? {
                return Err(CallError::NotInConversation {
                    conversation_id: conversation_id.clone(),
                    user_id: user_id.clone(),
                });
            }
        }

        self.clear_previous_call().await?;

        let call = self.db.insert_call(NewCall {
            caller_id: self.user_id.clone(),
            callee_id,
            conversation_id,
            call_type,
            created_at: Utc::now(),
        })?;
        tracing::info!(
            "Started {} call {} to {}",
            call.call_type,
            call.id,
            call.callee_id
        );

        self.active_tx.send_replace(Some(call.clone()));
        self.emit(CallEvent::Updated(call.clone()));
        self.spawn_ring_timeout(call.id.clone());
        Ok(call)
    }

    /// Nimmt einen eingehenden Call an
    ///
    /// Der Status bleibt `calling`/`ringing`, bis die Medienverbindung steht
    /// (`mark_active`).
    pub async fn accept_call(self: &Arc<Self>, call_id: &CallId) -> Result<Call, CallError> {
        let call = self.db.get_call(call_id)?;
        if call.callee_id != self.user_id {
            return Err(CallError::NotCallee(call_id.clone()));
        }
        if call.status == CallStatus::Missed {
            self.forget(&call);
            return Err(CallError::CallExpired(call_id.clone()));
        }
        if !call.status.is_pending() {
            return Err(CallError::InvalidTransition {
                from: call.status,
                to: CallStatus::Active,
            });
        }
        if self.is_stale(&call) {
            if let Some(missed) = self.db.transition(call_id, CallStatus::Missed, Utc::now())? {
                self.finish(missed).await;
            }
            return Err(CallError::CallExpired(call_id.clone()));
        }

        if self.active_call().map(|a| a.id) != Some(call.id.clone()) {
            self.clear_previous_call().await?;
        }

        tracing::info!("Accepted call {} from {}", call.id, call.caller_id);
        self.incoming_tx.send_replace(None);
        self.active_tx.send_replace(Some(call.clone()));
        self.emit(CallEvent::Updated(call.clone()));
        Ok(call)
    }

    /// Lehnt einen eingehenden Call ab
    pub async fn decline_call(self: &Arc<Self>, call_id: &CallId) -> Result<Call, CallError> {
        let call = self.db.get_call(call_id)?;
        if call.callee_id != self.user_id {
            return Err(CallError::NotCallee(call_id.clone()));
        }

        match self.db.transition(call_id, CallStatus::Declined, Utc::now())? {
            Some(declined) => {
                tracing::info!("Declined call {}", call_id);
                self.signaling.publish_hangup(call_id).await;
                self.finish(declined.clone()).await;
                Ok(declined)
            }
            None => {
                let current = self.db.get_call(call_id)?;
                if current.status.is_terminal() {
                    self.finish(current.clone()).await;
                    return Ok(current);
                }
                Err(CallError::InvalidTransition {
                    from: current.status,
                    to: CallStatus::Declined,
                })
            }
        }
    }

    /// Legt auf bzw. bricht einen ausgehenden Call ab
    ///
    /// Der Status wird persistiert, bevor das Hangup gesendet wird. Bereits
    /// beendete Calls werden nur noch lokal aufgeräumt.
    pub async fn end_call(self: &Arc<Self>, call_id: &CallId) -> Result<Call, CallError> {
        let call = self.db.get_call(call_id)?;
        if !call.involves(&self.user_id) {
            return Err(CallError::NotParticipant(call_id.clone()));
        }
        if call.status.is_terminal() {
            self.finish(call.clone()).await;
            return Ok(call);
        }

        let ended = match self.db.transition(call_id, CallStatus::Ended, Utc::now())? {
            Some(ended) => {
                tracing::info!("Ended call {}", call_id);
                self.signaling.publish_hangup(call_id).await;
                ended
            }
            // Die Gegenseite war schneller
            None => self.db.get_call(call_id)?,
        };

        self.finish(ended.clone()).await;
        Ok(ended)
    }

    /// Markiert den Call als aktiv (erster Schreiber gewinnt)
    pub fn mark_active(&self, call_id: &CallId) -> Result<Option<Call>, CallError> {
        let activated = self.db.transition(call_id, CallStatus::Active, Utc::now())?;
        match &activated {
            Some(call) => {
                tracing::info!("Call {} is active", call.id);
                self.update_views(call);
            }
            None => tracing::debug!("Call {} already active or finished", call_id),
        }
        Ok(activated)
    }

    /// Zustandsmeldung der Peer Connection
    pub async fn report_connection(
        self: &Arc<Self>,
        call_id: &CallId,
        state: ConnectionState,
    ) -> Result<(), CallError> {
        match state {
            ConnectionState::Connected => {
                self.mark_active(call_id)?;
            }
            ConnectionState::Failed => {
                tracing::error!("Connection failed on call {}, hanging up", call_id);
                self.end_call(call_id).await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Die Gegenseite hat aufgelegt (Session ist bereits abgebaut)
    pub async fn on_remote_hangup(self: &Arc<Self>, call_id: &CallId) -> Result<(), CallError> {
        let call = self.db.get_call(call_id)?;
        if call.status.is_terminal() {
            self.finish(call).await;
            return Ok(());
        }
        // Hangup ohne persistierten Endzustand
        self.end_call(call_id).await?;
        Ok(())
    }

    /// Verknüpft die Medien-Session mit einem Call
    ///
    /// Eine noch vorhandene Session eines anderen Calls wird vorher abgebaut.
    pub async fn attach_session(&self, call_id: CallId, session: Arc<dyn SessionTeardown>) {
        let previous = self.session.lock().replace((call_id.clone(), Arc::clone(&session)));
        if let Some((previous_id, previous)) = previous {
            if previous_id != call_id {
                tracing::warn!("Tearing down leftover session of call {}", previous_id);
            }
            previous.teardown().await;
        }

        let finished = self
            .db
            .get_call(&call_id)
            .map(|c| c.status.is_terminal())
            .unwrap_or(true);
        if finished {
            let current = {
                let mut slot = self.session.lock();
                match slot.as_ref() {
                    Some((id, _)) if id == &call_id => slot.take(),
                    _ => None,
                }
            };
            if let Some((_, session)) = current {
                session.teardown().await;
            }
        }
    }

    /// Alle eingehenden, noch nicht abgelaufenen Calls (neueste zuerst)
    pub fn list_incoming(&self) -> Result<Vec<Call>, CallError> {
        let calls = self
            .db
            .calls_for_user(&self.user_id, &[CallStatus::Calling, CallStatus::Ringing])?;
        Ok(calls
            .into_iter()
            .filter(|c| c.callee_id == self.user_id && !self.is_stale(c))
            .collect())
    }

    /// Markiert eigene Geister-Calls als `missed`, gibt deren Anzahl zurück
    pub fn cleanup_stale_calls(&self) -> Result<usize, CallError> {
        let pending = self
            .db
            .calls_for_user(&self.user_id, &[CallStatus::Calling, CallStatus::Ringing])?;
        let mut cleaned = 0;
        for call in pending.iter().filter(|c| self.is_stale(c)) {
            if self
                .db
                .transition(&call.id, CallStatus::Missed, Utc::now())?
                .is_some()
            {
                cleaned += 1;
            }
        }
        if cleaned > 0 {
            tracing::info!("Marked {} stale call(s) as missed", cleaned);
        }
        Ok(cleaned)
    }

    /// Löscht beendete Calls, die länger als `history_retention` her sind
    pub fn purge_history(&self) -> Result<usize, CallError> {
        let cutoff = chrono::Duration::from_std(self.timings.history_retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention));
        let Some(cutoff) = cutoff else {
            return Ok(0);
        };
        let purged = self.db.purge_finished(cutoff)?;
        if purged > 0 {
            tracing::info!("Purged {} finished call(s)", purged);
        }
        Ok(purged)
    }

    // ========================================================================
    // REALTIME LISTENER
    // ========================================================================

    /// Räumt Geister-Calls auf, lädt eingehende Calls und folgt dem Change-Feed
    pub fn start_listening(self: &Arc<Self>) -> Result<(), CallError> {
        let mut changes = self.db.subscribe();

        self.cleanup_stale_calls()?;
        self.purge_history()?;
        self.load_incoming()?;

        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                let change = changes.recv().await;
                let Some(this) = weak.upgrade() else {
                    break;
                };
                match change {
                    Ok(change) => this.on_change(change).await,
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!("Call feed lagged by {} change(s), resyncing", missed);
                        if let Err(e) = this.load_incoming() {
                            tracing::error!("Resync failed: {}", e);
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        self.track(handle);
        Ok(())
    }

    fn load_incoming(&self) -> Result<(), CallError> {
        if let Some(call) = self.list_incoming()?.into_iter().next() {
            self.offer_incoming(call);
        }
        Ok(())
    }

    async fn on_change(self: &Arc<Self>, change: CallChange) {
        let call = change.call;
        if !call.involves(&self.user_id) {
            return;
        }

        if change.kind == ChangeKind::Delete {
            self.forget(&call);
            return;
        }

        if call.status.is_terminal() {
            self.finish(call).await;
            return;
        }

        let is_active = self.active_call().is_some_and(|a| a.id == call.id);
        if is_active {
            self.update_views(&call);
            return;
        }

        if call.callee_id == self.user_id && call.status.is_pending() {
            if self.is_stale(&call) {
                tracing::debug!("Ignoring stale call {}", call.id);
                return;
            }
            if call.status == CallStatus::Calling {
                // Empfang bestätigen, das folgende Update zeigt den Call an
                match self.db.transition(&call.id, CallStatus::Ringing, Utc::now()) {
                    Ok(Some(_)) => return,
                    Ok(None) => {}
                    Err(e) => tracing::warn!("Failed to acknowledge call {}: {}", call.id, e),
                }
            }
            self.offer_incoming(call);
        }
    }

    /// Zeigt einen eingehenden Call an, außer es läuft schon einer
    fn offer_incoming(&self, call: Call) {
        let busy_with_other = |slot: &Option<Call>| {
            slot.as_ref()
                .is_some_and(|c| c.id != call.id && !c.status.is_terminal())
        };
        if busy_with_other(&*self.incoming_tx.borrow())
            || busy_with_other(&*self.active_tx.borrow())
        {
            tracing::info!("Busy, not surfacing incoming call {}", call.id);
            return;
        }

        let is_new = self
            .incoming_tx
            .borrow()
            .as_ref()
            .map_or(true, |c| c.id != call.id);
        self.incoming_tx.send_replace(Some(call.clone()));
        if is_new {
            tracing::info!(
                "Incoming {} call {} from {}",
                call.call_type,
                call.id,
                call.caller_id
            );
            self.emit(CallEvent::Incoming(call));
        } else {
            self.emit(CallEvent::Updated(call));
        }
    }

    fn update_views(&self, call: &Call) {
        let mut changed = false;
        self.active_tx.send_if_modified(|slot| match slot {
            Some(current) if current.id == call.id => {
                *current = call.clone();
                changed = true;
                true
            }
            _ => false,
        });
        self.incoming_tx.send_if_modified(|slot| match slot {
            Some(current) if current.id == call.id => {
                *current = call.clone();
                changed = true;
                true
            }
            _ => false,
        });
        if changed {
            self.emit(CallEvent::Updated(call.clone()));
        }
    }

    /// Entfernt einen Call aus allen Sichten ohne Ended-Anzeige
    fn forget(&self, call: &Call) {
        let clear = |slot: &mut Option<Call>| {
            if slot.as_ref().is_some_and(|c| c.id == call.id) {
                *slot = None;
                true
            } else {
                false
            }
        };
        self.incoming_tx.send_if_modified(clear);
        self.active_tx.send_if_modified(clear);
    }

    // ========================================================================
    // TEARDOWN
    // ========================================================================

    /// Lokales Aufräumen nach einem Endzustand
    ///
    /// Erst wird die Medien-Session abgebaut, danach werden die Sichten
    /// aktualisiert. Mehrfache Aufrufe sind harmlos.
    async fn finish(self: &Arc<Self>, call: Call) {
        let session = {
            let mut slot = self.session.lock();
            match slot.as_ref() {
                Some((id, _)) if id == &call.id => slot.take(),
                _ => None,
            }
        };
        if let Some((_, session)) = session {
            session.teardown().await;
        }

        let mut changed = false;
        self.incoming_tx.send_if_modified(|slot| {
            if slot.as_ref().is_some_and(|c| c.id == call.id) {
                *slot = None;
                changed = true;
                true
            } else {
                false
            }
        });
        self.active_tx.send_if_modified(|slot| match slot {
            Some(current) if current.id == call.id && !current.status.is_terminal() => {
                *current = call.clone();
                changed = true;
                true
            }
            _ => false,
        });
        if !changed {
            return;
        }

        tracing::info!("Call {} finished as {}", call.id, call.status);
        self.emit(CallEvent::Ended(call.clone()));
        self.spawn_clear_ended(call.id);
    }

    /// Erzwingt das Aufräumen eines alten Calls vor einem neuen
    async fn clear_previous_call(self: &Arc<Self>) -> Result<(), CallError> {
        let Some(previous) = self.active_call() else {
            return Ok(());
        };
        let current = match self.db.get_call(&previous.id) {
            Ok(call) => call,
            Err(crate::database::DatabaseError::CallNotFound(_)) => {
                self.forget(&previous);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if current.status.is_terminal() {
            self.finish(current.clone()).await;
            self.forget(&current);
            return Ok(());
        }
        if self.is_stale(&current) {
            tracing::warn!("Force-cleaning stale call {}", current.id);
            let missed = self
                .db
                .transition(&current.id, CallStatus::Missed, Utc::now())?
                .unwrap_or(current);
            self.finish(missed.clone()).await;
            self.forget(&missed);
            return Ok(());
        }
        Err(CallError::AlreadyInCall)
    }

    // ========================================================================
    // TIMERS
    // ========================================================================

    fn spawn_ring_timeout(self: &Arc<Self>, call_id: CallId) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let timeout = self.timings.ring_timeout;
        self.track(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(this) = weak.upgrade() else {
                return;
            };
            match this.db.transition(&call_id, CallStatus::Missed, Utc::now()) {
                Ok(Some(missed)) => {
                    tracing::info!("Call {} was not answered", call_id);
                    this.signaling.publish_hangup(&call_id).await;
                    this.finish(missed).await;
                }
                Ok(None) => {}
                Err(e) => tracing::error!("Ring timeout for {} failed: {}", call_id, e),
            }
        }));
    }

    /// Blendet den beendeten Call nach `ended_display` aus und entfernt
    /// danach die Signal-Zeilen
    fn spawn_clear_ended(self: &Arc<Self>, call_id: CallId) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let display = self.timings.ended_display;
        let retention = self.timings.stale_after;
        self.track(tokio::spawn(async move {
            tokio::time::sleep(display).await;
            let Some(this) = weak.upgrade() else {
                return;
            };
            this.active_tx.send_if_modified(|slot| {
                if slot.as_ref().is_some_and(|c| c.id == call_id) {
                    *slot = None;
                    true
                } else {
                    false
                }
            });
            drop(this);

            tokio::time::sleep(retention).await;
            if let Some(this) = weak.upgrade() {
                if let Err(e) = this.db.purge_signals(&call_id) {
                    tracing::warn!("Failed to purge signals of {}: {}", call_id, e);
                }
            }
        }));
    }
}

impl Drop for CallController {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for CallController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallController")
            .field("user_id", &self.user_id)
            .field("active_call", &self.active_call().map(|c| c.id))
            .field("incoming_call", &self.incoming_call().map(|c| c.id))
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
