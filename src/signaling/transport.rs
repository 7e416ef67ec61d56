//! Redundante Zustellung
//!
//! Jede Nachricht wird über alle konfigurierten Pfade gesendet (Broadcast
//! und dauerhafter Polling-Fallback). Der Empfänger führt beide Quellen
//! zusammen und verwirft Duplikate sowie eigene Nachrichten.

use super::messages::{DedupKey, SignalKind, SignalingMessage};
use crate::call::{CallId, UserId};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling relay")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Invalid signaling payload: {0}")]
    InvalidPayload(String),

    #[error("Signal store error: {0}")]
    Store(String),
}

// ============================================================================
// SIGNAL PATH
// ============================================================================

/// Aktive Subscription auf einem einzelnen Pfad
///
/// Beim Drop werden die Tasks abgebrochen und der Cleanup ausgeführt.
pub struct PathSubscription {
    tasks: Vec<JoinHandle<()>>,
    on_close: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl PathSubscription {
    pub fn new(tasks: Vec<JoinHandle<()>>) -> Self {
        Self {
            tasks,
            on_close: None,
        }
    }

    /// Zusätzlicher Cleanup beim Schließen (z.B. Kanal verlassen)
    pub fn with_cleanup(mut self, cleanup: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.on_close = Some(Box::new(cleanup));
        self
    }
}

impl Drop for PathSubscription {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        if let Some(cleanup) = self.on_close.take() {
            cleanup();
        }
    }
}

/// Ein einzelner, unzuverlässiger Zustellweg
#[async_trait]
pub trait SignalPath: Send + Sync {
    /// Name für Logs
    fn name(&self) -> &'static str;

    async fn publish(&self, message: &SignalingMessage) -> Result<(), SignalingError>;

    /// Leitet alle Nachrichten des Calls an `sink` weiter, bis die
    /// Subscription gedroppt wird
    async fn subscribe(
        &self,
        call_id: &CallId,
        sink: mpsc::UnboundedSender<SignalingMessage>,
    ) -> Result<PathSubscription, SignalingError>;
}

// ============================================================================
// REDUNDANT SIGNALING
// ============================================================================

/// Signaling über mehrere redundante Pfade
pub struct RedundantSignaling {
    local_user: UserId,
    paths: Vec<Arc<dyn SignalPath>>,
    seq: AtomicU64,
}

impl RedundantSignaling {
    pub fn new(local_user: UserId, paths: Vec<Arc<dyn SignalPath>>) -> Self {
        Self {
            local_user,
            paths,
            seq: AtomicU64::new(0),
        }
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    /// Baut eine Nachricht dieses Benutzers mit fortlaufender Sequenznummer
    pub fn message<T: Serialize>(
        &self,
        call_id: &CallId,
        kind: SignalKind,
        payload: &T,
    ) -> Result<SignalingMessage, SignalingError> {
        SignalingMessage::with_payload(
            call_id.clone(),
            self.local_user.clone(),
            kind,
            payload,
            self.next_seq(),
        )
    }

    /// Sendet ein Hangup für den Call
    pub async fn publish_hangup(&self, call_id: &CallId) {
        let message = SignalingMessage::new(
            call_id.clone(),
            self.local_user.clone(),
            SignalKind::Hangup,
            String::new(),
            self.next_seq(),
        );
        self.publish(message).await;
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Sendet über alle Pfade
    ///
    /// Schlägt nie fehl. Fallen alle Pfade aus, endet der Call später über
    /// den Verbindungs-Timeout der Peer Connection.
    pub async fn publish(&self, message: SignalingMessage) {
        let sends = self.paths.iter().map(|path| {
            let message = &message;
            async move { (path.name(), path.publish(message).await) }
        });

        let mut delivered = 0usize;
        for (name, result) in futures::future::join_all(sends).await {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!("Signal path '{}' failed to publish: {}", name, e),
            }
        }

        if delivered == 0 {
            tracing::error!(
                "All signal paths failed for {} on call {}",
                message.kind,
                message.call_id
            );
        } else {
            tracing::debug!(
                "Published {} #{} on call {} via {} path(s)",
                message.kind,
                message.seq,
                message.call_id,
                delivered
            );
        }
    }

    /// Abonniert alle Pfade für einen Call
    ///
    /// Pfade, deren Subscribe fehlschlägt, werden übersprungen.
    pub async fn subscribe(&self, call_id: &CallId) -> SignalSubscription {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<SignalingMessage>();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let mut paths = Vec::with_capacity(self.paths.len());
        for path in &self.paths {
            match path.subscribe(call_id, raw_tx.clone()).await {
                Ok(subscription) => paths.push(subscription),
                Err(e) => tracing::warn!("Signal path '{}' failed to subscribe: {}", path.name(), e),
            }
        }
        drop(raw_tx);

        let local_user = self.local_user.clone();
        let forwarder = tokio::spawn(async move {
            let mut seen: HashSet<DedupKey> = HashSet::new();
            while let Some(message) = raw_rx.recv().await {
                if message.sender_id == local_user {
                    continue;
                }
                if !seen.insert(message.dedup_key()) {
                    tracing::trace!("Dropping duplicate {} #{}", message.kind, message.seq);
                    continue;
                }
                if out_tx.send(message).is_err() {
                    break;
                }
            }
        });

        SignalSubscription {
            rx: out_rx,
            _paths: paths,
            forwarder,
        }
    }
}

impl std::fmt::Debug for RedundantSignaling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedundantSignaling")
            .field("local_user", &self.local_user)
            .field(
                "paths",
                &self.paths.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Zusammengeführter, deduplizierter Nachrichtenstrom eines Calls
///
/// Droppen verlässt alle Kanäle und beendet das Polling.
pub struct SignalSubscription {
    rx: mpsc::UnboundedReceiver<SignalingMessage>,
    _paths: Vec<PathSubscription>,
    forwarder: JoinHandle<()>,
}

impl SignalSubscription {
    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        self.rx.recv().await
    }
}

impl Drop for SignalSubscription {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::{BroadcastHub, SessionDescription};
    use std::time::Duration;

    /// Pfad der jede Nachricht verliert
    struct BrokenPath;

    #[async_trait]
    impl SignalPath for BrokenPath {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn publish(&self, _message: &SignalingMessage) -> Result<(), SignalingError> {
            Err(SignalingError::NotConnected)
        }

        async fn subscribe(
            &self,
            _call_id: &CallId,
            _sink: mpsc::UnboundedSender<SignalingMessage>,
        ) -> Result<PathSubscription, SignalingError> {
            Err(SignalingError::NotConnected)
        }
    }

    fn signaling(user: &str, paths: Vec<Arc<dyn SignalPath>>) -> RedundantSignaling {
        RedundantSignaling::new(user.into(), paths)
    }

    #[tokio::test]
    async fn test_duplicate_over_two_paths_is_delivered_once() {
        let hub_a = BroadcastHub::new();
        let hub_b = BroadcastHub::new();
        let paths: Vec<Arc<dyn SignalPath>> = vec![hub_a, hub_b];

        let alice = signaling("alice", paths.clone());
        let bob = signaling("bob", paths);
        let call_id = CallId::from("call-1");

        let mut sub = bob.subscribe(&call_id).await;
        let offer = alice
            .message(&call_id, SignalKind::Offer, &SessionDescription::offer("v=0"))
            .unwrap();
        alice.publish(offer.clone()).await;
        // Erneutes Senden derselben Payload
        alice.publish(offer).await;

        let received = sub.recv().await.unwrap();
        assert_eq!(received.kind, SignalKind::Offer);
        assert!(tokio::time::timeout(Duration::from_millis(50), sub.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_own_messages_are_filtered() {
        let hub = BroadcastHub::new();
        let alice = signaling("alice", vec![hub.clone() as Arc<dyn SignalPath>]);
        let call_id = CallId::from("call-1");

        let mut sub = alice.subscribe(&call_id).await;
        alice.publish_hangup(&call_id).await;

        assert!(tokio::time::timeout(Duration::from_millis(50), sub.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_one_broken_path_is_tolerated() {
        let hub = BroadcastHub::new();
        let paths: Vec<Arc<dyn SignalPath>> = vec![Arc::new(BrokenPath), hub];
        let alice = signaling("alice", paths.clone());
        let bob = signaling("bob", paths);
        let call_id = CallId::from("call-1");

        let mut sub = bob.subscribe(&call_id).await;
        alice.publish_hangup(&call_id).await;

        let received = sub.recv().await.unwrap();
        assert_eq!(received.kind, SignalKind::Hangup);
        assert!(received.payload.is_empty());
    }

    #[tokio::test]
    async fn test_all_paths_broken_does_not_fail() {
        let alice = signaling("alice", vec![Arc::new(BrokenPath)]);
        alice.publish_hangup(&"call-1".into()).await;

        let mut sub = alice.subscribe(&"call-1".into()).await;
        // Keine Quelle mehr: Strom endet sofort
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_drop_leaves_channel() {
        let hub = BroadcastHub::new();
        let bob = signaling("bob", vec![hub.clone() as Arc<dyn SignalPath>]);
        let call_id = CallId::from("call-1");

        let sub = bob.subscribe(&call_id).await;
        assert_eq!(hub.subscriber_count(&call_id), 1);
        drop(sub);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hub.subscriber_count(&call_id), 0);
    }
}
