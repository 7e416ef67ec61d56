//! In-Process Broadcast-Hub
//!
//! Pub/Sub ohne Presence, pro Kanalname ein `tokio::sync::broadcast`.
//! Wird für Tests und den Loopback-Betrieb als Broadcast-Pfad genutzt.

use super::messages::{channel_name, SignalingMessage};
use super::transport::{PathSubscription, SignalPath, SignalingError};
use crate::call::CallId;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

const CHANNEL_CAPACITY: usize = 64;

type Channels = Arc<Mutex<HashMap<String, broadcast::Sender<SignalingMessage>>>>;

/// Broadcast-Primitive, gescoped über beliebige Kanalnamen
///
/// Ein Kanal existiert nur solange er Subscriber hat.
pub struct BroadcastHub {
    channels: Channels,
    /// Simuliert ein Netzwerk, das keine Broadcasts zustellt
    dropping: AtomicBool,
}

impl BroadcastHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            dropping: AtomicBool::new(false),
        })
    }

    /// Anzahl offener Kanäle
    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    /// Anzahl aktiver Subscriber im Kanal eines Calls
    pub fn subscriber_count(&self, call_id: &CallId) -> usize {
        self.channels
            .lock()
            .get(&channel_name(call_id))
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Verwirft ab jetzt alle Nachrichten stillschweigend
    pub fn set_dropping(&self, dropping: bool) {
        self.dropping.store(dropping, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignalPath for BroadcastHub {
    fn name(&self) -> &'static str {
        "broadcast"
    }

    async fn publish(&self, message: &SignalingMessage) -> Result<(), SignalingError> {
        if self.dropping.load(Ordering::SeqCst) {
            return Ok(());
        }
        // Kein Empfänger im Kanal ist kein Fehler (keine Bestätigung)
        let channel = channel_name(&message.call_id);
        let mut channels = self.channels.lock();
        let delivered = channels
            .get(&channel)
            .map(|tx| tx.send(message.clone()).is_ok());
        if delivered == Some(false) {
            channels.remove(&channel);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        call_id: &CallId,
        sink: mpsc::UnboundedSender<SignalingMessage>,
    ) -> Result<PathSubscription, SignalingError> {
        let channel = channel_name(call_id);
        let mut rx = self
            .channels
            .lock()
            .entry(channel.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        let cleanup_channels = Arc::clone(&self.channels);
        let cleanup_channel = channel.clone();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => {
                        if sink.send(message).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Broadcast channel {} lagged by {}", channel, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        // Der abgebrochene Task gibt seinen Receiver erst später frei, leere
        // Kanäle räumt dann `publish` auf
        Ok(PathSubscription::new(vec![task]).with_cleanup(move || {
            let mut channels = cleanup_channels.lock();
            if channels
                .get(&cleanup_channel)
                .is_some_and(|tx| tx.receiver_count() == 0)
            {
                channels.remove(&cleanup_channel);
            }
        }))
    }
}

impl std::fmt::Debug for BroadcastHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastHub")
            .field("channels", &self.channel_count())
            .field("dropping", &self.dropping.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::SignalKind;
    use std::time::Duration;

    #[tokio::test]
    async fn test_channels_are_scoped_by_call() {
        let hub = BroadcastHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = hub.subscribe(&"call-1".into(), tx).await.unwrap();

        let other = SignalingMessage::new("call-2".into(), "a".into(), SignalKind::Hangup, String::new(), 1);
        let mine = SignalingMessage::new("call-1".into(), "a".into(), SignalKind::Hangup, String::new(), 2);
        hub.publish(&other).await.unwrap();
        hub.publish(&mine).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().seq, 2);
    }

    #[tokio::test]
    async fn test_channels_are_removed_without_subscribers() {
        let hub = BroadcastHub::new();
        let call_id = CallId::from("call-1");

        // Ohne Subscriber entsteht kein Kanal
        let message = SignalingMessage::new(call_id.clone(), "a".into(), SignalKind::Hangup, String::new(), 1);
        hub.publish(&message).await.unwrap();
        assert_eq!(hub.channel_count(), 0);

        let (tx, _rx) = mpsc::unbounded_channel();
        let sub = hub.subscribe(&call_id, tx).await.unwrap();
        assert_eq!(hub.channel_count(), 1);
        assert_eq!(hub.subscriber_count(&call_id), 1);

        drop(sub);
        tokio::time::sleep(Duration::from_millis(20)).await;
        hub.publish(&message).await.unwrap();
        assert_eq!(hub.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_dropping_hub_delivers_nothing() {
        let hub = BroadcastHub::new();
        hub.set_dropping(true);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = hub.subscribe(&"call-1".into(), tx).await.unwrap();

        let message = SignalingMessage::new("call-1".into(), "a".into(), SignalKind::Hangup, String::new(), 1);
        hub.publish(&message).await.unwrap();

        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv())
            .await
            .is_err());
    }
}
