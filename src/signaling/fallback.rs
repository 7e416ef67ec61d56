//! Dauerhafter Fallback-Pfad
//!
//! Jede Nachricht landet zusätzlich als Zeile in `call_signals`. Der
//! Empfänger pollt in festem Intervall ab seinem Cursor, dadurch erreicht
//! ihn auch ein verpasster Broadcast (z.B. Offer vor dem Subscribe).

use super::messages::SignalingMessage;
use super::transport::{PathSubscription, SignalPath, SignalingError};
use crate::call::CallId;
use crate::database::CallDatabase;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

/// Polling über die Signal-Tabelle der Call-Datenbank
pub struct PolledSignalPath {
    db: Arc<CallDatabase>,
    interval: Duration,
}

/// Untergrenze, `tokio::time::interval` verlangt eine Periode > 0
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

impl PolledSignalPath {
    pub fn new(db: Arc<CallDatabase>, interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            db,
            interval: interval.max(MIN_POLL_INTERVAL),
        })
    }
}

#[async_trait]
impl SignalPath for PolledSignalPath {
    fn name(&self) -> &'static str {
        "durable"
    }

    async fn publish(&self, message: &SignalingMessage) -> Result<(), SignalingError> {
        self.db
            .insert_signal(message)
            .map(|_| ())
            .map_err(|e| SignalingError::Store(e.to_string()))
    }

    async fn subscribe(
        &self,
        call_id: &CallId,
        sink: mpsc::UnboundedSender<SignalingMessage>,
    ) -> Result<PathSubscription, SignalingError> {
        let db = Arc::clone(&self.db);
        let call_id = call_id.clone();
        let period = self.interval;

        let task = tokio::spawn(async move {
            let mut cursor = 0i64;
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let rows = match db.signals_after(&call_id, cursor) {
                    Ok(rows) => rows,
                    Err(e) => {
                        tracing::warn!("Polling signals for call {} failed: {}", call_id, e);
                        continue;
                    }
                };

                for (row_id, message) in rows {
                    cursor = row_id;
                    if sink.send(message).is_err() {
                        return;
                    }
                }
            }
        });

        Ok(PathSubscription::new(vec![task]))
    }
}

impl std::fmt::Debug for PolledSignalPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolledSignalPath")
            .field("interval", &self.interval)
            .finish()
    }
}
