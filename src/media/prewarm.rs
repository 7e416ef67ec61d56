//! Media Pre-Warming
//!
//! Startet die Medienaufnahme schon beim Klingeln, damit das Annehmen
//! schneller geht. Der Stream wird genau einmal von `take` übernommen oder
//! nach dem Zeitfenster (5s) freigegeben.

use super::stream::{MediaConstraints, MediaDevices, MediaStream};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Öffentlich sichtbare Phase des Caches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrewarmPhase {
    Empty,
    Warming,
    Ready,
    Consumed,
}

enum PrewarmState {
    Empty,
    Warming {
        generation: u64,
    },
    Ready {
        generation: u64,
        stream: MediaStream,
        constraints: MediaConstraints,
    },
    Consumed,
}

struct Inner {
    state: PrewarmState,
    generation: u64,
}

/// Cache für genau einen vorab geöffneten Stream
pub struct MediaPrewarm {
    inner: Mutex<Inner>,
    window: Duration,
}

impl MediaPrewarm {
    pub fn new(window: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                state: PrewarmState::Empty,
                generation: 0,
            }),
            window,
        })
    }

    pub fn phase(&self) -> PrewarmPhase {
        match self.inner.lock().state {
            PrewarmState::Empty => PrewarmPhase::Empty,
            PrewarmState::Warming { .. } => PrewarmPhase::Warming,
            PrewarmState::Ready { .. } => PrewarmPhase::Ready,
            PrewarmState::Consumed => PrewarmPhase::Consumed,
        }
    }

    /// Startet die Aufnahme im Hintergrund
    ///
    /// No-op, solange bereits ein Stream vorbereitet wird oder bereitliegt.
    pub fn start(self: &Arc<Self>, devices: Arc<dyn MediaDevices>, constraints: MediaConstraints) {
        let generation = {
            let mut inner = self.inner.lock();
            if matches!(
                inner.state,
                PrewarmState::Warming { .. } | PrewarmState::Ready { .. }
            ) {
                return;
            }
            inner.generation += 1;
            inner.state = PrewarmState::Warming {
                generation: inner.generation,
            };
            inner.generation
        };

        tracing::debug!("Pre-warming local media (generation {})", generation);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = devices.acquire(&constraints).await;

            {
                let mut inner = this.inner.lock();
                let current = matches!(
                    inner.state,
                    PrewarmState::Warming { generation: g } if g == generation
                );
                match result {
                    Ok(stream) if current => {
                        inner.state = PrewarmState::Ready {
                            generation,
                            stream,
                            constraints,
                        };
                    }
                    Ok(stream) => {
                        // Inzwischen verworfen
                        stream.stop_all();
                        return;
                    }
                    Err(e) => {
                        tracing::debug!("Pre-warm acquisition failed: {}", e);
                        if current {
                            inner.state = PrewarmState::Empty;
                        }
                        return;
                    }
                }
            }

            tokio::time::sleep(this.window).await;
            this.release(generation);
        });
    }

    /// Übernimmt den vorbereiteten Stream, falls er zu `constraints` passt
    pub fn take(&self, constraints: &MediaConstraints) -> Option<MediaStream> {
        let mut inner = self.inner.lock();
        match std::mem::replace(&mut inner.state, PrewarmState::Empty) {
            PrewarmState::Ready {
                stream,
                constraints: warmed,
                ..
            } if &warmed == constraints && stream.satisfies(constraints) => {
                inner.state = PrewarmState::Consumed;
                tracing::debug!("Using pre-warmed media stream {}", stream.id);
                Some(stream)
            }
            PrewarmState::Ready { stream, .. } => {
                stream.stop_all();
                None
            }
            other => {
                inner.state = other;
                None
            }
        }
    }

    /// Verwirft einen vorbereiteten oder laufenden Pre-Warm
    ///
    /// Ein noch laufender Abruf stoppt seinen Stream nach dem Eintreffen.
    pub fn discard(&self) {
        let mut inner = self.inner.lock();
        if let PrewarmState::Ready { stream, .. } =
            std::mem::replace(&mut inner.state, PrewarmState::Empty)
        {
            tracing::debug!("Discarding pre-warmed stream {}", stream.id);
            stream.stop_all();
        }
    }

    fn release(&self, generation: u64) {
        let mut inner = self.inner.lock();
        let expired = matches!(
            inner.state,
            PrewarmState::Ready { generation: g, .. } if g == generation
        );
        if !expired {
            return;
        }
        if let PrewarmState::Ready { stream, .. } =
            std::mem::replace(&mut inner.state, PrewarmState::Empty)
        {
            tracing::debug!("Releasing unused pre-warmed stream {}", stream.id);
            stream.stop_all();
        }
    }
}

impl std::fmt::Debug for MediaPrewarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaPrewarm")
            .field("phase", &self.phase())
            .field("window", &self.window)
            .finish()
    }
}
