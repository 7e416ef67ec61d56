//! Call UI Presenter
//!
//! Leitet den angezeigten Bildschirm allein aus dem Zustand des Call
//! Lifecycle Controllers und der Verbindung ab. Sendet selbst kein
//! Signaling.

use crate::call::{Call, CallRole, CallStatus, UserId};
use crate::peer::ConnectionState;
use serde::Serialize;

// ============================================================================
// SCREEN
// ============================================================================

/// Angezeigter Call-Bildschirm
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "screen", rename_all = "snake_case")]
pub enum CallScreen {
    /// Kein Call
    Hidden,
    /// Eingehender Call, wartet auf Annehmen/Ablehnen
    Incoming { call: Call },
    /// Ausgehender Call, Gegenseite hat noch nicht angenommen
    Outgoing { call: Call },
    /// Angenommen, Medienverbindung wird aufgebaut
    Connecting {
        call: Call,
        connection: ConnectionState,
    },
    InCall {
        call: Call,
        connection: ConnectionState,
    },
    /// Kurze Anzeige nach dem Ende
    Ended { call: Call },
}

impl CallScreen {
    pub fn call(&self) -> Option<&Call> {
        match self {
            Self::Hidden => None,
            Self::Incoming { call }
            | Self::Outgoing { call }
            | Self::Connecting { call, .. }
            | Self::InCall { call, .. }
            | Self::Ended { call } => Some(call),
        }
    }

    /// Kann minimiert werden (laufender Call)
    pub fn is_minimizable(&self) -> bool {
        matches!(
            self,
            Self::Outgoing { .. } | Self::Connecting { .. } | Self::InCall { .. }
        )
    }

    pub fn status_text(&self) -> &'static str {
        match self {
            Self::Hidden => "",
            Self::Incoming { .. } => "Incoming call",
            Self::Outgoing { call } => match call.status {
                CallStatus::Ringing => "Ringing…",
                _ => "Calling…",
            },
            Self::Connecting { connection, .. } => match connection {
                ConnectionState::Failed => "Connection error",
                _ => "Connecting…",
            },
            Self::InCall { connection, .. } => match connection {
                ConnectionState::Connected => "Connected",
                ConnectionState::Disconnected => "Reconnecting…",
                ConnectionState::Failed => "Connection error",
                ConnectionState::Closed => "Call ended",
                ConnectionState::New | ConnectionState::Connecting => "Connecting…",
            },
            Self::Ended { call } => match call.status {
                CallStatus::Declined => "Call declined",
                CallStatus::Missed => "Missed call",
                _ => "Call ended",
            },
        }
    }
}

/// Bildschirm aus Controller-Zustand
///
/// Der aktive Call hat Vorrang vor einem eingehenden. Ein eingehender Call
/// wird nur angezeigt, solange er nicht beendet ist.
pub fn present(
    incoming: Option<&Call>,
    active: Option<&Call>,
    connection: ConnectionState,
    me: &UserId,
) -> CallScreen {
    if let Some(call) = active {
        let call = call.clone();
        return match call.status {
            status if status.is_terminal() => CallScreen::Ended { call },
            CallStatus::Active => CallScreen::InCall { call, connection },
            _ => match call.role_of(me) {
                Some(CallRole::Callee) => CallScreen::Connecting { call, connection },
                _ => CallScreen::Outgoing { call },
            },
        };
    }

    match incoming {
        Some(call) if !call.status.is_terminal() => CallScreen::Incoming { call: call.clone() },
        _ => CallScreen::Hidden,
    }
}

// ============================================================================
// PRESENTER
// ============================================================================

/// Darstellung inklusive Minimierung
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallView {
    pub screen: CallScreen,
    pub status_text: &'static str,
    pub minimized: bool,
    /// Gesprächspartner
    pub peer_id: Option<UserId>,
}

/// Hält den lokalen UI-Zustand (Minimierung)
#[derive(Debug, Clone)]
pub struct CallPresenter {
    me: UserId,
    minimized: bool,
}

impl CallPresenter {
    pub fn new(me: UserId) -> Self {
        Self {
            me,
            minimized: false,
        }
    }

    pub fn is_minimized(&self) -> bool {
        self.minimized
    }

    /// Schaltet die Minimierung um, nur bei laufendem Call
    pub fn toggle_minimize(&mut self, screen: &CallScreen) -> bool {
        if screen.is_minimizable() {
            self.minimized = !self.minimized;
        }
        self.minimized
    }

    pub fn view(
        &mut self,
        incoming: Option<&Call>,
        active: Option<&Call>,
        connection: ConnectionState,
    ) -> CallView {
        let screen = present(incoming, active, connection, &self.me);
        // Eingehende Calls und Endanzeige sind nie minimiert
        if !screen.is_minimizable() {
            self.minimized = false;
        }
        CallView {
            status_text: screen.status_text(),
            minimized: self.minimized,
            peer_id: screen.call().and_then(|c| c.peer_of(&self.me)).cloned(),
            screen,
        }
    }
}
