//! Call-Datenmodell
//!
//! Der persistierte Call-Record und seine geschlossene Status-Maschine.
//! Übergänge werden hier validiert, die Datenbank setzt sie danach
//! atomar per bedingtem UPDATE um.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Calls in `calling`/`ringing` gelten nach dieser Zeit als Geister-Calls
pub const STALE_CALL_AFTER: Duration = Duration::from_secs(60);

// ============================================================================
// IDENTIFIERS
// ============================================================================

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Eindeutige ID eines Call-Versuchs
    CallId
);
string_id!(
    /// ID eines Benutzers (Anrufer oder Angerufener)
    UserId
);
string_id!(
    /// ID der Konversation, in der beide Teilnehmer Mitglied sind
    ConversationId
);

impl CallId {
    /// Erzeugt eine neue zufällige Call-ID
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid {field}: {value}")]
pub struct InvalidValue {
    pub field: &'static str,
    pub value: String,
}

// ============================================================================
// CALL TYPE
// ============================================================================

/// Art des Anrufs, nach dem Anlegen unveränderlich
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Audio,
    Video,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl FromStr for CallType {
    type Err = InvalidValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            other => Err(InvalidValue {
                field: "call type",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// CALL STATUS
// ============================================================================

/// Status eines Call-Records
///
/// `calling → ringing → active → ended`, dazu die Endzustände
/// `declined` und `missed`. Endzustände akzeptieren keine Übergänge mehr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// Ausgehender Anruf, Angerufener hat noch nicht bestätigt
    Calling,
    /// Angerufener hat den Anruf empfangen
    Ringing,
    /// Medienverbindung steht
    Active,
    /// Aufgelegt oder abgebrochen
    Ended,
    /// Vom Angerufenen abgelehnt
    Declined,
    /// Nicht angenommen (Timeout oder Geister-Call)
    Missed,
}

impl CallStatus {
    pub const ALL: [CallStatus; 6] = [
        Self::Calling,
        Self::Ringing,
        Self::Active,
        Self::Ended,
        Self::Declined,
        Self::Missed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Calling => "calling",
            Self::Ringing => "ringing",
            Self::Active => "active",
            Self::Ended => "ended",
            Self::Declined => "declined",
            Self::Missed => "missed",
        }
    }

    /// Noch nicht angenommen (`calling` oder `ringing`)
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Calling | Self::Ringing)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Declined | Self::Missed)
    }

    /// Prüft ob der Übergang `self → next` erlaubt ist
    pub fn can_transition_to(&self, next: CallStatus) -> bool {
        use CallStatus::*;
        matches!(
            (self, next),
            (Calling, Ringing)
                | (Calling, Active)
                | (Calling, Ended)
                | (Calling, Declined)
                | (Calling, Missed)
                | (Ringing, Active)
                | (Ringing, Ended)
                | (Ringing, Declined)
                | (Ringing, Missed)
                | (Active, Ended)
        )
    }

    /// Alle Zustände, aus denen `next` erreichbar ist
    pub fn sources_of(next: CallStatus) -> Vec<CallStatus> {
        Self::ALL
            .iter()
            .copied()
            .filter(|s| s.can_transition_to(next))
            .collect()
    }
}

impl FromStr for CallStatus {
    type Err = InvalidValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| InvalidValue {
                field: "call status",
                value: s.to_string(),
            })
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// CALL RECORD
// ============================================================================

/// Rolle des lokalen Benutzers in einem Call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Callee,
}

/// Persistierter Call-Record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    pub id: CallId,
    pub caller_id: UserId,
    pub callee_id: UserId,
    pub conversation_id: ConversationId,
    pub call_type: CallType,
    pub status: CallStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Call {
    pub fn role_of(&self, user: &UserId) -> Option<CallRole> {
        if &self.caller_id == user {
            Some(CallRole::Caller)
        } else if &self.callee_id == user {
            Some(CallRole::Callee)
        } else {
            None
        }
    }

    pub fn involves(&self, user: &UserId) -> bool {
        self.role_of(user).is_some()
    }

    /// Gibt die Gegenseite zu `user` zurück
    pub fn peer_of(&self, user: &UserId) -> Option<&UserId> {
        match self.role_of(user)? {
            CallRole::Caller => Some(&self.callee_id),
            CallRole::Callee => Some(&self.caller_id),
        }
    }

    /// Geister-Call: zu lange in `calling`/`ringing`
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        if !self.status.is_pending() {
            return false;
        }
        let age_ms = (now - self.created_at).num_milliseconds();
        age_ms > stale_after.as_millis() as i64
    }

    /// Gesprächsdauer, sobald der Call aktiv war und beendet ist
    pub fn talk_time(&self) -> Option<chrono::Duration> {
        Some(self.ended_at? - self.started_at?)
    }
}

/// Neuer Call ohne Status (für INSERT)
#[derive(Debug, Clone)]
pub struct NewCall {
    pub caller_id: UserId,
    pub callee_id: UserId,
    pub conversation_id: ConversationId,
    pub call_type: CallType,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// TESTS
// ============================================================================
