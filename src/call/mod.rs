//! Call Module - Call-Records und Lebenszyklus
//!
//! Dieses Modul verwaltet:
//! - Das Datenmodell und die Status-Maschine eines Calls
//! - Den Call Lifecycle Controller (Starten, Annehmen, Ablehnen, Auflegen)
//! - Aufräumen von Geister-Calls

mod controller;
mod model;

use crate::database::DatabaseError;
use thiserror::Error;

pub use controller::{CallController, CallEvent, ControllerTimings, SessionTeardown};
pub use model::{
    Call, CallId, CallRole, CallStatus, CallType, ConversationId, InvalidValue, NewCall, UserId,
    STALE_CALL_AFTER,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CallError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Cannot call yourself")]
    SelfCall,

    #[error("User {user_id} is not a member of conversation {conversation_id}")]
    NotInConversation {
        conversation_id: ConversationId,
        user_id: UserId,
    },

    #[error("Already in a call")]
    AlreadyInCall,

    #[error("Only the callee can answer call {0}")]
    NotCallee(CallId),

    #[error("Not a participant of call {0}")]
    NotParticipant(CallId),

    #[error("Call {0} has expired")]
    CallExpired(CallId),

    #[error("Invalid transition {from} -> {to}")]
    InvalidTransition { from: CallStatus, to: CallStatus },
}
