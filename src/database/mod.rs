//! Database Module - SQLite Persistenz
//!
//! Dieses Modul verwaltet:
//! - Call-Records inkl. Realtime-Change-Feed
//! - Signaling-Zeilen für den Polling-Fallback
//! - Konversations-Mitgliedschaften

mod calls;
mod conversations;
mod signals;

pub use calls::{CallChange, CallDatabase, ChangeKind, DatabaseError};
