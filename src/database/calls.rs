//! Call-Datenbank
//!
//! SQLite-Datenbank für Call-Records. Alle Statuswechsel laufen als
//! bedingtes UPDATE durch eine einzige Connection, dadurch gewinnt bei
//! konkurrierenden Schreibern genau der erste.

use crate::call::{Call, CallId, CallStatus, CallType, NewCall, UserId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::broadcast;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    DirectoryCreation(#[from] std::io::Error),

    #[error("Call not found: {0}")]
    CallNotFound(CallId),

    #[error("Invalid signal row: {0}")]
    InvalidSignal(String),
}

// ============================================================================
// CHANGE FEED
// ============================================================================

/// Art der Änderung an einer Call-Zeile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Realtime-Benachrichtigung über eine geänderte Call-Zeile
#[derive(Debug, Clone)]
pub struct CallChange {
    pub kind: ChangeKind,
    pub call: Call,
}

// ============================================================================
// DATABASE
// ============================================================================

const CALL_COLUMNS: &str = "id, caller_id, callee_id, conversation_id, call_type, status, \
                            created_at, started_at, ended_at";

/// SQLite-Datenbank für Calls (Thread-safe durch Mutex)
pub struct CallDatabase {
    pub(super) conn: Mutex<Connection>,
    changes: broadcast::Sender<CallChange>,
}

impl CallDatabase {
    /// Öffnet oder erstellt die Datenbank unter `path`
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!("Opening call database at {:?}", path);

        Self::with_connection(Connection::open(path)?)
    }

    /// Öffnet die Datenbank im App-Datenverzeichnis
    pub fn open_default() -> Result<Self, DatabaseError> {
        Self::open(&Self::default_path()?)
    }

    /// In-Memory Datenbank (Tests, Loopback)
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, DatabaseError> {
        let (changes, _) = broadcast::channel(256);
        let db = Self {
            conn: Mutex::new(conn),
            changes,
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Ermittelt den Pfad zur Datenbank-Datei
    pub fn default_path() -> Result<PathBuf, DatabaseError> {
        let proj_dirs =
            directories::ProjectDirs::from("com", "social", "calls").ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Could not determine app data directory",
                )
            })?;

        let mut path = proj_dirs.data_dir().to_path_buf();
        path.push("calls.db");
        Ok(path)
    }

    /// Initialisiert das Datenbank-Schema
    fn init_schema(&self) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS calls (
                id TEXT PRIMARY KEY,
                caller_id TEXT NOT NULL,
                callee_id TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                call_type TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                ended_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_calls_caller ON calls(caller_id, status);
            CREATE INDEX IF NOT EXISTS idx_calls_callee ON calls(callee_id, status);

            CREATE TABLE IF NOT EXISTS call_signals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                call_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                seq INTEGER NOT NULL,
                sent_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_call_signals_call ON call_signals(call_id, id);

            CREATE TABLE IF NOT EXISTS conversation_members (
                conversation_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                joined_at INTEGER NOT NULL,
                PRIMARY KEY (conversation_id, user_id)
            );
            "#,
        )?;
        Ok(())
    }

    /// Gibt einen Receiver für den Change-Feed zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallChange> {
        self.changes.subscribe()
    }

    /// Legt einen neuen Call im Status `calling` an
    pub fn insert_call(&self, new_call: NewCall) -> Result<Call, DatabaseError> {
        let call = Call {
            id: CallId::generate(),
            caller_id: new_call.caller_id,
            callee_id: new_call.callee_id,
            conversation_id: new_call.conversation_id,
            call_type: new_call.call_type,
            status: CallStatus::Calling,
            created_at: new_call.created_at,
            started_at: None,
            ended_at: None,
        };

        {
            let conn = self.conn.lock();
            conn.execute(
                r#"
                INSERT INTO calls (id, caller_id, callee_id, conversation_id, call_type, status, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    call.id.as_str(),
                    call.caller_id.as_str(),
                    call.callee_id.as_str(),
                    call.conversation_id.as_str(),
                    call.call_type.as_str(),
                    call.status.as_str(),
                    call.created_at.timestamp_millis(),
                ],
            )?;
        }

        self.notify(ChangeKind::Insert, &call);
        Ok(call)
    }

    /// Holt einen Call anhand der ID
    pub fn get_call(&self, id: &CallId) -> Result<Call, DatabaseError> {
        let conn = self.conn.lock();
        Self::get_call_inner(&conn, id)
    }

    fn get_call_inner(conn: &Connection, id: &CallId) -> Result<Call, DatabaseError> {
        conn.query_row(
            &format!("SELECT {CALL_COLUMNS} FROM calls WHERE id = ?1"),
            params![id.as_str()],
            row_to_call,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => DatabaseError::CallNotFound(id.clone()),
            other => DatabaseError::Sqlite(other),
        })
    }

    /// Alle Calls eines Teilnehmers mit einem der angegebenen Status
    pub fn calls_for_user(
        &self,
        user: &UserId,
        statuses: &[CallStatus],
    ) -> Result<Vec<Call>, DatabaseError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {CALL_COLUMNS}
            FROM calls
            WHERE (caller_id = ?1 OR callee_id = ?1) AND status IN ({})
            ORDER BY created_at DESC
            "#,
            status_list(statuses)
        ))?;

        let calls = stmt
            .query_map(params![user.as_str()], row_to_call)?
            .collect::<rusqlite::Result<Vec<Call>>>()?;

        Ok(calls)
    }

    /// Führt einen Statuswechsel atomar aus
    ///
    /// Gibt `None` zurück, wenn die Zeile nicht mehr in einem erlaubten
    /// Ausgangszustand ist (z.B. weil ein anderer Schreiber schneller war).
    /// `started_at` wird nur beim Wechsel nach `active` gesetzt, `ended_at`
    /// nur beim Wechsel in einen Endzustand.
    pub fn transition(
        &self,
        id: &CallId,
        next: CallStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<Call>, DatabaseError> {
        let sources = status_list(&CallStatus::sources_of(next));
        if sources.is_empty() {
            return Ok(None);
        }
        let at_ms = at.timestamp_millis();

        let call = {
            let conn = self.conn.lock();
            let changed = match next {
                CallStatus::Active => conn.execute(
                    &format!(
                        "UPDATE calls SET status = 'active', started_at = ?2 \
                         WHERE id = ?1 AND started_at IS NULL AND ended_at IS NULL \
                         AND status IN ({sources})"
                    ),
                    params![id.as_str(), at_ms],
                )?,
                status if status.is_terminal() => conn.execute(
                    &format!(
                        "UPDATE calls SET status = ?2, ended_at = ?3 \
                         WHERE id = ?1 AND ended_at IS NULL AND status IN ({sources})"
                    ),
                    params![id.as_str(), status.as_str(), at_ms],
                )?,
                status => conn.execute(
                    &format!(
                        "UPDATE calls SET status = ?2 \
                         WHERE id = ?1 AND ended_at IS NULL AND status IN ({sources})"
                    ),
                    params![id.as_str(), status.as_str()],
                )?,
            };

            if changed == 0 {
                return Ok(None);
            }
            Self::get_call_inner(&conn, id)?
        };

        tracing::debug!("Call {} -> {}", call.id, call.status);
        self.notify(ChangeKind::Update, &call);
        Ok(Some(call))
    }

    /// Löscht beendete Calls (und deren Signal-Zeilen), die vor `before` endeten
    pub fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let removed = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(&format!(
                "SELECT {CALL_COLUMNS} FROM calls WHERE ended_at IS NOT NULL AND ended_at < ?1"
            ))?;
            let calls = stmt
                .query_map(params![before.timestamp_millis()], row_to_call)?
                .collect::<rusqlite::Result<Vec<Call>>>()?;

            for call in &calls {
                conn.execute(
                    "DELETE FROM call_signals WHERE call_id = ?1",
                    params![call.id.as_str()],
                )?;
                conn.execute("DELETE FROM calls WHERE id = ?1", params![call.id.as_str()])?;
            }
            calls
        };

        for call in &removed {
            self.notify(ChangeKind::Delete, call);
        }
        Ok(removed.len())
    }

    fn notify(&self, kind: ChangeKind, call: &Call) {
        // Keine Subscriber ist kein Fehler
        let _ = self.changes.send(CallChange {
            kind,
            call: call.clone(),
        });
    }
}

impl std::fmt::Debug for CallDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallDatabase")
            .field("subscribers", &self.changes.receiver_count())
            .finish()
    }
}

// ============================================================================
// ROW MAPPING
// ============================================================================

fn status_list(statuses: &[CallStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

pub(super) fn millis_to_datetime(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            format!("timestamp out of range: {ms}").into(),
        )
    })
}

fn parse_column<T>(idx: usize, raw: String) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_call(row: &Row<'_>) -> rusqlite::Result<Call> {
    let started_at: Option<i64> = row.get(7)?;
    let ended_at: Option<i64> = row.get(8)?;

    Ok(Call {
        id: CallId::from(row.get::<_, String>(0)?),
        caller_id: UserId::from(row.get::<_, String>(1)?),
        callee_id: UserId::from(row.get::<_, String>(2)?),
        conversation_id: row.get::<_, String>(3)?.into(),
        call_type: parse_column::<CallType>(4, row.get(4)?)?,
        status: parse_column::<CallStatus>(5, row.get(5)?)?,
        created_at: millis_to_datetime(6, row.get(6)?)?,
        started_at: started_at.map(|ms| millis_to_datetime(7, ms)).transpose()?,
        ended_at: ended_at.map(|ms| millis_to_datetime(8, ms)).transpose()?,
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn new_call(age_secs: i64) -> NewCall {
        NewCall {
            caller_id: "alice".into(),
            callee_id: "bob".into(),
            conversation_id: "conv-1".into(),
            call_type: CallType::Video,
            created_at: Utc::now() - chrono::Duration::seconds(age_secs),
        }
    }

    #[test]
    fn test_insert_and_get_call() {
        let db = CallDatabase::open_in_memory().unwrap();

        let call = db.insert_call(new_call(0)).unwrap();
        assert_eq!(call.status, CallStatus::Calling);

        let loaded = db.get_call(&call.id).unwrap();
        assert_eq!(loaded, Call {
            // Millisekunden-Auflösung in der DB
            created_at: loaded.created_at,
            ..call
        });
        assert!(loaded.started_at.is_none());
    }

    #[test]
    fn test_missing_call() {
        let db = CallDatabase::open_in_memory().unwrap();
        let err = db.get_call(&CallId::from("nope")).unwrap_err();
        assert!(matches!(err, DatabaseError::CallNotFound(_)));
    }

    #[test]
    fn test_activation_is_first_writer_wins() {
        let db = CallDatabase::open_in_memory().unwrap();
        let call = db.insert_call(new_call(0)).unwrap();

        let first = db.transition(&call.id, CallStatus::Active, Utc::now()).unwrap();
        let second = db
            .transition(
                &call.id,
                CallStatus::Active,
                Utc::now() + chrono::Duration::seconds(5),
            )
            .unwrap();

        let first = first.expect("first activation applies");
        assert!(second.is_none());
        let stored = db.get_call(&call.id).unwrap();
        assert_eq!(stored.started_at, first.started_at);
    }

    #[test]
    fn test_concurrent_activation_sets_started_at_once() {
        let db = Arc::new(CallDatabase::open_in_memory().unwrap());
        let call = db.insert_call(new_call(0)).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let db = Arc::clone(&db);
                let id = call.id.clone();
                std::thread::spawn(move || {
                    db.transition(&id, CallStatus::Active, Utc::now() + chrono::Duration::milliseconds(i))
                        .unwrap()
                        .is_some()
                })
            })
            .collect();

        let applied = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|applied| *applied)
            .count();
        assert_eq!(applied, 1);
    }

    #[test]
    fn test_terminal_is_immutable() {
        let db = CallDatabase::open_in_memory().unwrap();
        let call = db.insert_call(new_call(0)).unwrap();

        let ended = db
            .transition(&call.id, CallStatus::Declined, Utc::now())
            .unwrap()
            .unwrap();
        assert!(ended.ended_at.is_some());

        for next in CallStatus::ALL {
            assert!(db.transition(&call.id, next, Utc::now()).unwrap().is_none());
        }
        assert_eq!(db.get_call(&call.id).unwrap().ended_at, ended.ended_at);
    }

    #[test]
    fn test_calls_for_user_filters_status() {
        let db = CallDatabase::open_in_memory().unwrap();
        let pending = db.insert_call(new_call(0)).unwrap();
        let finished = db.insert_call(new_call(0)).unwrap();
        db.transition(&finished.id, CallStatus::Ended, Utc::now()).unwrap();

        let calls = db
            .calls_for_user(&"bob".into(), &[CallStatus::Calling, CallStatus::Ringing])
            .unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, pending.id);
        assert!(db.calls_for_user(&"carol".into(), &CallStatus::ALL).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_change_feed() {
        let db = CallDatabase::open_in_memory().unwrap();
        let mut rx = db.subscribe();

        let call = db.insert_call(new_call(0)).unwrap();
        db.transition(&call.id, CallStatus::Ringing, Utc::now()).unwrap();

        let insert = rx.recv().await.unwrap();
        assert_eq!(insert.kind, ChangeKind::Insert);
        let update = rx.recv().await.unwrap();
        assert_eq!(update.kind, ChangeKind::Update);
        assert_eq!(update.call.status, CallStatus::Ringing);
    }

    #[test]
    fn test_purge_finished() {
        let db = CallDatabase::open_in_memory().unwrap();
        let call = db.insert_call(new_call(10)).unwrap();
        db.transition(&call.id, CallStatus::Ended, Utc::now() - chrono::Duration::seconds(5))
            .unwrap();
        let open = db.insert_call(new_call(0)).unwrap();

        assert_eq!(db.purge_finished(Utc::now()).unwrap(), 1);
        assert!(db.get_call(&call.id).is_err());
        assert!(db.get_call(&open.id).is_ok());
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("calls.db");

        let id = {
            let db = CallDatabase::open(&path).unwrap();
            db.insert_call(new_call(0)).unwrap().id
        };

        let db = CallDatabase::open(&path).unwrap();
        assert_eq!(db.get_call(&id).unwrap().status, CallStatus::Calling);
    }
}
