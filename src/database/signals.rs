//! Signaling-Zeilen
//!
//! Dauerhafte Kopie jeder Signaling-Nachricht. Der Polling-Fallback liest
//! sie per Cursor (`rowid`) aus, dadurch kommen auch Nachrichten an, die vor
//! dem Subscribe gesendet wurden.

use super::calls::{millis_to_datetime, CallDatabase, DatabaseError};
use crate::call::CallId;
use crate::signaling::{SignalKind, SignalingMessage};
use rusqlite::types::Type;
use rusqlite::params;

impl CallDatabase {
    /// Speichert eine Signaling-Nachricht, gibt die Row-ID zurück
    pub fn insert_signal(&self, message: &SignalingMessage) -> Result<i64, DatabaseError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO call_signals (call_id, sender_id, kind, payload, seq, sent_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                message.call_id.as_str(),
                message.sender_id.as_str(),
                message.kind.as_str(),
                message.payload,
                message.seq as i64,
                message.sent_at.timestamp_millis(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Alle Nachrichten eines Calls mit Row-ID > `after`, aufsteigend
    pub fn signals_after(
        &self,
        call_id: &CallId,
        after: i64,
    ) -> Result<Vec<(i64, SignalingMessage)>, DatabaseError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, call_id, sender_id, kind, payload, seq, sent_at
            FROM call_signals
            WHERE call_id = ?1 AND id > ?2
            ORDER BY id ASC
            "#,
        )?;

        let rows = stmt
            .query_map(params![call_id.as_str(), after], |row| {
                let kind: String = row.get(3)?;
                let kind = kind.parse::<SignalKind>().map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e))
                })?;
                let seq: i64 = row.get(5)?;

                Ok((
                    row.get::<_, i64>(0)?,
                    SignalingMessage {
                        call_id: CallId::from(row.get::<_, String>(1)?),
                        sender_id: row.get::<_, String>(2)?.into(),
                        kind,
                        payload: row.get(4)?,
                        seq: seq as u64,
                        sent_at: millis_to_datetime(6, row.get(6)?)?,
                    },
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows)
    }

    /// Löscht alle Signaling-Zeilen eines Calls
    pub fn purge_signals(&self, call_id: &CallId) -> Result<usize, DatabaseError> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM call_signals WHERE call_id = ?1",
            params![call_id.as_str()],
        )?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::UserId;

    fn message(call: &str, kind: SignalKind, payload: &str, seq: u64) -> SignalingMessage {
        SignalingMessage::new(
            CallId::from(call),
            UserId::from("alice"),
            kind,
            payload.to_string(),
            seq,
        )
    }

    #[test]
    fn test_cursor_reads_in_order() {
        let db = CallDatabase::open_in_memory().unwrap();
        let first = db
            .insert_signal(&message("c1", SignalKind::Offer, "{}", 1))
            .unwrap();
        db.insert_signal(&message("c2", SignalKind::Offer, "{}", 1))
            .unwrap();
        db.insert_signal(&message("c1", SignalKind::IceCandidate, "{\"candidate\":\"x\"}", 2))
            .unwrap();

        let all = db.signals_after(&"c1".into(), 0).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].1.kind, SignalKind::Offer);
        assert_eq!(all[1].1.seq, 2);

        let rest = db.signals_after(&"c1".into(), first).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].1.kind, SignalKind::IceCandidate);
    }

    #[test]
    fn test_purge_signals() {
        let db = CallDatabase::open_in_memory().unwrap();
        db.insert_signal(&message("c1", SignalKind::Hangup, "", 1))
            .unwrap();

        assert_eq!(db.purge_signals(&"c1".into()).unwrap(), 1);
        assert!(db.signals_after(&"c1".into(), 0).unwrap().is_empty());
    }
}
