//! Konversations-Mitgliedschaften
//!
//! Ein Call darf nur zwischen zwei Mitgliedern derselben Konversation
//! aufgebaut werden.

use super::calls::{CallDatabase, DatabaseError};
use crate::call::{ConversationId, UserId};
use chrono::Utc;
use rusqlite::params;

impl CallDatabase {
    /// Fügt ein Mitglied hinzu (idempotent)
    pub fn add_member(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO conversation_members (conversation_id, user_id, joined_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(conversation_id, user_id) DO NOTHING
            "#,
            params![
                conversation_id.as_str(),
                user_id.as_str(),
                Utc::now().timestamp_millis()
            ],
        )?;
        Ok(())
    }

    /// Entfernt ein Mitglied
    pub fn remove_member(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM conversation_members WHERE conversation_id = ?1 AND user_id = ?2",
            params![conversation_id.as_str(), user_id.as_str()],
        )?;
        Ok(())
    }

    pub fn is_member(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM conversation_members WHERE conversation_id = ?1 AND user_id = ?2",
            params![conversation_id.as_str(), user_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Alle Mitglieder einer Konversation, in Beitrittsreihenfolge
    pub fn members(&self, conversation_id: &ConversationId) -> Result<Vec<UserId>, DatabaseError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT user_id FROM conversation_members
            WHERE conversation_id = ?1
            ORDER BY joined_at ASC, user_id ASC
            "#,
        )?;

        let members = stmt
            .query_map(params![conversation_id.as_str()], |row| {
                Ok(UserId::from(row.get::<_, String>(0)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(members)
    }
}
