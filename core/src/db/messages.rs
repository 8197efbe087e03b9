//! Message rows and their checkpoint association.

use rusqlite::Row;
use rusqlite::params;

use super::DbError;
use super::Result;
use super::Store;
use super::now_rfc3339;
use crate::models::Message;
use crate::models::MessageRole;

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let role_str: String = row.get(2)?;
    let role = MessageRole::parse(&role_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown role: {role_str}").into(),
        )
    })?;
    Ok(Message {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        role,
        content: row.get(3)?,
        checkpoint_hash: row.get(4)?,
        commit_hash: row.get(5)?,
        is_checkpoint: row.get(6)?,
        created_at: row.get(7)?,
    })
}

const MESSAGE_COLUMNS: &str =
    "id, chat_id, role, content, checkpoint_hash, commit_hash, is_checkpoint, created_at";

impl Store {
    pub async fn insert_message(
        &self,
        chat_id: i64,
        role: MessageRole,
        content: &str,
    ) -> Result<Message> {
        let content = content.to_string();
        self.with_connection(move |conn| {
            let created_at = now_rfc3339();
            conn.execute(
                "INSERT INTO messages (chat_id, role, content, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![chat_id, role.as_str(), content, created_at],
            )?;
            Ok(Message {
                id: conn.last_insert_rowid(),
                chat_id,
                role,
                content,
                checkpoint_hash: None,
                commit_hash: None,
                is_checkpoint: false,
                created_at,
            })
        })
        .await
    }

    pub async fn get_message(&self, id: i64) -> Result<Message> {
        self.with_connection(move |conn| {
            conn.query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
                row_to_message,
            )
            .map_err(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => DbError::NotFound("message"),
                other => DbError::Sqlite(other),
            })
        })
        .await
    }

    /// Record a checkpoint on a message (sets `is_checkpoint`).
    pub async fn set_message_checkpoint(&self, id: i64, checkpoint_hash: &str) -> Result<()> {
        let checkpoint_hash = checkpoint_hash.to_string();
        self.with_connection(move |conn| {
            let updated = conn.execute(
                "UPDATE messages SET checkpoint_hash = ?2, is_checkpoint = 1 WHERE id = ?1",
                params![id, checkpoint_hash],
            )?;
            if updated == 0 {
                return Err(DbError::NotFound("message"));
            }
            Ok(())
        })
        .await
    }

    /// Detach a checkpoint association. The underlying commit is untouched.
    pub async fn clear_message_checkpoint(&self, id: i64) -> Result<()> {
        self.with_connection(move |conn| {
            conn.execute(
                "UPDATE messages SET checkpoint_hash = NULL, is_checkpoint = 0 WHERE id = ?1",
                params![id],
            )?;
            Ok(())
        })
        .await
    }

    /// Assistant messages carrying a checkpoint, oldest first.
    pub async fn checkpointed_messages(&self, chat_id: i64) -> Result<Vec<Message>> {
        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE chat_id = ?1 AND role = 'assistant' AND checkpoint_hash IS NOT NULL
                 ORDER BY created_at ASC, id ASC"
            ))?;
            let rows = stmt.query_map(params![chat_id], row_to_message)?;
            let mut messages = Vec::new();
            for row in rows {
                messages.push(row?);
            }
            Ok(messages)
        })
        .await
    }
}
