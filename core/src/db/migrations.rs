//! Forward-only schema migrations tracked through `PRAGMA user_version`.

use rusqlite::Connection;

use super::DbError;
use super::Result;

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

pub fn migrate_to_latest(conn: &mut Connection) -> Result<()> {
    let mut version = schema_version(conn)?;
    while version < SCHEMA_VERSION {
        let next = version + 1;
        let tx = conn.transaction()?;
        match next {
            1 => migration_v1(&tx)?,
            _ => {
                return Err(DbError::Migration(format!(
                    "no migration registered for version {next}"
                )));
            }
        }
        tx.pragma_update(None, "user_version", next)?;
        tx.commit()?;
        version = next;
    }
    Ok(())
}

fn schema_version(conn: &Connection) -> Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version)
}

fn migration_v1(tx: &rusqlite::Transaction) -> Result<()> {
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS apps (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             name TEXT NOT NULL,
             path TEXT NOT NULL,
             created_at TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS chats (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             app_id INTEGER NOT NULL REFERENCES apps(id) ON DELETE CASCADE,
             title TEXT,
             created_at TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS messages (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             chat_id INTEGER NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
             role TEXT NOT NULL,
             content TEXT NOT NULL DEFAULT '',
             checkpoint_hash TEXT,
             commit_hash TEXT,
             is_checkpoint INTEGER NOT NULL DEFAULT 0,
             created_at TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages(chat_id, created_at);
         CREATE TABLE IF NOT EXISTS mcp_servers (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             name TEXT NOT NULL,
             transport TEXT NOT NULL,
             command TEXT,
             args TEXT NOT NULL DEFAULT '[]',
             env TEXT NOT NULL DEFAULT '{}',
             url TEXT,
             is_enabled INTEGER NOT NULL DEFAULT 1,
             created_at TEXT NOT NULL,
             updated_at TEXT NOT NULL
         );",
    )?;
    Ok(())
}
