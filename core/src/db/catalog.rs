//! Apps and chats: the join path from a chat id to a project directory.

use rusqlite::OptionalExtension;
use rusqlite::params;

use super::DbError;
use super::Result;
use super::Store;
use super::now_rfc3339;
use crate::models::App;
use crate::models::Chat;

impl Store {
    pub async fn insert_app(&self, name: &str, path: &str) -> Result<App> {
        let name = name.to_string();
        let path = path.to_string();
        self.with_connection(move |conn| {
            let created_at = now_rfc3339();
            conn.execute(
                "INSERT INTO apps (name, path, created_at) VALUES (?1, ?2, ?3)",
                params![name, path, created_at],
            )?;
            Ok(App {
                id: conn.last_insert_rowid(),
                name,
                path,
                created_at,
            })
        })
        .await
    }

    pub async fn insert_chat(&self, app_id: i64, title: Option<&str>) -> Result<Chat> {
        let title = title.map(str::to_string);
        self.with_connection(move |conn| {
            let created_at = now_rfc3339();
            conn.execute(
                "INSERT INTO chats (app_id, title, created_at) VALUES (?1, ?2, ?3)",
                params![app_id, title, created_at],
            )?;
            Ok(Chat {
                id: conn.last_insert_rowid(),
                app_id,
                title,
                created_at,
            })
        })
        .await
    }

    /// The stored project path for a chat's app. `NotFound` when either the
    /// chat or its app row is missing.
    pub async fn chat_app_path(&self, chat_id: i64) -> Result<String> {
        self.with_connection(move |conn| {
            conn.query_row(
                "SELECT apps.path FROM chats JOIN apps ON apps.id = chats.app_id
                 WHERE chats.id = ?1",
                params![chat_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(DbError::NotFound("chat"))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use pretty_assertions::assert_eq;

    use crate::db::test_support::scratch_store;

    #[tokio::test]
    async fn chat_resolves_to_app_path() {
        let (_dir, store) = scratch_store();
        let app = store.insert_app("demo", "/srv/apps/demo").await.unwrap();
        let chat = store.insert_chat(app.id, Some("first chat")).await.unwrap();
        assert_eq!(store.chat_app_path(chat.id).await.unwrap(), "/srv/apps/demo");
    }

    #[tokio::test]
    async fn unknown_chat_is_not_found() {
        let (_dir, store) = scratch_store();
        let err = store.chat_app_path(404).await.unwrap_err();
        assert!(matches!(err, crate::db::DbError::NotFound(_)));
    }
}
