//! MCP server configuration rows. `args` and `env` are stored as JSON text.

use std::collections::HashMap;

use rusqlite::Row;
use rusqlite::params;

use super::DbError;
use super::Result;
use super::Store;
use super::now_rfc3339;
use crate::models::McpServerConfig;
use crate::models::McpServerDraft;
use crate::models::McpTransport;

const SERVER_COLUMNS: &str =
    "id, name, transport, command, args, env, url, is_enabled, created_at, updated_at";

fn row_to_server(row: &Row<'_>) -> rusqlite::Result<McpServerConfig> {
    let transport_str: String = row.get(2)?;
    let transport = McpTransport::parse(&transport_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown transport: {transport_str}").into(),
        )
    })?;
    let args_json: String = row.get(4)?;
    let env_json: String = row.get(5)?;
    let args: Vec<String> = serde_json::from_str(&args_json).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(err))
    })?;
    let env: HashMap<String, String> = serde_json::from_str(&env_json).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(err))
    })?;
    Ok(McpServerConfig {
        id: row.get(0)?,
        name: row.get(1)?,
        transport,
        command: row.get(3)?,
        args,
        env,
        url: row.get(6)?,
        is_enabled: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

impl Store {
    pub async fn insert_server(&self, draft: McpServerDraft) -> Result<McpServerConfig> {
        self.with_connection(move |conn| {
            let transport = draft
                .transport
                .ok_or(DbError::NotFound("transport"))?;
            let args = serde_json::to_string(&draft.args)?;
            let env = serde_json::to_string(&draft.env)?;
            let now = now_rfc3339();
            conn.execute(
                "INSERT INTO mcp_servers
                 (name, transport, command, args, env, url, is_enabled, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    draft.name,
                    transport.as_str(),
                    draft.command,
                    args,
                    env,
                    draft.url,
                    draft.is_enabled,
                    now,
                ],
            )?;
            let id = conn.last_insert_rowid();
            conn.query_row(
                &format!("SELECT {SERVER_COLUMNS} FROM mcp_servers WHERE id = ?1"),
                params![id],
                row_to_server,
            )
            .map_err(DbError::Sqlite)
        })
        .await
    }

    pub async fn update_server(&self, id: i64, draft: McpServerDraft) -> Result<McpServerConfig> {
        self.with_connection(move |conn| {
            let transport = draft
                .transport
                .ok_or(DbError::NotFound("transport"))?;
            let args = serde_json::to_string(&draft.args)?;
            let env = serde_json::to_string(&draft.env)?;
            let updated = conn.execute(
                "UPDATE mcp_servers SET
                     name = ?2, transport = ?3, command = ?4, args = ?5, env = ?6,
                     url = ?7, is_enabled = ?8, updated_at = ?9
                 WHERE id = ?1",
                params![
                    id,
                    draft.name,
                    transport.as_str(),
                    draft.command,
                    args,
                    env,
                    draft.url,
                    draft.is_enabled,
                    now_rfc3339(),
                ],
            )?;
            if updated == 0 {
                return Err(DbError::NotFound("mcp server"));
            }
            conn.query_row(
                &format!("SELECT {SERVER_COLUMNS} FROM mcp_servers WHERE id = ?1"),
                params![id],
                row_to_server,
            )
            .map_err(DbError::Sqlite)
        })
        .await
    }

    pub async fn delete_server(&self, id: i64) -> Result<bool> {
        self.with_connection(move |conn| {
            let deleted = conn.execute("DELETE FROM mcp_servers WHERE id = ?1", params![id])?;
            Ok(deleted > 0)
        })
        .await
    }

    pub async fn set_server_enabled(&self, id: i64, enabled: bool) -> Result<McpServerConfig> {
        self.with_connection(move |conn| {
            let updated = conn.execute(
                "UPDATE mcp_servers SET is_enabled = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, enabled, now_rfc3339()],
            )?;
            if updated == 0 {
                return Err(DbError::NotFound("mcp server"));
            }
            conn.query_row(
                &format!("SELECT {SERVER_COLUMNS} FROM mcp_servers WHERE id = ?1"),
                params![id],
                row_to_server,
            )
            .map_err(DbError::Sqlite)
        })
        .await
    }

    pub async fn get_server(&self, id: i64) -> Result<McpServerConfig> {
        self.with_connection(move |conn| {
            conn.query_row(
                &format!("SELECT {SERVER_COLUMNS} FROM mcp_servers WHERE id = ?1"),
                params![id],
                row_to_server,
            )
            .map_err(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => DbError::NotFound("mcp server"),
                other => DbError::Sqlite(other),
            })
        })
        .await
    }

    pub async fn list_servers(&self) -> Result<Vec<McpServerConfig>> {
        self.servers_where("1 = 1").await
    }

    pub async fn enabled_servers(&self) -> Result<Vec<McpServerConfig>> {
        self.servers_where("is_enabled = 1").await
    }

    async fn servers_where(&self, predicate: &'static str) -> Result<Vec<McpServerConfig>> {
        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SERVER_COLUMNS} FROM mcp_servers WHERE {predicate} ORDER BY id ASC"
            ))?;
            let rows = stmt.query_map([], row_to_server)?;
            let mut servers = Vec::new();
            for row in rows {
                servers.push(row?);
            }
            Ok(servers)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::db::test_support::scratch_store;

    fn stdio_draft(name: &str) -> McpServerDraft {
        McpServerDraft {
            name: name.to_string(),
            transport: Some(McpTransport::Stdio),
            command: Some("mcp-server".to_string()),
            args: vec!["--flag".to_string()],
            env: HashMap::from([("API_KEY".to_string(), "secret".to_string())]),
            url: None,
            is_enabled: true,
        }
    }

    #[tokio::test]
    async fn insert_round_trips_args_and_env() {
        let (_dir, store) = scratch_store();
        let server = store.insert_server(stdio_draft("files")).await.unwrap();
        let loaded = store.get_server(server.id).await.unwrap();
        assert_eq!(loaded.name, "files");
        assert_eq!(loaded.args, vec!["--flag".to_string()]);
        assert_eq!(loaded.env.get("API_KEY").map(String::as_str), Some("secret"));
        assert_eq!(loaded.transport, McpTransport::Stdio);
    }

    #[tokio::test]
    async fn toggle_and_enabled_listing() {
        let (_dir, store) = scratch_store();
        let a = store.insert_server(stdio_draft("a")).await.unwrap();
        let b = store.insert_server(stdio_draft("b")).await.unwrap();

        store.set_server_enabled(a.id, false).await.unwrap();

        let enabled = store.enabled_servers().await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, b.id);
        assert_eq!(store.list_servers().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn delete_reports_whether_row_existed() {
        let (_dir, store) = scratch_store();
        let server = store.insert_server(stdio_draft("gone")).await.unwrap();
        assert!(store.delete_server(server.id).await.unwrap());
        assert!(!store.delete_server(server.id).await.unwrap());
    }

    #[tokio::test]
    async fn update_replaces_fields() {
        let (_dir, store) = scratch_store();
        let server = store.insert_server(stdio_draft("old")).await.unwrap();
        let mut draft = stdio_draft("new");
        draft.transport = Some(McpTransport::Http);
        draft.command = None;
        draft.url = Some("http://localhost:9000/mcp".to_string());
        let updated = store.update_server(server.id, draft).await.unwrap();
        assert_eq!(updated.name, "new");
        assert_eq!(updated.transport, McpTransport::Http);
        assert_eq!(updated.url.as_deref(), Some("http://localhost:9000/mcp"));
    }
}
