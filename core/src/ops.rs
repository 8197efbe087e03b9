//! The boundary layer: operations exposed to frontends, combining the
//! database, the checkpoint engine, and the MCP connection manager.

use std::sync::Arc;

use serde_json::Value;
use tracing::info;
use tracing::warn;

use crate::checkpoint::CheckpointEngine;
use crate::checkpoint::CheckpointResult;
use crate::checkpoint::DEFAULT_KEPT_CHECKPOINTS;
use crate::db::Store;
use crate::error::Result;
use crate::mcp_connection_manager::ClientFactory;
use crate::mcp_connection_manager::McpConnectionManager;
use crate::mcp_connection_manager::McpError;
use crate::mcp_connection_manager::ServerTool;
use crate::mcp_connection_manager::validate_config;
use crate::models::CheckpointEntry;
use crate::models::McpServerConfig;
use crate::models::McpServerDraft;
use crate::models::resolve_app_path;

pub struct Services {
    pub store: Store,
    pub checkpoints: CheckpointEngine,
    pub mcp: Arc<McpConnectionManager>,
}

impl Services {
    pub fn new(store: Store) -> Self {
        Self {
            checkpoints: CheckpointEngine::new(store.clone()),
            mcp: Arc::new(McpConnectionManager::new()),
            store,
        }
    }

    /// Like [`Services::new`] but with a custom transport factory, for tests.
    pub fn with_factory(store: Store, factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            checkpoints: CheckpointEngine::new(store.clone()),
            mcp: Arc::new(McpConnectionManager::with_factory(factory)),
            store,
        }
    }

    // ---- MCP server management -------------------------------------------

    /// Validate, persist, and (if enabled) connect a new server. The row is
    /// saved before the connection attempt, so a server that is configured
    /// correctly but currently unreachable still ends up in the database.
    pub async fn add_mcp_server(&self, draft: McpServerDraft) -> Result<McpServerConfig> {
        let probe = draft
            .clone()
            .into_config(0)
            .ok_or_else(|| McpError::Validation("transport is required".to_string()))?;
        validate_config(&probe)?;

        let saved = self.store.insert_server(draft).await?;
        if saved.is_enabled {
            self.mcp.add_server(&saved).await?;
        }
        Ok(saved)
    }

    /// Replace a server's configuration. The old connection is torn down
    /// first so a transport change cannot leave a stale client behind.
    pub async fn update_mcp_server(
        &self,
        id: i64,
        draft: McpServerDraft,
    ) -> Result<McpServerConfig> {
        let probe = draft
            .clone()
            .into_config(id)
            .ok_or_else(|| McpError::Validation("transport is required".to_string()))?;
        validate_config(&probe)?;

        self.mcp.remove_server(id).await?;
        let saved = self.store.update_server(id, draft).await?;
        if saved.is_enabled {
            self.mcp.add_server(&saved).await?;
        }
        Ok(saved)
    }

    /// Disconnect and delete a server. Returns whether a row existed.
    pub async fn delete_mcp_server(&self, id: i64) -> Result<bool> {
        self.mcp.remove_server(id).await?;
        Ok(self.store.delete_server(id).await?)
    }

    pub async fn toggle_mcp_server(&self, id: i64, enabled: bool) -> Result<McpServerConfig> {
        let saved = self.store.set_server_enabled(id, enabled).await?;
        if enabled {
            self.mcp.add_server(&saved).await?;
        } else {
            self.mcp.remove_server(id).await?;
        }
        Ok(saved)
    }

    /// Probe an unsaved configuration. Never errors; an invalid draft is
    /// simply unreachable.
    pub async fn test_mcp_connection(&self, draft: McpServerDraft) -> bool {
        match draft.into_config(-1) {
            Some(config) => self.mcp.test_connection(&config).await,
            None => false,
        }
    }

    pub async fn list_mcp_servers(&self) -> Result<Vec<McpServerConfig>> {
        Ok(self.store.list_servers().await?)
    }

    pub async fn get_mcp_tools(&self, server_id: Option<i64>) -> Vec<ServerTool> {
        self.mcp.get_tools(server_id).await
    }

    pub async fn call_mcp_tool(
        &self,
        server_id: i64,
        name: String,
        arguments: Option<Value>,
    ) -> Result<Value> {
        Ok(self.mcp.call_tool(server_id, name, arguments).await?)
    }

    /// Reconnect every enabled server from the database, typically at
    /// startup. A server that fails to connect is logged and skipped; one
    /// bad config must not prevent the rest from coming up.
    pub async fn initialize_mcp_servers(&self) -> Result<()> {
        let servers = self.store.enabled_servers().await?;
        let total = servers.len();
        let mut connected = 0usize;
        for server in servers {
            match self.mcp.add_server(&server).await {
                Ok(()) => connected += 1,
                Err(err) => {
                    warn!(id = server.id, name = %server.name, error = %err, "server failed to connect at startup");
                }
            }
        }
        info!(connected, total, "mcp server initialization complete");
        Ok(())
    }

    // ---- checkpoints ------------------------------------------------------

    /// Snapshot a chat's app directory before AI-driven edits land.
    pub async fn checkpoint_before_changes(&self, chat_id: i64) -> CheckpointResult {
        self.checkpoint_in_chat(chat_id, &format!("Before AI changes - Chat {chat_id}"), None)
            .await
    }

    /// Snapshot a chat's app directory, optionally attributing the
    /// checkpoint to a message.
    pub async fn create_checkpoint(
        &self,
        chat_id: i64,
        description: &str,
        message_id: Option<i64>,
    ) -> CheckpointResult {
        self.checkpoint_in_chat(chat_id, description, message_id).await
    }

    async fn checkpoint_in_chat(
        &self,
        chat_id: i64,
        description: &str,
        message_id: Option<i64>,
    ) -> CheckpointResult {
        let stored_path = match self.store.chat_app_path(chat_id).await {
            Ok(path) => path,
            Err(err) => return failed(err.to_string()),
        };
        let app_path = resolve_app_path(&stored_path);
        self.checkpoints
            .create_checkpoint(&app_path, description, message_id)
            .await
    }

    /// Manually restore a chat's app to a specific checkpoint.
    pub async fn restore_checkpoint(
        &self,
        chat_id: i64,
        checkpoint_hash: &str,
    ) -> CheckpointResult {
        let stored_path = match self.store.chat_app_path(chat_id).await {
            Ok(path) => path,
            Err(err) => return failed(err.to_string()),
        };
        let app_path = resolve_app_path(&stored_path);
        let short = &checkpoint_hash[..checkpoint_hash.len().min(7)];
        self.checkpoints
            .restore_to_checkpoint(
                &app_path,
                checkpoint_hash,
                true,
                Some(format!("[restore] Manual restore to checkpoint {short}")),
            )
            .await
    }

    /// Undo the edits recorded against one message.
    pub async fn undo_message(&self, message_id: i64) -> CheckpointResult {
        self.checkpoints.undo_message(message_id).await
    }

    pub async fn list_checkpoints(&self, chat_id: i64) -> Result<Vec<CheckpointEntry>> {
        self.checkpoints.get_chat_checkpoints(chat_id).await
    }

    /// Best-effort trim of old checkpoint associations for a chat.
    pub async fn cleanup_checkpoints(&self, chat_id: i64) {
        self.checkpoints
            .cleanup_old_checkpoints(chat_id, DEFAULT_KEPT_CHECKPOINTS)
            .await;
    }

    /// Disconnect all MCP servers, e.g. at process exit.
    pub async fn shutdown(&self) {
        self.mcp.shutdown().await;
    }
}

fn failed(error: String) -> CheckpointResult {
    CheckpointResult {
        checkpoint_hash: String::new(),
        success: false,
        error: Some(error),
    }
}
