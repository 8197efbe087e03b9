//! Live MCP server connections.
//!
//! The manager owns one client per enabled server id and rebuilds that set
//! from the database at startup. Connection state is process-local; the only
//! durable record is the `mcp_servers` table. Lifecycle changes and
//! per-server failures are published on a broadcast channel so interested
//! frontends can react without polling.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;
use tracing::info;
use tracing::warn;

use atelier_mcp_client::HttpClient;
use atelier_mcp_client::McpClient;
use atelier_mcp_client::McpClientError;
use atelier_mcp_client::StdioClient;
use atelier_mcp_client::Tool;

use crate::models::McpServerConfig;
use crate::models::McpTransport;

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("invalid server configuration: {0}")]
    Validation(String),

    #[error(transparent)]
    Connection(#[from] McpClientError),

    #[error("no connected server with id {0}")]
    NotFound(i64),
}

pub type Result<T> = std::result::Result<T, McpError>;

/// Connection lifecycle notifications.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum McpEvent {
    ServerAdded { id: i64, name: String },
    ServerRemoved { id: i64 },
    ServerError { id: i64, message: String },
}

/// A tool offered by one connected server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerTool {
    pub server_id: i64,
    pub server_name: String,
    pub tool: Tool,
}

/// Seam between the manager and the transport layer. Production code uses
/// [`TransportFactory`]; tests substitute scripted clients.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn connect(
        &self,
        config: &McpServerConfig,
    ) -> atelier_mcp_client::Result<Box<dyn McpClient>>;
}

/// Connects over the transport named in the config.
pub struct TransportFactory;

#[async_trait]
impl ClientFactory for TransportFactory {
    async fn connect(
        &self,
        config: &McpServerConfig,
    ) -> atelier_mcp_client::Result<Box<dyn McpClient>> {
        match config.transport {
            McpTransport::Stdio => {
                let command = config.command.as_deref().ok_or_else(|| {
                    McpClientError::Protocol("stdio server has no command".to_string())
                })?;
                let client =
                    StdioClient::connect(command, &config.args, &config.env, None).await?;
                Ok(Box::new(client))
            }
            McpTransport::Http => {
                let url = config.url.as_deref().ok_or_else(|| {
                    McpClientError::Protocol("http server has no url".to_string())
                })?;
                let client = HttpClient::connect(url, None).await?;
                Ok(Box::new(client))
            }
        }
    }
}

/// Reject configs that cannot possibly connect, before any process is
/// spawned or request sent.
pub fn validate_config(config: &McpServerConfig) -> Result<()> {
    match config.transport {
        McpTransport::Stdio => {
            if config.command.as_deref().is_none_or(|c| c.trim().is_empty()) {
                return Err(McpError::Validation(
                    "stdio transport requires a command".to_string(),
                ));
            }
        }
        McpTransport::Http => match config.url.as_deref() {
            Some(url) if url.starts_with("http://") || url.starts_with("https://") => {}
            Some(url) => {
                return Err(McpError::Validation(format!(
                    "http transport requires an http(s) url, got {url}"
                )));
            }
            None => {
                return Err(McpError::Validation(
                    "http transport requires a url".to_string(),
                ));
            }
        },
    }
    Ok(())
}

// Handles are cloned out of the registry before any transport await. The
// registry lock therefore only guards map access; a hung server stalls the
// operation awaiting it and nothing else.
#[derive(Clone)]
struct ServerHandle {
    name: String,
    client: Arc<dyn McpClient>,
}

pub struct McpConnectionManager {
    clients: Mutex<HashMap<i64, ServerHandle>>,
    factory: Arc<dyn ClientFactory>,
    events: broadcast::Sender<McpEvent>,
}

impl Default for McpConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl McpConnectionManager {
    pub fn new() -> Self {
        Self::with_factory(Arc::new(TransportFactory))
    }

    pub fn with_factory(factory: Arc<dyn ClientFactory>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            clients: Mutex::new(HashMap::new()),
            factory,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<McpEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: McpEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    /// Connect to a server and track it under its config id. Disabled
    /// configs are a no-op. An existing connection under the same id is
    /// closed and replaced.
    pub async fn add_server(&self, config: &McpServerConfig) -> Result<()> {
        if !config.is_enabled {
            debug!(id = config.id, name = %config.name, "skipping disabled server");
            return Ok(());
        }
        validate_config(config)?;

        let client: Arc<dyn McpClient> = match self.factory.connect(config).await {
            Ok(client) => Arc::from(client),
            Err(err) => {
                self.emit(McpEvent::ServerError {
                    id: config.id,
                    message: err.to_string(),
                });
                return Err(McpError::Connection(err));
            }
        };

        let replaced = {
            let mut clients = self.clients.lock().await;
            clients.insert(
                config.id,
                ServerHandle {
                    name: config.name.clone(),
                    client,
                },
            )
        };
        if let Some(old) = replaced {
            if let Err(err) = old.client.close().await {
                warn!(id = config.id, error = %err, "failed to close replaced connection");
            }
        }

        info!(id = config.id, name = %config.name, "mcp server connected");
        self.emit(McpEvent::ServerAdded {
            id: config.id,
            name: config.name.clone(),
        });
        Ok(())
    }

    /// Disconnect a server. Unknown ids are a no-op.
    pub async fn remove_server(&self, id: i64) -> Result<()> {
        let removed = self.clients.lock().await.remove(&id);
        let Some(handle) = removed else {
            return Ok(());
        };
        if let Err(err) = handle.client.close().await {
            warn!(id, error = %err, "error while closing mcp connection");
            self.emit(McpEvent::ServerError {
                id,
                message: err.to_string(),
            });
        }
        info!(id, name = %handle.name, "mcp server disconnected");
        self.emit(McpEvent::ServerRemoved { id });
        Ok(())
    }

    /// The tools offered by connected servers. With `server_id` set, only
    /// that server is queried; an unknown id yields an empty list. When
    /// aggregating, a failing server contributes nothing and emits a single
    /// `ServerError`, but never sinks the other servers' results.
    pub async fn get_tools(&self, server_id: Option<i64>) -> Vec<ServerTool> {
        let handles: Vec<(i64, ServerHandle)> = {
            let clients = self.clients.lock().await;
            clients
                .iter()
                .filter(|(id, _)| server_id.is_none_or(|wanted| **id == wanted))
                .map(|(id, handle)| (*id, handle.clone()))
                .collect()
        };
        let mut tools = Vec::new();
        for (id, handle) in handles {
            match handle.client.list_tools(None).await {
                Ok(listing) => {
                    tools.extend(listing.tools.into_iter().map(|tool| ServerTool {
                        server_id: id,
                        server_name: handle.name.clone(),
                        tool,
                    }));
                }
                Err(err) => {
                    warn!(id, name = %handle.name, error = %err, "tool listing failed");
                    self.emit(McpEvent::ServerError {
                        id,
                        message: err.to_string(),
                    });
                }
            }
        }
        tools.sort_by(|a, b| (a.server_id, &a.tool.name).cmp(&(b.server_id, &b.tool.name)));
        tools
    }

    pub async fn call_tool(
        &self,
        server_id: i64,
        name: String,
        arguments: Option<Value>,
    ) -> Result<Value> {
        let handle = {
            let clients = self.clients.lock().await;
            clients.get(&server_id).cloned()
        };
        let handle = handle.ok_or(McpError::NotFound(server_id))?;
        match handle.client.call_tool(name, arguments, None).await {
            Ok(result) => Ok(result),
            Err(err) => {
                self.emit(McpEvent::ServerError {
                    id: server_id,
                    message: err.to_string(),
                });
                Err(McpError::Connection(err))
            }
        }
    }

    /// Probe a config without tracking the connection. Reports reachability
    /// as a bool; nothing here is an error condition.
    pub async fn test_connection(&self, config: &McpServerConfig) -> bool {
        if validate_config(config).is_err() {
            return false;
        }
        let client = match self.factory.connect(config).await {
            Ok(client) => client,
            Err(err) => {
                debug!(name = %config.name, error = %err, "test connection failed");
                return false;
            }
        };
        let reachable = client.list_tools(None).await.is_ok();
        if let Err(err) = client.close().await {
            debug!(name = %config.name, error = %err, "error closing test connection");
        }
        reachable
    }

    /// Ids and names of currently connected servers, ordered by id.
    pub async fn connected_servers(&self) -> Vec<(i64, String)> {
        let clients = self.clients.lock().await;
        let mut servers: Vec<(i64, String)> = clients
            .iter()
            .map(|(id, handle)| (*id, handle.name.clone()))
            .collect();
        servers.sort_by_key(|(id, _)| *id);
        servers
    }

    /// Close every connection. Emits `ServerRemoved` per server.
    pub async fn shutdown(&self) {
        let drained: Vec<(i64, ServerHandle)> =
            self.clients.lock().await.drain().collect();
        let closes = drained.into_iter().map(|(id, handle)| async move {
            if let Err(err) = handle.client.close().await {
                warn!(id, error = %err, "error during shutdown close");
            }
            id
        });
        for id in join_all(closes).await {
            self.emit(McpEvent::ServerRemoved { id });
        }
        info!("mcp connection manager shut down");
    }
}
