//! Stdio transport: a spawned child process speaking line-delimited JSON-RPC.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use serde_json::json;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::ChildStdin;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::McpClient;
use crate::McpClientError;
use crate::Result;
use crate::types::Implementation;
use crate::types::InitializeParams;
use crate::types::InitializeResult;
use crate::types::JSONRPC_VERSION;
use crate::types::JsonRpcNotification;
use crate::types::JsonRpcRequest;
use crate::types::JsonRpcResponse;
use crate::types::ListToolsResult;
use crate::types::MCP_PROTOCOL_VERSION;

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<JsonRpcResponse>>>>;

/// MCP client over a spawned child process.
///
/// One background task owns the child's stdout and routes each response line
/// to the request that is waiting for it; requests write directly to stdin.
pub struct StdioClient {
    child: tokio::sync::Mutex<Option<Child>>,
    stdin: tokio::sync::Mutex<ChildStdin>,
    pending: PendingMap,
    reader: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicI64,
}

impl StdioClient {
    /// Spawn `program args…` and perform the MCP initialize handshake.
    ///
    /// The child inherits the current process environment with `extra_env`
    /// overlaid, and is killed when the client is dropped or closed.
    pub async fn connect(
        program: &str,
        args: &[String],
        extra_env: &HashMap<String, String>,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .envs(extra_env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpClientError::Protocol("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpClientError::Protocol("child stdout unavailable".to_string()))?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let reader = tokio::spawn(route_responses(stdout, Arc::clone(&pending)));

        let client = Self {
            child: tokio::sync::Mutex::new(Some(child)),
            stdin: tokio::sync::Mutex::new(stdin),
            pending,
            reader: Mutex::new(Some(reader)),
            next_id: AtomicI64::new(1),
        };

        let init = client.initialize(timeout).await?;
        info!(
            server = %init.server_info.name,
            version = %init.server_info.version,
            "mcp stdio session established"
        );
        Ok(client)
    }

    async fn initialize(&self, timeout: Option<Duration>) -> Result<InitializeResult> {
        let params = InitializeParams {
            protocol_version: MCP_PROTOCOL_VERSION,
            capabilities: json!({ "tools": {} }),
            client_info: Implementation {
                name: "atelier".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        let result = self
            .request("initialize", Some(serde_json::to_value(&params)?), timeout)
            .await?;
        let init: InitializeResult = serde_json::from_value(result)?;
        self.notify("notifications/initialized", None).await?;
        Ok(init)
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id, tx);
        }

        let request = JsonRpcRequest {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.to_string(),
            params,
        };
        self.write_line(&serde_json::to_string(&request)?).await?;

        let response = match timeout {
            Some(budget) => match tokio::time::timeout(budget, rx).await {
                Ok(received) => received.map_err(|_| McpClientError::ChannelClosed)?,
                Err(_) => {
                    if let Ok(mut pending) = self.pending.lock() {
                        pending.remove(&id);
                    }
                    return Err(McpClientError::Timeout);
                }
            },
            None => rx.await.map_err(|_| McpClientError::ChannelClosed)?,
        };

        if let Some(error) = response.error {
            return Err(McpClientError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = JsonRpcNotification {
            jsonrpc: JSONRPC_VERSION,
            method: method.to_string(),
            params,
        };
        self.write_line(&serde_json::to_string(&notification)?).await
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }
}

async fn route_responses(stdout: tokio::process::ChildStdout, pending: PendingMap) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<JsonRpcResponse>(line) {
                    Ok(response) => {
                        let Some(id) = response.id.as_ref().and_then(Value::as_i64) else {
                            // Server-initiated notification; nothing awaits it.
                            debug!("ignoring message without integer id");
                            continue;
                        };
                        let waiter = pending.lock().ok().and_then(|mut map| map.remove(&id));
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(response);
                            }
                            None => warn!(id, "response for unknown request id"),
                        }
                    }
                    Err(err) => warn!(%err, "failed to parse server message"),
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(%err, "stdout read failed");
                break;
            }
        }
    }
    // Dropping the map wakes every outstanding request with ChannelClosed.
    if let Ok(mut map) = pending.lock() {
        map.clear();
    }
}

#[async_trait]
impl McpClient for StdioClient {
    async fn list_tools(&self, timeout: Option<Duration>) -> Result<ListToolsResult> {
        let result = self.request("tools/list", None, timeout).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn call_tool(
        &self,
        name: String,
        arguments: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let params = json!({
            "name": name,
            "arguments": arguments.unwrap_or_else(|| json!({})),
        });
        self.request("tools/call", Some(params), timeout).await
    }

    async fn close(&self) -> Result<()> {
        if let Ok(mut reader) = self.reader.lock()
            && let Some(handle) = reader.take()
        {
            handle.abort();
        }
        let mut child = self.child.lock().await;
        if let Some(mut child) = child.take() {
            if let Err(err) = child.start_kill() {
                debug!(%err, "child already exited");
            }
            let _ = child.wait().await;
        }
        Ok(())
    }
}
