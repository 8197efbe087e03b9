//! Streamable-HTTP transport: JSON-RPC requests POSTed to a single endpoint,
//! answered either with a JSON body or with an SSE stream carrying the
//! response event.

use std::sync::Mutex;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde_json::Value;
use serde_json::json;
use tracing::debug;
use tracing::info;

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

const SESSION_HEADER: &str = "Mcp-Session-Id";
const ACCEPT_BOTH: &str = "application/json, text/event-stream";

/// MCP client over streamable HTTP.
pub struct HttpClient {
    http: reqwest::Client,
    url: String,
    session: Mutex<Option<String>>,
    next_id: AtomicI64,
}

impl HttpClient {
    /// Open a session against `url` and perform the initialize handshake.
    pub async fn connect(url: &str, timeout: Option<Duration>) -> Result<Self> {
        let client = Self {
            http: reqwest::Client::new(),
            url: url.to_string(),
            session: Mutex::new(None),
            next_id: AtomicI64::new(1),
        };

        let params = InitializeParams {
            protocol_version: MCP_PROTOCOL_VERSION,
            capabilities: json!({ "tools": {} }),
            client_info: Implementation {
                name: "atelier".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        let result = client
            .request("initialize", Some(serde_json::to_value(&params)?), timeout)
            .await?;
        let init: InitializeResult = serde_json::from_value(result)?;
        client.notify("notifications/initialized", None).await?;

        info!(
            server = %init.server_info.name,
            version = %init.server_info.version,
            url,
            "mcp http session established"
        );
        Ok(client)
    }

    fn session_id(&self) -> Option<String> {
        self.session.lock().ok().and_then(|guard| guard.clone())
    }

    fn remember_session(&self, response: &reqwest::Response) {
        if let Some(id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
            && let Ok(mut guard) = self.session.lock()
        {
            *guard = Some(id.to_string());
        }
    }

    async fn post(
        &self,
        body: &impl serde::Serialize,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response> {
        let mut builder = self
            .http
            .post(&self.url)
            .header(reqwest::header::ACCEPT, ACCEPT_BOTH)
            .json(body);
        if let Some(session) = self.session_id() {
            builder = builder.header(SESSION_HEADER, session);
        }
        if let Some(budget) = timeout {
            builder = builder.timeout(budget);
        }
        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                McpClientError::Timeout
            } else {
                McpClientError::Http(err)
            }
        })?;
        if !response.status().is_success() {
            return Err(McpClientError::Protocol(format!(
                "server answered {}",
                response.status()
            )));
        }
        self.remember_session(&response);
        Ok(response)
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.to_string(),
            params,
        };
        let response = self.post(&request, timeout).await?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let rpc = if content_type.starts_with("text/event-stream") {
            scan_sse_for_response(response, id).await?
        } else {
            response.json::<JsonRpcResponse>().await?
        };

        if let Some(error) = rpc.error {
            return Err(McpClientError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(rpc.result.unwrap_or(Value::Null))
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = JsonRpcNotification {
            jsonrpc: JSONRPC_VERSION,
            method: method.to_string(),
            params,
        };
        self.post(&notification, None).await?;
        Ok(())
    }
}

/// Read SSE events off the response body until the JSON-RPC response with the
/// expected id shows up. Unrelated events (server notifications, keepalives)
/// are skipped.
async fn scan_sse_for_response(response: reqwest::Response, id: i64) -> Result<JsonRpcResponse> {
    let mut stream = response.bytes_stream().eventsource();
    while let Some(event) = stream.next().await {
        let event = event.map_err(|err| McpClientError::Protocol(err.to_string()))?;
        if event.data.is_empty() {
            continue;
        }
        match serde_json::from_str::<JsonRpcResponse>(&event.data) {
            Ok(rpc) if rpc.id.as_ref().and_then(Value::as_i64) == Some(id) => return Ok(rpc),
            Ok(_) => debug!("skipping unrelated sse event"),
            Err(err) => debug!(%err, "skipping unparseable sse event"),
        }
    }
    Err(McpClientError::ChannelClosed)
}

#[async_trait]
impl McpClient for HttpClient {
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
        // Best-effort session teardown; servers without session tracking
        // simply never handed us an id.
        if let Some(session) = self.session_id() {
            let _ = self
                .http
                .delete(&self.url)
                .header(SESSION_HEADER, session)
                .send()
                .await;
        }
        Ok(())
    }
}
