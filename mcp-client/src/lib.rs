//! Client-side MCP transports.
//!
//! Both transports sit behind the narrow [`McpClient`] trait — connect is the
//! constructor, after which a client can list tools, call one, and be closed.
//! The connection manager in `atelier-core` holds clients exclusively through
//! this trait, which is also what lets tests substitute mocks.

mod http;
mod stdio;
pub mod types;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

pub use http::HttpClient;
pub use stdio::StdioClient;
pub use types::Implementation;
pub use types::InitializeResult;
pub use types::ListToolsResult;
pub use types::MCP_PROTOCOL_VERSION;
pub use types::Tool;

#[derive(Debug, thiserror::Error)]
pub enum McpClientError {
    #[error("server process i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server returned an error: {message} (code {code})")]
    Rpc { code: i64, message: String },

    #[error("transport closed before a response arrived")]
    ChannelClosed,

    #[error("request timed out")]
    Timeout,

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, McpClientError>;

/// The tool-facing surface of a connected MCP server.
///
/// `timeout: None` means wait indefinitely; a hung server stalls only the
/// operation awaiting it.
#[async_trait]
pub trait McpClient: Send + Sync {
    async fn list_tools(&self, timeout: Option<Duration>) -> Result<ListToolsResult>;

    /// Invoke a tool and return the raw `tools/call` result payload.
    async fn call_tool(
        &self,
        name: String,
        arguments: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value>;

    /// Tear down the connection. Idempotent.
    async fn close(&self) -> Result<()>;
}
