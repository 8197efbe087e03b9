//! Persisted entities: apps, chats, messages, and MCP server configurations.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

/// An on-disk project the checkpoint engine operates on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct App {
    pub id: i64,
    pub name: String,
    /// Absolute for modern entries; legacy rows may be relative to the user
    /// home directory (see [`resolve_app_path`]).
    pub path: String,
    pub created_at: String,
}

/// A conversation, associated 1:1 with an [`App`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: i64,
    pub app_id: i64,
    pub title: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// A chat turn. `is_checkpoint == true` implies `checkpoint_hash` is set and
/// resolvable in the owning app's repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub chat_id: i64,
    pub role: MessageRole,
    pub content: String,
    pub checkpoint_hash: Option<String>,
    pub commit_hash: Option<String>,
    pub is_checkpoint: bool,
    pub created_at: String,
}

/// One row of `checkpoint.list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub id: i64,
    pub checkpoint_hash: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpTransport {
    Stdio,
    Http,
}

impl McpTransport {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Http => "http",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "stdio" => Some(Self::Stdio),
            "http" => Some(Self::Http),
            _ => None,
        }
    }
}

/// A persisted MCP server row. The live connection set is rebuilt from
/// enabled rows at startup; it is never itself persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub id: i64,
    pub name: String,
    pub transport: McpTransport,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub url: Option<String>,
    pub is_enabled: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// An unsaved server configuration, as submitted through the boundary layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerDraft {
    pub name: String,
    pub transport: Option<McpTransport>,
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub url: Option<String>,
    #[serde(default = "default_enabled")]
    pub is_enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl McpServerDraft {
    /// Materialize an ephemeral (unpersisted) config, e.g. for
    /// `mcp.testConnection`.
    pub fn into_config(self, id: i64) -> Option<McpServerConfig> {
        Some(McpServerConfig {
            id,
            name: self.name,
            transport: self.transport?,
            command: self.command,
            args: self.args,
            env: self.env,
            url: self.url,
            is_enabled: self.is_enabled,
            created_at: String::new(),
            updated_at: String::new(),
        })
    }
}

/// Resolve a stored app path: absolute paths pass through, legacy relative
/// entries are joined to the user's home directory.
pub fn resolve_app_path(stored: &str) -> PathBuf {
    let path = Path::new(stored);
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match dirs::home_dir() {
        Some(home) => home.join(path),
        None => path.to_path_buf(),
    }
}
