//! Core services: SQLite persistence, git-backed checkpoints for app
//! working trees, and the MCP server connection manager.

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod checkpoint;
pub mod db;
pub mod error;
pub mod mcp_connection_manager;
pub mod models;
pub mod ops;

pub use checkpoint::CheckpointEngine;
pub use checkpoint::CheckpointResult;
pub use db::Store;
pub use error::CoreError;
pub use mcp_connection_manager::McpConnectionManager;
pub use mcp_connection_manager::McpEvent;
pub use ops::Services;
