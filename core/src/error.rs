use crate::db::DbError;
use crate::mcp_connection_manager::McpError;
use atelier_git_store::GitStoreError;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Mcp(#[from] McpError),

    #[error(transparent)]
    Git(#[from] GitStoreError),

    #[error("blocking task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
