//! SQLite persistence: pooled connections, migrations, and typed CRUD for
//! apps, chats, messages, and MCP server configurations.
//!
//! SQLite is synchronous; every public operation goes through
//! [`Store::with_connection`], which runs the closure on the blocking thread
//! pool so callers never stall the async runtime.

mod catalog;
mod mcp_servers;
mod messages;
pub mod migrations;

use std::path::Path;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use tracing::info;

pub type DbPool = Pool<SqliteConnectionManager>;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("column serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("blocking task failed: {0}")]
    Join(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Handle to the application database. Cheap to clone; all clones share the
/// same pool.
#[derive(Clone)]
pub struct Store {
    pool: DbPool,
}

impl Store {
    /// Open (or create) the database at `path`, apply pragmas to every pooled
    /// connection, and run migrations.
    pub fn open(path: &Path, pool_size: u32) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            conn.busy_timeout(std::time::Duration::from_secs(5))?;
            Ok(())
        });
        let pool = Pool::builder()
            .max_size(pool_size)
            .build(manager)
            .map_err(|err| DbError::Pool(err.to_string()))?;

        {
            let mut conn = pool.get().map_err(|err| DbError::Pool(err.to_string()))?;
            migrations::migrate_to_latest(&mut conn)?;
        }

        info!(path = %path.display(), "database ready");
        Ok(Self { pool })
    }

    /// Run a synchronous database operation on the blocking thread pool.
    pub async fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(|err| DbError::Pool(err.to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|err| DbError::Join(err.to_string()))?
    }
}

pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
