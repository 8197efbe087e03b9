//! Git-backed checkpoints for app working trees.
//!
//! Every mutation of a working tree goes through a per-path async mutex, so
//! concurrent checkpoint and restore requests against the same app serialize
//! instead of corrupting the index. Restores never move HEAD backwards: a
//! restore checks out the target tree and then records a fresh commit on top,
//! which keeps every previously created checkpoint reachable.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;

use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;
use tracing::warn;

use crate::db::DbError;
use crate::db::Store;
use crate::error::CoreError;
use crate::error::Result;
use crate::models::CheckpointEntry;
use crate::models::resolve_app_path;

/// How many checkpoints `cleanup_old_checkpoints` keeps per chat by default.
pub const DEFAULT_KEPT_CHECKPOINTS: usize = 10;

/// Outcome of a checkpoint or restore operation. These operations report
/// failure in-band rather than through `Result`, so a caller driving a UI can
/// always render something.
#[derive(Debug, Clone, Serialize)]
pub struct CheckpointResult {
    pub checkpoint_hash: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CheckpointResult {
    fn committed(checkpoint_hash: String) -> Self {
        Self {
            checkpoint_hash,
            success: true,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            checkpoint_hash: String::new(),
            success: false,
            error: Some(error),
        }
    }
}

pub struct CheckpointEngine {
    store: Store,
    locks: StdMutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>,
}

impl CheckpointEngine {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    /// The serialization lock for one app directory. Canonicalized so that
    /// two spellings of the same path share a lock; paths that do not exist
    /// yet fall back to their literal form.
    fn lock_for(&self, app_path: &Path) -> Arc<AsyncMutex<()>> {
        let key = app_path
            .canonicalize()
            .unwrap_or_else(|_| app_path.to_path_buf());
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key).or_default())
    }

    /// Snapshot the working tree. A dirty tree is staged and committed; a
    /// clean tree resolves to the current HEAD so the caller still gets a
    /// usable hash. When `message_id` is set the hash is also recorded on
    /// that message.
    pub async fn create_checkpoint(
        &self,
        app_path: &Path,
        description: &str,
        message_id: Option<i64>,
    ) -> CheckpointResult {
        let lock = self.lock_for(app_path);
        let _guard = lock.lock().await;
        match self.create_inner(app_path, description, message_id).await {
            Ok(hash) => {
                debug!(path = %app_path.display(), hash = %hash, "checkpoint created");
                CheckpointResult::committed(hash)
            }
            Err(err) => {
                warn!(path = %app_path.display(), error = %err, "checkpoint failed");
                CheckpointResult::failed(err.to_string())
            }
        }
    }

    async fn create_inner(
        &self,
        app_path: &Path,
        description: &str,
        message_id: Option<i64>,
    ) -> Result<String> {
        let dir = app_path.to_path_buf();
        let message = format!("[checkpoint] {description}");
        let hash = run_git(move || {
            atelier_git_store::init_if_needed(&dir)?;
            if atelier_git_store::has_uncommitted_changes(&dir)? {
                atelier_git_store::stage_all(&dir)?;
                atelier_git_store::commit(&dir, &message)
            } else {
                atelier_git_store::resolve_ref(&dir, "HEAD")
            }
        })
        .await?;
        if let Some(id) = message_id {
            self.store.set_message_checkpoint(id, &hash).await?;
        }
        Ok(hash)
    }

    /// Restore the working tree to `checkpoint_hash`. With `create_commit`
    /// the restored state is recorded as a new commit on top of the current
    /// history; without it only the working tree and index change and the
    /// original hash is echoed back.
    pub async fn restore_to_checkpoint(
        &self,
        app_path: &Path,
        checkpoint_hash: &str,
        create_commit: bool,
        commit_message: Option<String>,
    ) -> CheckpointResult {
        let lock = self.lock_for(app_path);
        let _guard = lock.lock().await;

        let dir = app_path.to_path_buf();
        let hash = checkpoint_hash.to_string();
        let message = commit_message
            .unwrap_or_else(|| format!("[restore] Restored to checkpoint {}", short_hash(&hash)));
        let outcome = run_git(move || {
            atelier_git_store::revert_to_commit(&dir, &hash)?;
            if create_commit {
                atelier_git_store::stage_all(&dir)?;
                atelier_git_store::commit(&dir, &message)
            } else {
                Ok(hash)
            }
        })
        .await;

        match outcome {
            Ok(hash) => {
                debug!(path = %app_path.display(), hash = %hash, "restore complete");
                CheckpointResult::committed(hash)
            }
            Err(err) => {
                warn!(path = %app_path.display(), error = %err, "restore failed");
                CheckpointResult::failed(err.to_string())
            }
        }
    }

    /// Roll the app back to the checkpoint recorded on `message_id`. The
    /// message's chat determines which app directory is affected.
    pub async fn undo_message(&self, message_id: i64) -> CheckpointResult {
        let message = match self.store.get_message(message_id).await {
            Ok(message) => message,
            Err(DbError::NotFound(_)) => {
                return CheckpointResult::failed(format!("Message {message_id} not found"));
            }
            Err(err) => return CheckpointResult::failed(err.to_string()),
        };
        let Some(checkpoint_hash) = message.checkpoint_hash else {
            return CheckpointResult::failed(format!(
                "No checkpoint found for message {message_id}"
            ));
        };
        let stored_path = match self.store.chat_app_path(message.chat_id).await {
            Ok(path) => path,
            Err(err) => return CheckpointResult::failed(err.to_string()),
        };
        let app_path = resolve_app_path(&stored_path);
        self.restore_to_checkpoint(
            &app_path,
            &checkpoint_hash,
            true,
            Some(format!("[undo] Undid changes from message {message_id}")),
        )
        .await
    }

    /// The checkpoints recorded in a chat, oldest first.
    pub async fn get_chat_checkpoints(&self, chat_id: i64) -> Result<Vec<CheckpointEntry>> {
        let messages = self.store.checkpointed_messages(chat_id).await?;
        Ok(messages
            .into_iter()
            .filter_map(|message| {
                message.checkpoint_hash.map(|checkpoint_hash| CheckpointEntry {
                    id: message.id,
                    checkpoint_hash,
                    created_at: message.created_at,
                })
            })
            .collect())
    }

    /// Detach checkpoint associations beyond the newest `keep_latest`. The
    /// underlying commits stay in the repository; only the message rows are
    /// updated. Failures are logged and swallowed so cleanup never blocks the
    /// caller's main flow.
    pub async fn cleanup_old_checkpoints(&self, chat_id: i64, keep_latest: usize) {
        let messages = match self.store.checkpointed_messages(chat_id).await {
            Ok(messages) => messages,
            Err(err) => {
                warn!(chat_id, error = %err, "checkpoint cleanup query failed");
                return;
            }
        };
        if messages.len() <= keep_latest {
            return;
        }
        let excess = messages.len() - keep_latest;
        let mut cleared = 0usize;
        for message in messages.into_iter().take(excess) {
            match self.store.clear_message_checkpoint(message.id).await {
                Ok(()) => cleared += 1,
                Err(err) => {
                    warn!(chat_id, message_id = message.id, error = %err, "failed to clear checkpoint");
                }
            }
        }
        debug!(chat_id, cleared, "checkpoint cleanup complete");
    }
}

fn short_hash(hash: &str) -> &str {
    &hash[..hash.len().min(7)]
}

async fn run_git<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> atelier_git_store::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| CoreError::Task(err.to_string()))?
        .map_err(CoreError::Git)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn short_hash_truncates() {
        assert_eq!(short_hash("abcdef0123456789"), "abcdef0");
        assert_eq!(short_hash("abc"), "abc");
    }

    #[test]
    fn failed_result_serializes_error() {
        let result = CheckpointResult::failed("boom".to_string());
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "boom");
    }
}
