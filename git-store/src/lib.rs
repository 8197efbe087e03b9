//! Deterministic working-tree snapshot primitives over libgit2.
//!
//! The checkpoint engine treats a project directory as a content-addressable
//! history: stage everything, commit, resolve refs, and force the tree back to
//! an earlier snapshot. All functions here are synchronous; async callers are
//! expected to wrap them in `tokio::task::spawn_blocking`.

use std::path::Path;
use std::path::PathBuf;

use git2::build::CheckoutBuilder;
use git2::ErrorCode;
use git2::IndexAddOption;
use git2::Oid;
use git2::Repository;
use git2::Signature;
use git2::StatusOptions;
use tracing::debug;

/// Fallback identity used when the repository has no `user.name`/`user.email`
/// configured (scaffolded app directories usually do not).
const FALLBACK_NAME: &str = "atelier";
const FALLBACK_EMAIL: &str = "checkpoints@atelier.invalid";

#[derive(Debug, thiserror::Error)]
pub enum GitStoreError {
    #[error("not a git repository: {0}")]
    NotARepository(PathBuf),

    #[error("reference not found: {0}")]
    RefNotFound(String),

    #[error("invalid commit hash: {0}")]
    InvalidHash(String),

    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GitStoreError>;

fn open_repo(dir: &Path) -> Result<Repository> {
    Repository::open(dir).map_err(|err| match err.code() {
        ErrorCode::NotFound => GitStoreError::NotARepository(dir.to_path_buf()),
        _ => GitStoreError::Git(err),
    })
}

fn signature(repo: &Repository) -> Result<Signature<'static>> {
    match repo.signature() {
        Ok(sig) => Ok(sig.to_owned()),
        Err(_) => Ok(Signature::now(FALLBACK_NAME, FALLBACK_EMAIL)?),
    }
}

/// Open the repository at `dir`, initializing one (with a root commit, so
/// `HEAD` always resolves) if the directory is not yet under version control.
pub fn init_if_needed(dir: &Path) -> Result<()> {
    match Repository::open(dir) {
        Ok(_) => Ok(()),
        Err(err) if err.code() == ErrorCode::NotFound => {
            debug!(dir = %dir.display(), "initializing repository");
            Repository::init(dir)?;
            stage_all(dir)?;
            commit(dir, "Initial commit")?;
            Ok(())
        }
        Err(err) => Err(GitStoreError::Git(err)),
    }
}

/// Stage every working-tree change: new files, modifications, and deletions.
/// Safe to call on a clean tree, where it is a no-op.
pub fn stage_all(dir: &Path) -> Result<()> {
    let repo = open_repo(dir)?;
    let mut index = repo.index()?;
    // add_all picks up untracked and modified paths; update_all records
    // deletions of already-tracked paths.
    index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
    index.update_all(["*"].iter(), None)?;
    index.write()?;
    Ok(())
}

/// Commit the staged index, returning the new commit hash.
///
/// The parent is the current `HEAD` commit when the branch is born; on an
/// unborn branch this produces a root commit. Committing an index identical
/// to `HEAD`'s tree is allowed and still creates a new history entry, which
/// is what lets a restore be recorded as its own commit.
pub fn commit(dir: &Path, message: &str) -> Result<String> {
    let repo = open_repo(dir)?;
    let sig = signature(&repo)?;

    let mut index = repo.index()?;
    let tree_oid = index.write_tree()?;
    let tree = repo.find_tree(tree_oid)?;

    let parent = match repo.head() {
        Ok(head) => Some(head.peel_to_commit()?),
        Err(err) if err.code() == ErrorCode::UnbornBranch || err.code() == ErrorCode::NotFound => {
            None
        }
        Err(err) => return Err(GitStoreError::Git(err)),
    };
    let parents: Vec<&git2::Commit> = parent.iter().collect();

    let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
    debug!(dir = %dir.display(), hash = %oid, "created commit");
    Ok(oid.to_string())
}

/// Whether any tracked path changed or any untracked (non-ignored) path
/// exists. This is the "any status row not `(1,1,1)`" question the engine
/// asks before deciding to snapshot.
pub fn has_uncommitted_changes(dir: &Path) -> Result<bool> {
    let repo = open_repo(dir)?;
    let mut opts = StatusOptions::new();
    opts.include_untracked(true).recurse_untracked_dirs(true);
    let statuses = repo.statuses(Some(&mut opts))?;
    Ok(statuses.iter().any(|entry| !entry.status().is_ignored()))
}

/// Resolve a symbolic ref (e.g. `HEAD`) to a commit hash.
pub fn resolve_ref(dir: &Path, refname: &str) -> Result<String> {
    let repo = open_repo(dir)?;
    let object = repo.revparse_single(refname).map_err(|err| match err.code() {
        ErrorCode::NotFound => GitStoreError::RefNotFound(refname.to_string()),
        _ => GitStoreError::Git(err),
    })?;
    Ok(object.id().to_string())
}

/// Forcibly rewrite the working tree and the index to match the snapshot at
/// `target_hash`, discarding uncommitted changes and untracked files.
///
/// `HEAD` is deliberately left where it is: a subsequent [`commit`] records
/// the restoration as a descendant of the current tip instead of rewriting
/// history, so every earlier snapshot stays reachable.
pub fn revert_to_commit(dir: &Path, target_hash: &str) -> Result<()> {
    let repo = open_repo(dir)?;
    let oid = Oid::from_str(target_hash)
        .map_err(|_| GitStoreError::InvalidHash(target_hash.to_string()))?;
    let commit = repo.find_commit(oid).map_err(|err| match err.code() {
        ErrorCode::NotFound => GitStoreError::RefNotFound(target_hash.to_string()),
        _ => GitStoreError::Git(err),
    })?;
    let tree = commit.tree()?;

    let mut checkout = CheckoutBuilder::new();
    checkout.force().remove_untracked(true);
    repo.checkout_tree(tree.as_object(), Some(&mut checkout))?;

    let mut index = repo.index()?;
    index.read_tree(&tree)?;
    index.write()?;

    debug!(dir = %dir.display(), target = target_hash, "reverted working tree");
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use std::fs;

    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    fn scratch_repo() -> TempDir {
        let dir = TempDir::new().expect("tempdir");
        init_if_needed(dir.path()).expect("init repo");
        dir
    }

    #[test]
    fn init_creates_resolvable_head() {
        let dir = scratch_repo();
        let head = resolve_ref(dir.path(), "HEAD").expect("resolve HEAD");
        assert_eq!(head.len(), 40);
    }

    #[test]
    fn init_is_idempotent() {
        let dir = scratch_repo();
        let before = resolve_ref(dir.path(), "HEAD").unwrap();
        init_if_needed(dir.path()).expect("second init");
        let after = resolve_ref(dir.path(), "HEAD").unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn clean_tree_has_no_uncommitted_changes() {
        let dir = scratch_repo();
        assert!(!has_uncommitted_changes(dir.path()).unwrap());
    }

    #[test]
    fn untracked_file_is_an_uncommitted_change() {
        let dir = scratch_repo();
        fs::write(dir.path().join("index.html"), "<html></html>").unwrap();
        assert!(has_uncommitted_changes(dir.path()).unwrap());
    }

    #[test]
    fn stage_and_commit_captures_untracked_and_deleted_paths() {
        let dir = scratch_repo();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        fs::write(dir.path().join("b.txt"), "b").unwrap();
        stage_all(dir.path()).unwrap();
        let first = commit(dir.path(), "add a and b").unwrap();

        fs::remove_file(dir.path().join("b.txt")).unwrap();
        stage_all(dir.path()).unwrap();
        let second = commit(dir.path(), "drop b").unwrap();

        assert_ne!(first, second);
        assert!(!has_uncommitted_changes(dir.path()).unwrap());
        assert_eq!(resolve_ref(dir.path(), "HEAD").unwrap(), second);
    }

    #[test]
    fn commit_outside_repository_fails() {
        let dir = TempDir::new().unwrap();
        let err = commit(dir.path(), "nope").unwrap_err();
        assert!(matches!(err, GitStoreError::NotARepository(_)));
    }

    #[test]
    fn resolve_unknown_ref_fails() {
        let dir = scratch_repo();
        let err = resolve_ref(dir.path(), "refs/heads/no-such-branch").unwrap_err();
        assert!(matches!(err, GitStoreError::RefNotFound(_)));
    }

    #[test]
    fn revert_restores_snapshot_and_keeps_head() {
        let dir = scratch_repo();
        fs::write(dir.path().join("index.html"), "v1").unwrap();
        stage_all(dir.path()).unwrap();
        let snapshot = commit(dir.path(), "v1").unwrap();

        fs::write(dir.path().join("index.html"), "v2").unwrap();
        stage_all(dir.path()).unwrap();
        let tip = commit(dir.path(), "v2").unwrap();

        // Dirty the tree beyond the tip: an uncommitted edit plus an
        // untracked file, both of which the revert must discard.
        fs::write(dir.path().join("index.html"), "v3").unwrap();
        fs::write(dir.path().join("scratch.tmp"), "untracked").unwrap();

        revert_to_commit(dir.path(), &snapshot).unwrap();

        assert_eq!(fs::read_to_string(dir.path().join("index.html")).unwrap(), "v1");
        assert!(!dir.path().join("scratch.tmp").exists());
        // HEAD still points at the tip; the revert only touched tree + index.
        assert_eq!(resolve_ref(dir.path(), "HEAD").unwrap(), tip);
    }

    #[test]
    fn revert_rejects_garbage_hash() {
        let dir = scratch_repo();
        let err = revert_to_commit(dir.path(), "not-a-hash").unwrap_err();
        assert!(matches!(err, GitStoreError::InvalidHash(_)));
    }

    #[test]
    fn revert_unknown_commit_fails() {
        let dir = scratch_repo();
        let err = revert_to_commit(dir.path(), &"0".repeat(40)).unwrap_err();
        assert!(matches!(err, GitStoreError::RefNotFound(_)));
    }
}
