// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Operations applied to a whole directory tree.
//!
//! The root is classified with `lstat` first; a root that is not a directory, a symbolic link
//! to one included, is a single leaf and is never listed. Otherwise the engine lists a directory, recurses into subdirectories and treats everything else
//! (files, symbolic links, FIFOs) as a leaf. Every sub-operation of a level is started before
//! the level waits, and the level only finishes once all of them have settled. Failures do not
//! stop siblings and nothing is rolled back; the first failure to settle is the one reported.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::{self, BoxFuture};
use futures::stream::{FuturesUnordered, StreamExt as _};
use tracing::{Level, event};

use crate::adapter::Adapter;
use crate::error::{Error, Result};
use crate::protocol::{DirEntry, EntryKind};

/// The filesystem calls the engine is built on.
///
/// Every [`Adapter`] provides them. Tests drive the engine through an in-memory tree instead.
pub trait TreeOps: Send + Sync {
    /// Classifies `path` without following a symbolic link.
    fn entry_kind(&self, path: &Path) -> impl Future<Output = Result<EntryKind>> + Send;

    /// Lists a directory without following symbolic links.
    fn list_children(&self, path: &Path) -> impl Future<Output = Result<Vec<DirEntry>>> + Send;

    /// Removes a file, symbolic link or other non-directory entry.
    fn remove_leaf(&self, path: &Path) -> impl Future<Output = Result<()>> + Send;

    /// Removes an empty directory.
    fn remove_directory(&self, path: &Path) -> impl Future<Output = Result<()>> + Send;

    /// Changes permission bits, following symbolic links.
    fn set_mode(&self, path: &Path, mode: u32) -> impl Future<Output = Result<()>> + Send;

    /// Changes ownership, following symbolic links.
    fn set_owner(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> impl Future<Output = Result<()>> + Send;
}

impl<A: Adapter> TreeOps for A {
    fn entry_kind(&self, path: &Path) -> impl Future<Output = Result<EntryKind>> + Send {
        let stat = self.lstat(path);
        async move { Ok(stat.await?.kind) }
    }

    fn list_children(&self, path: &Path) -> impl Future<Output = Result<Vec<DirEntry>>> + Send {
        self.list_directory(path)
    }

    fn remove_leaf(&self, path: &Path) -> impl Future<Output = Result<()>> + Send {
        self.unlink(path)
    }

    fn remove_directory(&self, path: &Path) -> impl Future<Output = Result<()>> + Send {
        self.rmdir(path)
    }

    fn set_mode(&self, path: &Path, mode: u32) -> impl Future<Output = Result<()>> + Send {
        self.chmod(path, mode)
    }

    fn set_owner(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> impl Future<Output = Result<()>> + Send {
        self.chown(path, uid, gid)
    }
}

/// What to do with every node of a tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecursiveOperation {
    /// Remove the tree, children before their parent.
    Remove,
    /// Set the permission bits of every node.
    Chmod(u32),
    /// Set the owner and/or group of every node. `None` leaves that id unchanged.
    Chown {
        /// New owning user.
        uid: Option<u32>,
        /// New owning group.
        gid: Option<u32>,
    },
}

/// Counts of what a successful recursive operation visited.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AggregateResult {
    /// Directories listed, the root included.
    pub directories: u64,
    /// Non-directory entries the operation was applied to.
    pub entries: u64,
}

#[derive(Debug, Default)]
struct Task {
    directories: AtomicU64,
    entries: AtomicU64,
    first_error: Mutex<Option<Error>>,
}

impl Task {
    fn record(&self, path: &Path, error: Error) {
        event!(Level::DEBUG, message = "recursive step failed", path = %path.display(), error = %error);
        let mut first = self.first_error.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if first.is_none() {
            *first = Some(error);
        }
    }

    /// Records the failure, if any, and returns whether the step succeeded.
    fn settle(&self, path: &Path, result: Result<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                self.record(path, e);
                false
            }
        }
    }

    fn finish(self) -> Result<AggregateResult> {
        let first = self.first_error.into_inner().unwrap_or_else(std::sync::PoisonError::into_inner);
        match first {
            Some(e) => Err(e),
            None => Ok(AggregateResult {
                directories: self.directories.into_inner(),
                entries: self.entries.into_inner(),
            }),
        }
    }
}

/// Applies `operation` to `root` and everything below it.
///
/// The call resolves once every sub-operation has settled. A root that is not a directory,
/// including a symbolic link to one, is a single leaf: remove unlinks it and nothing it points
/// to is listed.
///
/// # Errors
///
/// Returns the first error to settle. Sub-operations that succeeded stay applied; for
/// [`RecursiveOperation::Remove`], a directory is kept whenever anything below it could not be
/// removed.
pub async fn run<T: TreeOps>(ops: &T, root: &Path, operation: RecursiveOperation) -> Result<AggregateResult> {
    let task = Task::default();

    let kind = ops.entry_kind(root).await?;
    if kind != EntryKind::Directory {
        event!(Level::DEBUG, message = "recursive root is a leaf", path = %root.display(), kind = ?kind);
        let _ = task.entries.fetch_add(1, Ordering::Relaxed);
        let result = match operation {
            RecursiveOperation::Remove => ops.remove_leaf(root).await,
            RecursiveOperation::Chmod(_) | RecursiveOperation::Chown { .. } => apply(ops, root, operation).await,
        };
        let _ = task.settle(root, result);
        return task.finish();
    }

    let _ = match operation {
        RecursiveOperation::Remove => remove(ops, root.to_path_buf(), &task).await,
        RecursiveOperation::Chmod(_) | RecursiveOperation::Chown { .. } => apply_tree(ops, root.to_path_buf(), operation, &task).await,
    };

    task.finish()
}

fn split(path: &Path, entries: Vec<DirEntry>) -> (Vec<PathBuf>, Vec<PathBuf>) {
    let (directories, leaves): (Vec<_>, Vec<_>) = entries.into_iter().partition(|entry| entry.kind == EntryKind::Directory);
    (
        directories.into_iter().map(|entry| path.join(entry.name)).collect(),
        leaves.into_iter().map(|entry| path.join(entry.name)).collect(),
    )
}

/// Removes `path` after everything below it. Returns whether the whole subtree is gone.
fn remove<'a, T: TreeOps>(ops: &'a T, path: PathBuf, task: &'a Task) -> BoxFuture<'a, bool> {
    Box::pin(async move {
        let entries = match ops.list_children(&path).await {
            Ok(entries) => entries,
            Err(e) => {
                task.record(&path, e);
                return false;
            }
        };
        let _ = task.directories.fetch_add(1, Ordering::Relaxed);

        let (directories, leaves) = split(&path, entries);

        let mut cleared = directories
            .into_iter()
            .map(|child| remove(ops, child, task))
            .collect::<FuturesUnordered<_>>()
            .fold(true, |all, removed| future::ready(all & removed))
            .await;

        cleared &= leaves
            .iter()
            .map(|leaf| async move {
                let _ = task.entries.fetch_add(1, Ordering::Relaxed);
                task.settle(leaf, ops.remove_leaf(leaf).await)
            })
            .collect::<FuturesUnordered<_>>()
            .fold(true, |all, removed| future::ready(all & removed))
            .await;

        if !cleared {
            return false;
        }

        task.settle(&path, ops.remove_directory(&path).await)
    })
}

async fn apply<T: TreeOps>(ops: &T, path: &Path, operation: RecursiveOperation) -> Result<()> {
    match operation {
        RecursiveOperation::Chmod(mode) => ops.set_mode(path, mode).await,
        RecursiveOperation::Chown { uid, gid } => ops.set_owner(path, uid, gid).await,
        RecursiveOperation::Remove => Err(Error::InvalidArgument("remove is not a per-node operation".to_string())),
    }
}

/// Applies `operation` to `path` while its children are processed.
fn apply_tree<'a, T: TreeOps>(ops: &'a T, path: PathBuf, operation: RecursiveOperation, task: &'a Task) -> BoxFuture<'a, bool> {
    Box::pin(async move {
        let own = async { task.settle(&path, apply(ops, &path, operation).await) };

        let children = async {
            let entries = match ops.list_children(&path).await {
                Ok(entries) => entries,
                Err(e) => {
                    task.record(&path, e);
                    return false;
                }
            };
            let _ = task.directories.fetch_add(1, Ordering::Relaxed);

            let (directories, leaves) = split(&path, entries);

            let mut pending: FuturesUnordered<BoxFuture<'_, bool>> = directories
                .into_iter()
                .map(|child| apply_tree(ops, child, operation, task))
                .collect();

            for leaf in leaves {
                pending.push(Box::pin(async move {
                    let _ = task.entries.fetch_add(1, Ordering::Relaxed);
                    task.settle(&leaf, apply(ops, &leaf, operation).await)
                }));
            }

            pending.fold(true, |all, applied| future::ready(all & applied)).await
        };

        let (own, children) = future::join(own, children).await;
        own && children
    })
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::ffi::OsString;

    use super::*;
    use crate::error::ErrorCode;

    /// An in-memory tree keyed by absolute path.
    #[derive(Debug, Default)]
    struct FakeTree {
        nodes: Mutex<BTreeMap<PathBuf, EntryKind>>,
        log: Mutex<Vec<String>>,
        denied: BTreeSet<PathBuf>,
    }

    impl FakeTree {
        fn new(nodes: &[(&str, EntryKind)]) -> Self {
            Self {
                nodes: Mutex::new(nodes.iter().map(|(p, k)| (PathBuf::from(p), *k)).collect()),
                ..Self::default()
            }
        }

        fn deny(mut self, path: &str) -> Self {
            let _ = self.denied.insert(PathBuf::from(path));
            self
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn remaining(&self) -> Vec<PathBuf> {
            self.nodes.lock().unwrap().keys().cloned().collect()
        }

        fn check(&self, path: &Path) -> Result<EntryKind> {
            if self.denied.contains(path) {
                return Err(Error::Io {
                    code: ErrorCode::PermissionDenied,
                    message: format!("{}: permission denied", path.display()),
                    native_code: Some(13),
                });
            }
            self.nodes.lock().unwrap().get(path).copied().ok_or_else(|| Error::Io {
                code: ErrorCode::NotFound,
                message: format!("{}: not found", path.display()),
                native_code: Some(2),
            })
        }

        fn record(&self, what: &str, path: &Path) {
            self.log.lock().unwrap().push(format!("{what} {}", path.display()));
        }
    }

    impl TreeOps for FakeTree {
        async fn entry_kind(&self, path: &Path) -> Result<EntryKind> {
            tokio::task::yield_now().await;
            self.check(path)
        }

        async fn list_children(&self, path: &Path) -> Result<Vec<DirEntry>> {
            tokio::task::yield_now().await;
            let nodes = self.nodes.lock().unwrap();
            Ok(nodes
                .iter()
                .filter(|(p, _)| p.parent() == Some(path))
                .map(|(p, kind)| DirEntry {
                    name: p.file_name().map(OsString::from).unwrap_or_default(),
                    kind: *kind,
                })
                .collect())
        }

        async fn remove_leaf(&self, path: &Path) -> Result<()> {
            tokio::task::yield_now().await;
            let _ = self.check(path)?;
            let _ = self.nodes.lock().unwrap().remove(path);
            self.record("unlink", path);
            Ok(())
        }

        async fn remove_directory(&self, path: &Path) -> Result<()> {
            tokio::task::yield_now().await;
            let _ = self.check(path)?;
            let mut nodes = self.nodes.lock().unwrap();
            assert!(
                !nodes.keys().any(|p| p.parent() == Some(path)),
                "{} removed before its children",
                path.display()
            );
            let _ = nodes.remove(path);
            drop(nodes);
            self.record("rmdir", path);
            Ok(())
        }

        async fn set_mode(&self, path: &Path, mode: u32) -> Result<()> {
            tokio::task::yield_now().await;
            let _ = self.check(path)?;
            self.record(&format!("chmod {mode:o}"), path);
            Ok(())
        }

        async fn set_owner(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
            tokio::task::yield_now().await;
            let _ = self.check(path)?;
            self.record(&format!("chown {uid:?}:{gid:?}"), path);
            Ok(())
        }
    }

    #[tokio::test]
    async fn remove_is_post_order() {
        let tree = FakeTree::new(&[
            ("/a", EntryKind::Directory),
            ("/a/b", EntryKind::Directory),
            ("/a/b/c", EntryKind::Directory),
            ("/a/b/c/d", EntryKind::File),
        ]);

        let result = run(&tree, Path::new("/a"), RecursiveOperation::Remove).await.unwrap();

        assert_eq!(tree.log(), ["unlink /a/b/c/d", "rmdir /a/b/c", "rmdir /a/b", "rmdir /a"]);
        assert_eq!(result, AggregateResult { directories: 3, entries: 1 });
        assert!(tree.remaining().is_empty());
    }

    #[tokio::test]
    async fn remove_keeps_ancestors_of_a_failure_but_finishes_siblings() {
        let tree = FakeTree::new(&[
            ("/r", EntryKind::Directory),
            ("/r/keep", EntryKind::Directory),
            ("/r/keep/locked", EntryKind::File),
            ("/r/gone", EntryKind::Directory),
            ("/r/gone/x", EntryKind::File),
            ("/r/link", EntryKind::Symlink),
        ])
        .deny("/r/keep/locked");

        let error = run(&tree, Path::new("/r"), RecursiveOperation::Remove).await.unwrap_err();

        assert!(error.is(ErrorCode::PermissionDenied));
        assert_eq!(
            tree.remaining(),
            [PathBuf::from("/r"), PathBuf::from("/r/keep"), PathBuf::from("/r/keep/locked")]
        );
    }

    #[tokio::test]
    async fn chmod_reaches_every_node() {
        let tree = FakeTree::new(&[
            ("/t", EntryKind::Directory),
            ("/t/f", EntryKind::File),
            ("/t/sub", EntryKind::Directory),
            ("/t/sub/g", EntryKind::File),
        ]);

        let result = run(&tree, Path::new("/t"), RecursiveOperation::Chmod(0o750)).await.unwrap();

        let mut log = tree.log();
        log.sort();
        assert_eq!(log, ["chmod 750 /t", "chmod 750 /t/f", "chmod 750 /t/sub", "chmod 750 /t/sub/g"]);
        assert_eq!(result, AggregateResult { directories: 2, entries: 2 });
    }

    #[tokio::test]
    async fn chown_failure_is_reported_and_siblings_keep_their_change() {
        let tree = FakeTree::new(&[
            ("/t", EntryKind::Directory),
            ("/t/ok", EntryKind::File),
            ("/t/denied", EntryKind::File),
        ])
        .deny("/t/denied");

        let error = run(
            &tree,
            Path::new("/t"),
            RecursiveOperation::Chown {
                uid: Some(1000),
                gid: None,
            },
        )
        .await
        .unwrap_err();

        assert!(error.is(ErrorCode::PermissionDenied));
        let log = tree.log();
        assert!(log.contains(&"chown Some(1000):None /t".to_string()));
        assert!(log.contains(&"chown Some(1000):None /t/ok".to_string()));
        assert_eq!(log.len(), 2);
    }

    #[tokio::test]
    async fn symlink_root_is_unlinked_and_its_target_is_untouched() {
        let tree = FakeTree::new(&[
            ("/keep", EntryKind::Directory),
            ("/keep/precious", EntryKind::File),
            ("/link", EntryKind::Symlink),
        ]);

        let result = run(&tree, Path::new("/link"), RecursiveOperation::Remove).await.unwrap();

        assert_eq!(tree.log(), ["unlink /link"]);
        assert_eq!(result, AggregateResult { directories: 0, entries: 1 });
        assert_eq!(tree.remaining(), [PathBuf::from("/keep"), PathBuf::from("/keep/precious")]);
    }

    #[tokio::test]
    async fn file_root_gets_a_single_chmod() {
        let tree = FakeTree::new(&[("/f", EntryKind::File)]);

        let result = run(&tree, Path::new("/f"), RecursiveOperation::Chmod(0o600)).await.unwrap();

        assert_eq!(tree.log(), ["chmod 600 /f"]);
        assert_eq!(result, AggregateResult { directories: 0, entries: 1 });
    }

    #[tokio::test]
    async fn missing_root_fails() {
        let tree = FakeTree::new(&[]);
        let error = run(&tree, Path::new("/nope"), RecursiveOperation::Chmod(0o700)).await.unwrap_err();
        assert!(error.is(ErrorCode::NotFound));
    }
}
