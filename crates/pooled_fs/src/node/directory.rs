// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::{BTreeMap, VecDeque};
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

use futures::stream::{FuturesUnordered, TryStreamExt as _};

use crate::adapter::Adapter;
use crate::error::{Error, ErrorCode, Result};
use crate::node::{File, Node};
use crate::protocol::{EntryKind, Stat};
use crate::recursive::{self, AggregateResult, RecursiveOperation};

const DEFAULT_DIRECTORY_MODE: u32 = 0o777;

/// A directory at a fixed path.
///
/// The handle borrows the adapter it was created from and does not check that the directory
/// exists; every method reports the filesystem's answer at the time it is awaited.
///
/// # Examples
///
/// ```no_run
/// # async fn example(fs: &pooled_fs::Filesystem) -> pooled_fs::Result<()> {
/// let logs = fs.dir("/tmp/app/logs");
/// logs.create_recursive().await?;
///
/// for (name, node) in logs.list().await? {
///     println!("{}: directory = {}", name.display(), node.is_dir());
/// }
/// # Ok(())
/// # }
/// ```
pub struct Directory<'a, A> {
    path: PathBuf,
    adapter: &'a A,
}

/// Recursive totals returned by [`Directory::size`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DirectorySize {
    /// Directories below the measured one, not counting itself.
    pub directories: u64,
    /// Non-directory entries.
    pub files: u64,
    /// Sum of the sizes of the non-directory entries, symbolic links not followed.
    pub bytes: u64,
}

impl<'a, A> Directory<'a, A> {
    pub(crate) fn new(path: impl Into<PathBuf>, adapter: &'a A) -> Self {
        Self {
            path: path.into(),
            adapter,
        }
    }

    /// Returns the path of the directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns a handle for the subdirectory `name`.
    #[must_use]
    pub fn dir(&self, name: impl AsRef<Path>) -> Self {
        Self::new(self.path.join(name), self.adapter)
    }

    /// Returns a handle for the file `name` inside this directory.
    #[must_use]
    pub fn file(&self, name: impl AsRef<Path>) -> File<'a, A> {
        File::new(self.path.join(name), self.adapter)
    }
}

impl<'a, A: Adapter> Directory<'a, A> {
    /// Lists the entries of the directory, keyed by name.
    ///
    /// # Errors
    ///
    /// Returns the error of the listing, for example when the directory does not exist.
    pub async fn list(&self) -> Result<BTreeMap<OsString, Node<'a, A>>> {
        let entries = self.adapter.list_directory(&self.path).await?;
        Ok(entries
            .into_iter()
            .map(|entry| {
                let node = Node::from_kind(self.path.join(&entry.name), entry.kind, self.adapter);
                (entry.name, node)
            })
            .collect())
    }

    /// Lists every node below the directory, parents before their children.
    ///
    /// # Errors
    ///
    /// Returns the first listing that fails; nothing is returned in that case.
    pub async fn list_recursive(&self) -> Result<Vec<Node<'a, A>>> {
        let mut found = Vec::new();
        let mut pending = VecDeque::from([self.path.clone()]);

        while let Some(path) = pending.pop_front() {
            for entry in self.adapter.list_directory(&path).await? {
                let child = path.join(&entry.name);
                if entry.kind == EntryKind::Directory {
                    pending.push_back(child.clone());
                }
                found.push(Node::from_kind(child, entry.kind, self.adapter));
            }
        }

        Ok(found)
    }

    /// Creates the directory. Its parent must exist.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorCode::AlreadyExists`] if the path exists and with
    /// [`ErrorCode::NotFound`] if the parent does not.
    pub async fn create(&self) -> Result<()> {
        self.adapter.mkdir(&self.path, DEFAULT_DIRECTORY_MODE).await
    }

    /// Creates the directory together with any missing ancestors.
    ///
    /// Succeeds without changes if the directory already exists.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorCode::NotADirectory`] if the path or one of its ancestors exists but is
    /// not a directory, or with the error of the failing `mkdir`.
    pub async fn create_recursive(&self) -> Result<()> {
        let mut missing = Vec::new();
        let mut current = self.path.as_path();

        loop {
            match self.adapter.stat(current).await {
                Ok(stat) if stat.is_dir() => break,
                Ok(_) => {
                    return Err(Error::io(
                        ErrorCode::NotADirectory,
                        format!("{} exists and is not a directory", current.display()),
                    ));
                }
                Err(e) if e.is(ErrorCode::NotFound) => {
                    missing.push(current);
                    match current.parent() {
                        Some(parent) if !parent.as_os_str().is_empty() => current = parent,
                        _ => break,
                    }
                }
                Err(e) => return Err(e),
            }
        }

        for path in missing.into_iter().rev() {
            match self.adapter.mkdir(path, DEFAULT_DIRECTORY_MODE).await {
                // Someone else created it in the meantime.
                Err(e) if e.is(ErrorCode::AlreadyExists) => {}
                other => other?,
            }
        }

        Ok(())
    }

    /// Removes the directory, which must be empty.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorCode::DirectoryNotEmpty`] if it is not empty.
    pub async fn remove(&self) -> Result<()> {
        self.adapter.rmdir(&self.path).await
    }

    /// Moves the directory and returns a handle for the new location.
    ///
    /// # Errors
    ///
    /// Returns the error of the rename.
    pub async fn rename(&self, to: impl AsRef<Path>) -> Result<Self> {
        let to = to.as_ref();
        self.adapter.rename(&self.path, to).await?;
        Ok(Self::new(to, self.adapter))
    }

    /// Returns the metadata of the directory.
    ///
    /// # Errors
    ///
    /// Returns the error of the `stat` call.
    pub async fn stat(&self) -> Result<Stat> {
        self.adapter.stat(&self.path).await
    }

    /// Sets the permission bits of the directory and everything below it.
    ///
    /// # Errors
    ///
    /// Returns the first failure; the nodes that could be changed keep their new mode.
    pub async fn chmod_recursive(&self, mode: u32) -> Result<AggregateResult> {
        recursive::run(self.adapter, &self.path, RecursiveOperation::Chmod(mode)).await
    }

    /// Sets the owner and/or group of the directory and everything below it.
    ///
    /// # Errors
    ///
    /// Returns the first failure; the nodes that could be changed keep their new owner.
    pub async fn chown_recursive(&self, uid: Option<u32>, gid: Option<u32>) -> Result<AggregateResult> {
        recursive::run(self.adapter, &self.path, RecursiveOperation::Chown { uid, gid }).await
    }

    /// Removes the directory and everything below it.
    ///
    /// # Errors
    ///
    /// Returns the first failure. Everything that could be removed is gone; the ancestors of
    /// what could not be removed remain.
    pub async fn remove_recursive(&self) -> Result<AggregateResult> {
        recursive::run(self.adapter, &self.path, RecursiveOperation::Remove).await
    }

    /// Adds up the entries below the directory.
    ///
    /// # Errors
    ///
    /// Returns the first listing or `lstat` that fails.
    pub async fn size(&self) -> Result<DirectorySize> {
        let mut size = DirectorySize::default();
        let mut pending = VecDeque::from([self.path.clone()]);

        while let Some(path) = pending.pop_front() {
            let mut leaves = Vec::new();
            for entry in self.adapter.list_directory(&path).await? {
                let child = path.join(&entry.name);
                if entry.kind == EntryKind::Directory {
                    size.directories += 1;
                    pending.push_back(child);
                } else {
                    leaves.push(child);
                }
            }

            let stats: Vec<Stat> = leaves
                .iter()
                .map(|leaf| self.adapter.lstat(leaf))
                .collect::<FuturesUnordered<_>>()
                .try_collect()
                .await?;

            size.files += stats.len() as u64;
            size.bytes += stats.iter().map(|stat| stat.size).sum::<u64>();
        }

        Ok(size)
    }
}

impl<A> Clone for Directory<'_, A> {
    fn clone(&self) -> Self {
        Self::new(self.path.clone(), self.adapter)
    }
}

impl<A> fmt::Debug for Directory<'_, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Directory").field("path", &self.path).finish_non_exhaustive()
    }
}
