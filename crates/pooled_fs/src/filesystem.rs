// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::path::Path;

use tokio::runtime::Handle;

use crate::adapter::Adapter;
use crate::config::PoolConfig;
use crate::error::Result;
use crate::node::{Directory, File, Node};
use crate::process_adapter::ProcessAdapter;

/// The entry point: owns an adapter and hands out nodes that borrow it.
///
/// The adapter is chosen when the filesystem is built. [`Filesystem::start`] uses the worker
/// pool; [`Filesystem::from_adapter`] accepts any other [`Adapter`].
///
/// # Examples
///
/// ```no_run
/// use pooled_fs::{Filesystem, PoolConfig};
///
/// # async fn example() -> pooled_fs::Result<()> {
/// let fs = Filesystem::start(&tokio::runtime::Handle::current(), PoolConfig::from_env()?)?;
///
/// let scratch = fs.mkdtemp("/tmp/scratch-").await?;
/// scratch.file("hello.txt").put_contents("hello").await?;
/// scratch.remove_recursive().await?;
///
/// fs.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Filesystem<A = ProcessAdapter> {
    adapter: A,
}

impl Filesystem<ProcessAdapter> {
    /// Starts a worker pool on the given runtime and wraps it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`](crate::Error::InvalidArgument) if the configuration is
    /// invalid.
    pub fn start(handle: &Handle, config: PoolConfig) -> Result<Self> {
        ProcessAdapter::start(handle, config).map(Self::from_adapter)
    }

    /// Shuts the worker pool down. See [`Dispatcher::shutdown`](crate::Dispatcher::shutdown).
    pub async fn shutdown(&self) {
        self.adapter.shutdown().await;
    }
}

impl<A> Filesystem<A> {
    /// Wraps an adapter.
    #[must_use]
    pub const fn from_adapter(adapter: A) -> Self {
        Self { adapter }
    }

    /// Returns the adapter.
    #[must_use]
    pub const fn adapter(&self) -> &A {
        &self.adapter
    }

    /// Returns a handle for the directory at `path`. Nothing is checked until it is used.
    #[must_use]
    pub fn dir(&self, path: impl AsRef<Path>) -> Directory<'_, A> {
        Directory::new(path.as_ref(), &self.adapter)
    }

    /// Returns a handle for the file at `path`. Nothing is checked until it is used.
    #[must_use]
    pub fn file(&self, path: impl AsRef<Path>) -> File<'_, A> {
        File::new(path.as_ref(), &self.adapter)
    }
}

impl<A: Adapter> Filesystem<A> {
    /// Looks up what exists at `path`, without following a final symbolic link.
    ///
    /// # Errors
    ///
    /// Returns the error of the `lstat` call, such as [`ErrorCode::NotFound`](crate::ErrorCode::NotFound).
    pub async fn node(&self, path: impl AsRef<Path>) -> Result<Node<'_, A>> {
        let path = path.as_ref();
        let stat = self.adapter.lstat(path).await?;
        Ok(Node::from_kind(path, stat.kind, &self.adapter))
    }

    /// Creates a new directory whose name is `prefix` followed by six random characters.
    ///
    /// # Errors
    ///
    /// Returns the error of the `mkdtemp` call.
    pub async fn mkdtemp(&self, prefix: impl AsRef<Path>) -> Result<Directory<'_, A>> {
        let path = self.adapter.mkdtemp(prefix.as_ref()).await?;
        Ok(Directory::new(path, &self.adapter))
    }
}
