// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};

use crate::adapter::Adapter;
use crate::error::{ErrorCode, Result};
use crate::open_options::OpenOptions;
use crate::protocol::Stat;
use crate::stream::{DescriptorIo, FileStream, StreamFactory};

/// A file at a fixed path.
///
/// Reading and writing go through streams: [`open`](Self::open) returns the stream matching the
/// access mode, and [`contents`](Self::contents) and [`put_contents`](Self::put_contents) are
/// shortcuts for whole-file transfers.
///
/// # Examples
///
/// ```no_run
/// # async fn example(fs: &pooled_fs::Filesystem) -> pooled_fs::Result<()> {
/// let config = fs.file("/tmp/app/config.toml");
/// config.put_contents("answer = 42\n").await?;
///
/// let text = config.contents().await?;
/// assert_eq!(&text[..], b"answer = 42\n");
/// # Ok(())
/// # }
/// ```
pub struct File<'a, A> {
    path: PathBuf,
    adapter: &'a A,
}

impl<'a, A> File<'a, A> {
    pub(crate) fn new(path: impl Into<PathBuf>, adapter: &'a A) -> Self {
        Self {
            path: path.into(),
            adapter,
        }
    }

    /// Returns the path of the file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<A: Adapter> File<'_, A> {
    /// Creates an empty file, truncating it if it exists.
    ///
    /// # Errors
    ///
    /// Returns the error of the open or close request.
    pub async fn create(&self) -> Result<()> {
        let descriptor = self
            .adapter
            .open(&self.path, OpenOptions::new().write(true).create(true).truncate(true))
            .await?;
        self.adapter.close(descriptor).await
    }

    /// Returns whether something exists at the path, following symbolic links.
    ///
    /// # Errors
    ///
    /// Returns failures other than [`ErrorCode::NotFound`].
    pub async fn exists(&self) -> Result<bool> {
        match self.adapter.stat(&self.path).await {
            Ok(_) => Ok(true),
            Err(e) if e.is(ErrorCode::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Returns the size of the file in bytes.
    ///
    /// # Errors
    ///
    /// Returns the error of the `stat` call.
    pub async fn size(&self) -> Result<u64> {
        Ok(self.stat().await?.size)
    }

    /// Returns the metadata of the file, following symbolic links.
    ///
    /// # Errors
    ///
    /// Returns the error of the `stat` call.
    pub async fn stat(&self) -> Result<Stat> {
        self.adapter.stat(&self.path).await
    }

    /// Creates the file if it is missing and sets its access and modification times to now.
    ///
    /// # Errors
    ///
    /// Returns the error of the `touch` call.
    pub async fn touch(&self) -> Result<()> {
        self.adapter.touch(&self.path).await
    }

    /// Removes the file.
    ///
    /// # Errors
    ///
    /// Returns the error of the `unlink` call.
    pub async fn remove(&self) -> Result<()> {
        self.adapter.unlink(&self.path).await
    }

    /// Moves the file and returns a handle for the new location.
    ///
    /// # Errors
    ///
    /// Returns the error of the rename.
    pub async fn rename(&self, to: impl AsRef<Path>) -> Result<Self> {
        let to = to.as_ref();
        self.adapter.rename(&self.path, to).await?;
        Ok(Self::new(to, self.adapter))
    }

    /// Sets the permission bits.
    ///
    /// # Errors
    ///
    /// Returns the error of the `chmod` call.
    pub async fn chmod(&self, mode: u32) -> Result<()> {
        self.adapter.chmod(&self.path, mode).await
    }

    /// Sets the owner and/or group. `None` leaves that id unchanged.
    ///
    /// # Errors
    ///
    /// Returns the error of the `chown` call.
    pub async fn chown(&self, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        self.adapter.chown(&self.path, uid, gid).await
    }
}

impl<A: Adapter + DescriptorIo> File<'_, A> {
    /// Opens the file and returns the stream matching the access mode in `options`.
    ///
    /// # Errors
    ///
    /// Returns the error of the open request.
    pub async fn open(&self, options: &OpenOptions) -> Result<FileStream<A>> {
        let descriptor = self.adapter.open(&self.path, options).await?;
        Ok(StreamFactory::create(&self.path, descriptor, options, self.adapter.clone()))
    }

    /// Reads the whole file.
    ///
    /// # Errors
    ///
    /// Returns the error of the open, of a read or of the close.
    pub async fn contents(&self) -> Result<Bytes> {
        let mut stream = self.open(OpenOptions::new().read(true)).await?;
        let mut contents = BytesMut::new();

        let read = loop {
            match stream.read_chunk().await {
                Ok(Some(chunk)) => contents.extend_from_slice(&chunk),
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        let closed = stream.close().await;
        read?;
        closed?;
        Ok(contents.freeze())
    }

    /// Replaces the contents of the file, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns the error of the open, of the write or of the close.
    pub async fn put_contents(&self, data: impl Into<Bytes>) -> Result<()> {
        let mut stream = self.open(OpenOptions::new().write(true).create(true).truncate(true)).await?;

        let written = match stream.write(data) {
            Ok(completion) => completion.await.map(|_| ()),
            Err(e) => Err(e),
        };

        let closed = stream.close().await;
        written?;
        closed
    }
}

impl<A> Clone for File<'_, A> {
    fn clone(&self) -> Self {
        Self::new(self.path.clone(), self.adapter)
    }
}

impl<A> fmt::Debug for File<'_, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("File").field("path", &self.path).finish_non_exhaustive()
    }
}
