// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::error::Result;
use crate::open_options::OpenOptions;
use crate::protocol::{DirEntry, Stat};
use crate::worker::WorkerId;

/// An open file living inside one worker process.
///
/// Descriptors are only meaningful to the worker that opened them, so every operation on a
/// descriptor is routed to that worker. If the worker dies, the descriptor is lost and further
/// operations fail with [`Error::WorkerCrashed`](crate::Error::WorkerCrashed).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Descriptor {
    worker: WorkerId,
    fd: u64,
}

impl Descriptor {
    /// Creates a descriptor handle for a file opened by `worker`.
    #[must_use]
    pub const fn new(worker: WorkerId, fd: u64) -> Self {
        Self { worker, fd }
    }

    /// Returns the worker that owns the descriptor.
    #[must_use]
    pub const fn worker(self) -> WorkerId {
        self.worker
    }

    /// Returns the descriptor number, local to its worker.
    #[must_use]
    pub const fn fd(self) -> u64 {
        self.fd
    }
}

/// The complete set of asynchronous filesystem operations.
///
/// Every backend implements this trait and the node model ([`Directory`](crate::Directory),
/// [`File`](crate::File)) and the recursive engine are written against it, so the backend is
/// chosen once, when the [`Filesystem`](crate::Filesystem) is built. [`ProcessAdapter`](crate::ProcessAdapter)
/// is the implementation backed by a worker pool.
///
/// Failures of the native call are reported as [`Error::Io`](crate::Error::Io) with the portable
/// error code.
pub trait Adapter: Send + Sync {
    /// Opens a file.
    fn open(&self, path: &Path, options: &OpenOptions) -> impl Future<Output = Result<Descriptor>> + Send;

    /// Closes a descriptor.
    fn close(&self, descriptor: Descriptor) -> impl Future<Output = Result<()>> + Send;

    /// Reads up to `len` bytes at `offset`. Fewer bytes are returned only at end-of-file.
    fn read(&self, descriptor: Descriptor, offset: u64, len: usize) -> impl Future<Output = Result<Bytes>> + Send;

    /// Writes all of `data` at `offset` and returns the number of bytes written.
    fn write(&self, descriptor: Descriptor, offset: u64, data: Bytes) -> impl Future<Output = Result<u64>> + Send;

    /// Creates a directory with the given permission bits.
    fn mkdir(&self, path: &Path, mode: u32) -> impl Future<Output = Result<()>> + Send;

    /// Removes an empty directory.
    fn rmdir(&self, path: &Path) -> impl Future<Output = Result<()>> + Send;

    /// Removes a file or symbolic link.
    fn unlink(&self, path: &Path) -> impl Future<Output = Result<()>> + Send;

    /// Renames a file or directory, replacing the target if the platform allows it.
    fn rename(&self, from: &Path, to: &Path) -> impl Future<Output = Result<()>> + Send;

    /// Returns metadata, following symbolic links.
    fn stat(&self, path: &Path) -> impl Future<Output = Result<Stat>> + Send;

    /// Returns metadata of the entry itself, without following symbolic links.
    fn lstat(&self, path: &Path) -> impl Future<Output = Result<Stat>> + Send;

    /// Changes permission bits, following symbolic links.
    fn chmod(&self, path: &Path, mode: u32) -> impl Future<Output = Result<()>> + Send;

    /// Changes the owner and/or group, following symbolic links. `None` leaves the value unchanged.
    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> impl Future<Output = Result<()>> + Send;

    /// Creates an empty file if missing and sets its access and modification times to now.
    fn touch(&self, path: &Path) -> impl Future<Output = Result<()>> + Send;

    /// Creates a symbolic link at `link` pointing to `target`.
    fn symlink(&self, target: &Path, link: &Path) -> impl Future<Output = Result<()>> + Send;

    /// Returns the target of a symbolic link.
    fn readlink(&self, path: &Path) -> impl Future<Output = Result<PathBuf>> + Send;

    /// Creates a hard link at `link` for `original`.
    fn link(&self, original: &Path, link: &Path) -> impl Future<Output = Result<()>> + Send;

    /// Creates a uniquely named directory whose path starts with `prefix` and returns its path.
    fn mkdtemp(&self, prefix: &Path) -> impl Future<Output = Result<PathBuf>> + Send;

    /// Lists a directory, sorted by name, without `.` and `..`.
    fn list_directory(&self, path: &Path) -> impl Future<Output = Result<Vec<DirEntry>>> + Send;
}
