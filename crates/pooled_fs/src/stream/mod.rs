// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Streams over an open descriptor.
//!
//! A descriptor lives in one worker, so everything a stream does is a positional request to that
//! worker. Readable streams keep a read cursor and issue one chunk-sized read at a time. Writable
//! streams queue writes and hand them to a drain task that keeps exactly one write in flight, so
//! writes land in the order they were queued.

mod duplex;
mod readable;
mod writable;

use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures::future::BoxFuture;

pub use duplex::DuplexStream;
pub use readable::ReadableStream;
pub use writable::{WritableStream, WriteCompletion};

use crate::adapter::Descriptor;
use crate::config::{DEFAULT_READ_CHUNK_SIZE, DEFAULT_WRITE_HIGH_WATER_MARK};
use crate::error::{Error, Result};
use crate::open_options::OpenOptions;
use crate::protocol::MAX_WRITE_LEN;

/// Positional I/O on descriptors, as needed by streams.
///
/// Futures are boxed and `'static` because streams store them across polls and hand writes to a
/// background task.
pub trait DescriptorIo: Clone + Send + Sync + Unpin + 'static {
    /// Reads up to `len` bytes at `offset`.
    fn read_at(&self, descriptor: Descriptor, offset: u64, len: usize) -> BoxFuture<'static, Result<Bytes>>;

    /// Writes all of `data` at `offset`.
    fn write_at(&self, descriptor: Descriptor, offset: u64, data: Bytes) -> BoxFuture<'static, Result<u64>>;

    /// Closes the descriptor.
    fn close_descriptor(&self, descriptor: Descriptor) -> BoxFuture<'static, Result<()>>;

    /// Runs a background task, such as the write drain task of a stream.
    fn spawn(&self, task: BoxFuture<'static, ()>);

    /// Number of bytes each read of a readable stream asks for.
    fn read_chunk_size(&self) -> usize {
        DEFAULT_READ_CHUNK_SIZE
    }

    /// Queued bytes above which a writable stream asks writers to wait.
    fn write_high_water_mark(&self) -> usize {
        DEFAULT_WRITE_HIGH_WATER_MARK
    }

    /// Largest buffer a single [`write_at`](Self::write_at) accepts. Streams split larger writes.
    fn max_write_len(&self) -> usize {
        MAX_WRITE_LEN
    }
}

/// Builds the stream matching the access mode a descriptor was opened with.
#[derive(Debug)]
pub struct StreamFactory;

impl StreamFactory {
    /// Wraps an open descriptor in a stream.
    ///
    /// * read only: [`FileStream::Readable`]
    /// * write or append without read: [`FileStream::Writable`]
    /// * anything else: [`FileStream::Duplex`]
    pub fn create<I: DescriptorIo>(path: impl Into<PathBuf>, descriptor: Descriptor, options: &OpenOptions, io: I) -> FileStream<I> {
        let path = path.into();
        match (options.is_readable(), options.is_writable()) {
            (true, false) => FileStream::Readable(ReadableStream::new(path, descriptor, io)),
            (false, true) => FileStream::Writable(WritableStream::new(path, descriptor, io)),
            _ => FileStream::Duplex(DuplexStream::new(path, descriptor, io)),
        }
    }
}

/// A stream over an open file whose direction is only known at runtime.
///
/// Match on the variants to get the statically typed stream. The convenience methods on this
/// enum check the direction at runtime and fail with [`Error::InvalidArgument`] before anything
/// is sent to a worker.
#[derive(Debug)]
pub enum FileStream<I: DescriptorIo> {
    /// Opened for reading only.
    Readable(ReadableStream<I>),
    /// Opened for writing or appending only.
    Writable(WritableStream<I>),
    /// Opened for reading and writing.
    Duplex(DuplexStream<I>),
}

impl<I: DescriptorIo> FileStream<I> {
    /// Returns the path the stream was opened with.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Readable(s) => s.path(),
            Self::Writable(s) => s.path(),
            Self::Duplex(s) => s.path(),
        }
    }

    /// Returns the underlying descriptor.
    #[must_use]
    pub fn descriptor(&self) -> Descriptor {
        match self {
            Self::Readable(s) => s.descriptor(),
            Self::Writable(s) => s.descriptor(),
            Self::Duplex(s) => s.descriptor(),
        }
    }

    /// Reads the next chunk, or `None` at end-of-stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the stream is write-only, otherwise see
    /// [`ReadableStream::read_chunk`].
    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        match self {
            Self::Readable(s) => s.read_chunk().await,
            Self::Duplex(s) => s.read_chunk().await,
            Self::Writable(s) => Err(not_readable(s.path())),
        }
    }

    /// Queues a write.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the stream is read-only, otherwise see
    /// [`WritableStream::write`].
    pub fn write(&self, data: impl Into<Bytes>) -> Result<WriteCompletion> {
        match self {
            Self::Writable(s) => s.write(data),
            Self::Duplex(s) => s.write(data),
            Self::Readable(s) => Err(not_writable(s.path())),
        }
    }

    /// Waits for queued writes, then closes the descriptor.
    ///
    /// # Errors
    ///
    /// Returns the error of the close request, or [`Error::StreamClosing`] if the stream was
    /// already closed.
    pub async fn close(&mut self) -> Result<()> {
        match self {
            Self::Readable(s) => s.close().await,
            Self::Writable(s) => s.close().await,
            Self::Duplex(s) => s.close().await,
        }
    }

    /// Returns the readable stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] unless the stream was opened for reading only.
    pub fn into_readable(self) -> Result<ReadableStream<I>> {
        match self {
            Self::Readable(s) => Ok(s),
            other => Err(Error::InvalidArgument(format!(
                "{} is not opened for reading only",
                other.path().display()
            ))),
        }
    }

    /// Returns the writable stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] unless the stream was opened for writing only.
    pub fn into_writable(self) -> Result<WritableStream<I>> {
        match self {
            Self::Writable(s) => Ok(s),
            other => Err(Error::InvalidArgument(format!(
                "{} is not opened for writing only",
                other.path().display()
            ))),
        }
    }

    /// Returns the duplex stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] unless the stream was opened for reading and writing.
    pub fn into_duplex(self) -> Result<DuplexStream<I>> {
        match self {
            Self::Duplex(s) => Ok(s),
            other => Err(Error::InvalidArgument(format!(
                "{} is not opened for reading and writing",
                other.path().display()
            ))),
        }
    }
}

fn not_readable(path: &Path) -> Error {
    Error::InvalidArgument(format!("{} is not opened for reading", path.display()))
}

fn not_writable(path: &Path) -> Error {
    Error::InvalidArgument(format!("{} is not opened for writing", path.display()))
}

#[cfg(test)]
pub(crate) mod fake {
    //! An in-memory descriptor backend for stream tests.

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::error::ErrorCode;

    #[derive(Debug, Default)]
    pub(crate) struct FakeFile {
        pub(crate) contents: Mutex<Vec<u8>>,
        pub(crate) reads: AtomicUsize,
        pub(crate) writes: AtomicUsize,
        pub(crate) closes: AtomicUsize,
        pub(crate) writes_in_flight: AtomicUsize,
        pub(crate) max_writes_in_flight: AtomicUsize,
        pub(crate) fail_writes_at: Mutex<Option<u64>>,
    }

    #[derive(Clone, Debug)]
    pub(crate) struct FakeIo {
        pub(crate) file: Arc<FakeFile>,
        pub(crate) chunk_size: usize,
        pub(crate) high_water_mark: usize,
        pub(crate) max_write_len: usize,
    }

    impl FakeIo {
        pub(crate) fn new(contents: &[u8], chunk_size: usize) -> Self {
            let file = FakeFile::default();
            *file.contents.lock().unwrap() = contents.to_vec();
            Self {
                file: Arc::new(file),
                chunk_size,
                high_water_mark: 8,
                max_write_len: MAX_WRITE_LEN,
            }
        }

        pub(crate) fn contents(&self) -> Vec<u8> {
            self.file.contents.lock().unwrap().clone()
        }
    }

    impl DescriptorIo for FakeIo {
        fn read_at(&self, _descriptor: Descriptor, offset: u64, len: usize) -> BoxFuture<'static, Result<Bytes>> {
            let file = Arc::clone(&self.file);
            Box::pin(async move {
                tokio::task::yield_now().await;
                let _ = file.reads.fetch_add(1, Ordering::SeqCst);
                let contents = file.contents.lock().unwrap();
                let start = usize::try_from(offset).unwrap().min(contents.len());
                let end = (start + len).min(contents.len());
                Ok(Bytes::copy_from_slice(&contents[start..end]))
            })
        }

        fn write_at(&self, _descriptor: Descriptor, offset: u64, data: Bytes) -> BoxFuture<'static, Result<u64>> {
            let file = Arc::clone(&self.file);
            let max_write_len = self.max_write_len;
            Box::pin(async move {
                assert!(data.len() <= max_write_len, "write of {} bytes over the limit", data.len());
                let _ = file.writes.fetch_add(1, Ordering::SeqCst);
                let now = file.writes_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                let _ = file.max_writes_in_flight.fetch_max(now, Ordering::SeqCst);

                // Later writes finish faster, so reordering would show up in the contents.
                let delay = 5_u64.saturating_sub(offset.min(5));
                tokio::time::sleep(Duration::from_millis(delay)).await;

                let _ = file.writes_in_flight.fetch_sub(1, Ordering::SeqCst);

                if *file.fail_writes_at.lock().unwrap() == Some(offset) {
                    return Err(Error::Io {
                        code: ErrorCode::Other,
                        message: "disk on fire".to_string(),
                        native_code: Some(5),
                    });
                }

                let mut contents = file.contents.lock().unwrap();
                let start = usize::try_from(offset).unwrap();
                if contents.len() < start + data.len() {
                    contents.resize(start + data.len(), 0);
                }
                contents[start..start + data.len()].copy_from_slice(&data);
                Ok(data.len() as u64)
            })
        }

        fn close_descriptor(&self, _descriptor: Descriptor) -> BoxFuture<'static, Result<()>> {
            let file = Arc::clone(&self.file);
            Box::pin(async move {
                let _ = file.closes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }

        fn spawn(&self, task: BoxFuture<'static, ()>) {
            drop(tokio::spawn(task));
        }

        fn read_chunk_size(&self) -> usize {
            self.chunk_size
        }

        fn write_high_water_mark(&self) -> usize {
            self.high_water_mark
        }

        fn max_write_len(&self) -> usize {
            self.max_write_len
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeIo;
    use super::*;
    use crate::worker::WorkerId;

    fn descriptor() -> Descriptor {
        Descriptor::new(WorkerId::new(0), 1)
    }

    #[tokio::test]
    async fn factory_picks_stream_from_access_mode() {
        let io = FakeIo::new(b"", 4);

        let readable = StreamFactory::create("r", descriptor(), OpenOptions::new().read(true), io.clone());
        assert!(matches!(readable, FileStream::Readable(_)));

        let writable = StreamFactory::create("w", descriptor(), OpenOptions::new().write(true), io.clone());
        assert!(matches!(writable, FileStream::Writable(_)));

        let appending = StreamFactory::create("a", descriptor(), OpenOptions::new().append(true), io.clone());
        assert!(matches!(appending, FileStream::Writable(_)));

        let duplex = StreamFactory::create("d", descriptor(), OpenOptions::new().read(true).write(true), io);
        assert!(matches!(duplex, FileStream::Duplex(_)));
    }

    #[tokio::test]
    async fn wrong_direction_is_invalid_argument() {
        let io = FakeIo::new(b"abc", 4);

        let readable = StreamFactory::create("r", descriptor(), OpenOptions::new().read(true), io.clone());
        assert!(matches!(readable.write(&b"x"[..]), Err(Error::InvalidArgument(_))));

        let mut writable = StreamFactory::create("w", descriptor(), OpenOptions::new().write(true), io.clone());
        assert!(matches!(writable.read_chunk().await, Err(Error::InvalidArgument(_))));
        assert!(matches!(writable.into_readable(), Err(Error::InvalidArgument(_))));

        // Nothing reached the descriptor.
        assert_eq!(io.file.reads.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(io.contents(), b"abc");
    }
}
