// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;

use crate::adapter::Descriptor;
use crate::error::Result;
use crate::stream::{DescriptorIo, ReadableStream, WritableStream, WriteCompletion};

/// A file opened for both reading and writing.
///
/// The two sides are independent: the read side has its own cursor and pause state, the write
/// side its own queue with one write in flight. Closing waits for the write side to drain and
/// closes the shared descriptor once.
#[derive(Debug)]
pub struct DuplexStream<I: DescriptorIo> {
    reader: ReadableStream<I>,
    writer: WritableStream<I>,
}

impl<I: DescriptorIo> DuplexStream<I> {
    pub(crate) fn new(path: PathBuf, descriptor: Descriptor, io: I) -> Self {
        Self {
            reader: ReadableStream::new(path.clone(), descriptor, io.clone()),
            writer: WritableStream::new(path, descriptor, io),
        }
    }

    /// Returns the path the stream was opened with.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.writer.path()
    }

    /// Returns the underlying descriptor.
    #[must_use]
    pub const fn descriptor(&self) -> Descriptor {
        self.writer.descriptor()
    }

    /// Returns the read side.
    pub const fn reader(&mut self) -> &mut ReadableStream<I> {
        &mut self.reader
    }

    /// Returns the write side.
    #[must_use]
    pub const fn writer(&self) -> &WritableStream<I> {
        &self.writer
    }

    /// Reads the next chunk from the read side. See [`ReadableStream::read_chunk`].
    ///
    /// # Errors
    ///
    /// Returns the error of the failed read.
    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        self.reader.read_chunk().await
    }

    /// Queues a write on the write side. See [`WritableStream::write`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamClosing`](crate::Error::StreamClosing) after close or a failed write.
    pub fn write(&self, data: impl Into<Bytes>) -> Result<WriteCompletion> {
        self.writer.write(data)
    }

    /// Waits for queued writes, then closes the descriptor.
    ///
    /// # Errors
    ///
    /// Returns the error of the close request, or [`Error::StreamClosing`](crate::Error::StreamClosing)
    /// if the stream was already closing.
    pub async fn close(&mut self) -> Result<()> {
        self.reader.pause();
        self.writer.close().await
    }
}

impl<I: DescriptorIo> Stream for DuplexStream<I> {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().reader).poll_next(cx)
    }
}
