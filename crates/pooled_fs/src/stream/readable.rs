// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{Stream, StreamExt as _};

use crate::adapter::Descriptor;
use crate::error::{Error, Result};
use crate::stream::DescriptorIo;

/// Reads a file chunk by chunk.
///
/// Each read asks the owning worker for [`read_chunk_size`](DescriptorIo::read_chunk_size) bytes
/// at the current position. A read that returns fewer bytes than requested (including none)
/// marks the end of the stream, after which no further reads are issued. Reaching the end does
/// not close the descriptor; call [`close`](Self::close) for that.
///
/// The stream implements [`futures::Stream`], yielding `Result<Bytes>` items.
pub struct ReadableStream<I: DescriptorIo> {
    path: PathBuf,
    descriptor: Descriptor,
    io: I,
    chunk_size: usize,
    position: u64,
    in_flight: Option<BoxFuture<'static, Result<Bytes>>>,
    buffered: Option<Result<Bytes>>,
    paused: bool,
    ended: bool,
    closed: bool,
    waker: Option<Waker>,
}

impl<I: DescriptorIo> ReadableStream<I> {
    pub(crate) fn new(path: PathBuf, descriptor: Descriptor, io: I) -> Self {
        let chunk_size = io.read_chunk_size().max(1);
        Self {
            path,
            descriptor,
            io,
            chunk_size,
            position: 0,
            in_flight: None,
            buffered: None,
            paused: false,
            ended: false,
            closed: false,
            waker: None,
        }
    }

    /// Returns the path the stream was opened with.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the underlying descriptor.
    #[must_use]
    pub const fn descriptor(&self) -> Descriptor {
        self.descriptor
    }

    /// Returns the offset of the next read.
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.position
    }

    /// Returns `true` once the end of the file was reached or a read failed.
    #[must_use]
    pub const fn is_ended(&self) -> bool {
        self.ended && self.buffered.is_none()
    }

    /// Returns `true` while the stream is paused.
    #[must_use]
    pub const fn is_paused(&self) -> bool {
        self.paused
    }

    /// Stops issuing reads. A read already in flight completes and its data is held back until
    /// the stream is resumed.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Resumes reading and wakes a consumer waiting on the stream.
    pub fn resume(&mut self) {
        self.paused = false;
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }

    /// Reads the next chunk, resuming the stream if it was paused.
    ///
    /// Returns `None` at the end of the stream.
    ///
    /// # Errors
    ///
    /// Returns the error of the failed read; the stream then ends.
    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        self.resume();
        self.next().await.transpose()
    }

    /// Closes the descriptor. Reads already in flight are abandoned.
    ///
    /// # Errors
    ///
    /// Returns the error of the close request, or [`Error::StreamClosing`] if the stream was
    /// already closed.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::StreamClosing);
        }
        self.closed = true;
        self.ended = true;
        self.in_flight = None;
        self.buffered = None;
        self.io.close_descriptor(self.descriptor).await
    }

    /// Accounts for a completed read and turns it into the next stream item.
    fn settle(&mut self, result: Result<Bytes>) -> Option<Result<Bytes>> {
        match result {
            Ok(chunk) => {
                self.position += chunk.len() as u64;
                if chunk.len() < self.chunk_size {
                    self.ended = true;
                }
                if chunk.is_empty() { None } else { Some(Ok(chunk)) }
            }
            Err(e) => {
                self.ended = true;
                Some(Err(e))
            }
        }
    }
}

impl<I: DescriptorIo> Stream for ReadableStream<I> {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if this.paused {
            // Let a read that is already running finish, but hold its data back.
            if let Some(read) = this.in_flight.as_mut()
                && let Poll::Ready(result) = read.as_mut().poll(cx)
            {
                this.in_flight = None;
                this.buffered = Some(result);
            }
            this.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        if let Some(result) = this.buffered.take() {
            return Poll::Ready(this.settle(result));
        }

        if this.ended || this.closed {
            return Poll::Ready(None);
        }

        let read = this.in_flight.get_or_insert_with(|| {
            this.io.read_at(this.descriptor, this.position, this.chunk_size)
        });

        match read.as_mut().poll(cx) {
            Poll::Ready(result) => {
                this.in_flight = None;
                Poll::Ready(this.settle(result))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<I: DescriptorIo> fmt::Debug for ReadableStream<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadableStream")
            .field("path", &self.path)
            .field("descriptor", &self.descriptor)
            .field("position", &self.position)
            .field("paused", &self.paused)
            .field("ended", &self.ended)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use futures::StreamExt as _;

    use super::*;
    use crate::stream::fake::FakeIo;
    use crate::worker::WorkerId;

    fn stream(io: &FakeIo) -> ReadableStream<FakeIo> {
        ReadableStream::new(PathBuf::from("f"), Descriptor::new(WorkerId::new(0), 1), io.clone())
    }

    #[tokio::test]
    async fn short_read_ends_the_stream() {
        let data: Vec<u8> = testing_aids::repeating_incrementing_bytes().take(10).collect();
        let io = FakeIo::new(&data, 4);
        let mut stream = stream(&io);

        let chunks: Vec<Bytes> = stream.by_ref().map(|chunk| chunk.unwrap()).collect().await;
        let lengths: Vec<_> = chunks.iter().map(Bytes::len).collect();
        assert_eq!(lengths, [4, 4, 2]);
        assert_eq!(chunks.concat(), data);

        // The short read at offset 8 ended the stream; no probe at offset 10 was needed.
        assert_eq!(io.file.reads.load(Ordering::SeqCst), 3);
        assert!(stream.is_ended());
        assert_eq!(stream.position(), 10);
        assert_eq!(io.file.closes.load(Ordering::SeqCst), 0, "end of stream does not close");
    }

    #[tokio::test]
    async fn exact_multiple_ends_with_empty_read() {
        let io = FakeIo::new(b"abcdefgh", 4);
        let mut stream = stream(&io);

        assert_eq!(stream.read_chunk().await.unwrap().unwrap(), &b"abcd"[..]);
        assert_eq!(stream.read_chunk().await.unwrap().unwrap(), &b"efgh"[..]);
        assert_eq!(stream.read_chunk().await.unwrap(), None);
        assert_eq!(stream.read_chunk().await.unwrap(), None);
        assert_eq!(io.file.reads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn paused_stream_holds_data_until_resumed() {
        let io = FakeIo::new(b"abcdef", 4);
        let mut stream = stream(&io);

        // Start a read, then pause while it is in flight.
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(Pin::new(&mut stream).poll_next(&mut cx).is_pending());
        stream.pause();

        // Give the read time to complete; the stream still yields nothing.
        tokio::task::yield_now().await;
        assert!(Pin::new(&mut stream).poll_next(&mut cx).is_pending());
        assert!(stream.is_paused());

        stream.resume();
        assert_eq!(stream.next().await.unwrap().unwrap(), &b"abcd"[..]);
        assert_eq!(stream.next().await.unwrap().unwrap(), &b"ef"[..]);
        assert!(stream.next().await.is_none());
        assert_eq!(io.file.reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn close_closes_once() {
        let io = FakeIo::new(b"abc", 4);
        let mut stream = stream(&io);

        stream.close().await.unwrap();
        assert!(matches!(stream.close().await, Err(Error::StreamClosing)));
        assert!(stream.next().await.is_none());
        assert_eq!(io.file.closes.load(Ordering::SeqCst), 1);
    }
}
