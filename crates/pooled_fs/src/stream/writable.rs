// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{Level, event};

use crate::adapter::Descriptor;
use crate::error::{Error, Result};
use crate::stream::DescriptorIo;

#[derive(Clone, Copy, Debug, Default)]
struct WriteState {
    queued_bytes: usize,
    pending: usize,
    closing: bool,
    failed: bool,
}

struct WriteJob {
    data: Bytes,
    done: oneshot::Sender<Result<u64>>,
}

/// Writes a file sequentially from the start.
///
/// [`write`](Self::write) queues the data and returns at once. A background drain task sends the
/// queued writes to the owning worker one at a time, each at the offset where the previous one
/// ended, so the file receives the writes in the order they were queued and never two at once.
///
/// A buffer larger than one request can carry is sent as consecutive pieces, and its
/// [`WriteCompletion`] settles once the last piece has landed or one has failed.
///
/// The stream does not refuse writes when the queue grows; callers that want to bound memory use
/// [`needs_drain`](Self::needs_drain) and [`drained`](Self::drained).
///
/// If a write fails, every write queued behind it fails with [`Error::StreamClosing`] and the
/// stream accepts no further writes.
pub struct WritableStream<I: DescriptorIo> {
    path: PathBuf,
    descriptor: Descriptor,
    io: I,
    jobs: mpsc::UnboundedSender<WriteJob>,
    state: Arc<watch::Sender<WriteState>>,
    high_water_mark: usize,
}

impl<I: DescriptorIo> WritableStream<I> {
    pub(crate) fn new(path: PathBuf, descriptor: Descriptor, io: I) -> Self {
        let (jobs, queue) = mpsc::unbounded_channel();
        let state = Arc::new(watch::Sender::new(WriteState::default()));

        io.spawn(Box::pin(drain(io.clone(), descriptor, queue, Arc::clone(&state))));

        Self {
            path,
            descriptor,
            high_water_mark: io.write_high_water_mark(),
            io,
            jobs,
            state,
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

    /// Queues `data` to be written after everything queued before it.
    ///
    /// The returned [`WriteCompletion`] resolves to the number of bytes written once the write has
    /// landed. It does not have to be awaited; the write happens either way.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamClosing`] if [`close`](Self::close) was called or an earlier write
    /// failed.
    pub fn write(&self, data: impl Into<Bytes>) -> Result<WriteCompletion> {
        let data = data.into();
        let len = data.len();

        let accepted = self.state.send_if_modified(|state| {
            if state.closing || state.failed {
                return false;
            }
            state.queued_bytes += len;
            state.pending += 1;
            true
        });

        if !accepted {
            return Err(Error::StreamClosing);
        }

        let (done, completion) = oneshot::channel();
        if self.jobs.send(WriteJob { data, done }).is_err() {
            // The drain task is gone, which only happens when the runtime shuts down.
            self.state.send_modify(|state| {
                state.queued_bytes -= len;
                state.pending -= 1;
                state.failed = true;
            });
            return Err(Error::StreamClosing);
        }

        Ok(WriteCompletion { completion })
    }

    /// Returns the number of bytes queued or in flight.
    #[must_use]
    pub fn queued_bytes(&self) -> usize {
        self.state.borrow().queued_bytes
    }

    /// Returns `true` if the queue has reached the high-water mark and the writer should wait for
    /// [`drained`](Self::drained) before writing more.
    #[must_use]
    pub fn needs_drain(&self) -> bool {
        self.queued_bytes() >= self.high_water_mark
    }

    /// Returns `true` if a write failed.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.state.borrow().failed
    }

    /// Waits until every queued write has settled.
    pub async fn drained(&self) {
        let mut state = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close while waiting.
        let _ = state.wait_for(|state| state.pending == 0).await;
    }

    /// Stops accepting writes, waits for queued writes to settle and closes the descriptor.
    ///
    /// # Errors
    ///
    /// Returns the error of the close request, or [`Error::StreamClosing`] if close was already
    /// requested.
    pub async fn close(&self) -> Result<()> {
        if !self.begin_close() {
            return Err(Error::StreamClosing);
        }
        self.drained().await;
        self.io.close_descriptor(self.descriptor).await
    }

    /// Marks the stream as closing. Returns `false` if it already was.
    pub(crate) fn begin_close(&self) -> bool {
        self.state.send_if_modified(|state| {
            if state.closing {
                return false;
            }
            state.closing = true;
            true
        })
    }
}

impl<I: DescriptorIo> fmt::Debug for WritableStream<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = *self.state.borrow();
        f.debug_struct("WritableStream")
            .field("path", &self.path)
            .field("descriptor", &self.descriptor)
            .field("queued_bytes", &state.queued_bytes)
            .field("pending", &state.pending)
            .field("closing", &state.closing)
            .field("failed", &state.failed)
            .finish_non_exhaustive()
    }
}

async fn drain<I: DescriptorIo>(
    io: I,
    descriptor: Descriptor,
    mut queue: mpsc::UnboundedReceiver<WriteJob>,
    state: Arc<watch::Sender<WriteState>>,
) {
    let mut position = 0_u64;
    let mut failed = false;
    let max_write_len = io.max_write_len().max(1);

    while let Some(WriteJob { data, done }) = queue.recv().await {
        let len = data.len();

        let result = if failed {
            Err(Error::StreamClosing)
        } else {
            match write_pieces(&io, descriptor, &mut position, data, max_write_len).await {
                Ok(written) => Ok(written),
                Err(e) => {
                    event!(Level::DEBUG, message = "stream write failed", worker = %descriptor.worker(), fd = descriptor.fd(), error = %e);
                    failed = true;
                    Err(e)
                }
            }
        };

        state.send_modify(|state| {
            state.queued_bytes -= len;
            state.pending -= 1;
            state.failed |= failed;
        });

        let _ = done.send(result);
    }
}

/// Writes `data` at `position` in pieces of at most `max_write_len` bytes, advancing `position`.
async fn write_pieces<I: DescriptorIo>(
    io: &I,
    descriptor: Descriptor,
    position: &mut u64,
    mut data: Bytes,
    max_write_len: usize,
) -> Result<u64> {
    let mut written = 0;
    loop {
        let piece = data.split_to(data.len().min(max_write_len));
        let landed = io.write_at(descriptor, *position, piece).await?;
        *position += landed;
        written += landed;
        if data.is_empty() {
            return Ok(written);
        }
    }
}

/// Resolves when a queued write has landed.
#[derive(Debug)]
pub struct WriteCompletion {
    completion: oneshot::Receiver<Result<u64>>,
}

impl Future for WriteCompletion {
    type Output = Result<u64>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().completion)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(Error::StreamClosing)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::stream::fake::FakeIo;
    use crate::worker::WorkerId;

    fn stream(io: &FakeIo) -> WritableStream<FakeIo> {
        WritableStream::new(PathBuf::from("f"), Descriptor::new(WorkerId::new(0), 1), io.clone())
    }

    #[tokio::test]
    async fn writes_land_in_order_one_at_a_time() {
        let io = FakeIo::new(b"", 4);
        let stream = stream(&io);

        let completions: Vec<_> = [&b"a"[..], &b"bb"[..], &b"ccc"[..], &b"d"[..]]
            .into_iter()
            .map(|chunk| stream.write(chunk).unwrap())
            .collect();

        let mut written = Vec::new();
        for completion in completions {
            written.push(completion.await.unwrap());
        }

        assert_eq!(written, [1, 2, 3, 1]);
        assert_eq!(io.contents(), b"abbcccd");
        assert_eq!(io.file.max_writes_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(stream.queued_bytes(), 0);
    }

    #[tokio::test]
    async fn backpressure_tracks_queued_bytes() {
        let io = FakeIo::new(b"", 4);
        let stream = stream(&io);
        assert!(!stream.needs_drain());

        let _ = stream.write(vec![1_u8; 5]).unwrap();
        let _ = stream.write(vec![2_u8; 5]).unwrap();
        assert_eq!(stream.queued_bytes(), 10);
        assert!(stream.needs_drain());

        stream.drained().await;
        assert_eq!(stream.queued_bytes(), 0);
        assert!(!stream.needs_drain());
        assert_eq!(io.contents().len(), 10);
    }

    #[tokio::test]
    async fn close_drains_then_closes_and_rejects_later_writes() {
        let io = FakeIo::new(b"", 4);
        let stream = stream(&io);

        let first = stream.write(&b"hello"[..]).unwrap();
        stream.close().await.unwrap();

        assert_eq!(first.await.unwrap(), 5);
        assert_eq!(io.contents(), b"hello");
        assert_eq!(io.file.closes.load(Ordering::SeqCst), 1);

        assert!(matches!(stream.write(&b"late"[..]), Err(Error::StreamClosing)));
        assert!(matches!(stream.close().await, Err(Error::StreamClosing)));
        assert_eq!(io.file.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn oversized_write_is_sent_in_consecutive_pieces() {
        let mut io = FakeIo::new(b"", 4);
        io.max_write_len = 3;
        let stream = stream(&io);

        let big = stream.write(&b"abcdefgh"[..]).unwrap();
        let after = stream.write(&b"ij"[..]).unwrap();

        assert_eq!(big.await.unwrap(), 8);
        assert_eq!(after.await.unwrap(), 2);
        assert_eq!(io.contents(), b"abcdefghij");
        assert_eq!(io.file.writes.load(Ordering::SeqCst), 4);
        assert_eq!(io.file.max_writes_in_flight.load(Ordering::SeqCst), 1);
        assert!(!stream.is_failed());
    }

    #[tokio::test]
    async fn failed_write_fails_everything_behind_it() {
        let io = FakeIo::new(b"", 4);
        *io.file.fail_writes_at.lock().unwrap() = Some(2);
        let stream = stream(&io);

        let first = stream.write(&b"ab"[..]).unwrap();
        let second = stream.write(&b"cd"[..]).unwrap();
        let third = stream.write(&b"ef"[..]).unwrap();

        assert_eq!(first.await.unwrap(), 2);
        assert!(matches!(second.await, Err(Error::Io { .. })));
        assert!(matches!(third.await, Err(Error::StreamClosing)));

        assert!(stream.is_failed());
        assert!(matches!(stream.write(&b"gh"[..]), Err(Error::StreamClosing)));
        assert_eq!(io.contents(), b"ab");
    }
}
