// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Control-side handle for one worker process.
//!
//! A [`WorkerLink`] owns the child process through two tasks. The writer task drains a channel
//! of encoded frames into the child's stdin and closes the pipe once the channel is dropped.
//! The supervisor task reads stdout, decodes frames and forwards them as [`WorkerEvent`]s, then
//! reaps the child and reports a single [`WorkerEvent::Exited`]. Neither task makes decisions;
//! the pool does.

mod state;

use std::fmt;
use std::io;
use std::path::Path;
use std::process::Stdio;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{Level, event};

pub use state::{IllegalTransition, Transition, WorkerState};

use crate::error::{Error, Result};
use crate::protocol::{Frame, FrameDecoder};

/// Identifies a worker within one pool. Identifiers are never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(u64);

impl WorkerId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw identifier.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Something that happened on a worker connection.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Frame { worker: WorkerId, frame: Frame },
    Exited { worker: WorkerId, reason: ExitReason },
}

/// Why a worker connection ended.
#[derive(Debug)]
pub(crate) enum ExitReason {
    /// The worker closed its stdout after a complete frame.
    Eof,
    /// The worker sent bytes that do not decode as a frame, or stopped mid-frame.
    Violation(Error),
    /// Reading stdout failed.
    ReadFailed(io::Error),
    /// The control process killed the worker.
    Killed,
}

impl ExitReason {
    pub(crate) fn into_violation(self) -> Option<Error> {
        match self {
            Self::Violation(error) => Some(error),
            _ => None,
        }
    }
}

/// The control process's end of one worker.
#[derive(Debug)]
pub(crate) struct WorkerLink {
    id: WorkerId,
    pid: Option<u32>,
    stdin: Option<mpsc::UnboundedSender<Bytes>>,
    kill: Option<oneshot::Sender<()>>,
}

impl WorkerLink {
    /// Starts the worker executable with piped stdin and stdout.
    ///
    /// The worker inherits stderr so that its logs end up next to the caller's.
    pub(crate) fn spawn(id: WorkerId, executable: &Path, handle: &Handle, events: mpsc::UnboundedSender<WorkerEvent>) -> io::Result<Self> {
        // Command::spawn registers the child with the runtime it is called from.
        let _guard = handle.enter();

        let mut child = Command::new(executable)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().ok_or_else(|| io::Error::other("worker stdin was not captured"))?;
        let stdout = child.stdout.take().ok_or_else(|| io::Error::other("worker stdout was not captured"))?;
        let pid = child.id();

        event!(Level::DEBUG, message = "worker spawned", worker = %id, pid = ?pid);

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();

        drop(handle.spawn(write_frames(id, stdin, frames_rx)));
        drop(handle.spawn(supervise(id, child, stdout, kill_rx, events)));

        Ok(Self {
            id,
            pid,
            stdin: Some(frames_tx),
            kill: Some(kill_tx),
        })
    }

    pub(crate) const fn id(&self) -> WorkerId {
        self.id
    }

    pub(crate) const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Encodes a frame and queues it for the child's stdin.
    ///
    /// A closed pipe is not reported here; the supervisor notices the exit and reports it.
    pub(crate) fn send(&self, frame: &Frame) -> Result<()> {
        let bytes = frame.to_bytes()?;
        if let Some(stdin) = &self.stdin
            && stdin.send(bytes).is_err()
        {
            event!(Level::DEBUG, message = "worker stdin already closed", worker = %self.id);
        }
        Ok(())
    }

    /// Closes the child's stdin once every queued frame is written. A well-behaved worker exits.
    pub(crate) fn close_stdin(&mut self) {
        self.stdin = None;
    }

    /// Kills the child immediately.
    pub(crate) fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }

    /// Hands out the kill switch so that it can be fired later, for example after a grace period.
    pub(crate) fn take_kill_switch(&mut self) -> Option<oneshot::Sender<()>> {
        self.kill.take()
    }
}

async fn write_frames(id: WorkerId, mut stdin: ChildStdin, mut frames: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(bytes) = frames.recv().await {
        let written = async {
            stdin.write_all(&bytes).await?;
            stdin.flush().await
        }
        .await;

        if let Err(e) = written {
            event!(Level::DEBUG, message = "cannot write to worker", worker = %id, error = %e);
            return;
        }
    }

    event!(Level::TRACE, message = "worker stdin closed", worker = %id);
}

async fn supervise(
    id: WorkerId,
    mut child: Child,
    mut stdout: ChildStdout,
    mut kill: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let mut decoder = FrameDecoder::new();

    let reason = 'read: loop {
        tokio::select! {
            _ = &mut kill => break 'read ExitReason::Killed,
            read = stdout.read_buf(decoder.buffer_mut()) => match read {
                Ok(0) if decoder.is_empty() => break 'read ExitReason::Eof,
                Ok(0) => break 'read ExitReason::Violation(Error::Protocol("worker output ended mid-frame".to_string())),
                Ok(_) => loop {
                    match decoder.decode() {
                        Ok(Some(frame)) => {
                            if events.send(WorkerEvent::Frame { worker: id, frame }).is_err() {
                                // Nobody is listening anymore.
                                break 'read ExitReason::Killed;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => break 'read ExitReason::Violation(e),
                    }
                },
                Err(e) => break 'read ExitReason::ReadFailed(e),
            },
        }
    };

    let status = if matches!(reason, ExitReason::Eof) {
        tokio::select! {
            status = child.wait() => status,
            _ = &mut kill => {
                let _ = child.start_kill();
                child.wait().await
            }
        }
    } else {
        let _ = child.start_kill();
        child.wait().await
    };

    match &status {
        Ok(status) => event!(Level::DEBUG, message = "worker exited", worker = %id, status = %status, reason = ?reason),
        Err(e) => event!(Level::WARN, message = "cannot reap worker", worker = %id, error = %e),
    }

    let _ = events.send(WorkerEvent::Exited { worker: id, reason });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_id_display() {
        assert_eq!(WorkerId::new(3).to_string(), "w3");
        assert_eq!(WorkerId::new(3).get(), 3);
    }

    #[test]
    fn only_violations_carry_an_error() {
        assert!(ExitReason::Eof.into_violation().is_none());
        assert!(ExitReason::Killed.into_violation().is_none());
        assert!(matches!(
            ExitReason::Violation(Error::Protocol("bad".to_string())).into_violation(),
            Some(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn missing_executable_fails_to_spawn() {
        let (events, _rx) = mpsc::unbounded_channel();
        let error = WorkerLink::spawn(
            WorkerId::new(0),
            Path::new("/nonexistent/pooled_fs_worker"),
            &Handle::current(),
            events,
        )
        .unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::NotFound);
    }
}
