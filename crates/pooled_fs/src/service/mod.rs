// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The worker side of the protocol.
//!
//! A worker announces itself with a ready frame, then executes request frames from its input
//! one at a time, in arrival order, writing each response before reading further.

mod ops;

use std::io::{ErrorKind, Read, Write};

use bytes::BytesMut;
use tracing::{Level, event};

use crate::error::{Error, Result};
use crate::protocol::{ErrorDescriptor, Frame, FrameDecoder};

use self::ops::Executor;

const READ_BUFFER_LEN: usize = 64 * 1024;

/// Serves requests from `input` until it reaches end-of-stream.
///
/// This is the body of the `pooled_fs_worker` executable, which calls it with its standard
/// input and output. It is public so that embedders can build their own worker executable,
/// for example to install a different logging setup.
///
/// # Errors
///
/// Returns [`Error::Protocol`] if the input is not a sequence of well-formed request frames or
/// ends in the middle of a frame, and [`Error::Io`] if reading the input or writing the output
/// fails. Failures of the requested operations are not errors here; they are reported to the
/// caller in the response frame.
pub fn serve(mut input: impl Read, mut output: impl Write) -> Result<()> {
    let mut executor = Executor::new();
    let mut decoder = FrameDecoder::new();
    let mut chunk = vec![0_u8; READ_BUFFER_LEN];

    write_frame(&mut output, &Frame::Ready { pid: std::process::id() })?;
    event!(Level::DEBUG, message = "worker ready", pid = std::process::id());

    loop {
        while let Some(frame) = decoder.decode()? {
            let (id, operation, args) = match frame {
                Frame::Request { id, operation, args } => (id, operation, args),
                other => return Err(Error::Protocol(format!("worker received a frame it cannot serve: {other:?}"))),
            };

            let outcome = executor.execute(operation, &args);
            match &outcome {
                Ok(_) => event!(Level::TRACE, message = "request served", request = %id, operation = %operation),
                Err(e) => event!(Level::DEBUG, message = "request failed", request = %id, operation = %operation, code = ?e.code, error = %e.message),
            }

            write_frame(&mut output, &Frame::Response { id, outcome })?;
        }

        let read = match input.read(&mut chunk) {
            Ok(read) => read,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(ErrorDescriptor::from_io(&e).into()),
        };

        if read == 0 {
            event!(
                Level::DEBUG,
                message = "worker input closed",
                open_descriptors = executor.open_descriptors()
            );
            return if decoder.is_empty() {
                Ok(())
            } else {
                Err(Error::Protocol("input ended in the middle of a frame".to_string()))
            };
        }

        decoder.extend_from_slice(&chunk[..read]);
    }
}

fn write_frame(output: &mut impl Write, frame: &Frame) -> Result<()> {
    let mut buffer = BytesMut::new();
    frame.encode(&mut buffer)?;
    output
        .write_all(&buffer)
        .and_then(|()| output.flush())
        .map_err(|e| ErrorDescriptor::from_io(&e).into())
}
