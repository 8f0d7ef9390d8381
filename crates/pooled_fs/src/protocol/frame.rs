// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::protocol::{ErrorDescriptor, Operation, Payload, RequestId, Value};

/// Upper bound on the body length of a single frame.
///
/// Anything larger is treated as a corrupt length prefix rather than buffered.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Largest single read a worker serves; the response must still fit in one frame.
pub const MAX_READ_LEN: usize = MAX_FRAME_LEN / 2;

/// Largest payload of a single write request; the request must still fit in one frame.
pub const MAX_WRITE_LEN: usize = MAX_FRAME_LEN / 2;

const LEN_PREFIX: usize = 4;

// opcode (1) + request id (8)
const HEADER_LEN: usize = 9;

const OPCODE_REQUEST: u8 = 1;
const OPCODE_RESPONSE: u8 = 2;
const OPCODE_READY: u8 = 3;

const STATUS_OK: u8 = 0;
const STATUS_ERR: u8 = 1;

/// One unit of the worker transport.
///
/// ```text
/// request  = len:u32 | 1 | id:u64 | bincode((operation name, args))
/// response = len:u32 | 2 | id:u64 | status:u8 | bincode(payload or error descriptor)
/// ready    = len:u32 | 3 | 0:u64  | pid:u32
/// ```
///
/// All integers are big-endian and `len` counts the bytes that follow it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// Control process to worker: execute an operation.
    Request {
        /// Identifier to echo in the response.
        id: RequestId,
        /// The operation to execute.
        operation: Operation,
        /// Positional arguments.
        args: Vec<Value>,
    },

    /// Worker to control process: the outcome of a request.
    Response {
        /// Identifier of the request this answers.
        id: RequestId,
        /// Success payload or error descriptor.
        outcome: std::result::Result<Payload, ErrorDescriptor>,
    },

    /// Worker to control process: the worker is initialized and waiting for requests.
    Ready {
        /// Process id as seen by the worker.
        pid: u32,
    },
}

impl Frame {
    /// Appends the encoded frame to `dst`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the body cannot be serialized or exceeds
    /// [`MAX_FRAME_LEN`]. Nothing is appended in that case.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        let start = dst.len();
        dst.put_u32(0);

        if let Err(e) = self.encode_body(dst) {
            dst.truncate(start);
            return Err(e);
        }

        let len = dst.len() - start - LEN_PREFIX;
        if len > MAX_FRAME_LEN {
            dst.truncate(start);
            return Err(Error::Protocol(format!("frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit")));
        }

        let len = u32::try_from(len).map_err(|e| Error::Protocol(format!("frame of {len} bytes cannot be framed: {e}")))?;
        dst[start..start + LEN_PREFIX].copy_from_slice(&len.to_be_bytes());
        Ok(())
    }

    /// Encodes the frame into a standalone buffer.
    ///
    /// # Errors
    ///
    /// See [`Frame::encode`].
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    fn encode_body(&self, dst: &mut BytesMut) -> Result<()> {
        match self {
            Self::Request { id, operation, args } => {
                dst.put_u8(OPCODE_REQUEST);
                dst.put_u64(id.get());
                bincode::serialize_into((&mut *dst).writer(), &(operation.name(), args)).map_err(|e| serialize_error(&e))
            }
            Self::Response { id, outcome } => {
                dst.put_u8(OPCODE_RESPONSE);
                dst.put_u64(id.get());
                match outcome {
                    Ok(payload) => {
                        dst.put_u8(STATUS_OK);
                        bincode::serialize_into((&mut *dst).writer(), payload).map_err(|e| serialize_error(&e))
                    }
                    Err(descriptor) => {
                        dst.put_u8(STATUS_ERR);
                        bincode::serialize_into((&mut *dst).writer(), descriptor).map_err(|e| serialize_error(&e))
                    }
                }
            }
            Self::Ready { pid } => {
                dst.put_u8(OPCODE_READY);
                dst.put_u64(0);
                dst.put_u32(*pid);
                Ok(())
            }
        }
    }

    fn decode_body(mut body: Bytes) -> Result<Self> {
        let opcode = body.get_u8();
        let id = RequestId::new(body.get_u64());

        match opcode {
            OPCODE_REQUEST => {
                let (name, args): (String, Vec<Value>) = bincode::deserialize(&body).map_err(|e| deserialize_error(&e))?;
                let operation =
                    Operation::from_name(&name).ok_or_else(|| Error::Protocol(format!("unknown operation '{name}'")))?;
                Ok(Self::Request { id, operation, args })
            }
            OPCODE_RESPONSE => {
                if body.is_empty() {
                    return Err(Error::Protocol("response frame without a status byte".to_string()));
                }
                let outcome = match body.get_u8() {
                    STATUS_OK => Ok(bincode::deserialize(&body).map_err(|e| deserialize_error(&e))?),
                    STATUS_ERR => Err(bincode::deserialize(&body).map_err(|e| deserialize_error(&e))?),
                    status => return Err(Error::Protocol(format!("unknown response status {status}"))),
                };
                Ok(Self::Response { id, outcome })
            }
            OPCODE_READY => {
                if body.remaining() != 4 {
                    return Err(Error::Protocol("malformed ready frame".to_string()));
                }
                Ok(Self::Ready { pid: body.get_u32() })
            }
            other => Err(Error::Protocol(format!("unknown opcode {other}"))),
        }
    }
}

fn serialize_error(e: &bincode::Error) -> Error {
    Error::Protocol(format!("cannot serialize frame body: {e}"))
}

fn deserialize_error(e: &bincode::Error) -> Error {
    Error::Protocol(format!("cannot deserialize frame body: {e}"))
}

/// Reassembles frames from a byte stream.
///
/// Pipe reads may return any number of bytes, so incoming data is buffered until a whole frame
/// (as announced by its length prefix) is available. Each call to [`decode`](Self::decode)
/// yields at most one frame.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Creates an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends received bytes to the internal buffer.
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Gives direct access to the internal buffer, for readers that fill it in place.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Returns `true` if no partial frame is buffered.
    ///
    /// A transport that reaches end-of-stream with a non-empty decoder has been cut off in the
    /// middle of a frame.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Extracts the next complete frame, if one has been fully received.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the buffered data cannot be a valid frame. The decoder
    /// should be discarded afterwards, since framing can no longer be trusted.
    pub fn decode(&mut self) -> Result<Option<Frame>> {
        if self.buffer.len() < LEN_PREFIX {
            return Ok(None);
        }

        let mut prefix = [0_u8; LEN_PREFIX];
        prefix.copy_from_slice(&self.buffer[..LEN_PREFIX]);
        let len = u32::from_be_bytes(prefix) as usize;

        if len > MAX_FRAME_LEN {
            return Err(Error::Protocol(format!("announced frame length {len} exceeds the {MAX_FRAME_LEN} byte limit")));
        }
        if len < HEADER_LEN {
            return Err(Error::Protocol(format!("announced frame length {len} is shorter than the frame header")));
        }

        let total = LEN_PREFIX + len;
        if self.buffer.len() < total {
            self.buffer.reserve(total - self.buffer.len());
            return Ok(None);
        }

        self.buffer.advance(LEN_PREFIX);
        let body = self.buffer.split_to(len).freeze();
        Frame::decode_body(body).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;

    use super::*;
    use crate::error::ErrorCode;

    fn sample_request() -> Frame {
        Frame::Request {
            id: RequestId::new(42),
            operation: Operation::Mkdir,
            args: vec![Value::Path(OsString::from("/tmp/a")), Value::U32(0o755)],
        }
    }

    #[test]
    fn frame_delivered_one_byte_at_a_time() {
        let encoded = sample_request().to_bytes().unwrap();
        let mut decoder = FrameDecoder::new();

        for (index, byte) in encoded.iter().enumerate() {
            assert_eq!(decoder.decode().unwrap(), None, "frame decoded early at byte {index}");
            decoder.extend_from_slice(&[*byte]);
        }

        assert_eq!(decoder.decode().unwrap(), Some(sample_request()));
        assert!(decoder.is_empty());
        assert_eq!(decoder.decode().unwrap(), None);
    }

    #[test]
    fn several_frames_in_one_read_come_out_one_at_a_time() {
        let mut buf = BytesMut::new();
        Frame::Ready { pid: 1234 }.encode(&mut buf).unwrap();
        sample_request().encode(&mut buf).unwrap();
        Frame::Response {
            id: RequestId::new(42),
            outcome: Err(ErrorDescriptor::new(ErrorCode::NotFound, "gone")),
        }
        .encode(&mut buf)
        .unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.extend_from_slice(&buf);

        assert_eq!(decoder.decode().unwrap(), Some(Frame::Ready { pid: 1234 }));
        assert_eq!(decoder.decode().unwrap(), Some(sample_request()));
        match decoder.decode().unwrap() {
            Some(Frame::Response { id, outcome: Err(descriptor) }) => {
                assert_eq!(id, RequestId::new(42));
                assert_eq!(descriptor.code, ErrorCode::NotFound);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        assert_eq!(decoder.decode().unwrap(), None);
    }

    #[test]
    fn response_payload_survives_the_wire() {
        let frame = Frame::Response {
            id: RequestId::new(7),
            outcome: Ok(Payload::Data(vec![1, 2, 3, 4])),
        };
        let mut decoder = FrameDecoder::new();
        decoder.extend_from_slice(&frame.to_bytes().unwrap());
        assert_eq!(decoder.decode().unwrap(), Some(frame));
    }

    #[test]
    fn partial_frame_is_reported_by_is_empty() {
        let encoded = sample_request().to_bytes().unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.extend_from_slice(&encoded[..encoded.len() - 1]);

        assert_eq!(decoder.decode().unwrap(), None);
        assert!(!decoder.is_empty());
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.extend_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(decoder.decode(), Err(Error::Protocol(_))));
    }

    #[test]
    fn undersized_length_prefix_is_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.extend_from_slice(&3_u32.to_be_bytes());
        decoder.extend_from_slice(&[1, 2, 3]);
        assert!(matches!(decoder.decode(), Err(Error::Protocol(_))));
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(9);
        buf.put_u8(77);
        buf.put_u64(1);

        let mut decoder = FrameDecoder::new();
        decoder.extend_from_slice(&buf);
        assert!(matches!(decoder.decode(), Err(Error::Protocol(_))));
    }

    #[test]
    fn unknown_operation_name_is_rejected() {
        let mut body = BytesMut::new();
        body.put_u8(OPCODE_REQUEST);
        body.put_u64(5);
        bincode::serialize_into((&mut body).writer(), &("format_disk", Vec::<Value>::new())).unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.extend_from_slice(&u32::try_from(body.len()).unwrap().to_be_bytes());
        decoder.extend_from_slice(&body);

        match decoder.decode() {
            Err(Error::Protocol(message)) => assert!(message.contains("format_disk")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn garbage_response_body_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(12);
        buf.put_u8(OPCODE_RESPONSE);
        buf.put_u64(1);
        buf.put_u8(STATUS_OK);
        buf.put_slice(&[0xff, 0xff]);

        let mut decoder = FrameDecoder::new();
        decoder.extend_from_slice(&buf);
        assert!(matches!(decoder.decode(), Err(Error::Protocol(_))));
    }
}
