// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The wire protocol spoken between the control process and its workers.

mod frame;
mod message;

pub use frame::{Frame, FrameDecoder, MAX_FRAME_LEN, MAX_READ_LEN, MAX_WRITE_LEN};
pub use message::{DirEntry, EntryKind, ErrorDescriptor, Operation, Payload, Request, RequestId, Stat, Value};
