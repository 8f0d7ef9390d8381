// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io::{self, ErrorKind};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{ErrorDescriptor, RequestId};

/// A specialized `Result` for filesystem operations that return a [`pooled_fs` error][enum@Error].
pub type Result<T> = std::result::Result<T, Error>;

/// Any error that may be returned by the pooled filesystem.
///
/// Errors from the native filesystem are reported as [`Error::Io`] and carry a portable
/// [`ErrorCode`] alongside the native error number, so that callers can tell "not found" apart
/// from "permission denied" or "already exists" without platform-specific code. The remaining
/// variants describe failures of the worker pool itself or misuse by the caller.
///
/// # Thread safety
///
/// This type is thread-safe.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A native filesystem call failed inside a worker process.
    #[error("{message}")]
    Io {
        /// Portable classification of the failure.
        code: ErrorCode,
        /// Human-readable description produced by the worker.
        message: String,
        /// The raw OS error number, if the failure came from the operating system.
        native_code: Option<i32>,
    },

    /// A worker sent a malformed or truncated frame, or a frame that does not fit its state.
    ///
    /// The worker connection is torn down and the worker replaced. The request that was in
    /// flight on that worker, if any, fails with this error and is not retried.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The worker process terminated while it was executing the request.
    ///
    /// The request is not retried because the operation may not be idempotent. Descriptors
    /// opened by the worker are lost with it, so later requests against them also fail
    /// with this error.
    #[error("worker crashed while executing request {request}")]
    WorkerCrashed {
        /// The request that was lost.
        request: RequestId,
    },

    /// The caller of some API made a mistake, detected before anything was dispatched.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The pool is shutting down and no longer accepts or serves requests.
    #[error("worker pool is closing")]
    PoolClosing,

    /// The stream is closing, closed or failed and no longer accepts writes.
    #[error("stream is closing")]
    StreamClosing,

    /// A worker process could not be started.
    #[error("failed to start worker process: {0}")]
    Spawn(#[source] Arc<io::Error>),
}

impl Error {
    /// Returns the portable error code for native filesystem failures.
    #[must_use]
    pub const fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Io { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Returns `true` if this is a native failure with the given portable code.
    #[must_use]
    pub fn is(&self, code: ErrorCode) -> bool {
        self.code() == Some(code)
    }

    pub(crate) fn io(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Io {
            code,
            message: message.into(),
            native_code: None,
        }
    }

    pub(crate) fn unexpected_payload(expected: &str) -> Self {
        Self::Protocol(format!("worker returned an unexpected payload, expected {expected}"))
    }
}

impl From<ErrorDescriptor> for Error {
    fn from(value: ErrorDescriptor) -> Self {
        Self::Io {
            code: value.code,
            message: value.message,
            native_code: value.native_code,
        }
    }
}

/// Represents the pooled filesystem error as a standard I/O error.
///
/// This is often used when interoperating with other libraries that expect standard I/O errors.
impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Io { code, message, .. } => Self::new(code.to_io_kind(), message),
            Error::InvalidArgument(message) => Self::new(ErrorKind::InvalidInput, message),
            other => Self::other(other),
        }
    }
}

/// The portable subset of native error conditions.
///
/// Workers map every native failure onto one of these codes before sending it back; the raw
/// OS error number travels alongside for callers that need it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ErrorCode {
    /// The path does not exist.
    NotFound,
    /// The caller lacks the permission to perform the operation.
    PermissionDenied,
    /// The target already exists.
    AlreadyExists,
    /// A path component that must be a directory is not one.
    NotADirectory,
    /// The operation expected a non-directory but found a directory.
    IsADirectory,
    /// The directory still has entries.
    DirectoryNotEmpty,
    /// An argument was rejected by the worker or the operating system.
    InvalidInput,
    /// The descriptor is not open in the worker that received the request.
    BadDescriptor,
    /// The filesystem is mounted read-only.
    ReadOnlyFilesystem,
    /// A rename or link would cross filesystem boundaries.
    CrossesDevices,
    /// The operation is not supported on this platform or filesystem.
    Unsupported,
    /// Any other failure.
    Other,
}

impl ErrorCode {
    /// Classifies a standard I/O error.
    #[must_use]
    pub fn from_io(error: &io::Error) -> Self {
        match error.kind() {
            ErrorKind::NotFound => Self::NotFound,
            ErrorKind::PermissionDenied => Self::PermissionDenied,
            ErrorKind::AlreadyExists => Self::AlreadyExists,
            ErrorKind::NotADirectory => Self::NotADirectory,
            ErrorKind::IsADirectory => Self::IsADirectory,
            ErrorKind::DirectoryNotEmpty => Self::DirectoryNotEmpty,
            ErrorKind::InvalidInput | ErrorKind::InvalidFilename => Self::InvalidInput,
            ErrorKind::ReadOnlyFilesystem => Self::ReadOnlyFilesystem,
            ErrorKind::CrossesDevices => Self::CrossesDevices,
            ErrorKind::Unsupported => Self::Unsupported,
            _ => Self::Other,
        }
    }

    /// Returns the closest standard I/O error kind.
    #[must_use]
    pub const fn to_io_kind(self) -> ErrorKind {
        match self {
            Self::NotFound => ErrorKind::NotFound,
            Self::PermissionDenied => ErrorKind::PermissionDenied,
            Self::AlreadyExists => ErrorKind::AlreadyExists,
            Self::NotADirectory => ErrorKind::NotADirectory,
            Self::IsADirectory => ErrorKind::IsADirectory,
            Self::DirectoryNotEmpty => ErrorKind::DirectoryNotEmpty,
            Self::InvalidInput | Self::BadDescriptor => ErrorKind::InvalidInput,
            Self::ReadOnlyFilesystem => ErrorKind::ReadOnlyFilesystem,
            Self::CrossesDevices => ErrorKind::CrossesDevices,
            Self::Unsupported => ErrorKind::Unsupported,
            Self::Other => ErrorKind::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    #[test]
    fn thread_safe_type() {
        assert_impl_all!(Error: Send, Sync);
    }

    #[test]
    fn classifies_common_errno_values() {
        let not_found = io::Error::from(ErrorKind::NotFound);
        assert_eq!(ErrorCode::from_io(&not_found), ErrorCode::NotFound);

        let denied = io::Error::from(ErrorKind::PermissionDenied);
        assert_eq!(ErrorCode::from_io(&denied), ErrorCode::PermissionDenied);

        let exists = io::Error::from(ErrorKind::AlreadyExists);
        assert_eq!(ErrorCode::from_io(&exists), ErrorCode::AlreadyExists);

        let weird = io::Error::other("something else");
        assert_eq!(ErrorCode::from_io(&weird), ErrorCode::Other);
    }

    #[test]
    fn descriptor_becomes_io_error() {
        let error = Error::from(ErrorDescriptor {
            code: ErrorCode::DirectoryNotEmpty,
            message: "Directory not empty (os error 39)".to_string(),
            native_code: Some(39),
        });

        assert!(error.is(ErrorCode::DirectoryNotEmpty));
        assert_eq!(error.to_string(), "Directory not empty (os error 39)");
        match error {
            Error::Io { native_code, .. } => assert_eq!(native_code, Some(39)),
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    #[test]
    fn into_stdio_error() {
        let e = Error::Io {
            code: ErrorCode::AlreadyExists,
            message: "hey what did you do".to_string(),
            native_code: None,
        };
        let io_error: io::Error = e.into();
        assert_eq!(io_error.kind(), ErrorKind::AlreadyExists);
        assert_eq!(io_error.to_string(), "hey what did you do");

        let e = Error::InvalidArgument("stream is read-only".to_string());
        let io_error: io::Error = e.into();
        assert_eq!(io_error.kind(), ErrorKind::InvalidInput);

        let io_error: io::Error = Error::PoolClosing.into();
        assert_eq!(io_error.kind(), ErrorKind::Other);
    }

    #[test]
    fn lifecycle_errors_have_no_code() {
        assert_eq!(Error::PoolClosing.code(), None);
        assert_eq!(Error::WorkerCrashed { request: RequestId::new(7) }.code(), None);
    }
}
