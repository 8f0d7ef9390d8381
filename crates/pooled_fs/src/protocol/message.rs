// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorCode};
use crate::worker::WorkerId;

/// Identifies one request for its whole lifetime.
///
/// Identifiers are allocated from a monotonically increasing counter, so a given value is
/// never reused by the same dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(u64);

impl RequestId {
    /// Wraps a raw request identifier.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw identifier as it appears on the wire.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

macro_rules! operations {
    ($($variant:ident => $name:literal,)+) => {
        /// A filesystem operation that a worker knows how to execute.
        ///
        /// Operations travel on the wire by name.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        #[non_exhaustive]
        pub enum Operation {
            $(
                #[doc = concat!("The `", $name, "` operation.")]
                $variant,
            )+
        }

        impl Operation {
            /// Returns the wire name of the operation.
            #[must_use]
            pub const fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)+
                }
            }

            /// Looks up an operation by its wire name.
            #[must_use]
            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

operations! {
    Open => "open",
    Close => "close",
    Read => "read",
    Write => "write",
    Mkdir => "mkdir",
    Rmdir => "rmdir",
    Unlink => "unlink",
    Rename => "rename",
    Stat => "stat",
    Lstat => "lstat",
    Chmod => "chmod",
    Chown => "chown",
    Touch => "touch",
    Symlink => "symlink",
    Readlink => "readlink",
    Link => "link",
    Mkdtemp => "mkdtemp",
    ReadDir => "readdir",
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One positional argument of a request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    /// An absent optional argument.
    None,
    /// A 32-bit unsigned integer, used for modes, ids and flag sets.
    U32(u32),
    /// A 64-bit unsigned integer, used for descriptors, offsets and lengths.
    U64(u64),
    /// A filesystem path, kept as an OS string so that non-UTF-8 names survive.
    Path(OsString),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

impl Value {
    /// Creates a path argument.
    #[must_use]
    pub fn path(path: impl AsRef<Path>) -> Self {
        Self::Path(path.as_ref().as_os_str().to_os_string())
    }

    /// Creates an optional 32-bit argument.
    #[must_use]
    pub const fn opt_u32(value: Option<u32>) -> Self {
        match value {
            Some(v) => Self::U32(v),
            None => Self::None,
        }
    }
}

/// A request as it is queued in the pool and sent to a worker.
#[derive(Clone, Debug)]
pub struct Request {
    /// Unique identifier of the request.
    pub id: RequestId,
    /// The operation to execute.
    pub operation: Operation,
    /// Positional arguments of the operation.
    pub args: Vec<Value>,
    /// The worker that must execute the request, if any.
    ///
    /// Requests against an open descriptor must reach the worker that opened it.
    pub affinity: Option<WorkerId>,
    /// When the request was created, for latency reporting.
    pub created_at: Instant,
}

impl Request {
    /// Creates a request that may run on any worker.
    #[must_use]
    pub fn new(id: RequestId, operation: Operation, args: Vec<Value>) -> Self {
        Self {
            id,
            operation,
            args,
            affinity: None,
            created_at: Instant::now(),
        }
    }

    /// Pins the request to one worker.
    #[must_use]
    pub const fn pinned_to(mut self, worker: WorkerId) -> Self {
        self.affinity = Some(worker);
        self
    }
}

/// The successful result of an operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// The operation has no result value.
    Unit,
    /// A descriptor identifier local to the worker that opened it.
    Descriptor(u64),
    /// Bytes read from a descriptor.
    Data(Vec<u8>),
    /// Number of bytes written.
    Written(u64),
    /// File metadata.
    Stat(Stat),
    /// Directory entries.
    Entries(Vec<DirEntry>),
    /// A path produced by the operation.
    Path(OsString),
}

impl Payload {
    pub(crate) fn into_unit(self) -> Result<(), Error> {
        match self {
            Self::Unit => Ok(()),
            _ => Err(Error::unexpected_payload("no value")),
        }
    }

    pub(crate) fn into_descriptor(self) -> Result<u64, Error> {
        match self {
            Self::Descriptor(fd) => Ok(fd),
            _ => Err(Error::unexpected_payload("a descriptor")),
        }
    }

    pub(crate) fn into_data(self) -> Result<Vec<u8>, Error> {
        match self {
            Self::Data(data) => Ok(data),
            _ => Err(Error::unexpected_payload("data")),
        }
    }

    pub(crate) fn into_written(self) -> Result<u64, Error> {
        match self {
            Self::Written(n) => Ok(n),
            _ => Err(Error::unexpected_payload("a byte count")),
        }
    }

    pub(crate) fn into_stat(self) -> Result<Stat, Error> {
        match self {
            Self::Stat(stat) => Ok(stat),
            _ => Err(Error::unexpected_payload("metadata")),
        }
    }

    pub(crate) fn into_entries(self) -> Result<Vec<DirEntry>, Error> {
        match self {
            Self::Entries(entries) => Ok(entries),
            _ => Err(Error::unexpected_payload("directory entries")),
        }
    }

    pub(crate) fn into_path(self) -> Result<PathBuf, Error> {
        match self {
            Self::Path(path) => Ok(PathBuf::from(path)),
            _ => Err(Error::unexpected_payload("a path")),
        }
    }
}

/// Describes a failed operation on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    /// Portable classification.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// The raw OS error number, if any.
    pub native_code: Option<i32>,
}

impl ErrorDescriptor {
    /// Captures a standard I/O error.
    #[must_use]
    pub fn from_io(error: &std::io::Error) -> Self {
        Self {
            code: ErrorCode::from_io(error),
            message: error.to_string(),
            native_code: error.raw_os_error(),
        }
    }

    /// Creates a descriptor that did not originate from the operating system.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            native_code: None,
        }
    }
}

/// The kind of a filesystem entry. Symbolic links are never followed when classifying.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    /// A regular file.
    File,
    /// A directory.
    Directory,
    /// A symbolic link.
    Symlink,
    /// A FIFO, socket, device or anything else.
    Other,
}

impl EntryKind {
    /// Classifies a standard file type.
    #[must_use]
    pub fn from_file_type(file_type: std::fs::FileType) -> Self {
        if file_type.is_symlink() {
            Self::Symlink
        } else if file_type.is_dir() {
            Self::Directory
        } else if file_type.is_file() {
            Self::File
        } else {
            Self::Other
        }
    }
}

/// One entry of a directory listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Bare name of the entry, without any leading path component.
    pub name: OsString,
    /// Kind of the entry, not following symbolic links.
    pub kind: EntryKind,
}

/// File metadata as reported by `stat` or `lstat`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    /// Kind of the entry.
    pub kind: EntryKind,
    /// Size in bytes.
    pub size: u64,
    /// Full mode word, including the file type bits.
    pub mode: u32,
    /// Owning user.
    pub uid: u32,
    /// Owning group.
    pub gid: u32,
    /// Number of hard links.
    pub nlink: u64,
    /// Inode number.
    pub ino: u64,
    /// Device the entry resides on.
    pub dev: u64,
    /// Last access time, seconds since the Unix epoch.
    pub atime: i64,
    /// Last modification time, seconds since the Unix epoch.
    pub mtime: i64,
    /// Last status change time, seconds since the Unix epoch.
    pub ctime: i64,
}

impl Stat {
    /// Returns the permission bits (including setuid, setgid and sticky).
    #[must_use]
    pub const fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }

    /// Returns `true` for directories.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Returns `true` for regular files.
    #[must_use]
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}
