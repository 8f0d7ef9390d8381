// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashMap;
use std::fs::{self, DirBuilder, File, FileTimes, Metadata, Permissions};
use std::io;
use std::os::unix::fs::{DirBuilderExt as _, FileExt as _, MetadataExt as _, PermissionsExt as _};
use std::path::PathBuf;
use std::time::SystemTime;

use crate::error::ErrorCode;
use crate::open_options::OpenOptions;
use crate::protocol::{DirEntry, EntryKind, ErrorDescriptor, MAX_READ_LEN, Operation, Payload, Stat, Value};

type Outcome = Result<Payload, ErrorDescriptor>;

const MKDTEMP_SUFFIX_LEN: usize = 6;
const MKDTEMP_ATTEMPTS: usize = 100;

/// Executes operations against the native filesystem and owns the descriptors opened so far.
///
/// Descriptor numbers are local to this executor and never reused.
#[derive(Debug, Default)]
pub(crate) struct Executor {
    descriptors: HashMap<u64, File>,
    next_descriptor: u64,
}

impl Executor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn open_descriptors(&self) -> usize {
        self.descriptors.len()
    }

    pub(crate) fn execute(&mut self, operation: Operation, args: &[Value]) -> Outcome {
        let mut args = Args::new(operation, args);

        match operation {
            Operation::Open => {
                let path = args.path()?;
                let flags = args.u32()?;
                let mode = args.u32()?;
                args.finish()?;
                self.open(path, OpenOptions::from_bits(flags, mode))
            }
            Operation::Close => {
                let fd = args.u64()?;
                args.finish()?;
                self.descriptors.remove(&fd).map(drop).ok_or_else(|| bad_descriptor(fd))?;
                Ok(Payload::Unit)
            }
            Operation::Read => {
                let fd = args.u64()?;
                let offset = args.u64()?;
                let len = args.u64()?;
                args.finish()?;
                self.read(fd, offset, len)
            }
            Operation::Write => {
                let fd = args.u64()?;
                let offset = args.u64()?;
                let data = args.bytes()?;
                args.finish()?;
                let file = self.descriptor(fd)?;
                file.write_all_at(data, offset).map_err(|e| ErrorDescriptor::from_io(&e))?;
                Ok(Payload::Written(data.len() as u64))
            }
            Operation::Mkdir => {
                let path = args.path()?;
                let mode = args.u32()?;
                args.finish()?;
                unit(DirBuilder::new().mode(mode).create(path))
            }
            Operation::Rmdir => {
                let path = args.path()?;
                args.finish()?;
                unit(fs::remove_dir(path))
            }
            Operation::Unlink => {
                let path = args.path()?;
                args.finish()?;
                unit(fs::remove_file(path))
            }
            Operation::Rename => {
                let from = args.path()?;
                let to = args.path()?;
                args.finish()?;
                unit(fs::rename(from, to))
            }
            Operation::Stat => {
                let path = args.path()?;
                args.finish()?;
                fs::metadata(path).map(|m| Payload::Stat(stat(&m))).map_err(|e| ErrorDescriptor::from_io(&e))
            }
            Operation::Lstat => {
                let path = args.path()?;
                args.finish()?;
                fs::symlink_metadata(path)
                    .map(|m| Payload::Stat(stat(&m)))
                    .map_err(|e| ErrorDescriptor::from_io(&e))
            }
            Operation::Chmod => {
                let path = args.path()?;
                let mode = args.u32()?;
                args.finish()?;
                unit(fs::set_permissions(path, Permissions::from_mode(mode)))
            }
            Operation::Chown => {
                let path = args.path()?;
                let uid = args.opt_u32()?;
                let gid = args.opt_u32()?;
                args.finish()?;
                unit(std::os::unix::fs::chown(path, uid, gid))
            }
            Operation::Touch => {
                let path = args.path()?;
                args.finish()?;
                unit(touch(path))
            }
            Operation::Symlink => {
                let target = args.path()?;
                let link = args.path()?;
                args.finish()?;
                unit(std::os::unix::fs::symlink(target, link))
            }
            Operation::Readlink => {
                let path = args.path()?;
                args.finish()?;
                fs::read_link(path)
                    .map(|target| Payload::Path(target.into_os_string()))
                    .map_err(|e| ErrorDescriptor::from_io(&e))
            }
            Operation::Link => {
                let original = args.path()?;
                let link = args.path()?;
                args.finish()?;
                unit(fs::hard_link(original, link))
            }
            Operation::Mkdtemp => {
                let prefix = args.path()?;
                args.finish()?;
                mkdtemp(prefix)
                    .map(|path| Payload::Path(path.into_os_string()))
                    .map_err(|e| ErrorDescriptor::from_io(&e))
            }
            Operation::ReadDir => {
                let path = args.path()?;
                args.finish()?;
                read_dir(path).map(Payload::Entries).map_err(|e| ErrorDescriptor::from_io(&e))
            }
        }
    }

    fn open(&mut self, path: PathBuf, options: OpenOptions) -> Outcome {
        let file = options.to_std().open(path).map_err(|e| ErrorDescriptor::from_io(&e))?;

        self.next_descriptor += 1;
        let fd = self.next_descriptor;
        let _ = self.descriptors.insert(fd, file);
        Ok(Payload::Descriptor(fd))
    }

    fn read(&self, fd: u64, offset: u64, len: u64) -> Outcome {
        if len > MAX_READ_LEN as u64 {
            return Err(ErrorDescriptor::new(
                ErrorCode::InvalidInput,
                format!("read of {len} bytes exceeds the {MAX_READ_LEN} byte limit"),
            ));
        }

        let file = self.descriptor(fd)?;
        #[expect(clippy::cast_possible_truncation, reason = "bounded by MAX_READ_LEN")]
        let mut buffer = vec![0_u8; len as usize];
        let mut filled = 0;

        // A short read only means end-of-file once the kernel returns zero.
        while filled < buffer.len() {
            match file.read_at(&mut buffer[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(ErrorDescriptor::from_io(&e)),
            }
        }

        buffer.truncate(filled);
        Ok(Payload::Data(buffer))
    }

    fn descriptor(&self, fd: u64) -> Result<&File, ErrorDescriptor> {
        self.descriptors.get(&fd).ok_or_else(|| bad_descriptor(fd))
    }
}

fn bad_descriptor(fd: u64) -> ErrorDescriptor {
    ErrorDescriptor::new(ErrorCode::BadDescriptor, format!("descriptor {fd} is not open in this worker"))
}

fn unit(result: io::Result<()>) -> Outcome {
    result.map(|()| Payload::Unit).map_err(|e| ErrorDescriptor::from_io(&e))
}

fn touch(path: PathBuf) -> io::Result<()> {
    let file = fs::OpenOptions::new().write(true).create(true).truncate(false).open(path)?;
    let now = SystemTime::now();
    file.set_times(FileTimes::new().set_accessed(now).set_modified(now))
}

fn mkdtemp(prefix: PathBuf) -> io::Result<PathBuf> {
    let mut builder = DirBuilder::new();
    let _ = builder.mode(0o700);

    for _ in 0..MKDTEMP_ATTEMPTS {
        let suffix: String = std::iter::repeat_with(fastrand::alphanumeric).take(MKDTEMP_SUFFIX_LEN).collect();
        let mut candidate = prefix.clone().into_os_string();
        candidate.push(suffix);
        let candidate = PathBuf::from(candidate);

        match builder.create(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }
    }

    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        "could not find an unused temporary directory name",
    ))
}

fn read_dir(path: PathBuf) -> io::Result<Vec<DirEntry>> {
    let mut entries = fs::read_dir(path)?
        .map(|entry| {
            let entry = entry?;
            Ok(DirEntry {
                name: entry.file_name(),
                kind: EntryKind::from_file_type(entry.file_type()?),
            })
        })
        .collect::<io::Result<Vec<_>>>()?;

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

fn stat(metadata: &Metadata) -> Stat {
    Stat {
        kind: EntryKind::from_file_type(metadata.file_type()),
        size: metadata.size(),
        mode: metadata.mode(),
        uid: metadata.uid(),
        gid: metadata.gid(),
        nlink: metadata.nlink(),
        ino: metadata.ino(),
        dev: metadata.dev(),
        atime: metadata.atime(),
        mtime: metadata.mtime(),
        ctime: metadata.ctime(),
    }
}

/// Cursor over the positional arguments of one request.
struct Args<'a> {
    operation: Operation,
    values: std::slice::Iter<'a, Value>,
}

impl<'a> Args<'a> {
    fn new(operation: Operation, values: &'a [Value]) -> Self {
        Self {
            operation,
            values: values.iter(),
        }
    }

    fn mismatch(&self, expected: &str) -> ErrorDescriptor {
        ErrorDescriptor::new(
            ErrorCode::InvalidInput,
            format!("{}: expected {expected} argument", self.operation),
        )
    }

    fn path(&mut self) -> Result<PathBuf, ErrorDescriptor> {
        match self.values.next() {
            Some(Value::Path(path)) => Ok(PathBuf::from(path)),
            _ => Err(self.mismatch("a path")),
        }
    }

    fn u32(&mut self) -> Result<u32, ErrorDescriptor> {
        match self.values.next() {
            Some(Value::U32(value)) => Ok(*value),
            _ => Err(self.mismatch("a 32-bit integer")),
        }
    }

    fn opt_u32(&mut self) -> Result<Option<u32>, ErrorDescriptor> {
        match self.values.next() {
            Some(Value::U32(value)) => Ok(Some(*value)),
            Some(Value::None) => Ok(None),
            _ => Err(self.mismatch("an optional 32-bit integer")),
        }
    }

    fn u64(&mut self) -> Result<u64, ErrorDescriptor> {
        match self.values.next() {
            Some(Value::U64(value)) => Ok(*value),
            _ => Err(self.mismatch("a 64-bit integer")),
        }
    }

    fn bytes(&mut self) -> Result<&'a [u8], ErrorDescriptor> {
        match self.values.next() {
            Some(Value::Bytes(bytes)) => Ok(bytes),
            _ => Err(self.mismatch("a byte")),
        }
    }

    fn finish(mut self) -> Result<(), ErrorDescriptor> {
        match self.values.next() {
            None => Ok(()),
            Some(_) => Err(ErrorDescriptor::new(
                ErrorCode::InvalidInput,
                format!("{}: too many arguments", self.operation),
            )),
        }
    }
}
