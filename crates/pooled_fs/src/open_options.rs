// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

/// Options and flags which can be used to configure how a file is opened.
///
/// This builder exposes the ability to configure how a file is opened and what operations are
/// permitted on the resulting stream. [`File::open`](crate::File::open) takes a set of options;
/// the access flags also decide which kind of stream is returned:
///
/// * read only: a [`ReadableStream`](crate::ReadableStream),
/// * write or append without read: a [`WritableStream`](crate::WritableStream),
/// * read together with write or append: a [`DuplexStream`](crate::DuplexStream).
///
/// Generally speaking, when using `OpenOptions`, you'll first call [`OpenOptions::new`],
/// then chain calls to methods to set each option.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[expect(clippy::struct_excessive_bools, reason = "mirrors std::fs::OpenOptions API")]
pub struct OpenOptions {
    read: bool,
    write: bool,
    append: bool,
    truncate: bool,
    create: bool,
    create_new: bool,
    mode: u32,
}

const READ: u32 = 1 << 0;
const WRITE: u32 = 1 << 1;
const APPEND: u32 = 1 << 2;
const TRUNCATE: u32 = 1 << 3;
const CREATE: u32 = 1 << 4;
const CREATE_NEW: u32 = 1 << 5;

impl OpenOptions {
    /// Creates a blank new set of options ready for configuration.
    ///
    /// All flags are initially set to `false` and the creation mode is `0o666`, which the
    /// worker's umask narrows as usual.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            read: false,
            write: false,
            append: false,
            truncate: false,
            create: false,
            create_new: false,
            mode: 0o666,
        }
    }

    /// Sets the option for read access.
    pub const fn read(&mut self, read: bool) -> &mut Self {
        self.read = read;
        self
    }

    /// Sets the option for write access.
    ///
    /// If the file already exists, writes overwrite its contents without truncating it.
    pub const fn write(&mut self, write: bool) -> &mut Self {
        self.write = write;
        self
    }

    /// Sets the option for the append mode.
    ///
    /// This option, when true, means that writes will append to a file instead
    /// of overwriting previous contents. Note that setting `.write(true).append(true)`
    /// has the same effect as setting only `.append(true)`.
    pub const fn append(&mut self, append: bool) -> &mut Self {
        self.append = append;
        self
    }

    /// Sets the option for truncating a previous file.
    ///
    /// The file must be opened with write access for truncate to work.
    pub const fn truncate(&mut self, truncate: bool) -> &mut Self {
        self.truncate = truncate;
        self
    }

    /// Sets the option to create a new file, or open it if it already exists.
    ///
    /// In order for the file to be created, write or append access must be used.
    pub const fn create(&mut self, create: bool) -> &mut Self {
        self.create = create;
        self
    }

    /// Sets the option to always create a new file, failing if it already exists.
    ///
    /// If `.create_new(true)` is set, `.create()` and `.truncate()` are ignored.
    pub const fn create_new(&mut self, create_new: bool) -> &mut Self {
        self.create_new = create_new;
        self
    }

    /// Sets the permission bits used when the file is created.
    pub const fn mode(&mut self, mode: u32) -> &mut Self {
        self.mode = mode;
        self
    }

    /// Returns `true` if the options grant read access.
    #[must_use]
    pub const fn is_readable(&self) -> bool {
        self.read
    }

    /// Returns `true` if the options grant write or append access.
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.write || self.append
    }

    /// Returns the creation mode.
    #[must_use]
    pub const fn creation_mode(&self) -> u32 {
        self.mode
    }

    pub(crate) const fn to_bits(self) -> u32 {
        let mut bits = 0;
        if self.read {
            bits |= READ;
        }
        if self.write {
            bits |= WRITE;
        }
        if self.append {
            bits |= APPEND;
        }
        if self.truncate {
            bits |= TRUNCATE;
        }
        if self.create {
            bits |= CREATE;
        }
        if self.create_new {
            bits |= CREATE_NEW;
        }
        bits
    }

    pub(crate) const fn from_bits(bits: u32, mode: u32) -> Self {
        Self {
            read: bits & READ != 0,
            write: bits & WRITE != 0,
            append: bits & APPEND != 0,
            truncate: bits & TRUNCATE != 0,
            create: bits & CREATE != 0,
            create_new: bits & CREATE_NEW != 0,
            mode,
        }
    }

    /// Translates the options for the standard library, as executed inside a worker.
    pub(crate) fn to_std(self) -> std::fs::OpenOptions {
        use std::os::unix::fs::OpenOptionsExt as _;

        let mut options = std::fs::OpenOptions::new();
        let _ = options
            .read(self.read)
            .write(self.write)
            .append(self.append)
            .truncate(self.truncate)
            .create(self.create)
            .create_new(self.create_new)
            .mode(self.mode);
        options
    }
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_survive_bit_packing() {
        let mut options = OpenOptions::new();
        let _ = options.read(true).append(true).create_new(true).mode(0o600);

        let unpacked = OpenOptions::from_bits(options.to_bits(), options.creation_mode());
        assert_eq!(unpacked, options);
    }

    #[test]
    fn access_classification() {
        assert!(!OpenOptions::new().is_readable());
        assert!(!OpenOptions::new().is_writable());
        assert!(OpenOptions::new().append(true).is_writable());
        assert!(OpenOptions::new().read(true).is_readable());
    }
}
