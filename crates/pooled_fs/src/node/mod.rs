// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Path-based handles over an [`Adapter`](crate::Adapter).
//!
//! Nodes are cheap: they hold a path and borrow the adapter, and they do not touch the
//! filesystem until one of their methods is awaited.

mod directory;
mod file;

use std::path::Path;

pub use directory::{Directory, DirectorySize};
pub use file::File;

use crate::protocol::EntryKind;

/// A file or a directory found on the filesystem.
///
/// Anything that is not a directory (symbolic links, FIFOs, sockets) is presented as a
/// [`File`].
#[derive(Debug)]
pub enum Node<'a, A> {
    /// A non-directory entry.
    File(File<'a, A>),
    /// A directory.
    Directory(Directory<'a, A>),
}

impl<'a, A> Node<'a, A> {
    pub(crate) fn from_kind(path: impl Into<std::path::PathBuf>, kind: EntryKind, adapter: &'a A) -> Self {
        match kind {
            EntryKind::Directory => Self::Directory(Directory::new(path, adapter)),
            EntryKind::File | EntryKind::Symlink | EntryKind::Other => Self::File(File::new(path, adapter)),
        }
    }

    /// Returns the path of the node.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::File(file) => file.path(),
            Self::Directory(dir) => dir.path(),
        }
    }

    /// Returns `true` for directories.
    #[must_use]
    pub const fn is_dir(&self) -> bool {
        matches!(self, Self::Directory(_))
    }

    /// Returns the file, if this node is one.
    #[must_use]
    pub const fn as_file(&self) -> Option<&File<'a, A>> {
        match self {
            Self::File(file) => Some(file),
            Self::Directory(_) => None,
        }
    }

    /// Returns the directory, if this node is one.
    #[must_use]
    pub const fn as_dir(&self) -> Option<&Directory<'a, A>> {
        match self {
            Self::Directory(dir) => Some(dir),
            Self::File(_) => None,
        }
    }
}

impl<A> Clone for Node<'_, A> {
    fn clone(&self) -> Self {
        match self {
            Self::File(file) => Self::File(file.clone()),
            Self::Directory(dir) => Self::Directory(dir.clone()),
        }
    }
}
