// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An unpublished crate containing testing utilities for use within this repo.

use std::path::Path;
use std::time::Duration;
use std::{env, fs};

mod log;

pub use log::*;

/// If something (whatever) does not happen in a test within this time, the test will fail.
///
/// We are conservative here and allow much time - this is only to break out of hung workers and
/// lost wakeups, not for any situations that are actually expected.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Returns `true` when running under mutation testing (`MUTATION_TESTING=1`).
#[must_use]
pub fn is_mutation_testing() -> bool {
    env::var("MUTATION_TESTING").as_deref() == Ok("1")
}

/// Awaits `future`, failing the test if it does not complete within [`TEST_TIMEOUT`].
///
/// Under mutation testing the timeout is disabled so that hangs surface as actual timeouts of
/// the mutation run.
///
/// # Panics
///
/// Panics if the timeout is exceeded.
pub async fn with_timeout<F: Future>(future: F) -> F::Output {
    if is_mutation_testing() {
        return future.await;
    }

    match tokio::time::timeout(TEST_TIMEOUT, future).await {
        Ok(output) => output,
        Err(_) => panic!("test did not complete within {TEST_TIMEOUT:?}"),
    }
}

/// Standard test data generator - a repeating sequence of bytes from 0 to 255.
pub fn repeating_incrementing_bytes() -> impl Iterator<Item = u8> {
    (0..=u8::MAX).cycle()
}

/// Creates a fixture tree under `root`.
///
/// Each entry is a path relative to `root`. Entries ending in `/` become directories, entries of
/// the form `name -> target` become symbolic links, and everything else becomes a file whose
/// contents are its own relative path. Missing parents are created as needed.
///
/// # Panics
///
/// Panics if any part of the tree cannot be created.
pub fn build_tree(root: &Path, entries: &[&str]) {
    for entry in entries {
        if let Some((link, target)) = entry.split_once(" -> ") {
            let link = root.join(link);
            create_parent(&link);
            std::os::unix::fs::symlink(target, &link).unwrap();
        } else if let Some(dir) = entry.strip_suffix('/') {
            fs::create_dir_all(root.join(dir)).unwrap();
        } else {
            let file = root.join(entry);
            create_parent(&file);
            fs::write(&file, entry.as_bytes()).unwrap();
        }
    }
}

fn create_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_tree_creates_every_kind() {
        let root = tempfile::tempdir().unwrap();

        build_tree(root.path(), &["a/", "a/b/c.txt", "d.txt", "a/link -> ../d.txt"]);

        assert!(root.path().join("a").is_dir());
        assert_eq!(fs::read(root.path().join("a/b/c.txt")).unwrap(), b"a/b/c.txt");
        assert_eq!(fs::read(root.path().join("d.txt")).unwrap(), b"d.txt");
        assert_eq!(fs::read_link(root.path().join("a/link")).unwrap(), Path::new("../d.txt"));
        assert_eq!(fs::read(root.path().join("a/link")).unwrap(), b"d.txt");
    }

    #[test]
    fn bytes_repeat() {
        let bytes: Vec<u8> = repeating_incrementing_bytes().skip(254).take(4).collect();
        assert_eq!(bytes, [254, 255, 0, 1]);
    }

    #[tokio::test]
    async fn with_timeout_returns_output() {
        assert_eq!(with_timeout(async { 42 }).await, 42);
    }
}
