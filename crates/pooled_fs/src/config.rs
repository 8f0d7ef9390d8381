// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::protocol::MAX_READ_LEN;

/// Name of the worker executable built by this crate.
pub const WORKER_EXECUTABLE_NAME: &str = "pooled_fs_worker";

const ENV_WORKER: &str = "POOLED_FS_WORKER";
const ENV_MAX_WORKERS: &str = "POOLED_FS_MAX_WORKERS";
const ENV_READ_CHUNK_SIZE: &str = "POOLED_FS_READ_CHUNK_SIZE";

const DEFAULT_MAX_WORKERS: usize = 4;
pub(crate) const DEFAULT_READ_CHUNK_SIZE: usize = 64 * 1024;
pub(crate) const DEFAULT_WRITE_HIGH_WATER_MARK: usize = 1024 * 1024;
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Configuration of a worker pool and of the streams opened through it.
///
/// # Defaults
///
/// | Parameter | Default Value | Configured By |
/// |-----------|---------------|---------------|
/// | Worker executable | `pooled_fs_worker` next to the current executable, else from `PATH` | [`with_worker_executable`][Self::with_worker_executable] |
/// | Maximum workers | 4 | [`with_max_workers`][Self::with_max_workers] |
/// | Read chunk size | 64 KiB | [`with_read_chunk_size`][Self::with_read_chunk_size] |
/// | Write high-water mark | 1 MiB | [`with_write_high_water_mark`][Self::with_write_high_water_mark] |
/// | Shutdown grace period | 5 seconds | [`with_shutdown_grace`][Self::with_shutdown_grace] |
///
/// The configuration can also be deserialized; missing fields take their default value.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Path of the worker executable.
    pub worker_executable: PathBuf,
    /// Upper bound on concurrently running worker processes.
    pub max_workers: usize,
    /// Number of bytes requested by each read of a readable stream.
    pub read_chunk_size: usize,
    /// Queued bytes above which a writable stream reports that the writer should wait.
    pub write_high_water_mark: usize,
    /// How long a worker may take to exit after its input is closed before it is killed.
    pub shutdown_grace: Duration,
}

impl PoolConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a configuration from the defaults, overridden by environment variables.
    ///
    /// * `POOLED_FS_WORKER` sets the worker executable.
    /// * `POOLED_FS_MAX_WORKERS` sets the maximum number of workers.
    /// * `POOLED_FS_READ_CHUNK_SIZE` sets the read chunk size in bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if a numeric variable does not parse or the resulting
    /// configuration does not pass [`validate`](Self::validate).
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(worker) = env::var_os(ENV_WORKER) {
            config.worker_executable = PathBuf::from(worker);
        }
        if let Some(max_workers) = parse_env(ENV_MAX_WORKERS)? {
            config.max_workers = max_workers;
        }
        if let Some(read_chunk_size) = parse_env(ENV_READ_CHUNK_SIZE)? {
            config.read_chunk_size = read_chunk_size;
        }

        config.validate()?;
        Ok(config)
    }

    /// Sets the path of the worker executable.
    #[must_use]
    pub fn with_worker_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.worker_executable = path.into();
        self
    }

    /// Sets the maximum number of worker processes.
    #[must_use]
    pub const fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// Sets the number of bytes each stream read requests.
    #[must_use]
    pub const fn with_read_chunk_size(mut self, read_chunk_size: usize) -> Self {
        self.read_chunk_size = read_chunk_size;
        self
    }

    /// Sets the write queue size above which writers should wait for the queue to drain.
    #[must_use]
    pub const fn with_write_high_water_mark(mut self, write_high_water_mark: usize) -> Self {
        self.write_high_water_mark = write_high_water_mark;
        self
    }

    /// Sets how long a worker may take to exit during shutdown.
    #[must_use]
    pub const fn with_shutdown_grace(mut self, shutdown_grace: Duration) -> Self {
        self.shutdown_grace = shutdown_grace;
        self
    }

    /// Checks that the configuration can drive a pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `max_workers` or `read_chunk_size` is zero, if
    /// `read_chunk_size` exceeds [`MAX_READ_LEN`], or if the worker executable path is empty.
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(Error::InvalidArgument("max_workers must be at least 1".to_string()));
        }
        if self.read_chunk_size == 0 {
            return Err(Error::InvalidArgument("read_chunk_size must be at least 1".to_string()));
        }
        if self.read_chunk_size > MAX_READ_LEN {
            return Err(Error::InvalidArgument(format!(
                "read_chunk_size of {} bytes exceeds the {MAX_READ_LEN} byte read limit",
                self.read_chunk_size
            )));
        }
        if self.worker_executable.as_os_str().is_empty() {
            return Err(Error::InvalidArgument("worker_executable must not be empty".to_string()));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_executable: default_worker_executable(),
            max_workers: DEFAULT_MAX_WORKERS,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            write_high_water_mark: DEFAULT_WRITE_HIGH_WATER_MARK,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

fn parse_env(name: &str) -> Result<Option<usize>> {
    let Some(value) = env::var_os(name) else {
        return Ok(None);
    };

    value
        .to_str()
        .and_then(|v| v.trim().parse().ok())
        .map(Some)
        .ok_or_else(|| Error::InvalidArgument(format!("{name} must be a non-negative integer, got {}", value.display())))
}

/// Looks for the worker next to the running executable.
///
/// Test and example binaries live one level below the build directory (in `deps/` or
/// `examples/`), so the parent of that directory is searched as well.
fn default_worker_executable() -> PathBuf {
    let Ok(current) = env::current_exe() else {
        return PathBuf::from(WORKER_EXECUTABLE_NAME);
    };

    current
        .parent()
        .into_iter()
        .flat_map(|dir| [Some(dir), dir.parent()])
        .flatten()
        .map(|dir| dir.join(WORKER_EXECUTABLE_NAME))
        .find(|candidate| is_file(candidate))
        .unwrap_or_else(|| PathBuf::from(WORKER_EXECUTABLE_NAME))
}

fn is_file(path: &Path) -> bool {
    path.metadata().is_ok_and(|m| m.is_file())
}
