// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Asynchronous filesystem API backed by a pool of worker processes.
//!
//! Native filesystem calls block. This crate runs them in separate worker processes and turns
//! every call into a future that resolves on the caller's Tokio runtime, so a slow disk or a
//! hung network mount stalls one worker instead of the executor.
//!
//! The crate has three layers:
//!
//! 1. **The worker pool.** A [`Dispatcher`] owns up to
//!    [`max_workers`](PoolConfig::max_workers) child processes running the `pooled_fs_worker`
//!    binary. Requests travel to the workers as length-prefixed binary frames over their
//!    standard input and come back over their standard output. Each worker executes one request
//!    at a time; excess requests wait in a FIFO queue. A worker that dies takes only its
//!    current request down with it and is replaced on demand.
//!
//! 2. **Streams over open files.** A file opened through the pool lives in one worker, and
//!    every read and write on it is routed there. [`ReadableStream`] reads the file chunk by
//!    chunk, [`WritableStream`] queues writes and lands them in order with one in flight, and
//!    [`DuplexStream`] combines both.
//!
//! 3. **Nodes and trees.** [`Filesystem`] hands out [`Directory`] and [`File`] handles that
//!    borrow its [`Adapter`]. Directories can be removed, re-moded or re-owned as a whole tree;
//!    such operations run concurrently and report the first failure without rolling anything
//!    back.
//!
//! # Quick start
//!
//! ```no_run
//! use pooled_fs::{Filesystem, OpenOptions, PoolConfig};
//!
//! # async fn example() -> pooled_fs::Result<()> {
//! let fs = Filesystem::start(&tokio::runtime::Handle::current(), PoolConfig::from_env()?)?;
//!
//! let dir = fs.dir("/tmp/pooled-fs-demo");
//! dir.create_recursive().await?;
//!
//! let file = dir.file("greeting.txt");
//! file.put_contents("Hello!").await?;
//! assert_eq!(&file.contents().await?[..], b"Hello!");
//!
//! // Stream a file in chunks.
//! let mut stream = file.open(OpenOptions::new().read(true)).await?;
//! while let Some(chunk) = stream.read_chunk().await? {
//!     println!("{} bytes", chunk.len());
//! }
//! stream.close().await?;
//!
//! dir.remove_recursive().await?;
//! fs.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Workers
//!
//! The worker executable is located through [`PoolConfig::worker_executable`]. By default it is
//! looked up next to the current executable; the `POOLED_FS_WORKER` environment variable
//! overrides it when the configuration comes from [`PoolConfig::from_env`]. Workers log to
//! their standard error through `tracing`, filtered by `RUST_LOG`.
//!
//! Only Unix-like platforms are supported.

#[cfg(not(unix))]
compile_error!("pooled_fs supports Unix-like platforms only");

mod adapter;
mod config;
mod dispatcher;
mod error;
mod filesystem;
mod node;
mod open_options;
mod pool;
mod process_adapter;
pub mod protocol;
mod recursive;
mod service;
pub mod stream;
mod worker;

pub use adapter::{Adapter, Descriptor};
pub use config::{PoolConfig, WORKER_EXECUTABLE_NAME};
pub use dispatcher::Dispatcher;
pub use error::{Error, ErrorCode, Result};
pub use filesystem::Filesystem;
pub use node::{Directory, DirectorySize, File, Node};
pub use open_options::OpenOptions;
pub use pool::{PoolStatus, WorkerInfo};
pub use process_adapter::ProcessAdapter;
pub use protocol::{DirEntry, EntryKind, Stat};
pub use recursive::{AggregateResult, RecursiveOperation, TreeOps, run as run_recursive};
pub use service::serve;
pub use stream::{DescriptorIo, DuplexStream, FileStream, ReadableStream, StreamFactory, WritableStream, WriteCompletion};
pub use worker::{IllegalTransition, Transition, WorkerId, WorkerState};

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Dispatcher: Send, Sync, Clone);
    assert_impl_all!(ProcessAdapter: Send, Sync, Clone);
    assert_impl_all!(Filesystem: Send, Sync);
    assert_impl_all!(Error: Send, Sync);
    assert_impl_all!(Directory<'static, ProcessAdapter>: Send, Sync);
    assert_impl_all!(File<'static, ProcessAdapter>: Send, Sync);
    assert_impl_all!(ReadableStream<ProcessAdapter>: Send);
    assert_impl_all!(WritableStream<ProcessAdapter>: Send, Sync);
}
