// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures::FutureExt as _;
use futures::future::BoxFuture;
use tokio::runtime::Handle;

use crate::adapter::{Adapter, Descriptor};
use crate::config::PoolConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::open_options::OpenOptions;
use crate::protocol::{DirEntry, MAX_WRITE_LEN, Operation, Stat, Value};
use crate::stream::{DescriptorIo, FileStream, StreamFactory};

/// The [`Adapter`] backed by a pool of worker processes.
///
/// Every operation becomes one request to the pool. Operations on a [`Descriptor`] are sent to the
/// worker that opened it. A single [`write`](Adapter::write) carries at most
/// [`MAX_WRITE_LEN`](crate::protocol::MAX_WRITE_LEN) bytes; larger buffers are rejected with
/// [`Error::InvalidArgument`] before anything is sent. Streams split larger writes themselves.
///
/// # Examples
///
/// ```no_run
/// # async fn example() -> pooled_fs::Result<()> {
/// use pooled_fs::{Adapter, PoolConfig, ProcessAdapter};
///
/// let adapter = ProcessAdapter::start(&tokio::runtime::Handle::current(), PoolConfig::from_env()?)?;
/// let stat = adapter.stat("/etc/hosts".as_ref()).await?;
/// println!("{} bytes", stat.size);
/// adapter.shutdown().await;
/// # Ok(())
/// # }
/// ```
///
/// # Thread safety
///
/// This type is thread-safe.
#[derive(Clone, Debug)]
pub struct ProcessAdapter {
    dispatcher: Dispatcher,
}

impl ProcessAdapter {
    /// Starts a worker pool on the given runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`](crate::Error::InvalidArgument) if the configuration is
    /// invalid.
    pub fn start(handle: &Handle, config: PoolConfig) -> Result<Self> {
        Dispatcher::start(handle, config).map(Self::from_dispatcher)
    }

    /// Wraps an existing dispatcher.
    #[must_use]
    pub const fn from_dispatcher(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// Returns the dispatcher behind this adapter.
    #[must_use]
    pub const fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Opens a file and wraps it in the stream matching `options`.
    ///
    /// # Errors
    ///
    /// Returns the error of the open request.
    pub async fn open_stream(&self, path: impl AsRef<Path>, options: &OpenOptions) -> Result<FileStream<Self>> {
        let path = path.as_ref();
        let descriptor = self.open(path, options).await?;
        Ok(StreamFactory::create(path, descriptor, options, self.clone()))
    }

    /// Shuts the pool down. See [`Dispatcher::shutdown`].
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
    }

    fn read_request(&self, descriptor: Descriptor, offset: u64, len: usize) -> impl Future<Output = Result<Bytes>> + Send + use<> {
        let call = self.dispatcher.call_on(
            descriptor.worker(),
            Operation::Read,
            vec![Value::U64(descriptor.fd()), Value::U64(offset), Value::U64(len as u64)],
        );
        async move { call.await?.into_data().map(Bytes::from) }
    }

    fn write_request(&self, descriptor: Descriptor, offset: u64, data: &[u8]) -> impl Future<Output = Result<u64>> + Send + use<> {
        let len = data.len();
        let call = (len <= MAX_WRITE_LEN).then(|| {
            self.dispatcher.call_on(
                descriptor.worker(),
                Operation::Write,
                vec![Value::U64(descriptor.fd()), Value::U64(offset), Value::Bytes(data.to_vec())],
            )
        });
        async move {
            let Some(call) = call else {
                return Err(Error::InvalidArgument(format!(
                    "write of {len} bytes exceeds the {MAX_WRITE_LEN} byte request limit"
                )));
            };
            call.await?.into_written()
        }
    }

    fn close_request(&self, descriptor: Descriptor) -> impl Future<Output = Result<()>> + Send + use<> {
        let call = self
            .dispatcher
            .call_on(descriptor.worker(), Operation::Close, vec![Value::U64(descriptor.fd())]);
        async move { call.await?.into_unit() }
    }
}

impl Adapter for ProcessAdapter {
    fn open(&self, path: &Path, options: &OpenOptions) -> impl Future<Output = Result<Descriptor>> + Send {
        let call = self.dispatcher.call_with_worker(
            Operation::Open,
            vec![Value::path(path), Value::U32(options.to_bits()), Value::U32(options.creation_mode())],
        );
        async move {
            let (worker, payload) = call.await?;
            Ok(Descriptor::new(worker, payload.into_descriptor()?))
        }
    }

    fn close(&self, descriptor: Descriptor) -> impl Future<Output = Result<()>> + Send {
        self.close_request(descriptor)
    }

    fn read(&self, descriptor: Descriptor, offset: u64, len: usize) -> impl Future<Output = Result<Bytes>> + Send {
        self.read_request(descriptor, offset, len)
    }

    fn write(&self, descriptor: Descriptor, offset: u64, data: Bytes) -> impl Future<Output = Result<u64>> + Send {
        self.write_request(descriptor, offset, &data)
    }

    fn mkdir(&self, path: &Path, mode: u32) -> impl Future<Output = Result<()>> + Send {
        let call = self.dispatcher.call(Operation::Mkdir, vec![Value::path(path), Value::U32(mode)]);
        async move { call.await?.into_unit() }
    }

    fn rmdir(&self, path: &Path) -> impl Future<Output = Result<()>> + Send {
        let call = self.dispatcher.call(Operation::Rmdir, vec![Value::path(path)]);
        async move { call.await?.into_unit() }
    }

    fn unlink(&self, path: &Path) -> impl Future<Output = Result<()>> + Send {
        let call = self.dispatcher.call(Operation::Unlink, vec![Value::path(path)]);
        async move { call.await?.into_unit() }
    }

    fn rename(&self, from: &Path, to: &Path) -> impl Future<Output = Result<()>> + Send {
        let call = self.dispatcher.call(Operation::Rename, vec![Value::path(from), Value::path(to)]);
        async move { call.await?.into_unit() }
    }

    fn stat(&self, path: &Path) -> impl Future<Output = Result<Stat>> + Send {
        let call = self.dispatcher.call(Operation::Stat, vec![Value::path(path)]);
        async move { call.await?.into_stat() }
    }

    fn lstat(&self, path: &Path) -> impl Future<Output = Result<Stat>> + Send {
        let call = self.dispatcher.call(Operation::Lstat, vec![Value::path(path)]);
        async move { call.await?.into_stat() }
    }

    fn chmod(&self, path: &Path, mode: u32) -> impl Future<Output = Result<()>> + Send {
        let call = self.dispatcher.call(Operation::Chmod, vec![Value::path(path), Value::U32(mode)]);
        async move { call.await?.into_unit() }
    }

    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> impl Future<Output = Result<()>> + Send {
        let call = self
            .dispatcher
            .call(Operation::Chown, vec![Value::path(path), Value::opt_u32(uid), Value::opt_u32(gid)]);
        async move { call.await?.into_unit() }
    }

    fn touch(&self, path: &Path) -> impl Future<Output = Result<()>> + Send {
        let call = self.dispatcher.call(Operation::Touch, vec![Value::path(path)]);
        async move { call.await?.into_unit() }
    }

    fn symlink(&self, target: &Path, link: &Path) -> impl Future<Output = Result<()>> + Send {
        let call = self.dispatcher.call(Operation::Symlink, vec![Value::path(target), Value::path(link)]);
        async move { call.await?.into_unit() }
    }

    fn readlink(&self, path: &Path) -> impl Future<Output = Result<PathBuf>> + Send {
        let call = self.dispatcher.call(Operation::Readlink, vec![Value::path(path)]);
        async move { call.await?.into_path() }
    }

    fn link(&self, original: &Path, link: &Path) -> impl Future<Output = Result<()>> + Send {
        let call = self.dispatcher.call(Operation::Link, vec![Value::path(original), Value::path(link)]);
        async move { call.await?.into_unit() }
    }

    fn mkdtemp(&self, prefix: &Path) -> impl Future<Output = Result<PathBuf>> + Send {
        let call = self.dispatcher.call(Operation::Mkdtemp, vec![Value::path(prefix)]);
        async move { call.await?.into_path() }
    }

    fn list_directory(&self, path: &Path) -> impl Future<Output = Result<Vec<DirEntry>>> + Send {
        let call = self.dispatcher.call(Operation::ReadDir, vec![Value::path(path)]);
        async move { call.await?.into_entries() }
    }
}

impl DescriptorIo for ProcessAdapter {
    fn read_at(&self, descriptor: Descriptor, offset: u64, len: usize) -> BoxFuture<'static, Result<Bytes>> {
        self.read_request(descriptor, offset, len).boxed()
    }

    fn write_at(&self, descriptor: Descriptor, offset: u64, data: Bytes) -> BoxFuture<'static, Result<u64>> {
        self.write_request(descriptor, offset, &data).boxed()
    }

    fn close_descriptor(&self, descriptor: Descriptor) -> BoxFuture<'static, Result<()>> {
        self.close_request(descriptor).boxed()
    }

    fn spawn(&self, task: BoxFuture<'static, ()>) {
        drop(self.dispatcher.handle().spawn(task));
    }

    fn read_chunk_size(&self) -> usize {
        self.dispatcher.config().read_chunk_size
    }

    fn write_high_water_mark(&self) -> usize {
        self.dispatcher.config().write_high_water_mark
    }
}
