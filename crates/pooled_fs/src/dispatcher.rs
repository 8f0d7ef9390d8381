// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{Level, event};

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::pool::{Action, Pool, PoolStatus, Served};
use crate::protocol::{Frame, Operation, Payload, Request, RequestId, Value};
use crate::worker::{WorkerEvent, WorkerId, WorkerLink};

enum Command {
    Submit {
        request: Request,
        reply: oneshot::Sender<Result<Served>>,
    },
    Status(oneshot::Sender<PoolStatus>),
    Shutdown(oneshot::Sender<()>),
}

struct DispatcherInner {
    commands: mpsc::UnboundedSender<Command>,
    next_request: AtomicU64,
    handle: Handle,
    config: Arc<PoolConfig>,
}

/// Routes filesystem operations to a pool of worker processes.
///
/// Starting a dispatcher spawns a single control task on the supplied runtime. The control task
/// owns all pool state: it starts workers on demand (up to [`PoolConfig::max_workers`]), queues
/// requests while every worker is busy, writes each request to exactly one worker and resolves
/// each caller exactly once with the worker's answer.
///
/// Cloning a dispatcher is cheap; all clones share the same pool. Once the last clone is dropped,
/// the pool shuts down on its own, as if [`shutdown`](Self::shutdown) had been called.
///
/// # Thread safety
///
/// This type is thread-safe.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// Starts a pool on the given runtime.
    ///
    /// No worker is started until the first request arrives.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the configuration does not pass
    /// [`PoolConfig::validate`].
    pub fn start(handle: &Handle, config: PoolConfig) -> Result<Self> {
        config.validate()?;

        let config = Arc::new(config);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        event!(
            Level::DEBUG,
            message = "starting worker pool",
            max_workers = config.max_workers,
            worker_executable = %config.worker_executable.display()
        );

        let control = Control {
            pool: Pool::new(config.max_workers),
            config: Arc::clone(&config),
            handle: handle.clone(),
            links: HashMap::new(),
            waiting: HashMap::new(),
            events: events_tx,
            shutdown_waiters: Vec::new(),
        };
        drop(handle.spawn(control.run(commands_rx, events_rx)));

        Ok(Self {
            inner: Arc::new(DispatcherInner {
                commands: commands_tx,
                next_request: AtomicU64::new(1),
                handle: handle.clone(),
                config,
            }),
        })
    }

    /// Submits an operation to any available worker.
    ///
    /// The request is submitted when this method is called, not when the returned future is
    /// first polled, so calls made one after another are queued in that order. Dropping the
    /// future does not cancel the request; its result is discarded.
    ///
    /// # Errors
    ///
    /// Resolves to [`Error::Io`] if the operation failed in the worker, [`Error::WorkerCrashed`] or
    /// [`Error::Protocol`] if the worker was lost while executing it, [`Error::Spawn`] if no
    /// worker could be started and [`Error::PoolClosing`] after shutdown.
    pub fn call(&self, operation: Operation, args: Vec<Value>) -> impl Future<Output = Result<Payload>> + Send + use<> {
        let served = self.submit(Request::new(self.next_id(), operation, args));
        async move { served.await.map(|(_, payload)| payload) }
    }

    /// Like [`call`](Self::call), but also reports which worker executed the operation.
    ///
    /// Opening a file uses this, since later operations on the descriptor must reach the same
    /// worker.
    ///
    /// # Errors
    ///
    /// Same as [`call`](Self::call).
    pub fn call_with_worker(&self, operation: Operation, args: Vec<Value>) -> impl Future<Output = Result<(WorkerId, Payload)>> + Send + use<> {
        self.submit(Request::new(self.next_id(), operation, args))
    }

    /// Submits an operation to one specific worker, which must be alive.
    ///
    /// Operations on an open descriptor use this to reach the worker that owns it.
    ///
    /// # Errors
    ///
    /// Same as [`call`](Self::call). If the worker has died, resolves to
    /// [`Error::WorkerCrashed`].
    pub fn call_on(&self, worker: WorkerId, operation: Operation, args: Vec<Value>) -> impl Future<Output = Result<Payload>> + Send + use<> {
        let served = self.submit(Request::new(self.next_id(), operation, args).pinned_to(worker));
        async move { served.await.map(|(_, payload)| payload) }
    }

    /// Returns a snapshot of the workers and of the queue.
    ///
    /// After the pool has fully shut down, an empty closing status is returned.
    pub async fn status(&self) -> PoolStatus {
        let (reply, status) = oneshot::channel();
        if self.inner.commands.send(Command::Status(reply)).is_err() {
            return closed_status();
        }
        status.await.unwrap_or_else(|_| closed_status())
    }

    /// Shuts the pool down and waits until every worker process has exited.
    ///
    /// Queued requests and later submissions are rejected with [`Error::PoolClosing`]. Requests
    /// already executing are allowed to finish; then each worker's input is closed and the worker
    /// is killed if it does not exit within [`PoolConfig::shutdown_grace`].
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self.inner.commands.send(Command::Shutdown(reply)).is_ok() {
            let _ = done.await;
        }
    }

    /// Returns the configuration the pool was started with.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Returns the runtime the pool runs on.
    #[must_use]
    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    fn next_id(&self) -> RequestId {
        RequestId::new(self.inner.next_request.fetch_add(1, Ordering::Relaxed))
    }

    fn submit(&self, request: Request) -> impl Future<Output = Result<Served>> + Send + use<> {
        let (reply, response) = oneshot::channel();
        let submitted = self.inner.commands.send(Command::Submit { request, reply }).is_ok();

        async move {
            if !submitted {
                return Err(Error::PoolClosing);
            }
            // The control task drops the sender only when it stops.
            response.await.unwrap_or_else(|_| Err(Error::PoolClosing))
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("max_workers", &self.inner.config.max_workers)
            .field("next_request", &self.inner.next_request.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn closed_status() -> PoolStatus {
    PoolStatus {
        closing: true,
        ..PoolStatus::default()
    }
}

/// The single task that owns the pool, the worker links and the table of waiting callers.
struct Control {
    pool: Pool,
    config: Arc<PoolConfig>,
    handle: Handle,
    links: HashMap<WorkerId, WorkerLink>,
    waiting: HashMap<RequestId, oneshot::Sender<Result<Served>>>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
}

impl Control {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, mut events: mpsc::UnboundedReceiver<WorkerEvent>) {
        let mut accepting = true;

        loop {
            tokio::select! {
                command = commands.recv(), if accepting => match command {
                    Some(command) => self.command(command),
                    None => {
                        event!(Level::DEBUG, message = "all dispatcher handles dropped, shutting down");
                        accepting = false;
                        let actions = self.pool.shutdown();
                        self.perform(actions);
                    }
                },
                Some(worker_event) = events.recv() => self.worker_event(worker_event),
                else => break,
            }

            if self.pool.is_drained() {
                for waiter in self.shutdown_waiters.drain(..) {
                    let _ = waiter.send(());
                }
                if !accepting {
                    break;
                }
            }
        }

        event!(Level::DEBUG, message = "worker pool stopped");
    }

    fn command(&mut self, command: Command) {
        match command {
            Command::Submit { request, reply } => {
                let _ = self.waiting.insert(request.id, reply);
                let actions = self.pool.submit(request);
                self.perform(actions);
            }
            Command::Status(reply) => {
                let _ = reply.send(self.pool.status());
            }
            Command::Shutdown(reply) => {
                event!(Level::DEBUG, message = "shutting down worker pool");
                self.shutdown_waiters.push(reply);
                let actions = self.pool.shutdown();
                self.perform(actions);
            }
        }
    }

    fn worker_event(&mut self, worker_event: WorkerEvent) {
        let actions = match worker_event {
            WorkerEvent::Frame { worker, frame } => self.pool.frame(worker, frame),
            WorkerEvent::Exited { worker, reason } => {
                let _ = self.links.remove(&worker);
                self.pool.exited(worker, reason)
            }
        };
        self.perform(actions);
    }

    fn perform(&mut self, actions: Vec<Action>) {
        let mut queue = VecDeque::from(actions);

        while let Some(action) = queue.pop_front() {
            match action {
                Action::Spawn(worker) => {
                    match WorkerLink::spawn(worker, &self.config.worker_executable, &self.handle, self.events.clone()) {
                        Ok(link) => {
                            self.pool.spawned(worker, link.pid());
                            let _ = self.links.insert(link.id(), link);
                        }
                        Err(e) => queue.extend(self.pool.spawn_failed(worker, e)),
                    }
                }
                Action::Send { worker, request } => {
                    let id = request.id;
                    let frame = Frame::Request {
                        id,
                        operation: request.operation,
                        args: request.args,
                    };
                    let sent = match self.links.get(&worker) {
                        Some(link) => link.send(&frame),
                        None => Err(Error::Protocol(format!("no connection to worker {worker}"))),
                    };
                    if let Err(e) = sent {
                        queue.extend(self.pool.undeliverable(worker, id, e));
                    }
                }
                Action::Settle { id, result } => {
                    // A missing entry means the caller is gone; the result is discarded.
                    if let Some(reply) = self.waiting.remove(&id) {
                        let _ = reply.send(result);
                    }
                }
                Action::Terminate(worker) => {
                    if let Some(link) = self.links.get_mut(&worker) {
                        link.close_stdin();
                        if let Some(kill) = link.take_kill_switch() {
                            let grace = self.config.shutdown_grace;
                            drop(self.handle.spawn(async move {
                                tokio::time::sleep(grace).await;
                                let _ = kill.send(());
                            }));
                        }
                    }
                }
                Action::Kill(worker) => {
                    if let Some(link) = self.links.get_mut(&worker) {
                        link.kill();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    #[test]
    fn thread_safe_type() {
        assert_impl_all!(Dispatcher: Send, Sync, Clone);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let error = Dispatcher::start(&Handle::current(), PoolConfig::new().with_max_workers(0)).unwrap_err();
        assert!(matches!(error, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn missing_worker_executable_fails_requests_instead_of_hanging() {
        let config = PoolConfig::new().with_worker_executable("/nonexistent/pooled_fs_worker");
        let dispatcher = Dispatcher::start(&Handle::current(), config).unwrap();

        let error = dispatcher.call(Operation::Stat, vec![Value::path("/")]).await.unwrap_err();
        assert!(matches!(error, Error::Spawn(_)));

        let status = dispatcher.status().await;
        assert!(status.workers.is_empty());
        assert_eq!(status.queued, 0);
    }

    #[tokio::test]
    async fn shutdown_without_workers_completes_and_rejects_later_calls() {
        let dispatcher = Dispatcher::start(&Handle::current(), PoolConfig::new()).unwrap();
        dispatcher.shutdown().await;

        let error = dispatcher.call(Operation::Stat, vec![Value::path("/")]).await.unwrap_err();
        assert!(matches!(error, Error::PoolClosing));
        assert!(dispatcher.status().await.closing);
    }

    #[tokio::test]
    async fn request_ids_increase() {
        let dispatcher = Dispatcher::start(&Handle::current(), PoolConfig::new()).unwrap();
        let first = dispatcher.next_id();
        let second = dispatcher.next_id();
        assert!(second > first);
    }
}
