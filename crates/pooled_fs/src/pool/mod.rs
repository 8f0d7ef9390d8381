// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Worker bookkeeping and request scheduling.
//!
//! [`Pool`] is a plain state machine: every input (a submission, a frame from a worker, a
//! worker exit) returns the list of [`Action`]s the driver must perform. It never touches a
//! process or a channel itself, which keeps every scheduling rule testable without spawning
//! anything.

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::Instant;

use tracing::{Level, event};

use crate::error::{Error, Result};
use crate::protocol::{Frame, Payload, Request, RequestId};
use crate::worker::{ExitReason, Transition, WorkerId, WorkerState};

/// A successful result together with the worker that produced it.
pub(crate) type Served = (WorkerId, Payload);

/// Something the driver of the pool has to do.
#[derive(Debug)]
pub(crate) enum Action {
    /// Start a worker process under this id and report back with `spawned` or `spawn_failed`.
    Spawn(WorkerId),
    /// Write the request to the worker.
    Send { worker: WorkerId, request: Request },
    /// Resolve the caller waiting on the request.
    Settle { id: RequestId, result: Result<Served> },
    /// Close the worker's input so that it exits, and kill it if it does not exit in time.
    Terminate(WorkerId),
    /// Kill the worker right away.
    Kill(WorkerId),
}

/// A point-in-time view of one worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerInfo {
    /// Identifier of the worker within its pool.
    pub id: WorkerId,
    /// Operating system process id, once known.
    pub pid: Option<u32>,
    /// Lifecycle state.
    pub state: WorkerState,
}

/// A point-in-time view of a pool, as returned by [`Dispatcher::status`](crate::Dispatcher::status).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStatus {
    /// Every worker process the pool currently tracks, ordered by id.
    pub workers: Vec<WorkerInfo>,
    /// Requests waiting for a worker.
    pub queued: usize,
    /// Whether shutdown has started.
    pub closing: bool,
}

impl PoolStatus {
    /// Returns the number of workers in the given state.
    #[must_use]
    pub fn count(&self, predicate: impl Fn(WorkerState) -> bool) -> usize {
        self.workers.iter().filter(|w| predicate(w.state)).count()
    }
}

#[derive(Debug)]
struct Slot {
    state: WorkerState,
    pid: Option<u32>,
    in_flight_since: Option<Instant>,
    retiring: bool,
}

#[derive(Debug)]
pub(crate) struct Pool {
    max_workers: usize,
    workers: BTreeMap<WorkerId, Slot>,
    pending: VecDeque<Request>,
    next_worker: u64,
    closing: bool,
}

impl Pool {
    pub(crate) fn new(max_workers: usize) -> Self {
        Self {
            max_workers,
            workers: BTreeMap::new(),
            pending: VecDeque::new(),
            next_worker: 0,
            closing: false,
        }
    }

    /// Accepts a request for execution.
    pub(crate) fn submit(&mut self, request: Request) -> Vec<Action> {
        let mut actions = Vec::new();

        if self.closing {
            actions.push(Action::Settle {
                id: request.id,
                result: Err(Error::PoolClosing),
            });
            return actions;
        }

        if let Some(worker) = request.affinity
            && !self.workers.get(&worker).is_some_and(|slot| slot.state.is_alive() && !slot.retiring)
        {
            // The descriptor died with its worker.
            actions.push(Action::Settle {
                id: request.id,
                result: Err(Error::WorkerCrashed { request: request.id }),
            });
            return actions;
        }

        self.pending.push_back(request);
        self.schedule(&mut actions);
        actions
    }

    /// Records the process id of a worker that was started for a [`Action::Spawn`].
    pub(crate) fn spawned(&mut self, worker: WorkerId, pid: Option<u32>) {
        if let Some(slot) = self.workers.get_mut(&worker) {
            slot.pid = pid;
        }
    }

    /// Handles a worker that could not be started at all.
    pub(crate) fn spawn_failed(&mut self, worker: WorkerId, error: io::Error) -> Vec<Action> {
        let mut actions = Vec::new();
        let _ = self.workers.remove(&worker);

        event!(Level::WARN, message = "cannot start worker", worker = %worker, error = %error);
        self.reject_unpinned_if_no_worker_lives(&Arc::new(error), &mut actions);
        actions
    }

    /// Handles a frame decoded from a worker's output.
    pub(crate) fn frame(&mut self, worker: WorkerId, frame: Frame) -> Vec<Action> {
        let mut actions = Vec::new();

        match frame {
            Frame::Ready { pid } => {
                if let Err(e) = self.transition(worker, Transition::Ready) {
                    self.violation(worker, Error::Protocol(e.to_string()), &mut actions);
                    return actions;
                }
                if let Some(slot) = self.workers.get_mut(&worker) {
                    slot.pid = Some(pid);
                }
                event!(Level::DEBUG, message = "worker ready", worker = %worker, pid = pid);
                self.after_idle(worker, &mut actions);
            }
            Frame::Response { id, outcome } => {
                self.complete(worker, id, outcome.map_err(Error::from), &mut actions);
            }
            Frame::Request { id, .. } => {
                self.violation(worker, Error::Protocol(format!("worker sent request frame {id}")), &mut actions);
            }
        }

        actions
    }

    /// Handles a request that could not be written to the worker it was assigned to.
    pub(crate) fn undeliverable(&mut self, worker: WorkerId, id: RequestId, error: Error) -> Vec<Action> {
        let mut actions = Vec::new();
        self.complete(worker, id, Err(error), &mut actions);
        actions
    }

    /// Handles the end of a worker connection. The process has been reaped.
    pub(crate) fn exited(&mut self, worker: WorkerId, reason: ExitReason) -> Vec<Action> {
        let mut actions = Vec::new();
        let Some(slot) = self.workers.remove(&worker) else {
            return actions;
        };

        let violation = reason.into_violation();

        match slot.state {
            WorkerState::Busy(request) => {
                event!(Level::WARN, message = "worker died while busy", worker = %worker, request = %request);
                actions.push(Action::Settle {
                    id: request,
                    result: Err(violation.unwrap_or(Error::WorkerCrashed { request })),
                });
            }
            WorkerState::Starting => {
                let error = Arc::new(io::Error::other(match violation {
                    Some(e) => format!("worker failed during startup: {e}"),
                    None => "worker exited before becoming ready".to_string(),
                }));
                self.reject_unpinned_if_no_worker_lives(&error, &mut actions);
            }
            WorkerState::Idle | WorkerState::Dead => {}
        }

        self.reject_pinned_to(worker, &mut actions);
        self.schedule(&mut actions);
        actions
    }

    /// Starts shutdown: queued requests are rejected, workers finish their current request and
    /// are then terminated.
    pub(crate) fn shutdown(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.closing {
            return actions;
        }
        self.closing = true;

        for request in self.pending.drain(..) {
            actions.push(Action::Settle {
                id: request.id,
                result: Err(Error::PoolClosing),
            });
        }

        for (id, slot) in &mut self.workers {
            if matches!(slot.state, WorkerState::Starting | WorkerState::Idle) {
                slot.retiring = true;
                actions.push(Action::Terminate(*id));
            }
        }

        actions
    }

    /// Returns `true` once shutdown has started and every worker has been reaped.
    pub(crate) fn is_drained(&self) -> bool {
        self.closing && self.workers.is_empty()
    }

    pub(crate) fn status(&self) -> PoolStatus {
        PoolStatus {
            workers: self
                .workers
                .iter()
                .map(|(id, slot)| WorkerInfo {
                    id: *id,
                    pid: slot.pid,
                    state: slot.state,
                })
                .collect(),
            queued: self.pending.len(),
            closing: self.closing,
        }
    }

    fn transition(&mut self, worker: WorkerId, transition: Transition) -> std::result::Result<(), crate::worker::IllegalTransition> {
        let Some(slot) = self.workers.get_mut(&worker) else {
            return Ok(());
        };
        slot.state = slot.state.apply(transition)?;
        Ok(())
    }

    fn complete(&mut self, worker: WorkerId, id: RequestId, result: Result<Payload>, actions: &mut Vec<Action>) {
        if !self.workers.contains_key(&worker) {
            return;
        }

        if let Err(e) = self.transition(worker, Transition::Complete(id)) {
            self.violation(worker, Error::Protocol(e.to_string()), actions);
            return;
        }

        if let Some(slot) = self.workers.get_mut(&worker)
            && let Some(since) = slot.in_flight_since.take()
        {
            event!(
                Level::TRACE,
                message = "request completed",
                worker = %worker,
                request = %id,
                ok = result.is_ok(),
                elapsed_us = u64::try_from(since.elapsed().as_micros()).unwrap_or(u64::MAX)
            );
        }

        actions.push(Action::Settle {
            id,
            result: result.map(|payload| (worker, payload)),
        });
        self.after_idle(worker, actions);
    }

    fn after_idle(&mut self, worker: WorkerId, actions: &mut Vec<Action>) {
        if self.closing {
            if let Some(slot) = self.workers.get_mut(&worker)
                && !slot.retiring
            {
                slot.retiring = true;
                actions.push(Action::Terminate(worker));
            }
            return;
        }
        self.schedule(actions);
    }

    /// Marks a worker dead after it broke the protocol. Its in-flight request fails with `error`.
    fn violation(&mut self, worker: WorkerId, error: Error, actions: &mut Vec<Action>) {
        let Some(slot) = self.workers.get_mut(&worker) else {
            return;
        };

        event!(Level::WARN, message = "worker violated the protocol", worker = %worker, error = %error);

        if let Some(request) = slot.state.in_flight() {
            actions.push(Action::Settle {
                id: request,
                result: Err(error),
            });
        }

        // Fail is legal from every live state; a dead worker stays dead.
        slot.state = slot.state.apply(Transition::Fail).unwrap_or(WorkerState::Dead);
        slot.in_flight_since = None;
        actions.push(Action::Kill(worker));

        self.reject_pinned_to(worker, actions);
    }

    fn reject_pinned_to(&mut self, worker: WorkerId, actions: &mut Vec<Action>) {
        let mut kept = VecDeque::with_capacity(self.pending.len());
        for request in self.pending.drain(..) {
            if request.affinity == Some(worker) {
                actions.push(Action::Settle {
                    id: request.id,
                    result: Err(Error::WorkerCrashed { request: request.id }),
                });
            } else {
                kept.push_back(request);
            }
        }
        self.pending = kept;
    }

    fn reject_unpinned_if_no_worker_lives(&mut self, error: &Arc<io::Error>, actions: &mut Vec<Action>) {
        if self.workers.values().any(|slot| slot.state.is_alive()) {
            return;
        }

        let mut kept = VecDeque::new();
        for request in self.pending.drain(..) {
            if request.affinity.is_none() {
                actions.push(Action::Settle {
                    id: request.id,
                    result: Err(Error::Spawn(Arc::clone(error))),
                });
            } else {
                kept.push_back(request);
            }
        }
        self.pending = kept;
    }

    /// Hands queued requests to idle workers and spawns workers for what is left over.
    fn schedule(&mut self, actions: &mut Vec<Action>) {
        if self.closing {
            return;
        }

        for (id, slot) in &mut self.workers {
            if slot.state != WorkerState::Idle {
                continue;
            }

            let Some(position) = self
                .pending
                .iter()
                .position(|request| request.affinity.is_none_or(|worker| worker == *id))
            else {
                continue;
            };

            let Some(request) = self.pending.remove(position) else {
                continue;
            };

            match slot.state.apply(Transition::Assign(request.id)) {
                Ok(state) => {
                    slot.state = state;
                    slot.in_flight_since = Some(request.created_at);
                    actions.push(Action::Send { worker: *id, request });
                }
                Err(_) => self.pending.insert(position, request),
            }
        }

        let unpinned = self.pending.iter().filter(|request| request.affinity.is_none()).count();
        let mut starting = self.workers.values().filter(|slot| slot.state == WorkerState::Starting).count();

        while unpinned > starting && self.workers.len() < self.max_workers {
            let id = WorkerId::new(self.next_worker);
            self.next_worker += 1;

            let _ = self.workers.insert(
                id,
                Slot {
                    state: WorkerState::Starting,
                    pid: None,
                    in_flight_since: None,
                    retiring: false,
                },
            );
            starting += 1;
            actions.push(Action::Spawn(id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::protocol::{ErrorDescriptor, Operation, Value};

    fn request(id: u64) -> Request {
        Request::new(RequestId::new(id), Operation::Mkdir, vec![Value::path(format!("/tmp/{id}")), Value::U32(0o755)])
    }

    fn ok(id: u64) -> Frame {
        Frame::Response {
            id: RequestId::new(id),
            outcome: Ok(Payload::Unit),
        }
    }

    fn spawned(actions: &[Action]) -> Vec<u64> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Spawn(w) => Some(w.get()),
                _ => None,
            })
            .collect()
    }

    fn sent(actions: &[Action]) -> Vec<(u64, u64)> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send { worker, request } => Some((worker.get(), request.id.get())),
                _ => None,
            })
            .collect()
    }

    fn settled(actions: Vec<Action>) -> Vec<(u64, Result<Payload>)> {
        actions
            .into_iter()
            .filter_map(|a| match a {
                Action::Settle { id, result } => Some((id.get(), result.map(|(_, payload)| payload))),
                _ => None,
            })
            .collect()
    }

    fn ready(pool: &mut Pool, worker: u64) -> Vec<Action> {
        pool.frame(WorkerId::new(worker), Frame::Ready { pid: 1000 + u32::try_from(worker).unwrap() })
    }

    #[test]
    fn excess_requests_are_served_fifo_within_the_worker_limit() {
        let mut pool = Pool::new(2);

        assert_eq!(spawned(&pool.submit(request(1))), [0]);
        assert_eq!(spawned(&pool.submit(request(2))), [1]);
        assert!(spawned(&pool.submit(request(3))).is_empty());
        assert_eq!(pool.status().workers.len(), 2);
        assert_eq!(pool.status().queued, 3);

        assert_eq!(sent(&ready(&mut pool, 0)), [(0, 1)]);
        assert_eq!(sent(&ready(&mut pool, 1)), [(1, 2)]);
        assert_eq!(pool.status().queued, 1);

        let actions = pool.frame(WorkerId::new(1), ok(2));
        assert_eq!(sent(&actions), [(1, 3)]);
        let results = settled(actions);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, 2);

        let status = pool.status();
        assert_eq!(status.queued, 0);
        assert_eq!(status.count(|s| matches!(s, WorkerState::Busy(_))), 2);
    }

    #[test]
    fn idle_worker_takes_request_without_spawning() {
        let mut pool = Pool::new(4);
        let _ = pool.submit(request(1));
        let _ = ready(&mut pool, 0);
        let _ = pool.frame(WorkerId::new(0), ok(1));

        let actions = pool.submit(request(2));
        assert!(spawned(&actions).is_empty());
        assert_eq!(sent(&actions), [(0, 2)]);
    }

    #[test]
    fn native_failure_is_reported_to_the_caller_only() {
        let mut pool = Pool::new(1);
        let _ = pool.submit(request(1));
        let _ = ready(&mut pool, 0);

        let actions = pool.frame(
            WorkerId::new(0),
            Frame::Response {
                id: RequestId::new(1),
                outcome: Err(ErrorDescriptor::new(ErrorCode::AlreadyExists, "exists")),
            },
        );
        let results = settled(actions);
        assert!(results[0].1.as_ref().unwrap_err().is(ErrorCode::AlreadyExists));
        assert_eq!(pool.status().count(|s| s == WorkerState::Idle), 1);
    }

    #[test]
    fn crash_rejects_only_the_busy_request_and_respawns() {
        let mut pool = Pool::new(1);
        let _ = pool.submit(request(1));
        let _ = ready(&mut pool, 0);
        let _ = pool.submit(request(2));

        let actions = pool.exited(WorkerId::new(0), ExitReason::Eof);
        assert_eq!(spawned(&actions), [1]);
        let results = settled(actions);
        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0],
            (1, Err(Error::WorkerCrashed { request })) if request == RequestId::new(1)
        ));

        assert_eq!(sent(&ready(&mut pool, 1)), [(1, 2)]);
    }

    #[test]
    fn crash_is_logged_with_worker_and_request() {
        let capture = testing_aids::LogCapture::new();
        let mut pool = Pool::new(1);

        tracing::subscriber::with_default(capture.subscriber(), || {
            let _ = pool.submit(request(7));
            let _ = ready(&mut pool, 0);
            let _ = pool.exited(WorkerId::new(0), ExitReason::Killed);
        });

        capture.assert_contains("worker died while busy");
        capture.assert_contains("worker=w0");
        capture.assert_contains("request=#7");
    }

    #[test]
    fn success_reports_the_serving_worker() {
        let mut pool = Pool::new(2);
        let _ = pool.submit(request(1));
        let _ = pool.submit(request(2));
        let _ = ready(&mut pool, 0);
        let _ = ready(&mut pool, 1);

        let actions = pool.frame(WorkerId::new(1), ok(2));
        let served: Vec<_> = actions
            .into_iter()
            .filter_map(|a| match a {
                Action::Settle { id, result: Ok((worker, _)) } => Some((id.get(), worker.get())),
                _ => None,
            })
            .collect();
        assert_eq!(served, [(2, 1)]);
    }

    #[test]
    fn protocol_violation_fails_in_flight_request_and_kills_worker() {
        let mut pool = Pool::new(1);
        let _ = pool.submit(request(1));
        let _ = ready(&mut pool, 0);

        // Wrong id.
        let actions = pool.frame(WorkerId::new(0), ok(9));
        assert!(actions.iter().any(|a| matches!(a, Action::Kill(w) if w.get() == 0)));
        let results = settled(actions);
        assert!(matches!(results[0], (1, Err(Error::Protocol(_)))));
        assert_eq!(pool.status().count(|s| s == WorkerState::Dead), 1);

        // The dead worker still counts against the limit until it is reaped.
        assert!(spawned(&pool.submit(request(2))).is_empty());
        let actions = pool.exited(
            WorkerId::new(0),
            ExitReason::Violation(Error::Protocol("ignored".to_string())),
        );
        assert_eq!(spawned(&actions), [1]);
        assert!(settled(actions).is_empty());
    }

    #[test]
    fn pinned_requests_wait_for_their_worker() {
        let mut pool = Pool::new(2);
        let _ = pool.submit(request(1));
        let _ = ready(&mut pool, 0);

        let pinned = request(2).pinned_to(WorkerId::new(0));
        let actions = pool.submit(pinned);
        assert!(spawned(&actions).is_empty(), "pinned requests never spawn workers");
        assert!(sent(&actions).is_empty());

        let actions = pool.frame(WorkerId::new(0), ok(1));
        assert_eq!(sent(&actions), [(0, 2)]);
    }

    #[test]
    fn pinned_requests_fail_once_their_worker_is_gone() {
        let mut pool = Pool::new(2);
        let _ = pool.submit(request(1));
        let _ = ready(&mut pool, 0);
        let _ = pool.submit(request(2).pinned_to(WorkerId::new(0)));

        let results = settled(pool.exited(WorkerId::new(0), ExitReason::Killed));
        let ids: Vec<_> = results.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, [1, 2]);
        assert!(results.iter().all(|(_, r)| matches!(r, Err(Error::WorkerCrashed { .. }))));

        let results = settled(pool.submit(request(3).pinned_to(WorkerId::new(0))));
        assert!(matches!(results[0], (3, Err(Error::WorkerCrashed { .. }))));
    }

    #[test]
    fn spawn_failure_rejects_queued_requests_instead_of_hanging() {
        let mut pool = Pool::new(1);
        let _ = pool.submit(request(1));
        let _ = pool.submit(request(2));

        let results = settled(pool.spawn_failed(WorkerId::new(0), io::Error::from(io::ErrorKind::NotFound)));
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, r)| matches!(r, Err(Error::Spawn(_)))));
        assert_eq!(pool.status().queued, 0);
    }

    #[test]
    fn worker_dying_before_ready_with_others_alive_keeps_requests_queued() {
        let mut pool = Pool::new(2);
        let _ = pool.submit(request(1));
        let _ = pool.submit(request(2));
        let _ = ready(&mut pool, 1);

        let actions = pool.exited(WorkerId::new(0), ExitReason::Eof);
        assert!(settled(actions).is_empty());
    }

    #[test]
    fn shutdown_rejects_queue_and_drains_in_flight() {
        let mut pool = Pool::new(1);
        let _ = pool.submit(request(1));
        let _ = ready(&mut pool, 0);
        let _ = pool.submit(request(2));

        let actions = pool.shutdown();
        assert!(!actions.iter().any(|a| matches!(a, Action::Terminate(_))), "busy worker is left to finish");
        let results = settled(actions);
        assert!(matches!(results[0], (2, Err(Error::PoolClosing))));

        let results = settled(pool.submit(request(3)));
        assert!(matches!(results[0], (3, Err(Error::PoolClosing))));

        let actions = pool.frame(WorkerId::new(0), ok(1));
        assert!(actions.iter().any(|a| matches!(a, Action::Terminate(w) if w.get() == 0)));
        assert!(matches!(settled(actions)[0], (1, Ok(Payload::Unit))));

        assert!(!pool.is_drained());
        let _ = pool.exited(WorkerId::new(0), ExitReason::Eof);
        assert!(pool.is_drained());
    }

    #[test]
    fn shutdown_terminates_starting_workers_once() {
        let mut pool = Pool::new(1);
        let _ = pool.submit(request(1));

        let actions = pool.shutdown();
        assert!(actions.iter().any(|a| matches!(a, Action::Terminate(_))));

        let actions = ready(&mut pool, 0);
        assert!(actions.is_empty());
    }

    #[test]
    fn unsolicited_request_frame_is_a_violation() {
        let mut pool = Pool::new(1);
        let _ = pool.submit(request(1));
        let _ = ready(&mut pool, 0);

        let actions = pool.frame(
            WorkerId::new(0),
            Frame::Request {
                id: RequestId::new(5),
                operation: Operation::Stat,
                args: Vec::new(),
            },
        );
        assert!(actions.iter().any(|a| matches!(a, Action::Kill(_))));
    }
}
