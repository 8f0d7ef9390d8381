// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use thiserror::Error;

use crate::protocol::RequestId;

/// Lifecycle state of one worker process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkerState {
    /// The process was spawned but has not announced readiness yet.
    Starting,
    /// Ready and waiting for a request.
    Idle,
    /// Executing exactly one request.
    Busy(RequestId),
    /// Terminated, crashed or disconnected for a protocol violation. Terminal.
    Dead,
}

/// An event that moves a worker between states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// The worker sent its ready frame.
    Ready,
    /// A request was written to the worker.
    Assign(RequestId),
    /// The worker answered a request.
    Complete(RequestId),
    /// The worker exited, lost its pipes or violated the protocol.
    Fail,
}

/// A transition that is not allowed from the current state.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("illegal worker transition {transition:?} from state {from:?}")]
pub struct IllegalTransition {
    /// The state the worker was in.
    pub from: WorkerState,
    /// The rejected transition.
    pub transition: Transition,
}

impl WorkerState {
    /// Applies a transition, returning the new state.
    ///
    /// ```text
    /// Starting --Ready--------> Idle
    /// Idle     --Assign(r)----> Busy(r)
    /// Busy(r)  --Complete(r)--> Idle
    /// (live)   --Fail---------> Dead
    /// ```
    ///
    /// # Errors
    ///
    /// Every pair not listed above is rejected, including completing a request other than the
    /// one in flight and any transition out of [`Dead`](Self::Dead).
    pub fn apply(self, transition: Transition) -> Result<Self, IllegalTransition> {
        match (self, transition) {
            (Self::Starting, Transition::Ready) => Ok(Self::Idle),
            (Self::Idle, Transition::Assign(request)) => Ok(Self::Busy(request)),
            (Self::Busy(current), Transition::Complete(request)) if current == request => Ok(Self::Idle),
            (Self::Starting | Self::Idle | Self::Busy(_), Transition::Fail) => Ok(Self::Dead),
            (from, transition) => Err(IllegalTransition { from, transition }),
        }
    }

    /// Returns `true` unless the worker is dead.
    #[must_use]
    pub const fn is_alive(self) -> bool {
        !matches!(self, Self::Dead)
    }

    /// Returns the request in flight, if any.
    #[must_use]
    pub const fn in_flight(self) -> Option<RequestId> {
        match self {
            Self::Busy(request) => Some(request),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const R1: RequestId = RequestId::new(1);
    const R2: RequestId = RequestId::new(2);

    #[test]
    fn happy_path() {
        let state = WorkerState::Starting;
        let state = state.apply(Transition::Ready).unwrap();
        assert_eq!(state, WorkerState::Idle);

        let state = state.apply(Transition::Assign(R1)).unwrap();
        assert_eq!(state, WorkerState::Busy(R1));
        assert_eq!(state.in_flight(), Some(R1));

        let state = state.apply(Transition::Complete(R1)).unwrap();
        assert_eq!(state, WorkerState::Idle);
        assert_eq!(state.in_flight(), None);
    }

    #[test]
    fn every_live_state_can_fail() {
        for state in [WorkerState::Starting, WorkerState::Idle, WorkerState::Busy(R1)] {
            assert_eq!(state.apply(Transition::Fail), Ok(WorkerState::Dead));
        }
        assert!(!WorkerState::Dead.is_alive());
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let cases = [
            (WorkerState::Starting, Transition::Assign(R1)),
            (WorkerState::Starting, Transition::Complete(R1)),
            (WorkerState::Idle, Transition::Ready),
            (WorkerState::Idle, Transition::Complete(R1)),
            (WorkerState::Busy(R1), Transition::Ready),
            (WorkerState::Busy(R1), Transition::Assign(R2)),
            (WorkerState::Busy(R1), Transition::Complete(R2)),
            (WorkerState::Dead, Transition::Ready),
            (WorkerState::Dead, Transition::Assign(R1)),
            (WorkerState::Dead, Transition::Complete(R1)),
            (WorkerState::Dead, Transition::Fail),
        ];

        for (from, transition) in cases {
            let error = from.apply(transition).unwrap_err();
            assert_eq!(error, IllegalTransition { from, transition });
        }
    }
}
