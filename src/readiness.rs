//! One-shot broadcast signal that flags are available for evaluation.
use std::{
    sync::{Condvar, Mutex},
    time::Duration,
};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Pending,
    Ready,
    /// Polling stopped before any snapshot became available. Nothing will ever make us ready.
    Closed,
}

/// Every waiter is released once the gate opens, each with its own optional timeout. A waiter that
/// times out does not affect the gate or any other waiter.
pub(crate) struct ReadinessGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl ReadinessGate {
    pub fn new() -> ReadinessGate {
        ReadinessGate {
            state: Mutex::new(GateState::Pending),
            cond: Condvar::new(),
        }
    }

    /// Open the gate. Returns `true` if this call opened it.
    pub fn mark_ready(&self) -> bool {
        self.settle(GateState::Ready)
    }

    /// Release waiters with [`Error::Closed`] unless the gate already opened.
    pub fn close(&self) {
        self.settle(GateState::Closed);
    }

    pub fn is_ready(&self) -> bool {
        self.state
            .lock()
            .is_ok_and(|state| *state == GateState::Ready)
    }

    fn settle(&self, next: GateState) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if *state != GateState::Pending {
            return false;
        }
        *state = next;
        self.cond.notify_all();
        true
    }

    /// Block until the gate settles or `timeout` elapses.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        let state = self
            .state
            .lock()
            .map_err(|_| Error::PollerThreadPanicked)?;

        let state = match timeout {
            Some(timeout) => {
                let (state, _) = self
                    .cond
                    .wait_timeout_while(state, timeout, |state| *state == GateState::Pending)
                    .map_err(|_| Error::PollerThreadPanicked)?;
                state
            }
            None => self
                .cond
                .wait_while(state, |state| *state == GateState::Pending)
                .map_err(|_| Error::PollerThreadPanicked)?,
        };

        match *state {
            GateState::Ready => Ok(()),
            GateState::Closed => Err(Error::Closed),
            GateState::Pending => Err(Error::ReadyTimeout(timeout.unwrap_or_default())),
        }
    }
}
