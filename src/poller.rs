//! The background poller thread that periodically fetches flag definitions and installs them into
//! the snapshot store.
//!
//! The poller is a small state machine:
//!
//! ```text
//! Idle -> Polling -> Scheduled -> Polling -> ...
//!                 -> Backoff   -> Polling -> ...
//!                 -> Terminal
//! ```
//!
//! `Terminal` is entered on an unauthorized response or when the client is closed, from any state.
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::JoinHandle,
    time::Duration,
};

use chrono::Utc;

use crate::{
    backoff::BackoffController,
    changes::diff,
    events::{FlagEvent, ListenerRegistry},
    flag::FlagMap,
    readiness::ReadinessGate,
    snapshot_store::SnapshotStore,
    stats::StatsCollector,
    Error, FlagsFetcher, Result, Snapshot,
};

/// Where the poller currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollerState {
    /// Constructed, first poll not started yet.
    Idle,
    /// A fetch is in flight.
    Polling,
    /// Waiting the steady-state interval after a successful poll.
    Scheduled,
    /// Waiting a backoff delay after a failed poll.
    Backoff,
    /// Polling has stopped for good.
    Terminal,
}

/// State shared between the poller thread and client handles.
pub(crate) struct Shared {
    pub store: SnapshotStore,
    pub stats: StatsCollector,
    pub gate: ReadinessGate,
    pub listeners: ListenerRegistry,
    state: Mutex<PollerState>,
    closed: AtomicBool,
}

impl Shared {
    pub fn new(bootstrap: Option<Snapshot>) -> Shared {
        let store = SnapshotStore::new();
        let gate = ReadinessGate::new();
        let flag_count = bootstrap.as_ref().map_or(0, Snapshot::len);

        if let Some(bootstrap) = bootstrap {
            store.replace(Arc::new(bootstrap));
            gate.mark_ready();
        }

        Shared {
            store,
            stats: StatsCollector::new(flag_count),
            gate,
            listeners: ListenerRegistry::new(),
            state: Mutex::new(PollerState::Idle),
            closed: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> PollerState {
        *self.lock_state()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Mark the client closed. No polls, events or stats updates happen afterwards. Returns
    /// `true` for the call that actually closed it.
    pub fn close(&self) -> bool {
        {
            // Taken before flipping `closed` so that a poll result being committed right now either
            // lands entirely before this returns or not at all.
            let mut state = self.lock_state();
            if self.closed.swap(true, Ordering::SeqCst) {
                return false;
            }
            *state = PollerState::Terminal;
        }
        self.gate.close();
        true
    }

    fn terminate(&self) {
        self.transition(PollerState::Terminal);
        self.gate.close();
    }

    fn transition(&self, next: PollerState) {
        let mut state = self.lock_state();
        // Nothing leaves Terminal.
        if *state != PollerState::Terminal {
            *state = next;
        }
    }

    /// Apply the outcome of a poll with `apply` and move to `next`, unless the client is closed or
    /// polling already stopped. Runs under the state lock, so it never interleaves with `close()`.
    ///
    /// `apply` must not call back into listeners.
    fn commit<T>(&self, next: PollerState, apply: impl FnOnce() -> T) -> Option<T> {
        let mut state = self.lock_state();
        if self.is_closed() || *state == PollerState::Terminal {
            return None;
        }
        let value = apply();
        *state = next;
        Some(value)
    }

    fn lock_state(&self) -> MutexGuard<'_, PollerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: FlagEvent) {
        if !self.is_closed() {
            self.listeners.emit(&event);
        }
    }
}

/// Handle to the poller thread.
pub(crate) struct PollerThread {
    join_handle: Mutex<Option<JoinHandle<()>>>,

    /// Used to interrupt the inter-poll sleep.
    stop_sender: SyncSender<()>,
}

impl PollerThread {
    /// Spawn the poller thread. The first poll starts immediately.
    pub fn start<F: FlagsFetcher>(
        fetcher: F,
        shared: Arc<Shared>,
        backoff: BackoffController,
    ) -> std::io::Result<PollerThread> {
        // Buffer size of 1 is enough: a stop command is sent with `try_send()`, and a full buffer
        // means another stop command is already pending.
        let (stop_sender, stop_receiver) = sync_channel::<()>(1);

        let join_handle = std::thread::Builder::new()
            .name("runtime-flags-poller".to_owned())
            .spawn(move || {
                let poller = Poller {
                    fetcher,
                    shared: shared.clone(),
                    backoff,
                    stop_receiver,
                    has_polled: false,
                };

                let result = catch_unwind(AssertUnwindSafe(|| poller.run()));

                if result.is_err() {
                    log::error!(target: "runtime_flags", "poller thread panicked, polling stopped");
                    shared.terminate();
                }
            })?;

        Ok(PollerThread {
            join_handle: Mutex::new(Some(join_handle)),
            stop_sender,
        })
    }

    /// Wake the poller thread so it notices the client is closed. Does not wait for it to exit.
    pub fn stop(&self) {
        // Error means that the receiver was dropped (thread exited) or the buffer is full (stop
        // already requested). Either way there's nothing left to do.
        let _ = self.stop_sender.try_send(());
    }

    /// Block until the poller thread exits. Blocks for as long as an in-flight fetch takes.
    pub fn join(&self) -> Result<()> {
        let handle = self
            .join_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(handle) = handle else {
            return Ok(());
        };

        if handle.thread().id() == std::thread::current().id() {
            // Called from an event listener. The thread exits once the listener returns.
            return Ok(());
        }

        handle.join().map_err(|_| Error::PollerThreadPanicked)
    }
}

struct Poller<F> {
    fetcher: F,
    shared: Arc<Shared>,
    backoff: BackoffController,
    stop_receiver: Receiver<()>,
    /// Whether a poll has succeeded before. The first successful poll populates the cache and
    /// does not produce change events.
    has_polled: bool,
}

impl<F: FlagsFetcher> Poller<F> {
    fn run(mut self) {
        let mut delay = Duration::ZERO;

        loop {
            if !delay.is_zero() && !self.sleep(delay) {
                return;
            }
            if self.shared.is_closed() {
                return;
            }

            self.shared.transition(PollerState::Polling);
            log::debug!(target: "runtime_flags", "polling flag definitions");
            let result = self.fetcher.fetch_flags();

            let next = match result {
                Ok(flags) => self.on_success(flags),
                Err(err) if err.is_terminal() => {
                    self.on_terminal_failure(err);
                    return;
                }
                Err(err) => self.on_failure(err),
            };

            match next {
                Some(next) => delay = next,
                None => {
                    log::debug!(target: "runtime_flags", "client closed during poll, discarding result");
                    return;
                }
            }
        }
    }

    /// Wait for `delay`. Returns `false` if the poller should stop instead.
    fn sleep(&self, delay: Duration) -> bool {
        match self.stop_receiver.recv_timeout(delay) {
            Err(RecvTimeoutError::Timeout) => true,
            Ok(()) => {
                log::debug!(target: "runtime_flags", "poller thread received stop command");
                false
            }
            Err(RecvTimeoutError::Disconnected) => {
                log::debug!(target: "runtime_flags", "poller thread received disconnected");
                false
            }
        }
    }

    /// Install a freshly fetched snapshot. Returns the delay until the next poll, or `None` if the
    /// client was closed first.
    fn on_success(&mut self, flags: FlagMap) -> Option<Duration> {
        let now = Utc::now();
        let snapshot = Arc::new(Snapshot::with_captured_at(flags, now));

        let shared = &self.shared;
        let previous = shared.commit(PollerState::Scheduled, || {
            let previous = shared.store.replace(snapshot.clone());
            shared.stats.record_success(now, snapshot.len());
            if shared.gate.mark_ready() {
                log::debug!(target: "runtime_flags", "client is ready");
            }
            previous
        })?;

        let changes = match (self.has_polled, previous) {
            (true, Some(previous)) => diff(&previous, &snapshot),
            (true, None) => diff(&Snapshot::empty(), &snapshot),
            (false, _) => Vec::new(),
        };
        self.has_polled = true;
        let delay = self.backoff.on_success();

        log::debug!(target: "runtime_flags",
                    flag_count = snapshot.len(),
                    changes = changes.len(),
                    delay_ms = delay.as_millis() as u64;
                    "installed new flag snapshot");

        for change in changes {
            self.shared.emit(FlagEvent::Change(change));
        }

        Some(delay)
    }

    fn on_failure(&mut self, err: Error) -> Option<Duration> {
        let shared = &self.shared;
        shared.commit(PollerState::Backoff, || shared.stats.record_failure(Utc::now()))?;
        let delay = self.backoff.on_failure();

        log::warn!(target: "runtime_flags",
                   consecutive_errors = self.backoff.consecutive_errors(),
                   delay_ms = delay.as_millis() as u64;
                   "error while polling flag definitions: {}", err);

        self.shared.emit(FlagEvent::Error(err));

        Some(delay)
    }

    fn on_terminal_failure(&mut self, err: Error) {
        let shared = &self.shared;
        if shared
            .commit(PollerState::Terminal, || shared.stats.record_failure(Utc::now()))
            .is_none()
        {
            return;
        }

        log::warn!(target: "runtime_flags", "polling stopped permanently: {}", err);

        self.shared.gate.close();
        self.shared.emit(FlagEvent::Error(err.clone()));
        self.shared.emit(FlagEvent::Failed(err));
    }
}
