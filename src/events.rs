//! Notifications emitted by the poller: flag changes, poll errors and terminal failure.
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, PoisonError, RwLock,
};

use crate::{ChangeRecord, Error};

/// An event emitted by the background poller.
#[derive(Debug, Clone)]
pub enum FlagEvent {
    /// A flag was added, removed or modified by a poll. Never emitted for the first poll.
    Change(ChangeRecord),
    /// A poll failed.
    Error(Error),
    /// A poll failed in a way that stops polling permanently. Always preceded by
    /// [`FlagEvent::Error`] carrying the same error.
    Failed(Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Change,
    Error,
    Failed,
}

impl FlagEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            FlagEvent::Change(_) => EventKind::Change,
            FlagEvent::Error(_) => EventKind::Error,
            FlagEvent::Failed(_) => EventKind::Failed,
        }
    }
}

/// Receives [`FlagEvent`]s. Called on the poller thread, so it should return quickly.
///
/// Implemented for any `Fn(&FlagEvent)`.
pub trait EventListener {
    fn on_event(&self, event: &FlagEvent);
}

impl<T: Fn(&FlagEvent)> EventListener for T {
    fn on_event(&self, event: &FlagEvent) {
        self(event);
    }
}

/// Handle returned by [`Client::subscribe`](crate::Client::subscribe), used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type SharedListener = Arc<dyn EventListener + Send + Sync>;

#[derive(Default)]
pub(crate) struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, SharedListener)>>,
}

impl ListenerRegistry {
    pub fn new() -> ListenerRegistry {
        ListenerRegistry::default()
    }

    pub fn subscribe(&self, listener: SharedListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    /// Returns `false` if `id` was not subscribed.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    pub fn emit(&self, event: &FlagEvent) {
        // Listeners run without the lock held so they may subscribe, unsubscribe or close the
        // client from inside the callback.
        let listeners: Vec<SharedListener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        log::trace!(target: "runtime_flags", listeners = listeners.len(); "emitting {:?}", event.kind());

        for listener in listeners {
            listener.on_event(event);
        }
    }
}
