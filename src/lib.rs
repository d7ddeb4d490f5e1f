//! A client-side feature flag evaluation cache.
//!
//! # Overview
//!
//! The crate revolves around a [`Client`] that keeps an in-memory [`Snapshot`] of flag
//! definitions and answers evaluation queries ([`Client::is_enabled`], [`Client::get_all_flags`],
//! [`Client::get_flag`]) synchronously from it. A background poller thread refreshes the snapshot
//! from the flag service, so evaluation never waits on the network.
//!
//! Each [`FlagEntry`] may carry per-user and per-organization targets. A matching user target wins
//! over a matching organization target, which wins over the flag's top-level `enabled` state.
//!
//! The poller fetches flags immediately on construction and then on a fixed interval (with
//! jitter). After failed polls it backs off exponentially, up to a minute. An unauthorized
//! response stops polling for good; the last cached flags remain available.
//!
//! # Events
//!
//! Subscribe with [`Client::subscribe`] (or [`ClientConfig::with_event_listener`] to observe the
//! very first poll) to receive [`FlagEvent`]s: a [`ChangeRecord`] for every flag a poll adds,
//! removes or modifies, and poll errors.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum. Evaluation never returns errors: a flag service
//! outage only means the client keeps serving the flags it cached last. Poll errors are reported
//! through events and [`Stats`].
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages under
//! the `runtime_flags` target. Consider integrating a `log`-compatible logger implementation for
//! better visibility into poller operations.

#![warn(rustdoc::missing_crate_level_docs)]

mod backoff;
mod changes;
mod client;
mod config;
mod error;
mod eval;
mod events;
mod flag;
mod flags_fetcher;
mod poller;
mod readiness;
mod snapshot;
mod snapshot_store;
mod stats;

pub use backoff::JitterSource;
pub use changes::{diff, ChangeKind, ChangeRecord};
pub use client::Client;
pub use config::ClientConfig;
pub use error::{Error, Result};
pub use events::{EventKind, EventListener, FlagEvent, ListenerId};
pub use flag::{EvaluationContext, FlagEntry, FlagMap, Target, Targets};
pub use flags_fetcher::{FlagsFetcher, HttpFetcherConfig, HttpFlagsFetcher};
pub use poller::PollerState;
pub use snapshot::Snapshot;
pub use stats::Stats;
