use std::{sync::Arc, time::Duration};

use reqwest::StatusCode;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while polling flag definitions or waiting for the client to become ready.
///
/// Evaluation never fails: poll errors are only observable through [`FlagEvent`]s and
/// [`Stats`](crate::Stats).
///
/// [`FlagEvent`]: crate::FlagEvent
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The flag service rejected our credentials. Polling stops permanently.
    #[error("unauthorized, api_key is likely invalid")]
    Unauthorized,

    /// The flag service answered with a non-2xx status other than 401.
    #[error("unexpected response status: {0}")]
    UnexpectedStatus(StatusCode),

    /// Network error, including request timeouts.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// Response body is not a mapping of flag slug to flag definition.
    #[error("invalid flag definitions")]
    InvalidFlags(#[source] Arc<serde_json::Error>),

    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// The client did not become ready within the requested time.
    #[error("client was not ready within {0:?}")]
    ReadyTimeout(Duration),

    /// The client was closed (or polling terminated) before any flags became available.
    #[error("client closed before flags became available")]
    Closed,

    /// Indicates that the poller thread panicked. This should normally never happen.
    #[error("poller thread panicked")]
    PollerThreadPanicked,

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),
}

impl Error {
    /// Returns `true` if a poll failing with this error must never be retried.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::Unauthorized)
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::InvalidFlags(Arc::new(value))
    }
}
