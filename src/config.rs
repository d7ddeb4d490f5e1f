use std::{sync::Arc, time::Duration};

use crate::{
    backoff::{thread_rng_jitter, JitterSource},
    events::EventListener,
    Client, FlagsFetcher, Result, Snapshot,
};

/// Configuration for [`Client`].
///
/// ```
/// # use std::time::Duration;
/// # use runtime_flags::ClientConfig;
/// let config = ClientConfig::from_api_key("api-key")
///     .with_polling_interval(Duration::from_secs(10))
///     .with_request_timeout(Duration::from_secs(2));
/// ```
pub struct ClientConfig {
    pub(crate) api_key: String,
    pub(crate) base_url: String,
    pub(crate) polling_interval: Duration,
    pub(crate) request_timeout: Duration,
    pub(crate) bootstrap_flags: Option<Snapshot>,
    pub(crate) jitter_source: JitterSource,
    pub(crate) listeners: Vec<Arc<dyn EventListener + Send + Sync>>,
}

impl ClientConfig {
    /// Default base URL for API calls.
    pub const DEFAULT_BASE_URL: &'static str = "https://flags.example.com/api";
    /// Default value for the polling interval.
    pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(30);
    /// Polling intervals below this are raised to it.
    pub const MIN_POLLING_INTERVAL: Duration = Duration::from_secs(5);
    /// Default bound on a single poll request.
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

    /// Create a default configuration using the specified API key.
    pub fn from_api_key(api_key: impl Into<String>) -> ClientConfig {
        ClientConfig {
            api_key: api_key.into(),
            base_url: ClientConfig::DEFAULT_BASE_URL.to_owned(),
            polling_interval: ClientConfig::DEFAULT_POLLING_INTERVAL,
            request_timeout: ClientConfig::DEFAULT_REQUEST_TIMEOUT,
            bootstrap_flags: None,
            jitter_source: thread_rng_jitter(),
            listeners: Vec::new(),
        }
    }

    /// Override base URL for API calls. Clients should use the default setting in most cases.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> ClientConfig {
        self.base_url = base_url.into();
        self
    }

    /// Set the steady-state delay between polls. Values below
    /// [`ClientConfig::MIN_POLLING_INTERVAL`] are silently raised to it.
    pub fn with_polling_interval(mut self, interval: Duration) -> ClientConfig {
        self.polling_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> ClientConfig {
        self.request_timeout = timeout;
        self
    }

    /// Seed the cache before the first poll completes. The client is ready immediately.
    pub fn with_bootstrap_flags(mut self, flags: impl Into<Snapshot>) -> ClientConfig {
        self.bootstrap_flags = Some(flags.into());
        self
    }

    /// Replace the randomness used for poll jitter. `source` must return values in `[0, 1)`.
    pub fn with_jitter_source(mut self, source: impl Fn() -> f64 + Send + Sync + 'static) -> ClientConfig {
        self.jitter_source = Arc::new(source);
        self
    }

    /// Register an event listener before polling starts, so it observes the first poll too.
    pub fn with_event_listener(
        mut self,
        listener: impl EventListener + Send + Sync + 'static,
    ) -> ClientConfig {
        self.listeners.push(Arc::new(listener));
        self
    }

    /// The polling interval after applying [`ClientConfig::MIN_POLLING_INTERVAL`].
    pub fn effective_polling_interval(&self) -> Duration {
        self.polling_interval.max(ClientConfig::MIN_POLLING_INTERVAL)
    }

    /// Create a [`Client`] polling the flag service over HTTP.
    pub fn to_client(self) -> Result<Client> {
        Client::new(self)
    }

    /// Create a [`Client`] polling `fetcher`.
    pub fn to_client_with_fetcher(self, fetcher: impl FlagsFetcher) -> Result<Client> {
        Client::with_fetcher(self, fetcher)
    }
}
