//! Fetching flag definitions from the flag service.
use std::time::Duration;

use reqwest::{StatusCode, Url};

use crate::{
    flag::{decode_flags, FlagMap},
    Error, Result,
};

/// Source of flag definitions polled by the client.
///
/// [`HttpFlagsFetcher`] is the production implementation. Any `FnMut() -> Result<FlagMap>`
/// closure is a fetcher too, which is handy for tests and custom transports.
///
/// A fetch that fails with [`Error::Unauthorized`] stops polling for good; any other error is
/// retried with backoff.
pub trait FlagsFetcher: Send + 'static {
    fn fetch_flags(&mut self) -> Result<FlagMap>;
}

impl<F> FlagsFetcher for F
where
    F: FnMut() -> Result<FlagMap> + Send + 'static,
{
    fn fetch_flags(&mut self) -> Result<FlagMap> {
        self()
    }
}

pub struct HttpFetcherConfig {
    pub base_url: String,
    pub api_key: String,
    /// Bound on the whole request, connection included.
    pub request_timeout: Duration,
    /// SDK name reported to the flag service.
    pub sdk_name: String,
    /// SDK version reported to the flag service.
    pub sdk_version: String,
}

const POLL_ENDPOINT: &str = "/flags/poll";

/// Fetches flag definitions with a `GET` against the flag service polling endpoint.
///
/// Once the service answers 401, every later call fails with [`Error::Unauthorized`] without
/// touching the network.
pub struct HttpFlagsFetcher {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::blocking::Client,
    url: Url,
    api_key: String,
    /// If we receive a 401 Unauthorized error during a request, it means the API key is not
    /// valid. We cache this error so we don't issue additional requests to the server.
    ///
    /// Only matters when the fetcher is driven directly: a [`Client`](crate::Client) stops
    /// polling after the first `Unauthorized` and never calls it again.
    unauthorized: bool,
}

impl HttpFlagsFetcher {
    /// # Errors
    ///
    /// - [`Error::InvalidBaseUrl`] if `base_url` can't be parsed.
    /// - [`Error::Network`] if the HTTP client can't be initialized.
    pub fn new(config: HttpFetcherConfig) -> Result<HttpFlagsFetcher> {
        let url = Url::parse_with_params(
            &format!("{}{}", config.base_url.trim_end_matches('/'), POLL_ENDPOINT),
            &[
                ("sdkName", &*config.sdk_name),
                ("sdkVersion", &*config.sdk_version),
            ],
        )
        .map_err(Error::InvalidBaseUrl)?;

        let client = reqwest::blocking::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(HttpFlagsFetcher {
            client,
            url,
            api_key: config.api_key,
            unauthorized: false,
        })
    }
}

impl FlagsFetcher for HttpFlagsFetcher {
    fn fetch_flags(&mut self) -> Result<FlagMap> {
        if self.unauthorized {
            return Err(Error::Unauthorized);
        }

        log::debug!(target: "runtime_flags", "fetching flag definitions");
        let response = self
            .client
            .get(self.url.clone())
            .bearer_auth(&self.api_key)
            .send()?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::UNAUTHORIZED => {
                log::warn!(target: "runtime_flags", "client is not authorized. Check your API key");
                self.unauthorized = true;
                return Err(Error::Unauthorized);
            }
            status => {
                log::warn!(target: "runtime_flags", status:display = status; "received non-2xx response while fetching flag definitions");
                return Err(Error::UnexpectedStatus(status));
            }
        }

        let body = response.bytes()?;
        let flags = decode_flags(&body)?;

        log::debug!(target: "runtime_flags", flag_count = flags.len(); "successfully fetched flag definitions");

        Ok(flags)
    }
}
