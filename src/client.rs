use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;

use crate::{
    backoff::{BackoffController, BackoffPolicy},
    events::{EventListener, FlagEvent, ListenerId},
    flags_fetcher::{HttpFetcherConfig, HttpFlagsFetcher},
    poller::{PollerState, PollerThread, Shared},
    ChangeRecord, ClientConfig, Error, EvaluationContext, FlagEntry, FlagsFetcher, Result,
    Snapshot, Stats,
};

/// A feature flag client that evaluates flags from an in-memory snapshot kept fresh by a
/// background poller thread.
///
/// Evaluation never blocks on the network and never fails: while no flags are available, or
/// after polling failed, the client answers from whatever was last cached.
///
/// `Client` is cheap to clone. Polling stops when [`Client::close`] is called or the last clone is
/// dropped.
///
/// # Examples
/// ```no_run
/// # use std::time::Duration;
/// # use runtime_flags::{ClientConfig, EvaluationContext};
/// let client = ClientConfig::from_api_key("api-key").to_client()?;
/// client.wait_until_ready(Some(Duration::from_secs(5)))?;
///
/// let context = EvaluationContext::new().with_user_id("user-1");
/// if client.is_enabled("new-checkout", Some(&context)) {
///     // ...
/// }
/// # Ok::<(), runtime_flags::Error>(())
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    shared: Arc<Shared>,
    poller: PollerThread,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shared.close();
        self.poller.stop();
    }
}

impl Client {
    /// Create a client polling the flag service over HTTP and start polling.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidBaseUrl`] if the configured base URL is invalid.
    /// - [`Error::Network`] if the HTTP client can't be initialized.
    /// - [`Error::Io`] if the poller thread failed to start.
    pub fn new(config: ClientConfig) -> Result<Client> {
        let fetcher = HttpFlagsFetcher::new(HttpFetcherConfig {
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            request_timeout: config.request_timeout,
            sdk_name: "rust".to_owned(),
            sdk_version: env!("CARGO_PKG_VERSION").to_owned(),
        })?;

        Client::with_fetcher(config, fetcher)
    }

    /// Create a client polling `fetcher` and start polling.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if the poller thread failed to start.
    pub fn with_fetcher(config: ClientConfig, fetcher: impl FlagsFetcher) -> Result<Client> {
        let policy = BackoffPolicy::new(config.effective_polling_interval());
        Client::start(config, fetcher, policy)
    }

    pub(crate) fn start(
        config: ClientConfig,
        fetcher: impl FlagsFetcher,
        policy: BackoffPolicy,
    ) -> Result<Client> {
        let ClientConfig {
            bootstrap_flags,
            jitter_source,
            listeners,
            ..
        } = config;

        let shared = Arc::new(Shared::new(bootstrap_flags));
        for listener in listeners {
            shared.listeners.subscribe(listener);
        }

        let backoff = BackoffController::new(policy, jitter_source);
        let poller = PollerThread::start(fetcher, shared.clone(), backoff)?;

        log::debug!(target: "runtime_flags",
                    interval_ms = policy.interval.as_millis() as u64,
                    bootstrapped = shared.gate.is_ready();
                    "started flag poller");

        Ok(Client {
            inner: Arc::new(ClientInner { shared, poller }),
        })
    }

    fn shared(&self) -> &Shared {
        &self.inner.shared
    }

    /// Evaluate `slug` for `context`. Returns `false` if the flag is unknown.
    pub fn is_enabled(&self, slug: &str, context: Option<&EvaluationContext>) -> bool {
        self.is_enabled_or(slug, context, false)
    }

    /// Evaluate `slug` for `context`. Returns `fallback_if_missing` if the flag is unknown or no
    /// flags have been loaded yet.
    pub fn is_enabled_or(
        &self,
        slug: &str,
        context: Option<&EvaluationContext>,
        fallback_if_missing: bool,
    ) -> bool {
        let Some(snapshot) = self.snapshot() else {
            log::warn!(target: "runtime_flags", slug; "evaluating a flag before flags have been fetched");
            return fallback_if_missing;
        };

        let enabled = snapshot.is_enabled(slug, context, fallback_if_missing);

        log::trace!(target: "runtime_flags", slug, enabled; "evaluated a flag");

        enabled
    }

    /// Evaluate every known flag for `context`.
    pub fn get_all_flags(&self, context: Option<&EvaluationContext>) -> HashMap<String, bool> {
        self.snapshot()
            .map(|snapshot| snapshot.eval_all(context))
            .unwrap_or_default()
    }

    /// Raw flag definition, without evaluation.
    pub fn get_flag(&self, slug: &str) -> Option<FlagEntry> {
        self.snapshot()?.get(slug).cloned()
    }

    /// The currently active snapshot, `None` until bootstrap flags or the first successful poll.
    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.shared().store.current()
    }

    pub fn get_stats(&self) -> Stats {
        self.shared().stats.read(Utc::now())
    }

    pub fn poller_state(&self) -> PollerState {
        self.shared().state()
    }

    /// Whether flags are available, from bootstrap or a successful poll.
    pub fn is_ready(&self) -> bool {
        self.shared().gate.is_ready()
    }

    /// Block until flags are available.
    ///
    /// A timeout only affects this call: polling carries on, and a later call can still succeed.
    ///
    /// # Errors
    ///
    /// - [`Error::ReadyTimeout`] if `timeout` elapsed first.
    /// - [`Error::Closed`] if the client was closed, or polling stopped for good, before any flags
    ///   became available.
    pub fn wait_until_ready(&self, timeout: Option<Duration>) -> Result<()> {
        self.shared().gate.wait(timeout)
    }

    /// Receive every [`FlagEvent`]. Listeners run on the poller thread.
    pub fn subscribe(&self, listener: impl EventListener + Send + Sync + 'static) -> ListenerId {
        self.shared().listeners.subscribe(Arc::new(listener))
    }

    /// Returns `false` if `id` was not subscribed.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.shared().listeners.unsubscribe(id)
    }

    /// Receive flag changes. Called after the new snapshot is installed, so evaluating from the
    /// callback observes the updated flags.
    pub fn on_change(&self, f: impl Fn(&ChangeRecord) + Send + Sync + 'static) -> ListenerId {
        self.subscribe(move |event: &FlagEvent| {
            if let FlagEvent::Change(change) = event {
                f(change);
            }
        })
    }

    /// Receive poll errors, terminal or not.
    pub fn on_error(&self, f: impl Fn(&Error) + Send + Sync + 'static) -> ListenerId {
        self.subscribe(move |event: &FlagEvent| {
            if let FlagEvent::Error(err) = event {
                f(err);
            }
        })
    }

    /// Receive the failure that stopped polling permanently.
    pub fn on_failed(&self, f: impl Fn(&Error) + Send + Sync + 'static) -> ListenerId {
        self.subscribe(move |event: &FlagEvent| {
            if let FlagEvent::Failed(err) = event {
                f(err);
            }
        })
    }

    /// Stop polling. Cached flags remain available for evaluation.
    ///
    /// Takes effect immediately: a pending timer is cancelled and the result of an in-flight
    /// fetch is discarded. Safe to call repeatedly and from event listeners.
    pub fn close(&self) {
        if self.shared().close() {
            log::debug!(target: "runtime_flags", "closing client");
        }
        self.inner.poller.stop();
    }

    pub fn is_closed(&self) -> bool {
        self.shared().is_closed()
    }

    /// Close the client and block waiting for the poller thread to exit.
    ///
    /// If you don't need to wait for the thread to exit, use [`Client::close`] instead.
    ///
    /// # Errors
    ///
    /// - [`Error::PollerThreadPanicked`] if the poller thread has panicked.
    pub fn shutdown(&self) -> Result<()> {
        self.close();
        self.inner.poller.join()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            mpsc::{sync_channel, SyncSender},
            Arc, Mutex,
        },
        time::{Duration, Instant},
    };

    use reqwest::StatusCode;

    use super::Client;
    use crate::{
        backoff::BackoffPolicy, changes::ChangeKind, events::EventKind, flag::FlagMap,
        ClientConfig, Error, EvaluationContext, FlagEntry, FlagEvent, FlagsFetcher, PollerState,
        Result,
    };

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    fn fast_policy(interval: Duration) -> BackoffPolicy {
        BackoffPolicy {
            interval,
            initial_backoff: ms(5),
            max_backoff: ms(40),
            jitter: Duration::ZERO,
        }
    }

    fn config() -> ClientConfig {
        let _ = env_logger::builder().is_test(true).try_init();
        ClientConfig::from_api_key("test-key").with_jitter_source(|| 0.5)
    }

    fn flags(entries: impl IntoIterator<Item = FlagEntry>) -> FlagMap {
        entries
            .into_iter()
            .map(|entry| (entry.slug.clone(), entry))
            .collect()
    }

    /// A fetcher that blocks until the test sends the next poll result.
    fn scripted() -> (SyncSender<Result<FlagMap>>, impl FlagsFetcher) {
        let (sender, receiver) = sync_channel(16);
        let fetcher = move || receiver.recv().unwrap_or(Err(Error::Closed));
        (sender, fetcher)
    }

    /// A fetcher that always returns `result` and counts calls.
    fn counting(result: Result<FlagMap>) -> (Arc<AtomicUsize>, impl FlagsFetcher) {
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = {
            let calls = calls.clone();
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
                result.clone()
            }
        };
        (calls, fetcher)
    }

    fn recorder() -> (
        Arc<Mutex<Vec<FlagEvent>>>,
        impl Fn(&FlagEvent) + Send + Sync + 'static,
    ) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let listener = {
            let events = events.clone();
            move |event: &FlagEvent| events.lock().unwrap().push(event.clone())
        };
        (events, listener)
    }

    fn wait_for(what: &str, condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(ms(2));
        }
    }

    fn kinds(events: &Mutex<Vec<FlagEvent>>) -> Vec<EventKind> {
        events.lock().unwrap().iter().map(FlagEvent::kind).collect()
    }

    #[test]
    fn evaluates_with_fallback_before_any_flags() {
        let (_sender, fetcher) = scripted();
        let client = Client::start(config(), fetcher, fast_policy(ms(20))).unwrap();

        assert!(!client.is_ready());
        assert!(!client.is_enabled("a", None));
        assert!(client.is_enabled_or("a", None, true));
        assert!(client.get_all_flags(None).is_empty());
        assert_eq!(client.get_flag("a"), None);
        assert_eq!(client.get_stats().cache_age, None);
    }

    #[test]
    fn bootstrap_is_replaced_by_first_poll_without_change_events() {
        let (sender, fetcher) = scripted();
        let (events, listener) = recorder();
        let config = config()
            .with_bootstrap_flags(flags([FlagEntry::new("a", true)]))
            .with_event_listener(listener);
        let client = Client::start(config, fetcher, fast_policy(ms(20))).unwrap();

        assert!(client.is_ready());
        assert!(client.is_enabled("a", None));
        assert_eq!(client.get_stats().flag_count, 1);

        sender
            .send(Ok(flags([FlagEntry::new("a", false), FlagEntry::new("b", true)])))
            .unwrap();
        wait_for("first poll", || client.get_stats().poll_count == 1);

        assert!(!client.is_enabled("a", None));
        assert!(client.is_enabled("b", None));
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn later_polls_emit_change_events() {
        let (sender, fetcher) = scripted();
        let (events, listener) = recorder();
        let config = config().with_event_listener(listener);
        let client = Client::start(config, fetcher, fast_policy(ms(20))).unwrap();

        sender
            .send(Ok(flags([
                FlagEntry::new("a", true),
                FlagEntry::new("b", true),
                FlagEntry::new("c", true),
            ])))
            .unwrap();
        client.wait_until_ready(Some(Duration::from_secs(5))).unwrap();
        assert!(events.lock().unwrap().is_empty());

        sender
            .send(Ok(flags([
                FlagEntry::new("a", false),
                FlagEntry::new("c", true),
                FlagEntry::new("d", true),
            ])))
            .unwrap();
        wait_for("change events", || events.lock().unwrap().len() == 3);

        let changes: Vec<_> = events
            .lock()
            .unwrap()
            .iter()
            .map(|event| match event {
                FlagEvent::Change(change) => (change.key.clone(), change.kind()),
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(
            changes,
            vec![
                ("a".to_owned(), ChangeKind::Modified),
                ("b".to_owned(), ChangeKind::Removed),
                ("d".to_owned(), ChangeKind::Added),
            ]
        );
    }

    #[test]
    fn change_listener_observes_updated_snapshot() {
        let (sender, fetcher) = scripted();
        let client = Client::start(config(), fetcher, fast_policy(ms(20))).unwrap();

        let observed = Arc::new(Mutex::new(Vec::new()));
        {
            let observed = observed.clone();
            let evaluator = client.clone();
            client.on_change(move |change| {
                let enabled = evaluator.is_enabled(&change.key, None);
                observed.lock().unwrap().push((change.key.clone(), enabled));
            });
        }

        sender.send(Ok(flags([FlagEntry::new("a", false)]))).unwrap();
        sender.send(Ok(flags([FlagEntry::new("a", true)]))).unwrap();
        wait_for("change event", || !observed.lock().unwrap().is_empty());

        assert_eq!(*observed.lock().unwrap(), vec![("a".to_owned(), true)]);
        client.close();
    }

    #[test]
    fn targeting_applies_to_polled_flags() {
        let (sender, fetcher) = scripted();
        let client = Client::start(config(), fetcher, fast_policy(ms(20))).unwrap();

        sender
            .send(Ok(flags([FlagEntry::new("beta", false)
                .with_user_target("alice", true)
                .with_organization_target("acme", true)])))
            .unwrap();
        client.wait_until_ready(None).unwrap();

        let alice = EvaluationContext::new().with_user_id("alice");
        let acme = EvaluationContext::new().with_organization_id("acme");
        assert!(client.is_enabled("beta", Some(&alice)));
        assert!(client.is_enabled("beta", Some(&acme)));
        assert!(!client.is_enabled("beta", None));
        assert_eq!(client.get_all_flags(Some(&alice)), client.get_all_flags(Some(&alice)));
        assert_eq!(client.get_flag("beta").map(|flag| flag.enabled), Some(false));
    }

    #[test]
    fn retryable_errors_back_off_then_recover() {
        let (sender, fetcher) = scripted();
        let (events, listener) = recorder();
        let client = Client::start(
            config().with_event_listener(listener),
            fetcher,
            fast_policy(ms(20)),
        )
        .unwrap();

        sender
            .send(Err(Error::UnexpectedStatus(StatusCode::SERVICE_UNAVAILABLE)))
            .unwrap();
        wait_for("first failure", || client.get_stats().poll_error_count == 1);
        sender
            .send(Err(serde_json::from_str::<u8>("x").unwrap_err().into()))
            .unwrap();
        sender.send(Ok(flags([FlagEntry::new("a", true)]))).unwrap();

        client.wait_until_ready(Some(Duration::from_secs(5))).unwrap();
        wait_for("third poll", || client.get_stats().poll_count == 3);

        let stats = client.get_stats();
        assert_eq!(stats.poll_error_count, 2);
        assert_eq!(stats.flag_count, 1);
        assert!(stats.last_successful_poll_at.is_some());
        assert!(stats.cache_age.is_some());
        assert_eq!(kinds(&events), vec![EventKind::Error, EventKind::Error]);
        assert!(client.is_enabled("a", None));
    }

    #[test]
    fn unauthorized_stops_polling_for_good() {
        let (calls, fetcher) = counting(Err(Error::Unauthorized));
        let (events, listener) = recorder();
        let client = Client::start(
            config().with_event_listener(listener),
            fetcher,
            fast_policy(ms(20)),
        )
        .unwrap();

        wait_for("terminal state", || {
            client.poller_state() == PollerState::Terminal
        });
        assert!(matches!(client.wait_until_ready(None), Err(Error::Closed)));

        std::thread::sleep(ms(200));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(kinds(&events), vec![EventKind::Error, EventKind::Failed]);
        let stats = client.get_stats();
        assert_eq!(stats.poll_count, 1);
        assert_eq!(stats.poll_error_count, 1);
        assert!(!client.is_closed());
    }

    #[test]
    fn unauthorized_keeps_bootstrap_flags() {
        let (_calls, fetcher) = counting(Err(Error::Unauthorized));
        let config = config().with_bootstrap_flags(flags([FlagEntry::new("a", true)]));
        let client = Client::start(config, fetcher, fast_policy(ms(20))).unwrap();

        wait_for("terminal state", || {
            client.poller_state() == PollerState::Terminal
        });

        assert!(client.wait_until_ready(None).is_ok());
        assert!(client.is_enabled("a", None));
    }

    #[test]
    fn ready_timeout_does_not_affect_polling() {
        let (sender, fetcher) = scripted();
        let client = Client::start(config(), fetcher, fast_policy(ms(20))).unwrap();

        let started = Instant::now();
        let result = client.wait_until_ready(Some(ms(100)));

        assert!(matches!(result, Err(Error::ReadyTimeout(_))));
        assert!(started.elapsed() >= ms(100));
        assert_eq!(client.poller_state(), PollerState::Polling);

        sender.send(Ok(flags([FlagEntry::new("a", true)]))).unwrap();
        assert!(client.wait_until_ready(Some(Duration::from_secs(5))).is_ok());
    }

    #[test]
    fn close_during_backoff_prevents_further_fetches() {
        let (calls, fetcher) = counting(Err(Error::UnexpectedStatus(
            StatusCode::INTERNAL_SERVER_ERROR,
        )));
        let (events, listener) = recorder();
        let client = Client::start(
            config().with_event_listener(listener),
            fetcher,
            fast_policy(ms(300)),
        )
        .unwrap();

        wait_for("first error", || events.lock().unwrap().len() == 1);
        assert_eq!(client.poller_state(), PollerState::Backoff);
        client.close();
        std::thread::sleep(ms(600));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.poller_state(), PollerState::Terminal);
        assert_eq!(kinds(&events), vec![EventKind::Error]);
        assert!(client.shutdown().is_ok());
    }

    #[test]
    fn close_discards_in_flight_poll() {
        let (sender, fetcher) = scripted();
        let (events, listener) = recorder();
        let client = Client::start(
            config().with_event_listener(listener),
            fetcher,
            fast_policy(ms(20)),
        )
        .unwrap();

        wait_for("fetch in flight", || {
            client.poller_state() == PollerState::Polling
        });
        client.close();
        sender.send(Ok(flags([FlagEntry::new("a", true)]))).unwrap();
        client.shutdown().unwrap();

        assert!(client.snapshot().is_none());
        assert_eq!(client.get_stats().poll_count, 0);
        assert!(events.lock().unwrap().is_empty());
        assert!(matches!(client.wait_until_ready(None), Err(Error::Closed)));
    }

    #[test]
    fn nothing_changes_once_close_returns() {
        let outcomes = [
            Ok(flags([FlagEntry::new("a", true)])),
            Err(Error::UnexpectedStatus(StatusCode::BAD_GATEWAY)),
        ];

        for outcome in outcomes {
            for _ in 0..200 {
                // Zero delays keep the poller committing results back to back.
                let mut policy = fast_policy(Duration::ZERO);
                policy.initial_backoff = Duration::ZERO;
                let (calls, fetcher) = counting(outcome.clone());
                let client = Client::start(config(), fetcher, policy).unwrap();
                wait_for("first poll", || calls.load(Ordering::SeqCst) > 0);

                client.close();
                let stats = client.get_stats();
                let snapshot = client.snapshot();
                std::thread::sleep(ms(3));

                let later = client.get_stats();
                assert_eq!(later.poll_count, stats.poll_count);
                assert_eq!(later.poll_error_count, stats.poll_error_count);
                match (snapshot, client.snapshot()) {
                    (Some(before), Some(after)) => assert!(Arc::ptr_eq(&before, &after)),
                    (None, None) => {}
                    _ => panic!("snapshot replaced after close"),
                }
                assert_eq!(client.poller_state(), PollerState::Terminal);
                client.shutdown().unwrap();
            }
        }
    }

    #[test]
    fn close_from_listener_is_idempotent() {
        let (calls, mut fetcher) =
            counting(Err(Error::UnexpectedStatus(StatusCode::BAD_GATEWAY)));
        let (sender, receiver) = sync_channel::<()>(1);
        let gated = move || {
            // Hold the first poll until the listener has a client handle.
            let _ = receiver.recv();
            fetcher.fetch_flags()
        };
        let client = Client::start(config(), gated, fast_policy(ms(20))).unwrap();

        let slot = Arc::new(Mutex::new(None::<Client>));
        {
            let slot = slot.clone();
            client.on_error(move |_| {
                if let Some(client) = slot.lock().unwrap().take() {
                    client.close();
                    client.close();
                }
            });
        }
        *slot.lock().unwrap() = Some(client.clone());
        sender.send(()).unwrap();

        wait_for("close from listener", || client.is_closed());
        std::thread::sleep(ms(100));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        client.close();
        assert!(client.shutdown().is_ok());
    }

    #[test]
    fn dropping_last_handle_stops_polling() {
        let (calls, fetcher) = counting(Ok(flags([FlagEntry::new("a", true)])));
        let client = Client::start(config(), fetcher, fast_policy(ms(20))).unwrap();

        client.wait_until_ready(Some(Duration::from_secs(5))).unwrap();
        let before = calls.load(Ordering::SeqCst);
        drop(client);
        std::thread::sleep(ms(100));

        assert!(calls.load(Ordering::SeqCst) <= before + 1);
    }

    #[test]
    fn polling_interval_is_clamped_to_minimum() {
        let (calls, fetcher) = counting(Ok(FlagMap::new()));
        let config = config().with_polling_interval(ms(1000));
        let client = Client::with_fetcher(config, fetcher).unwrap();

        client.wait_until_ready(Some(Duration::from_secs(5))).unwrap();
        std::thread::sleep(ms(1500));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.poller_state(), PollerState::Scheduled);
        client.shutdown().unwrap();
    }
}
