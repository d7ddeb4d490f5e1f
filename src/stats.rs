use std::{
    sync::{Mutex, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};

/// Poll counters, as returned by [`Client::get_stats`](crate::Client::get_stats).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    /// Number of poll attempts, successful or not.
    pub poll_count: u64,
    /// Number of failed poll attempts.
    pub poll_error_count: u64,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_successful_poll_at: Option<DateTime<Utc>>,
    /// Number of flags in the current snapshot.
    pub flag_count: usize,
    /// Time since the last successful poll. `None` if no poll has succeeded yet.
    pub cache_age: Option<Duration>,
}

#[derive(Debug, Default)]
struct Counters {
    poll_count: u64,
    poll_error_count: u64,
    last_poll_at: Option<DateTime<Utc>>,
    last_successful_poll_at: Option<DateTime<Utc>>,
    flag_count: usize,
}

/// Written only by the poller thread, once per poll attempt. Reads copy the counters out.
#[derive(Debug, Default)]
pub(crate) struct StatsCollector {
    counters: Mutex<Counters>,
}

impl StatsCollector {
    pub fn new(initial_flag_count: usize) -> StatsCollector {
        StatsCollector {
            counters: Mutex::new(Counters {
                flag_count: initial_flag_count,
                ..Counters::default()
            }),
        }
    }

    pub fn record_success(&self, at: DateTime<Utc>, flag_count: usize) {
        let mut counters = self.lock();
        counters.poll_count += 1;
        counters.last_poll_at = Some(at);
        counters.last_successful_poll_at = Some(at);
        counters.flag_count = flag_count;
    }

    pub fn record_failure(&self, at: DateTime<Utc>) {
        let mut counters = self.lock();
        counters.poll_count += 1;
        counters.poll_error_count += 1;
        counters.last_poll_at = Some(at);
    }

    pub fn read(&self, now: DateTime<Utc>) -> Stats {
        let counters = self.lock();
        Stats {
            poll_count: counters.poll_count,
            poll_error_count: counters.poll_error_count,
            last_poll_at: counters.last_poll_at,
            last_successful_poll_at: counters.last_successful_poll_at,
            flag_count: counters.flag_count,
            cache_age: counters
                .last_successful_poll_at
                .map(|at| (now - at).to_std().unwrap_or_default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
