//! # engine::fetch
//!
//! Windowed tick fetching with a fixed-delay retry.
//!
//! A failed fetch never fails the cycle on its own: it is retried every
//! `retry.delay` until it succeeds, until the optional attempt bound runs out,
//! or until shutdown is requested.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tokio::sync::watch;
use tracing::warn;

use crate::error::WatchError;
use crate::models::Tick;
use crate::sources::{AdminChannel, TickSource};

/// Fixed-delay retry, optionally bounded.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

/// Window sizes for steady-state and bootstrap fetches.
#[derive(Debug, Clone, Copy)]
pub struct FetchSettings {
    pub interval: Duration,
    /// Base window every cycle reaches back over (the interval is added).
    pub window: Duration,
    /// Extra reach for the one-time bootstrap fetch.
    pub bootstrap_lookback: Duration,
    pub retry: RetryPolicy,
}

impl FetchSettings {
    fn steady_since(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - to_chrono(self.window) - to_chrono(self.interval)
    }

    fn bootstrap_since(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.steady_since(now) - to_chrono(self.bootstrap_lookback)
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis().min(i64::MAX as u128) as i64)
}

/// How much of a window to pull.
#[derive(Debug, Clone, Copy)]
enum Reach {
    Full,
    Latest,
}

// ─── TickFetcher ──────────────────────────────────────────────────────────────

/// The engine's handle on the tick source.
#[derive(Clone)]
pub struct TickFetcher {
    source: Arc<dyn TickSource>,
    admin: Arc<dyn AdminChannel>,
    settings: FetchSettings,
    shutdown: watch::Receiver<bool>,
}

impl TickFetcher {
    pub fn new(
        source: Arc<dyn TickSource>,
        admin: Arc<dyn AdminChannel>,
        settings: FetchSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self { source, admin, settings, shutdown }
    }

    /// The steady-state window ending at `now`.
    pub async fn fetch_recent(&self, market: &str, now: DateTime<Utc>) -> Result<Vec<Tick>, WatchError> {
        self.fetch_with_retry(market, self.settings.steady_since(now), now, Reach::Full).await
    }

    /// The newest trades of the deep bootstrap window ending at `now`.
    pub async fn fetch_bootstrap(&self, market: &str, now: DateTime<Utc>) -> Result<Vec<Tick>, WatchError> {
        self.fetch_with_retry(market, self.settings.bootstrap_since(now), now, Reach::Latest).await
    }

    /// Steady-state windows for every market, fetched concurrently.  Returns
    /// only once every fetch has finished, in the order `markets` was given.
    pub async fn fetch_recent_all(
        &self,
        markets: &[String],
        now: DateTime<Utc>,
    ) -> Result<Vec<(String, Vec<Tick>)>, WatchError> {
        let pulls = join_all(markets.iter().map(|m| self.fetch_recent(m, now))).await;

        markets
            .iter()
            .cloned()
            .zip(pulls)
            .map(|(market, pull)| pull.map(|ticks| (market, ticks)))
            .collect()
    }

    async fn fetch_with_retry(
        &self,
        market: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        reach: Reach,
    ) -> Result<Vec<Tick>, WatchError> {
        let mut shutdown = self.shutdown.clone();
        let mut attempts: u32 = 0;

        loop {
            let pull = match reach {
                Reach::Full => self.source.fetch(market, since, until).await,
                Reach::Latest => self.source.fetch_latest(market, since, until).await,
            };
            let err = match pull {
                Ok(ticks) => return Ok(ticks),
                Err(e) => e,
            };
            attempts += 1;

            warn!(market = %market, attempts, error = %err, "Tick fetch failed — retrying");
            if attempts == 1 {
                self.admin.report_failure(&err.to_string()).await;
            }

            if self.settings.retry.max_attempts.is_some_and(|max| attempts >= max) {
                return Err(WatchError::RetriesExhausted { market: market.to_string(), attempts });
            }
            if *shutdown.borrow() {
                return Err(WatchError::Cancelled(market.to_string()));
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.retry.delay) => {}
                Ok(()) = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Err(WatchError::Cancelled(market.to_string()));
                    }
                }
            }
        }
    }
}
