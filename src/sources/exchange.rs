//! # sources::exchange
//!
//! REST trade feed in the FTX public-API shape.
//!
//! ```text
//! GET {base}/markets/{market}/trades?start_time={s}&end_time={s}
//! → { "success": true,
//!     "result": [ { "id": 1, "price": 41000.5, "size": 0.02, "side": "buy",
//!                   "liquidation": false,
//!                   "time": "2021-11-02T10:21:04.123456+00:00" }, … ] }
//! ```
//!
//! The endpoint returns the newest trades first and at most one page per
//! call, so the window is walked backwards by `end_time` until a short page
//! comes back or the start of the window is reached.  Bootstrap pulls stop
//! after the first page.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::WatchError;
use crate::models::Tick;
use crate::sources::TickSource;

#[derive(Debug, Deserialize)]
struct TradesResponse {
    success: bool,
    #[serde(default)]
    result: Vec<Tick>,
    #[serde(default)]
    error: Option<String>,
}

pub struct RestTickSource {
    client: reqwest::Client,
    base_url: String,
    page_limit: usize,
}

impl RestTickSource {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, page_limit: usize) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            page_limit: page_limit.max(1),
        }
    }

    async fn fetch_page(
        &self,
        market: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Tick>, WatchError> {
        let url = format!(
            "{}/markets/{}/trades?start_time={}&end_time={}",
            self.base_url,
            market,
            as_secs(since),
            as_secs(until),
        );
        let fetch_err = |message: String| WatchError::Fetch { market: market.to_string(), message };

        let resp = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| fetch_err(format!("exchange unreachable: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(fetch_err(format!("HTTP {status}: {body}")));
        }

        let body: TradesResponse = resp
            .json()
            .await
            .map_err(|e| fetch_err(format!("bad trades payload: {e}")))?;

        parse_page(market, body)
    }
}

fn parse_page(market: &str, body: TradesResponse) -> Result<Vec<Tick>, WatchError> {
    if !body.success {
        return Err(WatchError::Fetch {
            market: market.to_string(),
            message: body.error.unwrap_or_else(|| "exchange reported failure".to_string()),
        });
    }
    Ok(body.result)
}

fn as_secs(t: DateTime<Utc>) -> String {
    format!("{:.6}", t.timestamp_micros() as f64 / 1e6)
}

/// Walks `[since, until]` backwards one page at a time, stopping at a short
/// page, at a page that does not move the window, or after `max_pages`.
async fn walk_pages<F, Fut>(
    market: &str,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
    page_limit: usize,
    max_pages: Option<usize>,
    mut fetch_page: F,
) -> Result<Vec<Tick>, WatchError>
where
    F: FnMut(DateTime<Utc>) -> Fut,
    Fut: Future<Output = Result<Vec<Tick>, WatchError>>,
{
    let mut ticks: Vec<Tick> = Vec::new();
    let mut end = until;
    let mut pages = 0;

    loop {
        let page = fetch_page(end).await?;
        pages += 1;
        let full = page.len() >= page_limit;
        let oldest = page.iter().map(|t| t.time).min();
        ticks.extend(page);

        if !full || max_pages.is_some_and(|max| pages >= max) {
            break;
        }
        match oldest {
            Some(t) if t > since && t < end => end = t,
            _ => {
                warn!(market = %market, end = %end, "Trade page did not advance — window truncated");
                break;
            }
        }
    }

    // Pages overlap on their boundary timestamp.
    ticks.sort_by(Tick::chronological);
    ticks.dedup_by_key(|t| t.id);

    debug!(market = %market, ticks = ticks.len(), pages, "Trades fetched");
    Ok(ticks)
}

#[async_trait]
impl TickSource for RestTickSource {
    async fn fetch(
        &self,
        market: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Tick>, WatchError> {
        walk_pages(market, since, until, self.page_limit, None, |end| self.fetch_page(market, since, end)).await
    }

    async fn fetch_latest(
        &self,
        market: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Tick>, WatchError> {
        // Newest first: one page already holds the latest trade.
        walk_pages(market, since, until, self.page_limit, Some(1), |end| self.fetch_page(market, since, end)).await
    }
}
