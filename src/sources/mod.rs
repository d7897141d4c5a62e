//! # sources
//!
//! Boundaries to everything the engine does not own: the exchange, the rule
//! store, push delivery, support/resistance levels and the admin channel.
//!
//! Each boundary is a trait object held by the
//! [`ConnectionRegistry`](crate::connections::ConnectionRegistry); the engine
//! never depends on a concrete client.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::WatchError;
use crate::models::{Tick, WatchlistRecord};

pub mod exchange;
pub mod levels;
pub mod telegram;
pub mod watchlist;

/// Raw trade feed for one market.
#[async_trait]
pub trait TickSource: Send + Sync {
    /// Trades executed in `[since, until]`, ordered by `(time, id)`.
    async fn fetch(
        &self,
        market: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Tick>, WatchError>;

    /// The newest trades in `[since, until]`, enough to seed a cursor.
    /// Paged sources stop after the first page instead of walking the
    /// whole window.
    async fn fetch_latest(
        &self,
        market: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Tick>, WatchError> {
        self.fetch(market, since, until).await
    }
}

/// Source of truth for user watchlists.  Read-only from the engine's side.
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn pull(&self) -> Result<Vec<WatchlistRecord>, WatchError>;
}

/// Push delivery of one aggregated message per user.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, messages: &BTreeMap<i64, String>) -> Result<(), WatchError>;
}

/// Known support/resistance levels, used to decorate hit messages.
#[async_trait]
pub trait RangeLookup: Send + Sync {
    async fn bands(&self, market: &str, price: f64) -> Result<PriceBand, WatchError>;
}

/// Out-of-band channel for crash and liveness reports.
#[async_trait]
pub trait AdminChannel: Send + Sync {
    async fn report_failure(&self, error: &str);
    async fn report_recovery(&self);
}

// ─── PriceBand ────────────────────────────────────────────────────────────────

/// Tightest known bracket `low < price <= high`.  Either side may be missing
/// when the price sits outside every known level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PriceBand {
    pub low: Option<f64>,
    pub high: Option<f64>,
}

impl PriceBand {
    /// Brackets `price` within `levels` (any order).
    pub fn bracket(levels: &[f64], price: f64) -> Self {
        let low = levels
            .iter()
            .copied()
            .filter(|l| *l < price)
            .max_by(f64::total_cmp);
        let high = levels
            .iter()
            .copied()
            .filter(|l| *l >= price)
            .min_by(f64::total_cmp);
        Self { low, high }
    }
}

impl fmt::Display for PriceBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = |v: Option<f64>| v.map(|p| format!("{p:?}")).unwrap_or_else(|| "n/a".to_string());
        write!(f, "({}, {})", side(self.low), side(self.high))
    }
}
