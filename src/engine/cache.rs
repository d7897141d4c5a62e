//! # engine::cache
//!
//! Per-market tick ledger.
//!
//! A [`MarketCache`] holds a cursor (`last_id`, `last_time`, `last_price`) for
//! the ticks already consumed by aggregation, plus the ticks fetched this cycle
//! that lie strictly after that cursor.  From those recent ticks it derives a
//! [`CumulativeIndex`] per aggregation type.
//!
//! ```text
//! cursor ── t1 ── t2 ── t3        recent ticks this cycle
//!           │     │     │
//! dollar:  500  1005  1104        cumulative measure (index keys)
//! price:   100   101    99        price observed at that point
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::engine::fetch::TickFetcher;
use crate::error::WatchError;
use crate::models::{AggType, Tick};

// ─── Cumulative Index ─────────────────────────────────────────────────────────

/// Sorted mapping from cumulative measure to the price observed at that point.
///
/// Keys are non-decreasing by construction (every tick adds a positive
/// amount); lookups are binary searches, so "largest key ≤ target" is exact.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CumulativeIndex {
    keys: Vec<f64>,
    prices: Vec<f64>,
}

impl CumulativeIndex {
    /// Running sums of `agg_type`'s measure over `ticks`, in order.
    pub fn build(ticks: &[Tick], agg_type: AggType) -> Self {
        let mut keys = Vec::with_capacity(ticks.len());
        let mut prices = Vec::with_capacity(ticks.len());
        let mut running = 0.0;

        for (i, tick) in ticks.iter().enumerate() {
            running = match agg_type {
                AggType::Tick => (i + 1) as f64,
                AggType::Volume => running + tick.size,
                AggType::Dollar => running + tick.dollar(),
            };
            keys.push(running);
            prices.push(tick.price);
        }

        Self { keys, prices }
    }

    #[cfg(test)]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    #[cfg(test)]
    #[inline]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// The latest cumulative value this cycle, or 0 when nothing traded.
    #[inline]
    pub fn total(&self) -> f64 {
        self.keys.last().copied().unwrap_or(0.0)
    }

    /// The entry with the largest key `<= target`.  On equal keys the later
    /// tick wins.
    pub fn at_or_before(&self, target: f64) -> Option<(f64, f64)> {
        let upper = self.keys.partition_point(|k| *k <= target);
        upper
            .checked_sub(1)
            .map(|i| (self.keys[i], self.prices[i]))
    }

    #[cfg(test)]
    /// `(key, price)` pairs in ascending key order.
    pub fn entries(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.keys.iter().copied().zip(self.prices.iter().copied())
    }
}

// ─── Market Cache ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MarketCache {
    market: String,
    last_id: Option<u64>,
    last_time: Option<DateTime<Utc>>,
    last_price: f64,
    recent: Vec<Tick>,
}

/// Per-cycle summary of one cache, for logs and the status server.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub market: String,
    pub ticks: usize,
    pub volume: f64,
    pub dollar: f64,
    pub last_id: Option<u64>,
    pub last_time: Option<DateTime<Utc>>,
    pub last_price: f64,
}

impl MarketCache {
    /// Builds a cache whose cursor sits on the newest of `ticks`.
    ///
    /// Fails when `ticks` is empty: without a trade there is no price to
    /// anchor rules on.
    pub fn seeded(market: &str, ticks: Vec<Tick>) -> Result<Self, WatchError> {
        let mut cache = Self {
            market: market.to_string(),
            last_id: None,
            last_time: None,
            last_price: 0.0,
            recent: Vec::new(),
        };

        cache.ingest(ticks);
        if cache.recent.is_empty() {
            return Err(WatchError::EmptyBootstrap(market.to_string()));
        }
        cache.advance_cursor();

        Ok(cache)
    }

    /// Deep-lookback fetch that seeds the cursor before steady state.
    pub async fn bootstrap(
        fetcher: &TickFetcher,
        market: &str,
        now: DateTime<Utc>,
    ) -> Result<Self, WatchError> {
        let ticks = fetcher.fetch_bootstrap(market, now).await?;
        let cache = Self::seeded(market, ticks)?;

        tracing::info!(
            market     = %market,
            last_id    = ?cache.last_id,
            last_price = cache.last_price,
            "Market cache bootstrapped"
        );

        Ok(cache)
    }

    /// Replaces this cycle's recent ticks with the part of `window` that lies
    /// after the cursor.  Returns how many ticks were accepted.
    pub fn ingest(&mut self, mut window: Vec<Tick>) -> usize {
        window.sort_by(Tick::chronological);

        let mut accepted: Vec<Tick> = Vec::with_capacity(window.len());
        for tick in window {
            let floor_id = accepted.last().map(|t| t.id).or(self.last_id);
            if floor_id.is_some_and(|id| tick.id <= id) {
                continue;
            }
            if self.last_time.is_some_and(|t| tick.time < t) {
                continue;
            }
            accepted.push(tick);
        }

        self.recent = accepted;
        self.recent.len()
    }

    /// Index of this cycle's ticks for `agg_type`.
    pub fn index_for(&self, agg_type: AggType) -> CumulativeIndex {
        CumulativeIndex::build(&self.recent, agg_type)
    }

    /// Moves the cursor onto the newest recent tick and clears the cycle.
    pub fn advance_cursor(&mut self) {
        if let Some(last) = self.recent.last() {
            self.last_id = Some(last.id);
            self.last_time = Some(last.time);
            self.last_price = last.price;
        }
        self.recent.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            market: self.market.clone(),
            ticks: self.recent.len(),
            volume: self.recent.iter().map(|t| t.size).sum(),
            dollar: self.recent.iter().map(Tick::dollar).sum(),
            last_id: self.last_id,
            last_time: self.last_time,
            last_price: self.last_price,
        }
    }

    #[inline]
    pub fn market(&self) -> &str {
        &self.market
    }

    #[inline]
    pub fn last_id(&self) -> Option<u64> {
        self.last_id
    }

    #[cfg(test)]
    #[inline]
    pub fn last_time(&self) -> Option<DateTime<Utc>> {
        self.last_time
    }

    /// Price of the last consumed tick; the boundary fallback.
    #[inline]
    pub fn last_price(&self) -> f64 {
        self.last_price
    }

    #[cfg(test)]
    #[inline]
    pub fn recent(&self) -> &[Tick] {
        &self.recent
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::tick::Side;
    use chrono::TimeZone;

    pub(crate) fn tick(id: u64, secs: i64, price: f64, size: f64) -> Tick {
        Tick {
            id,
            time: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            price,
            size,
            side: Side::Buy,
            liquidation: false,
        }
    }

    fn seeded() -> MarketCache {
        MarketCache::seeded("BTC/USD", vec![tick(10, 0, 100.0, 1.0)]).unwrap()
    }

    #[test]
    fn test_seeded_sets_cursor() {
        let cache = seeded();
        assert_eq!(cache.last_id(), Some(10));
        assert_eq!(cache.last_price(), 100.0);
        assert!(cache.recent().is_empty());
    }

    #[test]
    fn test_empty_bootstrap_is_rejected() {
        let err = MarketCache::seeded("BTC/USD", vec![]).unwrap_err();
        assert!(matches!(err, WatchError::EmptyBootstrap(m) if m == "BTC/USD"));
    }

    #[test]
    fn test_ingest_rejects_consumed_ids() {
        let mut cache = seeded();
        let accepted = cache.ingest(vec![
            tick(9, 0, 99.0, 1.0),
            tick(10, 0, 100.0, 1.0),
            tick(11, 1, 101.0, 1.0),
            tick(12, 2, 102.0, 1.0),
        ]);
        assert_eq!(accepted, 2);
        assert!(cache.recent().iter().all(|t| t.id > 10));
    }

    #[test]
    fn test_ingest_rejects_ticks_older_than_cursor_time() {
        let mut cache = MarketCache::seeded("BTC/USD", vec![tick(10, 5, 100.0, 1.0)]).unwrap();
        let accepted = cache.ingest(vec![tick(11, 4, 101.0, 1.0), tick(12, 6, 102.0, 1.0)]);
        assert_eq!(accepted, 1);
        assert_eq!(cache.recent()[0].id, 12);
    }

    #[test]
    fn test_ingest_sorts_and_drops_duplicates() {
        let mut cache = seeded();
        cache.ingest(vec![
            tick(13, 3, 103.0, 1.0),
            tick(11, 1, 101.0, 1.0),
            tick(12, 2, 102.0, 1.0),
            tick(12, 2, 102.0, 1.0),
        ]);
        let ids: Vec<u64> = cache.recent().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![11, 12, 13]);
    }

    #[test]
    fn test_cursor_never_moves_backwards() {
        let mut cache = seeded();
        cache.ingest(vec![tick(11, 1, 101.0, 1.0)]);
        cache.advance_cursor();
        let (id, time) = (cache.last_id(), cache.last_time());

        cache.ingest(vec![tick(5, 0, 50.0, 1.0)]);
        cache.advance_cursor();
        assert_eq!(cache.last_id(), id);
        assert_eq!(cache.last_time(), time);
        assert_eq!(cache.last_price(), 101.0);
    }

    #[test]
    fn test_tick_index_counts_one_per_trade() {
        let mut cache = seeded();
        let prices = [101.0, 99.5, 100.25, 102.0];
        cache.ingest(
            prices
                .iter()
                .enumerate()
                .map(|(i, p)| tick(11 + i as u64, i as i64 + 1, *p, 0.3))
                .collect(),
        );

        let index = cache.index_for(AggType::Tick);
        assert_eq!(index.len(), prices.len());
        for (k, (key, price)) in index.entries().enumerate() {
            assert_eq!(key, (k + 1) as f64);
            assert_eq!(price, prices[k]);
        }
    }

    #[test]
    fn test_volume_and_dollar_indexes() {
        let mut cache = seeded();
        cache.ingest(vec![
            tick(11, 1, 100.0, 5.0),
            tick(12, 2, 101.0, 5.0),
            tick(13, 3, 99.0, 1.0),
        ]);

        let volume: Vec<f64> = cache.index_for(AggType::Volume).entries().map(|e| e.0).collect();
        assert_eq!(volume, vec![5.0, 10.0, 11.0]);

        let dollar = cache.index_for(AggType::Dollar);
        let keys: Vec<f64> = dollar.entries().map(|e| e.0).collect();
        assert_eq!(keys, vec![500.0, 1005.0, 1104.0]);
        assert_eq!(dollar.total(), 1104.0);
    }

    #[test]
    fn test_empty_cycle_has_empty_index() {
        let cache = seeded();
        let index = cache.index_for(AggType::Dollar);
        assert!(index.is_empty());
        assert_eq!(index.total(), 0.0);
        assert_eq!(index.at_or_before(1e9), None);
    }

    #[test]
    fn test_lookup_largest_key_at_or_before() {
        let mut cache = seeded();
        cache.ingest(vec![
            tick(11, 1, 100.0, 5.0),
            tick(12, 2, 101.0, 5.0),
            tick(13, 3, 99.0, 1.0),
        ]);
        let index = cache.index_for(AggType::Dollar);

        assert_eq!(index.at_or_before(200.0), None);
        assert_eq!(index.at_or_before(500.0), Some((500.0, 100.0)));
        assert_eq!(index.at_or_before(1004.99), Some((500.0, 100.0)));
        assert_eq!(index.at_or_before(1005.0), Some((1005.0, 101.0)));
        assert_eq!(index.at_or_before(5000.0), Some((1104.0, 99.0)));
    }

    #[test]
    fn test_lookup_ties_resolve_to_later_tick() {
        let ticks = vec![tick(1, 1, 100.0, 1.0), tick(2, 2, 105.0, 0.0), tick(3, 3, 110.0, 1.0)];
        let index = CumulativeIndex::build(&ticks, AggType::Volume);
        assert_eq!(index.at_or_before(1.0), Some((1.0, 105.0)));
    }

    #[test]
    fn test_advance_cursor_without_ticks_is_noop() {
        let mut cache = seeded();
        cache.ingest(vec![]);
        cache.advance_cursor();
        assert_eq!(cache.last_id(), Some(10));
        assert_eq!(cache.last_price(), 100.0);
    }

    #[test]
    fn test_stats_cover_recent_ticks() {
        let mut cache = seeded();
        cache.ingest(vec![tick(11, 1, 100.0, 2.0), tick(12, 2, 50.0, 1.0)]);
        let stats = cache.stats();
        assert_eq!(stats.ticks, 2);
        assert_eq!(stats.volume, 3.0);
        assert_eq!(stats.dollar, 250.0);
    }
}
