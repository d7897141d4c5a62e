//! # engine::aggregation
//!
//! **CUSUM core** — turns each rule's share of the cycle's cumulative measure
//! into aggregation points and accumulates the absolute percent move between
//! consecutive points.
//!
//! ## One rule, one cycle
//!
//! ```text
//! progress += total / agg_unit
//! multiples = floor(progress)            complete points crossed
//! rem       = progress - multiples       carried to next cycle
//!
//! target_k  = total - (rem + k) * agg_unit      k = 0 .. multiples-1
//!           → price at largest index key <= target_k
//!             (or the cache's pre-cycle last price when none qualifies)
//!
//! oldest boundary first:
//!   cusum_percent  += |p / reference_price - 1| * 100
//!   reference_price = p
//!
//! cusum_percent > agg_perc  → hit, drop every whole agg_perc crossed
//! ```

use std::collections::{BTreeMap, HashMap};

use anyhow::anyhow;
use serde::Serialize;
use tracing::debug;

use crate::engine::cache::{CumulativeIndex, MarketCache};
use crate::engine::reconcile::RuleBook;
use crate::error::WatchError;
use crate::models::{AggType, Rule, RuleKey};

/// Decimal places the carried remainder is rounded to.
const REM_DECIMALS: i32 = 7;

/// What one pass did to one rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Advance {
    /// Aggregation points consumed this cycle.
    pub multiples: u64,
    /// Boundaries that missed the index and used the fallback price.
    pub fallbacks: u64,
    pub hit: bool,
}

/// A rule that crossed its threshold, frozen at the moment of the hit.
#[derive(Debug, Clone, Serialize)]
pub struct Hit {
    pub key: RuleKey,
    pub user_ids: Vec<i64>,
    pub price: f64,
    pub cusum_percent: f64,
}

impl Hit {
    fn from_rule(rule: &Rule) -> Self {
        Self {
            key: rule.key.clone(),
            user_ids: rule.subscribers.user_ids.iter().copied().collect(),
            price: rule.reference_price,
            cusum_percent: rule.cusum_percent,
        }
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

/// Advances one rule by one cycle of `index`.
///
/// `fallback_price` is the market's last consumed price from before this
/// cycle; it stands in for boundaries older than the cycle's first tick.
/// A cycle with nothing traded leaves the rule untouched apart from `hit`.
pub fn advance(rule: &mut Rule, index: &CumulativeIndex, fallback_price: f64) -> Advance {
    rule.hit = false;

    let top = index.total();
    if top <= 0.0 {
        return Advance { multiples: 0, fallbacks: 0, hit: false };
    }

    let agg_unit = rule.key.agg_unit;
    rule.progress += top / agg_unit;

    let whole = rule.progress.floor();
    if whole < 1.0 {
        return Advance { multiples: 0, fallbacks: 0, hit: false };
    }
    let multiples = whole as u64;
    let exact_rem = rule.progress - whole;
    let rem = match round_to(exact_rem, REM_DECIMALS) {
        r if r < 1.0 => r,
        _ => exact_rem,
    };

    let (boundaries, fallbacks) = resolve_boundaries(index, top, rem, agg_unit, multiples);

    if !(rule.reference_price > 0.0) {
        rule.reference_price = fallback_price;
    }

    if fallbacks > 0 {
        rule.cusum_percent += (fallback_price / rule.reference_price - 1.0).abs() * 100.0;
        rule.reference_price = fallback_price;
        debug!(rule = %rule.key, fallbacks, "Boundary before cycle start — used last price");
    }
    for (_, price) in boundaries.iter().rev() {
        rule.cusum_percent += (price / rule.reference_price - 1.0).abs() * 100.0;
        rule.reference_price = *price;
    }

    let agg_perc = rule.key.agg_perc;
    if rule.cusum_percent > agg_perc {
        rule.hit = true;
        rule.cusum_percent -= (rule.cusum_percent / agg_perc).floor() * agg_perc;
    }

    rule.progress = rem;

    Advance { multiples, fallbacks, hit: rule.hit }
}

/// Resolves `target_k = top - (rem + k) * unit` for `k` in `0..multiples`,
/// newest first, keeping one entry per distinct index point.
///
/// Targets that land on the same point, and every miss after the first,
/// would replay a zero move, so they are skipped rather than visited.  The
/// walk costs one lookup per distinct point, whatever `multiples` is.
/// Returns the resolved points (descending) and the number of misses.
fn resolve_boundaries(
    index: &CumulativeIndex,
    top: f64,
    rem: f64,
    unit: f64,
    multiples: u64,
) -> (Vec<(f64, f64)>, u64) {
    let target = |k: u64| top - (rem + k as f64) * unit;
    let base = top - rem * unit;

    let mut points = Vec::new();
    let mut k = 0;
    while k < multiples {
        let Some((key, price)) = index.at_or_before(target(k)) else {
            return (points, multiples - k);
        };
        points.push((key, price));

        // First k whose target drops below `key`; the estimate may overshoot
        // by a rounding step.
        let jump = ((base - key) / unit).floor() + 1.0;
        let mut next = if jump >= multiples as f64 { multiples } else { (jump.max(0.0) as u64).max(k + 1) };
        for _ in 0..2 {
            if next > k + 1 && target(next - 1) < key {
                next -= 1;
            }
        }
        k = next;
    }
    (points, 0)
}

/// Runs one aggregation pass over every rule and returns the hits.
///
/// Indexes are built once per `(market, agg_type)` and shared by every rule
/// on that pair.  Every rule's market must have a cache; the check runs
/// before any counter is touched.
pub fn aggregate(book: &mut RuleBook, caches: &BTreeMap<String, MarketCache>) -> Result<Vec<Hit>, WatchError> {
    if let Some(orphan) = book.rules().find(|r| !caches.contains_key(r.market())) {
        return Err(WatchError::Internal(anyhow!("rule {} has no market cache", orphan.key)));
    }

    let mut indexes: HashMap<(String, AggType), CumulativeIndex> = HashMap::new();
    let mut hits = Vec::new();

    for rule in book.rules_mut() {
        let Some(cache) = caches.get(rule.market()) else {
            continue;
        };

        let agg_type = rule.key.agg_type;
        let index = indexes
            .entry((rule.key.market.clone(), agg_type))
            .or_insert_with(|| cache.index_for(agg_type));

        let step = advance(rule, index, cache.last_price());
        if step.hit {
            hits.push(Hit::from_rule(rule));
        }
    }

    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::cache::tests::tick;
    use crate::models::rule::{AggSpec, Subscribers};

    const EPS: f64 = 1e-9;

    fn rule(spec: &str, reference_price: f64) -> Rule {
        let spec: AggSpec = spec.parse().unwrap();
        let mut subs = Subscribers::default();
        subs.insert(1, "alice");
        Rule::new(RuleKey::new("BTC/USD", spec), subs, reference_price)
    }

    fn cache_with(last_price: f64, cycle: &[(f64, f64)]) -> MarketCache {
        let mut cache = MarketCache::seeded("BTC/USD", vec![tick(1, 0, last_price, 1.0)]).unwrap();
        cache.ingest(
            cycle
                .iter()
                .enumerate()
                .map(|(i, (p, s))| tick(2 + i as u64, 1 + i as i64, *p, *s))
                .collect(),
        );
        cache
    }

    #[test]
    fn test_dollar_cycle_falls_back_to_last_price() {
        // 3 ticks → cumulative dollar [500, 1005, 1104]; progress 0.8 → 1.904.
        // The one boundary sits at 1104 - 904 = 200, before the first tick.
        let cache = cache_with(102.0, &[(100.0, 5.0), (101.0, 5.0), (99.0, 1.0)]);
        let mut r = rule("dollar_1000_0.5", 100.0);
        r.progress = 0.8;

        let step = advance(&mut r, &cache.index_for(AggType::Dollar), cache.last_price());

        assert_eq!(step.multiples, 1);
        assert_eq!(step.fallbacks, 1);
        assert!((r.progress - 0.904).abs() < EPS);
        assert_eq!(r.reference_price, 102.0);
        // 2% move against a 0.5% threshold: hit, four whole thresholds removed.
        assert!(step.hit);
        assert!(r.cusum_percent.abs() < 1e-6);
    }

    #[test]
    fn test_dollar_cycle_below_threshold_accumulates() {
        let cache = cache_with(100.25, &[(100.0, 5.0), (101.0, 5.0), (99.0, 1.0)]);
        let mut r = rule("dollar_1000_0.5", 100.0);
        r.progress = 0.8;

        let step = advance(&mut r, &cache.index_for(AggType::Dollar), cache.last_price());

        assert!(!step.hit);
        assert!((r.cusum_percent - 0.25).abs() < 1e-9);
        assert_eq!(r.reference_price, 100.25);
    }

    #[test]
    fn test_no_complete_point_only_moves_progress() {
        let cache = cache_with(100.0, &[(110.0, 1.0)]);
        let mut r = rule("dollar_1000_0.5", 100.0);

        let step = advance(&mut r, &cache.index_for(AggType::Dollar), cache.last_price());

        assert_eq!(step.multiples, 0);
        assert!((r.progress - 0.11).abs() < EPS);
        assert_eq!(r.cusum_percent, 0.0);
        assert_eq!(r.reference_price, 100.0);
    }

    #[test]
    fn test_empty_cycle_changes_nothing() {
        let cache = cache_with(100.0, &[]);
        let mut r = rule("tick_5_1", 100.0);
        r.progress = 0.4;
        r.hit = true;

        advance(&mut r, &cache.index_for(AggType::Tick), cache.last_price());

        assert_eq!(r.progress, 0.4);
        assert!(!r.hit);
    }

    #[test]
    fn test_full_progress_is_not_spent_on_an_empty_cycle() {
        let cache = cache_with(105.0, &[]);
        let mut r = rule("dollar_1000_0.5", 100.0);
        r.progress = 1.0;
        r.cusum_percent = 0.3;

        let step = advance(&mut r, &cache.index_for(AggType::Dollar), cache.last_price());

        assert_eq!(step.multiples, 0);
        assert_eq!(r.progress, 1.0);
        assert_eq!(r.cusum_percent, 0.3);
        assert_eq!(r.reference_price, 100.0);
    }

    #[test]
    fn test_carried_remainder_stays_below_one() {
        // 0.99999996 rounds to 1.0 at 7 dp.
        let cache = cache_with(100.0, &[(100.0, 1.0)]);
        let mut r = rule("tick_1_50", 100.0);
        r.progress = 0.99999996;

        let step = advance(&mut r, &cache.index_for(AggType::Tick), cache.last_price());

        assert_eq!(step.multiples, 1);
        assert!(r.progress < 1.0);
    }

    #[test]
    fn test_tiny_unit_matches_coarse_replay() {
        let cycle = [(100.0, 4.0), (103.0, 2.0), (97.0, 5.0), (101.0, 3.0)];
        let cache = cache_with(99.0, &cycle);
        let index = cache.index_for(AggType::Volume);

        // Volume keys [4, 6, 11, 14].  Both units resolve to the same four
        // ticks plus the fallback; the fine one just lands there more often.
        let mut coarse = rule("volume_1_50", 99.5);
        let mut fine = rule("volume_0.000001_50", 99.5);

        let a = advance(&mut coarse, &index, cache.last_price());
        let started = std::time::Instant::now();
        let b = advance(&mut fine, &index, cache.last_price());
        let elapsed = started.elapsed();

        assert_eq!((a.multiples, a.fallbacks), (14, 3));
        assert_eq!((b.multiples, b.fallbacks), (14_000_000, 3_999_999));
        assert!((coarse.cusum_percent - fine.cusum_percent).abs() < 1e-9);
        assert_eq!(coarse.reference_price, fine.reference_price);
        assert!(elapsed < std::time::Duration::from_secs(1));
    }

    #[test]
    fn test_boundaries_replay_oldest_first() {
        // tick_1: every trade is a point; 100 → 110 → 99 chains two moves.
        let cache = cache_with(100.0, &[(110.0, 1.0), (99.0, 1.0)]);
        let mut r = rule("tick_1_50", 100.0);

        let step = advance(&mut r, &cache.index_for(AggType::Tick), cache.last_price());

        assert_eq!(step.multiples, 2);
        assert_eq!(step.fallbacks, 0);
        assert_eq!(r.reference_price, 99.0);
        // |110/100 - 1| + |99/110 - 1| = 10% + 10%
        assert!((r.cusum_percent - 20.0).abs() < 1e-9);
        assert!(!step.hit);
    }

    #[test]
    fn test_moves_never_cancel() {
        let cache = cache_with(100.0, &[(105.0, 1.0), (100.0, 1.0), (105.0, 1.0), (100.0, 1.0)]);
        let mut r = rule("tick_1_100", 100.0);

        advance(&mut r, &cache.index_for(AggType::Tick), cache.last_price());

        assert_eq!(r.reference_price, 100.0);
        assert!(r.cusum_percent > 19.0);
    }

    #[test]
    fn test_threshold_keeps_overshoot_beyond_whole_multiples() {
        let cache = cache_with(100.0, &[(102.0, 1.0)]);
        let mut r = rule("tick_1_1", 100.0);
        r.cusum_percent = 0.95;

        let step = advance(&mut r, &cache.index_for(AggType::Tick), cache.last_price());

        // 0.95 + 2.0 = 2.95 → two whole thresholds removed → 0.95 left.
        assert!(step.hit);
        assert!((r.cusum_percent - 0.95).abs() < 1e-9);
    }

    #[test]
    fn test_exactly_at_threshold_is_not_a_hit() {
        let cache = cache_with(100.0, &[(101.0, 1.0)]);
        let mut r = rule("tick_1_2", 100.0);
        r.cusum_percent = 1.0 - 1e-12;

        let step = advance(&mut r, &cache.index_for(AggType::Tick), cache.last_price());

        assert!(!step.hit);
    }

    #[test]
    fn test_zero_reference_price_is_replaced() {
        let cache = cache_with(100.0, &[(100.0, 1.0)]);
        let mut r = rule("tick_1_1", 0.0);

        advance(&mut r, &cache.index_for(AggType::Tick), cache.last_price());

        assert!(r.cusum_percent.is_finite());
        assert_eq!(r.cusum_percent, 0.0);
        assert_eq!(r.reference_price, 100.0);
    }

    #[test]
    fn test_progress_is_conserved_across_cycles() {
        let mut cache = MarketCache::seeded("BTC/USD", vec![tick(1, 0, 100.0, 1.0)]).unwrap();
        let mut r = rule("volume_3.7_50", 100.0);

        let mut next_id = 2;
        let mut raw_total = 0.0;
        let mut consumed = 0.0;

        for cycle in 0..25 {
            let batch: Vec<_> = (0..(cycle % 4))
                .map(|j| {
                    next_id += 1;
                    tick(next_id, next_id as i64, 100.0 + j as f64, 0.9 + 0.35 * j as f64)
                })
                .collect();
            raw_total += batch.iter().map(|t| t.size).sum::<f64>();
            cache.ingest(batch);

            let step = advance(&mut r, &cache.index_for(AggType::Volume), cache.last_price());
            consumed += step.multiples as f64 * r.key.agg_unit;
            cache.advance_cursor();
        }

        let leftover = r.progress * r.key.agg_unit;
        assert!((consumed - (raw_total - leftover)).abs() < 1e-5);
    }

    #[test]
    fn test_aggregate_reports_hits_per_rule() {
        let mut caches = BTreeMap::new();
        caches.insert("BTC/USD".to_string(), cache_with(100.0, &[(103.0, 1.0)]));

        let mut book = RuleBook::default();
        book.insert(rule("tick_1_1", 100.0));
        book.insert(rule("tick_1_5", 100.0));
        book.insert(rule("tick_10_1", 100.0));

        let hits = aggregate(&mut book, &caches).unwrap();

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key.agg_perc, 1.0);
        assert_eq!(hits[0].price, 103.0);
        assert_eq!(hits[0].user_ids, vec![1]);
    }

    #[test]
    fn test_rule_without_cache_fails_before_mutation() {
        let mut caches = BTreeMap::new();
        caches.insert("BTC/USD".to_string(), cache_with(100.0, &[(103.0, 1.0)]));

        let mut book = RuleBook::default();
        book.insert(rule("tick_1_1", 100.0));
        let spec: AggSpec = "tick_1_1".parse().unwrap();
        book.insert(Rule::new(RuleKey::new("ETH/USD", spec), Subscribers::default(), 3000.0));

        assert!(aggregate(&mut book, &caches).is_err());
        assert!(book.rules().all(|r| r.progress == 0.0 && r.cusum_percent == 0.0));
    }
}
