//! # engine::reconcile
//!
//! Keeps the live counter set in step with the rule store.
//!
//! Every cycle the freshly pulled catalog is compared with the one the book
//! was last built from.  Only when they differ does the merge run:
//!
//! | key in…          | result                                              |
//! |------------------|-----------------------------------------------------|
//! | book and catalog | counters kept, subscribers replaced                 |
//! | catalog only     | new counter anchored at the market's last price     |
//! | book only        | dropped                                             |
//!
//! Markets that gain their first rule are bootstrapped *before* anything is
//! mutated, so a failed bootstrap leaves the book exactly as it was and the
//! merge is simply retried on the next cycle.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use crate::engine::cache::MarketCache;
use crate::engine::fetch::TickFetcher;
use crate::error::WatchError;
use crate::models::{Rule, RuleCatalog, RuleKey};

// ─── RuleBook ─────────────────────────────────────────────────────────────────

/// The live counters plus the catalog they were last reconciled against.
#[derive(Debug, Default)]
pub struct RuleBook {
    rules: BTreeMap<RuleKey, Rule>,
    snapshot: Option<RuleCatalog>,
}

impl RuleBook {
    #[cfg(test)]
    pub fn insert(&mut self, rule: Rule) {
        self.rules.insert(rule.key.clone(), rule);
    }

    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.values()
    }

    pub fn rules_mut(&mut self) -> impl Iterator<Item = &mut Rule> {
        self.rules.values_mut()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    #[cfg(test)]
    /// Every market at least one rule watches.
    pub fn markets(&self) -> BTreeSet<String> {
        self.rules.keys().map(|k| k.market.clone()).collect()
    }

    /// True when `catalog` is exactly what the book was last built from.
    pub fn is_current(&self, catalog: &RuleCatalog) -> bool {
        self.snapshot.as_ref() == Some(catalog)
    }
}

// ─── Merge ────────────────────────────────────────────────────────────────────

/// Counts from one merge.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub kept: usize,
    pub added: usize,
    pub removed: usize,
    pub markets_added: Vec<String>,
    pub markets_removed: Vec<String>,
}

/// Right-joins `fresh` onto `current`.
///
/// `price_of` supplies the anchor price for new rules; it must know every
/// market in `fresh`.
pub fn merge(
    mut current: BTreeMap<RuleKey, Rule>,
    fresh: &RuleCatalog,
    price_of: impl Fn(&str) -> Option<f64>,
) -> Result<(BTreeMap<RuleKey, Rule>, ReconcileReport), WatchError> {
    let mut merged = BTreeMap::new();
    let mut report = ReconcileReport::default();

    for (key, subscribers) in fresh {
        let last_price = || {
            price_of(&key.market)
                .ok_or_else(|| WatchError::Internal(anyhow!("no market cache for {}", key.market)))
        };

        let rule = match current.remove(key) {
            Some(mut rule) => {
                rule.subscribers = subscribers.clone();
                if !(rule.reference_price > 0.0) {
                    rule.reference_price = last_price()?;
                }
                report.kept += 1;
                rule
            }
            None => {
                report.added += 1;
                Rule::new(key.clone(), subscribers.clone(), last_price()?)
            }
        };
        merged.insert(key.clone(), rule);
    }

    report.removed = current.len();
    Ok((merged, report))
}

// ─── RuleReconciler ───────────────────────────────────────────────────────────

/// Applies catalog changes to the book and to the set of market caches.
pub struct RuleReconciler {
    fetcher: TickFetcher,
}

impl RuleReconciler {
    pub fn new(fetcher: TickFetcher) -> Self {
        Self { fetcher }
    }

    /// Returns `None` when `fresh` matches the last catalog (nothing to do).
    pub async fn reconcile(
        &self,
        book: &mut RuleBook,
        caches: &mut BTreeMap<String, MarketCache>,
        fresh: RuleCatalog,
        now: DateTime<Utc>,
    ) -> Result<Option<ReconcileReport>, WatchError> {
        if book.is_current(&fresh) {
            return Ok(None);
        }
        info!(rules = fresh.len(), "Rule set changed — reconciling");

        let wanted: BTreeSet<String> = fresh.keys().map(|k| k.market.clone()).collect();

        // ── 1. Bootstrap every newly referenced market (no mutation yet) ─────
        let missing: Vec<&String> = wanted.iter().filter(|m| !caches.contains_key(*m)).collect();
        let seeded = join_all(
            missing
                .iter()
                .map(|m| MarketCache::bootstrap(&self.fetcher, m.as_str(), now)),
        )
        .await;
        let mut bootstrapped = Vec::with_capacity(seeded.len());
        for cache in seeded {
            bootstrapped.push(cache?);
        }

        // ── 2. Merge rules against the widened cache set ─────────────────────
        let (merged, mut report) = merge(book.rules.clone(), &fresh, |market| {
            caches
                .get(market)
                .or_else(|| bootstrapped.iter().find(|c| c.market() == market))
                .map(MarketCache::last_price)
        })
        .map_err(|e| {
            warn!(error = %e, "Rule merge failed");
            e
        })?;

        // ── 3. Commit: caches in, caches out, rules swapped ──────────────────
        for cache in bootstrapped {
            report.markets_added.push(cache.market().to_string());
            caches.insert(cache.market().to_string(), cache);
        }
        caches.retain(|market, _| {
            let keep = wanted.contains(market);
            if !keep {
                report.markets_removed.push(market.clone());
            }
            keep
        });

        book.rules = merged;
        book.snapshot = Some(fresh);

        info!(
            kept            = report.kept,
            added           = report.added,
            removed         = report.removed,
            markets_added   = ?report.markets_added,
            markets_removed = ?report.markets_removed,
            "Rules reconciled"
        );

        Ok(Some(report))
    }
}
