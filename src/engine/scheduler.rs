//! # engine::scheduler
//!
//! The [`Watcher`] owns every rule and market cache and drives one cycle per
//! poll interval, aligned to wall-clock multiples of the interval.
//!
//! ## Cycle
//!
//! ```text
//! 1. refresh    fetch every market's window (joined), ingest past the cursor
//! 2. reconcile  pull the rule store, merge only when the catalog changed
//! 3. aggregate  CUSUM pass over every rule, then advance every cursor
//! 4. persist    append hits to the hit log
//! 5. notify     decorate hits with price bands, one message per user
//! ```
//!
//! Any phase failure abandons the rest of the cycle, reports it on the admin
//! channel and waits for the next aligned tick.  The first successful cycle
//! after a failure sends a recovery notice.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::connections::ConnectionRegistry;
use crate::engine::aggregation::{aggregate, Hit};
use crate::engine::cache::{CacheStats, MarketCache};
use crate::engine::fetch::{FetchSettings, TickFetcher};
use crate::engine::reconcile::{ReconcileReport, RuleBook, RuleReconciler};
use crate::error::{CycleError, CyclePhase, InPhase, WatchError};
use crate::events::WatchEvent;
use crate::hit_log::HitLog;
use crate::messages;
use crate::models::normalize;
use crate::sources::PriceBand;
use crate::state::{SharedState, WatchSnapshot, WatcherPhase};

/// Time from `now` to the next multiple of `interval` since the epoch.
/// A `now` sitting exactly on a multiple waits a full interval.
pub fn next_aligned_delay(now: DateTime<Utc>, interval: Duration) -> Duration {
    let step = interval.as_millis().clamp(1, i64::MAX as u128) as i64;
    let into = now.timestamp_millis().rem_euclid(step);
    Duration::from_millis((step - into) as u64)
}

/// What one successful cycle did.
#[derive(Debug, Default)]
pub struct CycleSummary {
    /// Ticks accepted past the cursors.
    pub ticks: usize,
    pub hits: Vec<Hit>,
    pub reconciled: Option<ReconcileReport>,
    /// Per-market stats taken before the cursors moved.
    pub markets: Vec<CacheStats>,
}

pub struct Watcher {
    registry: ConnectionRegistry,
    interval: Duration,
    fetcher: TickFetcher,
    reconciler: RuleReconciler,
    book: RuleBook,
    caches: BTreeMap<String, MarketCache>,
    hit_log: HitLog,
    state: SharedState,
    shutdown: watch::Receiver<bool>,

    primed: bool,
    cycles: u64,
    failed: bool,
    last_failure: Option<(CyclePhase, String)>,
    last_cycle_at: Option<DateTime<Utc>>,
}

impl Watcher {
    pub fn new(
        registry: ConnectionRegistry,
        settings: FetchSettings,
        hit_log: HitLog,
        state: SharedState,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let fetcher = TickFetcher::new(
            registry.ticks.clone(),
            registry.admin.clone(),
            settings,
            shutdown.clone(),
        );

        Self {
            registry,
            interval: settings.interval,
            reconciler: RuleReconciler::new(fetcher.clone()),
            fetcher,
            book: RuleBook::default(),
            caches: BTreeMap::new(),
            hit_log,
            state,
            shutdown,
            primed: false,
            cycles: 0,
            failed: false,
            last_failure: None,
            last_cycle_at: None,
        }
    }

    /// Loads the rule set, bootstraps every watched market and consumes one
    /// steady-state window without aggregating it, so the first real cycle
    /// only sees trades newer than startup.
    pub async fn bootstrap(&mut self, now: DateTime<Utc>) -> Result<(), CycleError> {
        let records = self.registry.rules.pull().await.in_phase(CyclePhase::Bootstrap)?;
        let catalog = normalize(&records);

        let report = self
            .reconciler
            .reconcile(&mut self.book, &mut self.caches, catalog, now)
            .await
            .in_phase(CyclePhase::Bootstrap)?;
        if let Some(report) = report {
            self.state.broadcast(&WatchEvent::RulesReconciled { report });
        }

        let markets: Vec<String> = self.caches.keys().cloned().collect();
        let windows = self
            .fetcher
            .fetch_recent_all(&markets, now)
            .await
            .in_phase(CyclePhase::Bootstrap)?;
        for (market, window) in windows {
            if let Some(cache) = self.caches.get_mut(&market) {
                cache.ingest(window);
                cache.advance_cursor();
            }
        }

        if self.book.is_empty() {
            warn!("Rule store holds no rules — nothing to watch yet");
        }
        self.primed = true;
        info!(rules = self.book.len(), markets = self.caches.len(), "Watcher primed");
        let markets = self.caches.values().map(MarketCache::stats).collect();
        self.publish(WatcherPhase::Running, markets).await;
        Ok(())
    }

    /// Runs until shutdown.  Bootstrap is retried on every aligned tick until
    /// it succeeds.
    pub async fn run(mut self) {
        let mut shutdown = self.shutdown.clone();

        info!(interval = ?self.interval, "Watcher loop starting");

        loop {
            if *shutdown.borrow() {
                break;
            }

            if !self.primed {
                if let Err(e) = self.bootstrap(Utc::now()).await {
                    self.record_failure(e).await;
                }
            }

            let delay = next_aligned_delay(Utc::now(), self.interval);
            debug!(delay = ?delay, "Sleeping until next cycle");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            if self.primed {
                self.run_once(Utc::now()).await;
            }
        }

        info!(cycles = self.cycles, "Watcher stopped");
        self.state.set_phase(WatcherPhase::Stopped).await;
    }

    /// One cycle with failure bookkeeping.  Returns the summary of a
    /// successful cycle.
    pub async fn run_once(&mut self, now: DateTime<Utc>) -> Option<CycleSummary> {
        self.cycles += 1;

        match self.run_cycle(now).await {
            Ok(summary) => {
                self.last_cycle_at = Some(now);
                if self.failed {
                    self.failed = false;
                    info!(cycle = self.cycles, "Watcher recovered");
                    self.registry.admin.report_recovery().await;
                    self.state.broadcast(&WatchEvent::Recovered { cycle: self.cycles });
                }

                self.log_cycle(&summary);
                self.state.broadcast(&WatchEvent::CycleCompleted {
                    cycle: self.cycles,
                    at: now,
                    ticks: summary.ticks,
                    rules: self.book.len(),
                    hits: summary.hits.len(),
                });
                self.publish(WatcherPhase::Running, summary.markets.clone()).await;
                Some(summary)
            }
            Err(e) => {
                self.record_failure(e).await;
                None
            }
        }
    }

    async fn run_cycle(&mut self, now: DateTime<Utc>) -> Result<CycleSummary, CycleError> {
        // ── 1. Refresh ───────────────────────────────────────────────────────
        let markets: Vec<String> = self.caches.keys().cloned().collect();
        let windows = self
            .fetcher
            .fetch_recent_all(&markets, now)
            .await
            .in_phase(CyclePhase::RefreshCache)?;

        let mut ticks = 0;
        for (market, window) in windows {
            if let Some(cache) = self.caches.get_mut(&market) {
                ticks += cache.ingest(window);
            }
        }

        // ── 2. Reconcile ─────────────────────────────────────────────────────
        let records = self.registry.rules.pull().await.in_phase(CyclePhase::Reconcile)?;
        let reconciled = self
            .reconciler
            .reconcile(&mut self.book, &mut self.caches, normalize(&records), now)
            .await
            .in_phase(CyclePhase::Reconcile)?;
        if let Some(report) = &reconciled {
            self.state.broadcast(&WatchEvent::RulesReconciled { report: report.clone() });
        }

        // ── 3. Aggregate ─────────────────────────────────────────────────────
        let hits = aggregate(&mut self.book, &self.caches).in_phase(CyclePhase::Aggregate)?;
        let markets: Vec<CacheStats> = self.caches.values().map(MarketCache::stats).collect();
        for cache in self.caches.values_mut() {
            cache.advance_cursor();
        }

        // ── 4. Persist ───────────────────────────────────────────────────────
        self.hit_log.append(now, &hits).await.in_phase(CyclePhase::Persist)?;

        // ── 5. Notify ────────────────────────────────────────────────────────
        if !hits.is_empty() {
            self.notify(&hits).await.in_phase(CyclePhase::Notify)?;
        }

        Ok(CycleSummary { ticks, hits, reconciled, markets })
    }

    async fn notify(&self, hits: &[Hit]) -> Result<(), WatchError> {
        let mut rendered = Vec::with_capacity(hits.len());
        for hit in hits {
            let band = match self.registry.levels.bands(&hit.key.market, hit.price).await {
                Ok(band) => band,
                Err(e) => {
                    warn!(market = %hit.key.market, error = %e, "Price band lookup failed");
                    PriceBand::default()
                }
            };
            let message = messages::format_hit(hit, band);
            self.state.broadcast(&WatchEvent::RuleHit {
                hit: Box::new(hit.clone()),
                message: message.clone(),
            });
            rendered.push((hit, message));
        }

        let registry = messages::registry(rendered);
        self.registry.notifier.deliver(&registry).await
    }

    async fn record_failure(&mut self, e: CycleError) {
        if matches!(e.source, WatchError::Cancelled(_)) {
            info!(phase = %e.phase, "Cycle interrupted by shutdown");
            return;
        }

        error!(cycle = self.cycles, phase = %e.phase, error = %e.source, "Cycle failed — will retry next interval");

        self.failed = true;
        self.last_failure = Some((e.phase, e.source.to_string()));
        self.registry.admin.report_failure(&e.to_string()).await;
        self.state.broadcast(&WatchEvent::CycleFailed {
            cycle: self.cycles,
            phase: e.phase,
            error: e.source.to_string(),
        });

        let phase = if self.primed { WatcherPhase::Running } else { WatcherPhase::Starting };
        let markets = self.caches.values().map(MarketCache::stats).collect();
        self.publish(phase, markets).await;
    }

    fn log_cycle(&self, summary: &CycleSummary) {
        for m in &summary.markets {
            info!(
                market     = %m.market,
                ticks      = m.ticks,
                volume     = m.volume,
                dollar     = m.dollar,
                last_id    = ?m.last_id,
                last_price = m.last_price,
                "Market"
            );
        }
        for rule in self.book.rules() {
            debug!(
                rule      = %rule.key,
                progress  = rule.progress,
                cusum     = rule.cusum_percent,
                reference = rule.reference_price,
                hit       = rule.hit,
                "Rule"
            );
        }
        if let Some(report) = &summary.reconciled {
            debug!(kept = report.kept, added = report.added, removed = report.removed, "Rule set merged this cycle");
        }
        info!(
            cycle = self.cycles,
            ticks = summary.ticks,
            rules = self.book.len(),
            hits  = summary.hits.len(),
            "Cycle complete"
        );
    }

    async fn publish(&self, phase: WatcherPhase, markets: Vec<CacheStats>) {
        self.state
            .publish(WatchSnapshot {
                phase,
                cycles: self.cycles,
                failed: self.failed,
                last_failure: self.last_failure.clone(),
                last_cycle_at: self.last_cycle_at,
                rules: self.book.rules().cloned().collect(),
                markets,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::cache::tests::tick;
    use crate::engine::fetch::tests::{settings, CountingAdmin};
    use crate::models::watchlist::WatchlistEntry;
    use crate::models::{Tick, WatchlistRecord};
    use crate::sources::{Notifier, RangeLookup, RuleStore, TickSource};
    use crate::state::build_state;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    /// Serves whatever trades are queued for BTC/USD; fails while `down`.
    #[derive(Default)]
    struct ScriptedSource {
        ticks: Mutex<Vec<Tick>>,
        down: AtomicBool,
    }

    #[async_trait]
    impl TickSource for ScriptedSource {
        async fn fetch(&self, market: &str, _: DateTime<Utc>, _: DateTime<Utc>) -> Result<Vec<Tick>, WatchError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(WatchError::Fetch { market: market.to_string(), message: "503".into() });
            }
            Ok(self.ticks.lock().unwrap().clone())
        }
    }

    struct FixedRules;

    #[async_trait]
    impl RuleStore for FixedRules {
        async fn pull(&self) -> Result<Vec<WatchlistRecord>, WatchError> {
            Ok(vec![WatchlistRecord {
                user_id: 9,
                username: "erin".into(),
                entries: vec![WatchlistEntry {
                    market: "BTC/USD".into(),
                    aggs: vec!["tick_1_1".into()],
                }],
            }])
        }
    }

    #[derive(Default)]
    struct Outbox(Mutex<Vec<BTreeMap<i64, String>>>);

    #[async_trait]
    impl Notifier for Outbox {
        async fn deliver(&self, messages: &BTreeMap<i64, String>) -> Result<(), WatchError> {
            self.0.lock().unwrap().push(messages.clone());
            Ok(())
        }
    }

    struct NoLevels;

    #[async_trait]
    impl RangeLookup for NoLevels {
        async fn bands(&self, _: &str, _: f64) -> Result<PriceBand, WatchError> {
            Ok(PriceBand::default())
        }
    }

    struct Harness {
        watcher: Watcher,
        source: Arc<ScriptedSource>,
        admin: Arc<CountingAdmin>,
        outbox: Arc<Outbox>,
        _dir: tempfile::TempDir,
        _tx: watch::Sender<bool>,
    }

    fn harness(max_attempts: Option<u32>) -> Harness {
        let source = Arc::new(ScriptedSource::default());
        *source.ticks.lock().unwrap() = vec![tick(1, 0, 100.0, 1.0)];
        let admin = Arc::new(CountingAdmin::default());
        let outbox = Arc::new(Outbox::default());
        let registry = ConnectionRegistry {
            ticks: source.clone(),
            rules: Arc::new(FixedRules),
            notifier: outbox.clone(),
            levels: Arc::new(NoLevels),
            admin: admin.clone(),
        };
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = watch::channel(false);
        let watcher = Watcher::new(
            registry,
            settings(max_attempts),
            HitLog::new(dir.path().join("hits.txt")),
            build_state(),
            rx,
        );
        Harness { watcher, source, admin, outbox, _dir: dir, _tx: tx }
    }

    #[tokio::test]
    async fn test_bootstrap_anchors_rules_and_consumes_startup_window() {
        let mut h = harness(None);
        h.watcher.bootstrap(Utc::now()).await.unwrap();

        let rule = h.watcher.book.rules().next().unwrap();
        assert_eq!(rule.reference_price, 100.0);
        assert_eq!(h.watcher.caches["BTC/USD"].last_id(), Some(1));

        // Nothing new since startup → a quiet cycle.
        let summary = h.watcher.run_once(Utc::now()).await.unwrap();
        assert_eq!(summary.ticks, 0);
        assert!(summary.hits.is_empty());
    }

    #[tokio::test]
    async fn test_hit_is_logged_and_delivered() {
        let mut h = harness(None);
        h.watcher.bootstrap(Utc::now()).await.unwrap();

        h.source.ticks.lock().unwrap().push(tick(2, 5, 102.0, 1.0));
        let summary = h.watcher.run_once(Utc::now()).await.unwrap();

        assert_eq!(summary.ticks, 1);
        assert_eq!(summary.hits.len(), 1);

        let sent = h.outbox.0.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0][&9].starts_with("BTC/USD\n1.0 tick\n1.0% filter hit\n@ $102.0"));
        drop(sent);

        let log = tokio::fs::read_to_string(h.watcher.hit_log.path()).await.unwrap();
        assert!(log.contains("BTC/USD"));
    }

    #[tokio::test]
    async fn test_failure_then_recovery_reports_once_each() {
        let mut h = harness(Some(1));
        h.watcher.bootstrap(Utc::now()).await.unwrap();

        h.source.down.store(true, Ordering::SeqCst);
        assert!(h.watcher.run_once(Utc::now()).await.is_none());
        assert!(h.watcher.failed);
        assert_eq!(h.watcher.last_failure.as_ref().unwrap().0, CyclePhase::RefreshCache);
        let failures = h.admin.failures.load(Ordering::SeqCst);
        assert!(failures >= 1);

        h.source.down.store(false, Ordering::SeqCst);
        assert!(h.watcher.run_once(Utc::now()).await.is_some());
        assert!(!h.watcher.failed);
        assert_eq!(h.admin.recoveries.load(Ordering::SeqCst), 1);

        // Steady success sends no further notices.
        h.watcher.run_once(Utc::now()).await.unwrap();
        assert_eq!(h.admin.recoveries.load(Ordering::SeqCst), 1);
        assert_eq!(h.admin.failures.load(Ordering::SeqCst), failures);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_counters() {
        let mut h = harness(Some(1));
        h.watcher.bootstrap(Utc::now()).await.unwrap();
        h.source.ticks.lock().unwrap().push(tick(2, 5, 100.5, 1.0));
        h.watcher.run_once(Utc::now()).await.unwrap();
        let before = h.watcher.book.rules().next().unwrap().cusum_percent;

        h.source.down.store(true, Ordering::SeqCst);
        h.watcher.run_once(Utc::now()).await;

        let after = h.watcher.book.rules().next().unwrap().cusum_percent;
        assert_eq!(before, after);
        assert_eq!(h.watcher.caches["BTC/USD"].last_id(), Some(2));
    }

    #[tokio::test]
    async fn test_snapshot_is_published() {
        let mut h = harness(None);
        h.watcher.bootstrap(Utc::now()).await.unwrap();
        h.watcher.run_once(Utc::now()).await.unwrap();

        let snap = h.watcher.state.snapshot.read().await.clone();
        assert_eq!(snap.phase, WatcherPhase::Running);
        assert_eq!(snap.cycles, 1);
        assert_eq!(snap.rules.len(), 1);
        assert_eq!(snap.markets[0].market, "BTC/USD");
    }

    #[test]
    fn test_next_aligned_delay() {
        let interval = Duration::from_secs(10);
        let at = |s: i64, ms: u32| Utc.timestamp_opt(1_700_000_000 + s, ms * 1_000_000).unwrap();

        assert_eq!(next_aligned_delay(at(3, 0), interval), Duration::from_secs(7));
        assert_eq!(next_aligned_delay(at(9, 750), interval), Duration::from_millis(250));
        assert_eq!(next_aligned_delay(at(0, 0), interval), interval);
    }
}
