//! # events
//!
//! [`WatchEvent`] — everything the watcher broadcasts to `/ws/watcher`
//! clients.
//!
//! Events travel over a `tokio::sync::broadcast::Sender<String>` as
//! pre-serialised JSON.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::engine::aggregation::Hit;
use crate::engine::reconcile::ReconcileReport;
use crate::error::CyclePhase;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WatchEvent {
    /// A cycle ran every phase.
    CycleCompleted {
        cycle:    u64,
        at:       DateTime<Utc>,
        ticks:    usize,
        rules:    usize,
        hits:     usize,
    },

    /// One rule crossed its threshold.
    RuleHit {
        hit:     Box<Hit>,
        message: String,
    },

    /// A cycle was abandoned; state from before the failing phase is kept.
    CycleFailed {
        cycle: u64,
        phase: CyclePhase,
        error: String,
    },

    /// First successful cycle after one or more failures.
    Recovered {
        cycle: u64,
    },

    /// The rule set changed and was merged into the live rules.
    RulesReconciled {
        report: ReconcileReport,
    },
}

impl WatchEvent {
    #[inline]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"event":"SERIALIZATION_ERROR"}"#.to_string())
    }
}
