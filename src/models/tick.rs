//! # models::tick
//!
//! Defines [`Tick`], a single executed trade as reported by the exchange.
//!
//! Ticks are immutable once fetched.  Their natural order is `(time, id)`,
//! which is the order every cache and index in the engine relies on.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Aggressor side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

/// A single trade tick for one market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// Exchange trade id, monotonically increasing per market.
    pub id: u64,

    /// UTC time the trade executed.
    pub time: DateTime<Utc>,

    /// Execution price (> 0).
    pub price: f64,

    /// Executed size in base units (> 0).
    pub size: f64,

    pub side: Side,

    /// Whether the trade was a forced liquidation.
    #[serde(default)]
    pub liquidation: bool,
}

impl Tick {
    /// Notional value of the trade: `price * size`.
    #[inline]
    pub fn dollar(&self) -> f64 {
        self.price * self.size
    }

    /// Ordering used throughout the engine: by time, then by id.
    #[inline]
    pub fn chronological(a: &Tick, b: &Tick) -> Ordering {
        a.time.cmp(&b.time).then(a.id.cmp(&b.id))
    }
}
