//! Domain models shared across the watcher.

pub mod rule;
pub mod tick;
pub mod watchlist;

pub use rule::{AggType, Rule, RuleKey};
pub use tick::Tick;
pub use watchlist::{normalize, RuleCatalog, WatchlistRecord};
