//! # models::watchlist
//!
//! Raw documents as the rule store keeps them, and their normalisation into
//! one [`Subscribers`] set per [`RuleKey`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::rule::{AggSpec, RuleKey, Subscribers};

/// One user's watchlist document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchlistRecord {
    /// Chat id notifications are delivered to.
    #[serde(rename = "TGChatID")]
    pub user_id: i64,

    #[serde(rename = "TGUsername", default)]
    pub username: String,

    #[serde(rename = "watchList", default)]
    pub entries: Vec<WatchlistEntry>,
}

/// The aggregations one user watches on one market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchlistEntry {
    pub market: String,
    /// `type_unit_percent` strings, e.g. `"volume_25_1.5"`.
    #[serde(default)]
    pub aggs: Vec<String>,
}

/// Normalised rule set: one subscriber set per unique rule key.
pub type RuleCatalog = BTreeMap<RuleKey, Subscribers>;

/// Folds every user's entries into unique rule keys.
///
/// Entries that cannot be mapped onto a rule are logged as schema drift and
/// skipped; the rest of the catalog is still built.
pub fn normalize(records: &[WatchlistRecord]) -> RuleCatalog {
    let mut catalog = RuleCatalog::new();

    for record in records {
        for entry in &record.entries {
            for raw in &entry.aggs {
                match raw.parse::<AggSpec>() {
                    Ok(spec) => {
                        catalog
                            .entry(RuleKey::new(entry.market.clone(), spec))
                            .or_default()
                            .insert(record.user_id, &record.username);
                    }
                    Err(e) => {
                        warn!(
                            user_id = record.user_id,
                            market  = %entry.market,
                            error   = %e,
                            "Skipping watchlist entry"
                        );
                    }
                }
            }
        }
    }

    catalog
}
