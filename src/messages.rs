//! Hit notification text and the per-user message registry.

use std::collections::BTreeMap;

use crate::engine::aggregation::Hit;
use crate::sources::PriceBand;

/// Notification body for one hit rule.
///
/// ```text
/// BTC/USD
/// 1000.0 dollar
/// 0.5% filter hit
/// @ $41250.5
///
/// Active range:
/// (40000.0, 42000.0)
/// ```
pub fn format_hit(hit: &Hit, band: PriceBand) -> String {
    format!(
        "{}\n{:?} {}\n{:?}% filter hit\n@ ${:?}\n\nActive range:\n{}",
        hit.key.market, hit.key.agg_unit, hit.key.agg_type, hit.key.agg_perc, hit.price, band,
    )
}

/// Folds every hit's message into one message per subscribed user, joining
/// a user's messages with a blank line in hit order.
pub fn registry<'a>(hits: impl IntoIterator<Item = (&'a Hit, String)>) -> BTreeMap<i64, String> {
    let mut out: BTreeMap<i64, String> = BTreeMap::new();
    for (hit, msg) in hits {
        for user in &hit.user_ids {
            out.entry(*user)
                .and_modify(|m| {
                    m.push_str("\n\n");
                    m.push_str(&msg);
                })
                .or_insert_with(|| msg.clone());
        }
    }
    out
}
