//! # models::rule
//!
//! The user-facing alert definition and its live counter state.
//!
//! A [`Rule`] exists once per unique [`RuleKey`]
//! `(market, agg_type, agg_unit, agg_perc)`, no matter how many users asked
//! for it; the users are folded into its [`Subscribers`].

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::WatchError;

// ─── AggType ──────────────────────────────────────────────────────────────────

/// The cumulative measure that spaces aggregation points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggType {
    /// One point every `agg_unit` trades.
    Tick,
    /// One point every `agg_unit` base units traded.
    Volume,
    /// One point every `agg_unit` of notional traded.
    Dollar,
}

impl fmt::Display for AggType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggType::Tick => write!(f, "tick"),
            AggType::Volume => write!(f, "volume"),
            AggType::Dollar => write!(f, "dollar"),
        }
    }
}

impl FromStr for AggType {
    type Err = WatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tick" => Ok(AggType::Tick),
            "volume" => Ok(AggType::Volume),
            "dollar" => Ok(AggType::Dollar),
            other => Err(WatchError::SchemaDrift(format!("unknown aggregation type '{other}'"))),
        }
    }
}

// ─── AggSpec ──────────────────────────────────────────────────────────────────

/// One `type_unit_percent` entry of a user's watchlist, e.g. `dollar_1000_0.5`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggSpec {
    pub agg_type: AggType,
    pub agg_unit: f64,
    pub agg_perc: f64,
}

impl FromStr for AggSpec {
    type Err = WatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('_');
        let (Some(kind), Some(unit), Some(perc), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(WatchError::SchemaDrift(format!(
                "aggregation '{s}' is not of the form type_unit_percent"
            )));
        };

        let agg_type = kind.parse()?;
        let agg_unit = parse_positive(unit, "unit", s)?;
        let agg_perc = parse_positive(perc, "percent", s)?;

        Ok(Self { agg_type, agg_unit, agg_perc })
    }
}

fn parse_positive(raw: &str, what: &str, whole: &str) -> Result<f64, WatchError> {
    // Same shape the bot accepts: digits with an optional fractional part.
    let well_formed = !raw.is_empty()
        && raw.split('.').count() <= 2
        && raw.split('.').all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()));

    let value = if well_formed { raw.parse::<f64>().ok() } else { None };

    match value {
        Some(v) if v > 0.0 && v.is_finite() => Ok(v),
        _ => Err(WatchError::SchemaDrift(format!(
            "aggregation '{whole}' has invalid {what} '{raw}'"
        ))),
    }
}

// ─── RuleKey ──────────────────────────────────────────────────────────────────

/// Join key for reconciliation: two rules are "the same rule" iff their keys
/// are equal.  Float fields compare by total order so the key can live in
/// ordered maps.
#[derive(Debug, Clone, Serialize)]
pub struct RuleKey {
    pub market: String,
    pub agg_type: AggType,
    pub agg_unit: f64,
    pub agg_perc: f64,
}

impl RuleKey {
    pub fn new(market: impl Into<String>, spec: AggSpec) -> Self {
        Self {
            market: market.into(),
            agg_type: spec.agg_type,
            agg_unit: spec.agg_unit,
            agg_perc: spec.agg_perc,
        }
    }
}

impl PartialEq for RuleKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RuleKey {}

impl PartialOrd for RuleKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RuleKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.market
            .cmp(&other.market)
            .then(self.agg_type.cmp(&other.agg_type))
            .then(self.agg_unit.total_cmp(&other.agg_unit))
            .then(self.agg_perc.total_cmp(&other.agg_perc))
    }
}

impl Hash for RuleKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.market.hash(state);
        self.agg_type.hash(state);
        self.agg_unit.to_bits().hash(state);
        self.agg_perc.to_bits().hash(state);
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}_{}_{}",
            self.market, self.agg_type, self.agg_unit, self.agg_perc
        )
    }
}

// ─── Subscribers ──────────────────────────────────────────────────────────────

/// Everyone who asked for a rule.  Ordered sets so snapshots compare equal
/// regardless of the order the rule store returned users in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Subscribers {
    pub user_ids: BTreeSet<i64>,
    pub usernames: BTreeSet<String>,
}

impl Subscribers {
    pub fn insert(&mut self, user_id: i64, username: &str) {
        self.user_ids.insert(user_id);
        self.usernames.insert(username.to_string());
    }
}

// ─── Rule ─────────────────────────────────────────────────────────────────────

/// Live CUSUM counter for one rule key.
#[derive(Debug, Clone, Serialize)]
pub struct Rule {
    pub key: RuleKey,
    pub subscribers: Subscribers,

    /// Fractional aggregation points accumulated but not yet consumed.
    pub progress: f64,

    /// Absolute percent movement accumulated since the last threshold reset.
    pub cusum_percent: f64,

    /// Price sampled at the most recent aggregation point.  Never 0.
    pub reference_price: f64,

    /// Whether the last aggregation pass crossed the threshold.
    pub hit: bool,
}

impl Rule {
    /// A fresh counter anchored at `reference_price`.
    pub fn new(key: RuleKey, subscribers: Subscribers, reference_price: f64) -> Self {
        Self {
            key,
            subscribers,
            progress: 0.0,
            cusum_percent: 0.0,
            reference_price,
            hit: false,
        }
    }

    #[inline]
    pub fn market(&self) -> &str {
        &self.key.market
    }
}
