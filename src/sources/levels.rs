//! Support/resistance levels from a JSON file keyed by base asset:
//!
//! ```json
//! { "BTC": [38000, 40000, 42000], "ETH": [2800, 3000] }
//! ```
//!
//! The file is re-read on every lookup so levels can be edited while the
//! watcher runs.  A missing file yields an unknown band.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use crate::error::WatchError;
use crate::sources::{PriceBand, RangeLookup};

pub struct FileLevels {
    path: PathBuf,
}

impl FileLevels {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> Result<HashMap<String, Vec<f64>>, WatchError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No levels file");
                return Ok(HashMap::new());
            }
            Err(e) => {
                let context = format!("reading levels file {}", self.path.display());
                return Err(anyhow::Error::new(e).context(context).into());
            }
        };
        serde_json::from_str(&raw)
            .map_err(|e| WatchError::SchemaDrift(format!("levels file {}: {e}", self.path.display())))
    }
}

/// `BTC/USD` → `BTC`, `BTC-PERP` → `BTC`.
pub fn base_asset(market: &str) -> &str {
    market.split(['/', '-']).next().unwrap_or(market)
}

#[async_trait]
impl RangeLookup for FileLevels {
    async fn bands(&self, market: &str, price: f64) -> Result<PriceBand, WatchError> {
        let levels = self.load().await?;
        Ok(levels
            .get(base_asset(market))
            .map(|l| PriceBand::bracket(l, price))
            .unwrap_or_default())
    }
}
