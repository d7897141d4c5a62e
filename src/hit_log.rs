//! Append-only, human-readable record of every cycle that produced hits.
//!
//! ```text
//! 2024-03-01 12:00:10.004211
//! BTC/USD  dollar  1000.0  0.5%  @ 41250.5  cusum 0.132  users [1, 2]
//! ETH/USD  tick    50.0    1.0%  @ 3012.25  cusum 0.0    users [2]
//!
//! ```

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;

use crate::engine::aggregation::Hit;
use crate::error::WatchError;

pub struct HitLog {
    path: PathBuf,
}

impl HitLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[cfg(test)]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Appends one block for `hits`.  Does nothing when there are none.
    pub async fn append(&self, at: DateTime<Utc>, hits: &[Hit]) -> Result<(), WatchError> {
        if hits.is_empty() {
            return Ok(());
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(render(at, hits).as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

fn render(at: DateTime<Utc>, hits: &[Hit]) -> String {
    let mut block = format!("{}\n", at.format("%Y-%m-%d %H:%M:%S%.6f"));
    for hit in hits {
        block.push_str(&format!(
            "{}  {}  {:?}  {:?}%  @ {:?}  cusum {:?}  users {:?}\n",
            hit.key.market,
            hit.key.agg_type,
            hit.key.agg_unit,
            hit.key.agg_perc,
            hit.price,
            hit.cusum_percent,
            hit.user_ids,
        ));
    }
    block.push('\n');
    block
}
