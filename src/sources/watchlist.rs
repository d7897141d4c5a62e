//! Rule stores: a JSON document on disk, or the same document served over HTTP.
//!
//! Both hold a JSON array of [`WatchlistRecord`]s.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::WatchError;
use crate::models::WatchlistRecord;
use crate::sources::RuleStore;

fn parse(raw: &str, origin: &str) -> Result<Vec<WatchlistRecord>, WatchError> {
    serde_json::from_str(raw).map_err(|e| WatchError::RuleStore(format!("{origin}: {e}")))
}

// ─── File ─────────────────────────────────────────────────────────────────────

pub struct FileRuleStore {
    path: PathBuf,
}

impl FileRuleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RuleStore for FileRuleStore {
    async fn pull(&self) -> Result<Vec<WatchlistRecord>, WatchError> {
        let origin = self.path.display().to_string();
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| WatchError::RuleStore(format!("{origin}: {e}")))?;
        let records = parse(&raw, &origin)?;
        debug!(path = %origin, users = records.len(), "Watchlist loaded");
        Ok(records)
    }
}

// ─── HTTP ─────────────────────────────────────────────────────────────────────

pub struct HttpRuleStore {
    client: reqwest::Client,
    url: String,
}

impl HttpRuleStore {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self { client, url: url.into() }
    }
}

#[async_trait]
impl RuleStore for HttpRuleStore {
    async fn pull(&self) -> Result<Vec<WatchlistRecord>, WatchError> {
        let resp = self
            .client
            .get(&self.url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| WatchError::RuleStore(format!("{}: {e}", self.url)))?;

        if !resp.status().is_success() {
            return Err(WatchError::RuleStore(format!("{}: HTTP {}", self.url, resp.status())));
        }

        let raw = resp
            .text()
            .await
            .map_err(|e| WatchError::RuleStore(format!("{}: {e}", self.url)))?;
        let records = parse(&raw, &self.url)?;
        debug!(url = %self.url, users = records.len(), "Watchlist fetched");
        Ok(records)
    }
}
