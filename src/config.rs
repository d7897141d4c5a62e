//! # config
//!
//! Everything the watcher reads from the environment.  See `.env.example`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};

use crate::engine::fetch::{FetchSettings, RetryPolicy};

/// Where user watchlists are read from.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchlistSource {
    File(PathBuf),
    Url(String),
}

impl std::fmt::Display for WatchlistSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchlistSource::File(p) => write!(f, "file:{}", p.display()),
            WatchlistSource::Url(u) => write!(f, "{u}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Cycle length; cycles start on multiples of it.
    pub poll_interval:     Duration,
    /// Extra reach of the one-time bootstrap fetch.
    pub bootstrap_lookback: Duration,
    /// Base fetch window (the interval is added on top).
    pub fetch_window:      Duration,
    pub retry_delay:       Duration,
    /// `None` retries forever.
    pub max_retries:       Option<u32>,
    pub exchange_url:      String,
    pub exchange_page_limit: usize,
    pub watchlist:         WatchlistSource,
    pub levels_path:       PathBuf,
    /// Unset → notifications and admin reports only go to the log.
    pub bot_token:         Option<String>,
    pub bot_admin:         Option<String>,
    pub hit_log_path:      PathBuf,
    /// Unset → no status server.
    pub status_addr:       Option<SocketAddr>,
}

fn var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn number<T: std::str::FromStr>(key: &str, default: &str) -> anyhow::Result<T> {
    var_or(key, default)
        .trim()
        .parse()
        .ok()
        .with_context(|| format!("{key} must be a number"))
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let interval_secs: u64 = number("POLL_INTERVAL_SECS", "10")?;
        if interval_secs == 0 {
            bail!("POLL_INTERVAL_SECS must be at least 1");
        }

        let page_limit: usize = number("EXCHANGE_PAGE_LIMIT", "5000")?;
        if page_limit == 0 {
            bail!("EXCHANGE_PAGE_LIMIT must be at least 1");
        }

        let max_retries: u32 = number("FETCH_MAX_RETRIES", "0")?;

        let watchlist = match (non_empty("WATCHLIST_URL"), non_empty("WATCHLIST_PATH")) {
            (Some(_), Some(_)) => bail!("Set either WATCHLIST_URL or WATCHLIST_PATH, not both"),
            (Some(url), None) => WatchlistSource::Url(url),
            (None, path) => WatchlistSource::File(path.unwrap_or_else(|| "watchlist.json".to_string()).into()),
        };

        let status_addr = non_empty("STATUS_BIND_ADDR")
            .map(|a| a.parse::<SocketAddr>().with_context(|| format!("STATUS_BIND_ADDR '{a}' is not host:port")))
            .transpose()?;

        Ok(Self {
            poll_interval:       Duration::from_secs(interval_secs),
            bootstrap_lookback:  Duration::from_secs(number("BOOTSTRAP_LOOKBACK_SECS", "1000000")?),
            fetch_window:        Duration::from_secs(number("FETCH_WINDOW_SECS", "120")?),
            retry_delay:         Duration::from_millis(number("FETCH_RETRY_DELAY_MS", "500")?),
            max_retries:         (max_retries > 0).then_some(max_retries),
            exchange_url:        var_or("EXCHANGE_URL", "https://ftx.com/api"),
            exchange_page_limit: page_limit,
            watchlist,
            levels_path:         var_or("LEVELS_PATH", "levels.json").into(),
            bot_token:           non_empty("BOT_TOKEN"),
            bot_admin:           non_empty("BOT_ADMIN"),
            hit_log_path:        var_or("HIT_LOG_PATH", "logfile.txt").into(),
            status_addr,
        })
    }

    pub fn fetch_settings(&self) -> FetchSettings {
        FetchSettings {
            interval: self.poll_interval,
            window: self.fetch_window,
            bootstrap_lookback: self.bootstrap_lookback,
            retry: RetryPolicy { delay: self.retry_delay, max_attempts: self.max_retries },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Tests below mutate the process environment.
    static ENV: Mutex<()> = Mutex::new(());

    const KEYS: &[&str] = &[
        "POLL_INTERVAL_SECS", "FETCH_MAX_RETRIES", "WATCHLIST_URL", "WATCHLIST_PATH",
        "STATUS_BIND_ADDR", "BOT_TOKEN", "EXCHANGE_PAGE_LIMIT",
    ];

    fn clear() {
        for k in KEYS {
            std::env::remove_var(k);
        }
    }

    #[test]
    fn test_defaults() {
        let _g = ENV.lock().unwrap_or_else(|e| e.into_inner());
        clear();

        let c = Config::from_env().unwrap();
        assert_eq!(c.poll_interval, Duration::from_secs(10));
        assert_eq!(c.max_retries, None);
        assert_eq!(c.watchlist, WatchlistSource::File("watchlist.json".into()));
        assert!(c.bot_token.is_none());
        assert!(c.status_addr.is_none());

        let s = c.fetch_settings();
        assert_eq!(s.retry.delay, Duration::from_millis(500));
        assert_eq!(s.bootstrap_lookback, Duration::from_secs(1_000_000));
    }

    #[test]
    fn test_overrides_and_rejects() {
        let _g = ENV.lock().unwrap_or_else(|e| e.into_inner());
        clear();

        std::env::set_var("FETCH_MAX_RETRIES", "5");
        std::env::set_var("WATCHLIST_URL", "http://rules.local/watchlist");
        std::env::set_var("STATUS_BIND_ADDR", "127.0.0.1:8090");
        let c = Config::from_env().unwrap();
        assert_eq!(c.max_retries, Some(5));
        assert_eq!(c.watchlist, WatchlistSource::Url("http://rules.local/watchlist".into()));
        assert_eq!(c.status_addr.unwrap().port(), 8090);

        std::env::set_var("POLL_INTERVAL_SECS", "0");
        assert!(Config::from_env().is_err());

        std::env::set_var("POLL_INTERVAL_SECS", "ten");
        assert!(Config::from_env().is_err());

        clear();
    }
}
