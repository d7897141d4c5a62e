//! # connections
//!
//! [`ConnectionRegistry`] — every external collaborator, built once in
//! `main` from [`Config`] and handed to the watcher by reference.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use crate::config::{Config, WatchlistSource};
use crate::sources::exchange::RestTickSource;
use crate::sources::levels::FileLevels;
use crate::sources::telegram::{LogChannel, TelegramBot};
use crate::sources::watchlist::{FileRuleStore, HttpRuleStore};
use crate::sources::{AdminChannel, Notifier, RangeLookup, RuleStore, TickSource};

#[derive(Clone)]
pub struct ConnectionRegistry {
    pub ticks: Arc<dyn TickSource>,
    pub rules: Arc<dyn RuleStore>,
    pub notifier: Arc<dyn Notifier>,
    pub levels: Arc<dyn RangeLookup>,
    pub admin: Arc<dyn AdminChannel>,
}

impl ConnectionRegistry {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        // One pooled client shared by every HTTP collaborator.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;

        let ticks = Arc::new(RestTickSource::new(
            client.clone(),
            config.exchange_url.clone(),
            config.exchange_page_limit,
        ));

        let rules: Arc<dyn RuleStore> = match &config.watchlist {
            WatchlistSource::File(path) => Arc::new(FileRuleStore::new(path.clone())),
            WatchlistSource::Url(url) => Arc::new(HttpRuleStore::new(client.clone(), url.clone())),
        };

        let (notifier, admin): (Arc<dyn Notifier>, Arc<dyn AdminChannel>) = match &config.bot_token {
            Some(token) => {
                if config.bot_admin.is_none() {
                    warn!("BOT_ADMIN not set — crash reports will only be logged");
                }
                let bot = Arc::new(TelegramBot::new(client, token, config.bot_admin.clone()));
                let notifier: Arc<dyn Notifier> = bot.clone();
                let admin: Arc<dyn AdminChannel> = bot;
                (notifier, admin)
            }
            None => {
                warn!("BOT_TOKEN not set — notifications go to the log only");
                let notifier: Arc<dyn Notifier> = Arc::new(LogChannel);
                let admin: Arc<dyn AdminChannel> = Arc::new(LogChannel);
                (notifier, admin)
            }
        };

        info!(
            exchange  = %config.exchange_url,
            watchlist = %config.watchlist,
            levels    = %config.levels_path.display(),
            "Connections ready"
        );

        Ok(Self {
            ticks,
            rules,
            notifier,
            levels: Arc::new(FileLevels::new(config.levels_path.clone())),
            admin,
        })
    }
}
