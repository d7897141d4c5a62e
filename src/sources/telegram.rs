//! # sources::telegram
//!
//! Push delivery and admin reports through the Telegram Bot API
//! (`POST https://api.telegram.org/bot{token}/sendMessage`).
//!
//! Without a bot token the watcher runs with [`LogChannel`], which only
//! writes what it would have sent to the log.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::WatchError;
use crate::sources::{AdminChannel, Notifier};

const API_BASE: &str = "https://api.telegram.org";

/// Placeholder chat id used by rule-store fixtures; never messaged.
pub const NO_CHAT: i64 = -1;

pub fn crash_report(error: &str) -> String {
    format!("BOT CRASH: error message reads: {error}")
}

pub const LIVE_REPORT: &str = "BOT LIVE: Back up and running.";

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
}

pub struct TelegramBot {
    client: reqwest::Client,
    endpoint: String,
    admin_chat: Option<String>,
}

impl TelegramBot {
    pub fn new(client: reqwest::Client, token: &str, admin_chat: Option<String>) -> Self {
        Self {
            client,
            endpoint: format!("{API_BASE}/bot{token}/sendMessage"),
            admin_chat,
        }
    }

    async fn send(&self, chat_id: &str, text: &str) -> Result<(), WatchError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&SendMessage { chat_id, text })
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| WatchError::Notify(format!("telegram unreachable: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(WatchError::Notify(format!("chat {chat_id}: HTTP {status}: {body}")));
        }
        Ok(())
    }

    async fn send_admin(&self, text: &str) {
        let Some(chat) = &self.admin_chat else {
            warn!(text, "No admin chat configured — report dropped");
            return;
        };
        if let Err(e) = self.send(chat, text).await {
            error!(error = %e, "Admin report failed");
        }
    }
}

#[async_trait]
impl Notifier for TelegramBot {
    /// Best-effort: every failed chat is logged, and the call only fails when
    /// nothing at all was delivered.
    async fn deliver(&self, messages: &BTreeMap<i64, String>) -> Result<(), WatchError> {
        let mut delivered = 0usize;
        let mut last_err = None;

        for (chat_id, text) in messages.iter().filter(|(id, _)| **id != NO_CHAT) {
            match self.send(&chat_id.to_string(), text).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(chat_id, error = %e, "Notification not delivered");
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(e) if delivered == 0 => Err(e),
            _ => {
                info!(delivered, "Notifications sent");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl AdminChannel for TelegramBot {
    async fn report_failure(&self, error: &str) {
        self.send_admin(&crash_report(error)).await;
    }

    async fn report_recovery(&self) {
        self.send_admin(LIVE_REPORT).await;
    }
}

// ─── LogChannel ───────────────────────────────────────────────────────────────

/// Stand-in for both channels when no bot token is configured.
#[derive(Debug, Default)]
pub struct LogChannel;

#[async_trait]
impl Notifier for LogChannel {
    async fn deliver(&self, messages: &BTreeMap<i64, String>) -> Result<(), WatchError> {
        for (chat_id, text) in messages.iter().filter(|(id, _)| **id != NO_CHAT) {
            info!(chat_id, text = %text, "[log-only] notification");
        }
        Ok(())
    }
}

#[async_trait]
impl AdminChannel for LogChannel {
    async fn report_failure(&self, error: &str) {
        error!("[log-only] {}", crash_report(error));
    }

    async fn report_recovery(&self) {
        info!("[log-only] {LIVE_REPORT}");
    }
}
