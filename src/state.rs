//! # state
//!
//! Shared state between the watcher (single writer, once per cycle) and the
//! status server (many readers).
//!
//! * The watcher owns its rules and caches outright.  At the end of every
//!   cycle it publishes a [`WatchSnapshot`] copy here, so handlers never
//!   touch engine state.
//! * `broadcast_tx` carries pre-serialised [`WatchEvent`]s to WebSocket
//!   clients.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};

use crate::engine::cache::CacheStats;
use crate::error::CyclePhase;
use crate::events::WatchEvent;
use crate::models::Rule;

/// Where the watcher currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WatcherPhase {
    Starting,
    Running,
    Stopped,
}

/// Read-only copy of the engine, published once per cycle.
#[derive(Debug, Clone, Serialize)]
pub struct WatchSnapshot {
    pub phase: WatcherPhase,
    pub cycles: u64,
    /// Set after a failed cycle, cleared by the next successful one.
    pub failed: bool,
    pub last_failure: Option<(CyclePhase, String)>,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub rules: Vec<Rule>,
    pub markets: Vec<CacheStats>,
}

impl Default for WatchSnapshot {
    fn default() -> Self {
        Self {
            phase: WatcherPhase::Starting,
            cycles: 0,
            failed: false,
            last_failure: None,
            last_cycle_at: None,
            rules: Vec::new(),
            markets: Vec::new(),
        }
    }
}

// ─── AppState ─────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub snapshot: Arc<RwLock<WatchSnapshot>>,
    pub broadcast_tx: broadcast::Sender<String>,
}

impl AppState {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(256);
        Self {
            snapshot: Arc::new(RwLock::new(WatchSnapshot::default())),
            broadcast_tx,
        }
    }

    /// Sends `event` to every WebSocket client.  No listeners is not an error.
    pub fn broadcast(&self, event: &WatchEvent) {
        let _ = self.broadcast_tx.send(event.to_json());
    }

    pub async fn publish(&self, snapshot: WatchSnapshot) {
        *self.snapshot.write().await = snapshot;
    }

    pub async fn set_phase(&self, phase: WatcherPhase) {
        self.snapshot.write().await.phase = phase;
    }
}

pub type SharedState = Arc<AppState>;

pub fn build_state() -> SharedState {
    Arc::new(AppState::new())
}
