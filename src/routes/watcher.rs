//! # routes::watcher
//!
//! Read-only status endpoints over the last published [`WatchSnapshot`].
//!
//! ## Endpoints
//!
//! | Method    | Path                                | Description                      |
//! |-----------|-------------------------------------|----------------------------------|
//! | GET (WS)  | `/ws/watcher`                       | Real-time [`WatchEvent`] stream  |
//! | GET       | `/api/watcher/health`               | Phase, cycle count, failure flag |
//! | GET       | `/api/watcher/rules`                | Every rule's counters            |
//! | GET       | `/api/watcher/markets`              | Every market cursor              |
//! | GET       | `/api/watcher/markets/:base/:quote` | One market cursor, or 404        |
//!
//! [`WatchSnapshot`]: crate::state::WatchSnapshot
//! [`WatchEvent`]: crate::events::WatchEvent

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
    Json,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tracing::{debug, info};

use crate::{error::ApiError, state::SharedState};

// ─── WebSocket Handler ────────────────────────────────────────────────────────

pub async fn ws_watcher(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let mut rx = state.broadcast_tx.subscribe();
    let (mut sender, mut receiver) = socket.split();

    info!("WebSocket client connected");

    // ── Current snapshot first ───────────────────────────────────────────────
    let snapshot = {
        let snap = state.snapshot.read().await;
        json!({
            "event":    "SNAPSHOT",
            "phase":    snap.phase,
            "cycles":   snap.cycles,
            "failed":   snap.failed,
            "rules":    snap.rules,
            "markets":  snap.markets,
        })
        .to_string()
    };

    if sender.send(Message::Text(snapshot)).await.is_err() {
        return;
    }

    // ── Event Loop ───────────────────────────────────────────────────────────
    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(json_str) => {
                        if sender.send(Message::Text(json_str)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        debug!("WS client lagged, skipped {n} events");
                    }
                    Err(_) => break,
                }
            }

            result = receiver.next() => {
                match result {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sender.send(Message::Pong(data)).await;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("WebSocket client disconnected");
}

// ─── REST Endpoints ───────────────────────────────────────────────────────────

/// GET /api/watcher/health
pub async fn get_health(State(state): State<SharedState>) -> impl IntoResponse {
    let snap = state.snapshot.read().await;
    Json(json!({
        "ok":            true,
        "phase":         snap.phase,
        "cycles":        snap.cycles,
        "failed":        snap.failed,
        "last_failure":  snap.last_failure,
        "last_cycle_at": snap.last_cycle_at,
        "rules":         snap.rules.len(),
        "markets":       snap.markets.len(),
    }))
}

/// GET /api/watcher/rules
pub async fn get_rules(State(state): State<SharedState>) -> impl IntoResponse {
    let snap = state.snapshot.read().await;
    Json(json!({
        "ok":    true,
        "count": snap.rules.len(),
        "rules": snap.rules,
    }))
}

/// GET /api/watcher/markets
pub async fn get_markets(State(state): State<SharedState>) -> impl IntoResponse {
    let snap = state.snapshot.read().await;
    Json(json!({
        "ok":      true,
        "count":   snap.markets.len(),
        "markets": snap.markets,
    }))
}

/// GET /api/watcher/markets/:base/:quote — market names carry a slash.
pub async fn get_market(
    State(state): State<SharedState>,
    Path((base, quote)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let market = format!("{base}/{quote}");
    let snap = state.snapshot.read().await;
    let stats = snap
        .markets
        .iter()
        .find(|m| m.market == market)
        .ok_or_else(|| ApiError::NotFound(format!("market {market} is not watched")))?;

    Ok(Json(json!({
        "ok":     true,
        "market": stats,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::cache::CacheStats;
    use crate::state::{build_state, WatchSnapshot};
    use axum::http::StatusCode;

    fn stats(market: &str) -> CacheStats {
        CacheStats {
            market: market.to_string(),
            ticks: 3,
            volume: 1.5,
            dollar: 61_500.0,
            last_id: Some(42),
            last_time: None,
            last_price: 41_000.0,
        }
    }

    #[tokio::test]
    async fn test_get_market_found_and_missing() {
        let state = build_state();
        state
            .publish(WatchSnapshot { markets: vec![stats("BTC/USD")], ..WatchSnapshot::default() })
            .await;

        let found = get_market(State(state.clone()), Path(("BTC".into(), "USD".into())))
            .await
            .map(IntoResponse::into_response)
            .unwrap();
        assert_eq!(found.status(), StatusCode::OK);

        let missing = get_market(State(state), Path(("ETH".into(), "USD".into())))
            .await
            .err()
            .unwrap();
        assert_eq!(missing.into_response().status(), StatusCode::NOT_FOUND);
    }
}
