//! # CUSUM Watcher — tick-aggregated price-movement alerts
//!
//! ## Architecture Overview
//!
//! ```text
//!  ┌──────────────┐  trades (REST, paginated)   ┌──────────────────────────┐
//!  │  Exchange    │ ───────────────────────────▶│                          │
//!  └──────────────┘                             │   Watcher                │
//!  ┌──────────────┐  watchlists (file / HTTP)   │   cache → reconcile →    │──▶ Telegram (per user)
//!  │  Rule store  │ ───────────────────────────▶│   CUSUM → hit log        │──▶ logfile.txt
//!  └──────────────┘                             └──────────────────────────┘
//!                                                          │ snapshot + events
//!  ┌──────────────┐   GET /api/watcher/*                   ▼
//!  │  Dashboard   │ ◀──────────────────────────────  AppState (optional server)
//!  └──────────────┘   WS  /ws/watcher
//! ```
//!
//! ## Environment Variables
//!
//! See [`config::Config`]; the common ones:
//!
//! | Variable             | Default          | Description                     |
//! |----------------------|------------------|---------------------------------|
//! | `POLL_INTERVAL_SECS` | `10`             | Cycle interval                  |
//! | `WATCHLIST_PATH`     | `watchlist.json` | Rule store document             |
//! | `BOT_TOKEN`          | —                | Telegram bot (unset → log only) |
//! | `STATUS_BIND_ADDR`   | —                | Status server (unset → off)     |
//! | `RUST_LOG`           | `cusum_watcher=debug` | Tracing filter             |

use anyhow::Context;
use axum::{routing::get, Router};
use tokio::sync::watch;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod connections;
mod engine;
mod error;
mod events;
mod hit_log;
mod messages;
mod models;
mod routes;
mod sources;
mod state;

use config::Config;
use connections::ConnectionRegistry;
use engine::scheduler::Watcher;
use hit_log::HitLog;
use routes::watcher::{get_health, get_market, get_markets, get_rules, ws_watcher};
use state::{build_state, SharedState};

// ─── Entry Point ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Load .env (optional — prod can use real env vars) ─────────────────
    dotenvy::dotenv().ok();

    // ── 2. Initialise structured logging ─────────────────────────────────────
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env()
            .add_directive("cusum_watcher=debug".parse()?)
            .add_directive("reqwest=warn".parse()?)
            .add_directive("tower_http=info".parse()?))
        .init();

    info!(
        r#"

  ╔═══════════════════════════════════════════════╗
  ║        CUSUM WATCHER — Price Movement Alerts  ║
  ║        tick · volume · dollar aggregation     ║
  ╚═══════════════════════════════════════════════╝"#
    );

    // ── 3. Config + collaborators ────────────────────────────────────────────
    let config = Config::from_env().context("Failed to load config")?;
    let registry = ConnectionRegistry::from_config(&config).context("Failed to build connections")?;
    let state = build_state();

    info!(
        interval  = ?config.poll_interval,
        lookback  = ?config.bootstrap_lookback,
        retries   = ?config.max_retries,
        hit_log   = %config.hit_log_path.display(),
        "Watcher configured"
    );

    // ── 4. Shutdown signal (Ctrl-C) ──────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl-C"),
        }
        let _ = shutdown_tx.send(true);
    });

    // ── 5. Optional status server ────────────────────────────────────────────
    if let Some(addr) = config.status_addr {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind status server on {addr}"))?;
        let app = status_router(state.clone());
        let mut server_shutdown = shutdown_rx.clone();

        info!(%addr, "Status server starting");
        tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = server_shutdown.wait_for(|stop| *stop).await;
            });
            if let Err(e) = serve.await {
                error!(error = %e, "Status server stopped");
            }
        });
    }

    // ── 6. Watcher loop (runs until shutdown) ────────────────────────────────
    let watcher = Watcher::new(
        registry,
        config.fetch_settings(),
        HitLog::new(config.hit_log_path.clone()),
        state,
        shutdown_rx,
    );
    watcher.run().await;

    Ok(())
}

fn status_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/watcher/health",              get(get_health))
        .route("/api/watcher/rules",               get(get_rules))
        .route("/api/watcher/markets",             get(get_markets))
        .route("/api/watcher/markets/:base/:quote", get(get_market))
        .route("/ws/watcher",                      get(ws_watcher))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
