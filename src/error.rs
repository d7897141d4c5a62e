//! # error
//!
//! Centralised error types.
//!
//! * [`WatchError`] — every domain failure the engine or a collaborator can
//!   raise.
//! * [`CycleError`] — a [`WatchError`] tagged with the cycle phase it escaped
//!   from; the scheduler catches these at the cycle boundary.
//! * [`ApiError`] — status-server failures, rendered as JSON bodies.

use std::fmt;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WatchError {
    /// The tick source could not be reached or returned garbage.
    #[error("Fetch error for {market}: {message}")]
    Fetch { market: String, message: String },

    /// A bounded retry policy gave up.
    #[error("Fetch for {market} abandoned after {attempts} attempts")]
    RetriesExhausted { market: String, attempts: u32 },

    /// Shutdown was requested while a fetch was being retried.
    #[error("Fetch for {0} cancelled by shutdown")]
    Cancelled(String),

    /// The deep lookback window held no trades, so no reference price exists.
    #[error("Bootstrap window for {0} contained no trades")]
    EmptyBootstrap(String),

    /// A rule document could not be mapped onto a rule key.
    #[error("Schema drift: {0}")]
    SchemaDrift(String),

    /// The rule store could not be read.
    #[error("Rule store error: {0}")]
    RuleStore(String),

    /// Push delivery failed.
    #[error("Notification error: {0}")]
    Notify(String),

    /// The hit log could not be appended to.
    #[error("Hit log error: {0}")]
    HitLog(#[from] std::io::Error),

    /// Catch-all for unexpected failures.
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

// ─── Cycle Errors ─────────────────────────────────────────────────────────────

/// Phase of a watcher cycle, used to tag failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CyclePhase {
    Bootstrap,
    RefreshCache,
    Reconcile,
    Aggregate,
    Notify,
    Persist,
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CyclePhase::Bootstrap => "bootstrap",
            CyclePhase::RefreshCache => "refresh",
            CyclePhase::Reconcile => "reconcile",
            CyclePhase::Aggregate => "aggregate",
            CyclePhase::Notify => "notify",
            CyclePhase::Persist => "persist",
        };
        f.write_str(name)
    }
}

/// A failure that abandoned one cycle.
#[derive(Debug, Error)]
#[error("Cycle failed during {phase}: {source}")]
pub struct CycleError {
    pub phase: CyclePhase,
    #[source]
    pub source: WatchError,
}

impl CycleError {
    pub fn new(phase: CyclePhase, source: WatchError) -> Self {
        Self { phase, source }
    }
}

/// `result.in_phase(CyclePhase::Notify)?` inside a cycle body.
pub trait InPhase<T> {
    fn in_phase(self, phase: CyclePhase) -> Result<T, CycleError>;
}

impl<T> InPhase<T> for Result<T, WatchError> {
    fn in_phase(self, phase: CyclePhase) -> Result<T, CycleError> {
        self.map_err(|e| CycleError::new(phase, e))
    }
}

// ─── API Errors ───────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ApiError {
    /// The requested resource (e.g. a market cache) does not exist.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
        };

        let body = Json(json!({
            "ok":    false,
            "error": message,
        }));

        (status, body).into_response()
    }
}
