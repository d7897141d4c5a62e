//! # engine
//!
//! The watcher's cycle machinery.
//!
//! ```text
//! scheduler ──► fetch ──► cache ──► reconcile ──► aggregation ──► notify
//!   (aligned     (retry)   (cursor)   (rule set)    (CUSUM)
//!    sleep)
//! ```

pub mod aggregation;
pub mod cache;
pub mod fetch;
pub mod reconcile;
pub mod scheduler;
