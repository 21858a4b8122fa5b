//! Batch job orchestrator.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │ Operator │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │ Observer │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘ WebSocket│         │                                        │
//!                       │         │ start / pause / resume / stop          │
//!                       │         v                                        │
//!                       │  controller.rs  (BatchController, job loop)      │
//!                       │         │  holds a lease.rs CampaignLease        │
//!                       │         │                                        │
//!                       │         │ PipelineExecutor::run_one()            │
//!                       │         v                                        │
//!                       │  executor.rs ── window.rs ── claim.rs            │
//!                       │         │                                        │
//!                       │         │ CallAdapter::place_call()              │
//!                       │         v                                        │
//!                       │  adapter.rs  ── classify.rs                      │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module     | Responsibility                                              |
//! |------------|-------------------------------------------------------------|
//! | `db`       | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)         |
//! | `emitter`  | `EventEmitter`, fire-and-forget broadcast of `BatchEvent`s  |
//! | `ws`       | WebSocket fan-out of the emitter with ping/pong keepalive   |
//! | `lease`    | Per-campaign executor lease with owner id and expiry        |
//!
//! ## Concurrency
//!
//! One loop drives a job at a time, guarded by the campaign lease. Operator
//! commands never touch the loop directly: they either perform a
//! compare-and-swap on the job row (paused jobs, or running jobs with no
//! live loop) or record a pending command that the loop applies between
//! contacts. An in-flight call is never interrupted.

pub mod adapter;
pub mod api;
pub mod claim;
pub mod classify;
pub mod controller;
pub mod db;
pub mod emitter;
pub mod executor;
pub mod lease;
pub mod server;
pub mod window;
pub mod ws;

use std::time::Duration;

use outreach_common::InterestStatus;

/// Runtime knobs shared by the controller and the executor.
#[derive(Debug, Clone)]
pub struct BatchSettings {
    /// Upper bound for one call attempt.
    pub call_timeout: Duration,
    /// Lifetime of a campaign lease between renewals. Must exceed `call_timeout`.
    pub lease_ttl: Duration,
    /// Longest single sleep while waiting for a calling window to open.
    pub max_window_wait: Duration,
    /// Pause before reselecting after every candidate was claimed elsewhere.
    pub claim_backoff: Duration,
    /// Interest statuses never dialed automatically.
    pub excluded_statuses: Vec<InterestStatus>,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(90),
            lease_ttl: Duration::from_secs(180),
            max_window_wait: Duration::from_secs(15 * 60),
            claim_backoff: Duration::from_millis(500),
            excluded_statuses: vec![InterestStatus::Hot],
        }
    }
}
