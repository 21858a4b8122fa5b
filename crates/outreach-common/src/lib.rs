//! Shared domain types for the outreach orchestrator and its observers.

pub mod events;
pub mod models;

pub use events::{BatchEvent, EventPayload, RiskLevel};
pub use models::*;
