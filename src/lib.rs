pub mod batch;
pub mod errors;
pub mod logging;
pub mod outreach_config;
pub mod reconcile;
