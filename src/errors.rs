//! Typed error hierarchy for the batch orchestrator.
//!
//! Command-level errors (`NoEligibleLeads`, `JobAlreadyActive`,
//! `InvalidTransition`, not-found) are surfaced synchronously to the caller
//! and never change job state. `ClaimConflict` and `CallExecutionFailure`
//! are per-contact and handled inside the executor; they never escalate to
//! a job failure.

use outreach_common::JobStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Campaign {campaign_id} has no eligible leads")]
    NoEligibleLeads { campaign_id: i64 },

    #[error("Campaign {campaign_id} already has an active batch job ({job_id})")]
    JobAlreadyActive { campaign_id: i64, job_id: i64 },

    #[error("Cannot {command} batch job {job_id} while it is {status}")]
    InvalidTransition {
        job_id: i64,
        command: &'static str,
        status: JobStatus,
    },

    #[error("Contact {contact_id} was claimed by another dispatcher")]
    ClaimConflict { contact_id: i64 },

    #[error("Call to contact {contact_id} failed: {message}")]
    CallExecutionFailure { contact_id: i64, message: String },

    #[error("Batch job {id} not found")]
    JobNotFound { id: i64 },

    #[error("Campaign {id} not found")]
    CampaignNotFound { id: i64 },

    #[error("Persistence failure: {0:#}")]
    Persistence(#[from] anyhow::Error),
}

impl BatchError {
    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoEligibleLeads { .. } => "NO_ELIGIBLE_LEADS",
            Self::JobAlreadyActive { .. } => "JOB_ALREADY_ACTIVE",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::ClaimConflict { .. } => "CLAIM_CONFLICT",
            Self::CallExecutionFailure { .. } => "CALL_EXECUTION_FAILURE",
            Self::JobNotFound { .. } => "JOB_NOT_FOUND",
            Self::CampaignNotFound { .. } => "CAMPAIGN_NOT_FOUND",
            Self::Persistence(_) => "PERSISTENCE_FAILURE",
        }
    }
}
