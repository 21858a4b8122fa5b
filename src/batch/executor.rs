use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use outreach_common::*;

use super::BatchSettings;
use super::adapter::{CallAdapter, CallContext, CallReport};
use super::claim::{Eligibility, claim_next};
use super::classify::{InterestClassifier, classify_outcome};
use super::db::DbHandle;
use super::emitter::EventEmitter;
use super::window;
use crate::errors::BatchError;

/// Why a step did not process a contact.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    OutsideWindow {
        next_retry_time: DateTime<Utc>,
        retry_count: u32,
    },
    /// Every candidate was taken by other dispatchers during selection.
    ClaimContention,
}

/// Why the loop must stop dispatching before this step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Halt {
    NotRunning(JobStatus),
    Command(PendingCommand),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepResult {
    Processed(CallOutcome),
    Skipped(SkipReason),
    NoWorkRemaining,
    Halted(Halt),
}

/// How a dispatched contact ended, as reported in `BATCH_PROGRESS`.
struct Resolution {
    outcome: CallOutcome,
    success: bool,
    skipped: bool,
    reason: Option<String>,
}

/// Drives one contact per step through window check, claim, call,
/// classification and write-back.
pub struct PipelineExecutor {
    db: DbHandle,
    emitter: EventEmitter,
    adapter: Arc<dyn CallAdapter>,
    classifier: Arc<dyn InterestClassifier>,
    settings: BatchSettings,
}

impl PipelineExecutor {
    pub fn new(
        db: DbHandle,
        emitter: EventEmitter,
        adapter: Arc<dyn CallAdapter>,
        classifier: Arc<dyn InterestClassifier>,
        settings: BatchSettings,
    ) -> Self {
        Self {
            db,
            emitter,
            adapter,
            classifier,
            settings,
        }
    }

    /// Run a single step of the job's loop.
    ///
    /// Per-contact failures are absorbed here: the contact ends FAILED and
    /// the step still reports `Processed`. Only persistence failures on the
    /// job record itself surface as errors.
    pub async fn run_one(&self, job_id: i64) -> Result<StepResult, BatchError> {
        let (job, campaign) = self
            .db
            .call(move |db| {
                let Some(job) = db.get_job(job_id)? else {
                    return Ok(None);
                };
                let campaign = db.get_campaign(job.campaign_id)?;
                Ok(campaign.map(|c| (job, c)))
            })
            .await?
            .ok_or(BatchError::JobNotFound { id: job_id })?;

        if job.status != JobStatus::Running {
            return Ok(StepResult::Halted(Halt::NotRunning(job.status)));
        }
        if let Some(command) = job.pending_command {
            return Ok(StepResult::Halted(Halt::Command(command)));
        }

        let now = Utc::now();
        if !window::is_open(&campaign.window, now) {
            return self.skip_outside_window(&job, &campaign.window, now).await;
        }

        let eligibility = Eligibility::new(
            self.settings.excluded_statuses.clone(),
            job.cooldown_hours,
            now,
        )
        .created_until(job.created_at);
        let contact = match claim_next(&self.db, job.campaign_id, &eligibility).await {
            Ok(Some(contact)) => contact,
            Ok(None) => return Ok(StepResult::NoWorkRemaining),
            Err(BatchError::ClaimConflict { contact_id }) => {
                warn!(job_id, contact_id, "claim contention, retrying next pass");
                return Ok(StepResult::Skipped(SkipReason::ClaimContention));
            }
            Err(e) => return Err(e),
        };

        let resolution = self.dispatch(&job, &contact).await;
        self.record_progress(&job, contact.id, &resolution).await?;
        Ok(StepResult::Processed(resolution.outcome))
    }

    async fn skip_outside_window(
        &self,
        job: &BatchJob,
        window: &CallingWindow,
        now: DateTime<Utc>,
    ) -> Result<StepResult, BatchError> {
        let job_id = job.id;
        let retry_count = self.db.call(move |db| db.record_window_skip(job_id)).await?;
        // A window that never opens still gets a bounded retry time.
        let next_retry_time = window::next_open(window, now).unwrap_or_else(|| {
            now + chrono::Duration::from_std(self.settings.max_window_wait)
                .unwrap_or(chrono::Duration::hours(1))
        });
        info!(
            job_id,
            campaign_id = job.campaign_id,
            retry_count,
            next_retry_time = %next_retry_time,
            "outside calling window"
        );
        self.emitter.job_event(
            job.campaign_id,
            job.id,
            EventPayload::BatchSkippedOutsideTimeWindow {
                next_retry_time,
                retry_count,
            },
        );
        Ok(StepResult::Skipped(SkipReason::OutsideWindow {
            next_retry_time,
            retry_count,
        }))
    }

    /// Steps 4-7 for one claimed contact. Never fails: anything that goes
    /// wrong ends the contact FAILED.
    async fn dispatch(&self, job: &BatchJob, contact: &Contact) -> Resolution {
        if contact.phone.trim().is_empty() {
            let reason = "missing phone number".to_string();
            self.force_failed(job, contact.id, None, &reason).await;
            return Resolution {
                outcome: CallOutcome::Failed,
                success: false,
                skipped: true,
                reason: Some(reason),
            };
        }

        let (job_id, contact_id) = (job.id, contact.id);
        let log = match self
            .db
            .call(move |db| db.create_call_log(job_id, contact_id, Utc::now()))
            .await
        {
            Ok(log) => log,
            Err(e) => return self.fail(job, contact.id, None, BatchError::Persistence(e)).await,
        };
        self.emitter.contact_event(
            job.campaign_id,
            job.id,
            contact.id,
            EventPayload::CallStarted {
                call_log_id: log.id,
            },
        );

        let ctx = CallContext::new(
            self.emitter.clone(),
            job.campaign_id,
            job.id,
            contact.id,
            log.id,
        );
        let report = match self.place_call(&ctx, contact).await {
            Ok(report) => report,
            Err(e) => return self.fail(job, contact.id, Some(log.id), e).await,
        };

        let outcome = classify_outcome(&report);
        let interest = match outcome {
            CallOutcome::Completed => Some(self.classifier.classify(&report)),
            CallOutcome::NoAnswer => Some(InterestStatus::NotPick),
            CallOutcome::Failed => None,
        };
        if let Err(e) = self
            .write_back(job, contact.id, log.id, outcome, interest, &report)
            .await
        {
            return self.fail(job, contact.id, Some(log.id), e).await;
        }

        Resolution {
            outcome,
            success: outcome == CallOutcome::Completed,
            skipped: false,
            reason: match outcome {
                CallOutcome::Completed => None,
                CallOutcome::NoAnswer => Some(outcome.as_str().to_string()),
                CallOutcome::Failed => Some(
                    report
                        .error
                        .clone()
                        .unwrap_or_else(|| outcome.as_str().to_string()),
                ),
            },
        }
    }

    async fn place_call(
        &self,
        ctx: &CallContext,
        contact: &Contact,
    ) -> Result<CallReport, BatchError> {
        let timeout = self.settings.call_timeout;
        match tokio::time::timeout(timeout, self.adapter.place_call(ctx, contact)).await {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(e)) => Err(BatchError::CallExecutionFailure {
                contact_id: contact.id,
                message: format!("{:#}", e),
            }),
            Err(_) => Err(BatchError::CallExecutionFailure {
                contact_id: contact.id,
                message: format!("call timed out after {}s", timeout.as_secs()),
            }),
        }
    }

    async fn write_back(
        &self,
        job: &BatchJob,
        contact_id: i64,
        call_log_id: i64,
        outcome: CallOutcome,
        interest: Option<InterestStatus>,
        report: &CallReport,
    ) -> Result<(), BatchError> {
        let call_status = match outcome {
            CallOutcome::Failed => CallStatus::Failed,
            CallOutcome::Completed | CallOutcome::NoAnswer => CallStatus::Completed,
        };
        let summary = report.summary.clone();
        let error = report.error.clone();
        let (log, contact) = self
            .db
            .call(move |db| {
                let ended_at = Utc::now();
                db.finalize_call_log(
                    call_log_id,
                    ended_at,
                    outcome,
                    interest,
                    summary.as_deref(),
                    error.as_deref(),
                )?;
                let contact = db.finish_contact(contact_id, call_status, interest, ended_at)?;
                let log = db
                    .get_call_log(call_log_id)?
                    .ok_or_else(|| anyhow::anyhow!("Call log {} vanished", call_log_id))?;
                Ok((log, contact))
            })
            .await?;

        self.emitter.contact_event(
            job.campaign_id,
            job.id,
            contact_id,
            EventPayload::CallEnded {
                call_log_id,
                outcome,
                interest: log.interest,
                duration_secs: log.duration_secs.unwrap_or(0),
                summary: log.summary,
            },
        );
        self.emitter.contact_event(
            job.campaign_id,
            job.id,
            contact_id,
            EventPayload::ContactUpdated {
                call_status: Some(contact.call_status),
                status: Some(contact.status),
                last_call_at: contact.last_call_at,
            },
        );
        Ok(())
    }

    async fn fail(
        &self,
        job: &BatchJob,
        contact_id: i64,
        call_log_id: Option<i64>,
        err: BatchError,
    ) -> Resolution {
        let reason = err.to_string();
        warn!(job_id = job.id, contact_id, error = %reason, "contact failed");
        self.force_failed(job, contact_id, call_log_id, &reason).await;
        Resolution {
            outcome: CallOutcome::Failed,
            success: false,
            skipped: false,
            reason: Some(reason),
        }
    }

    /// Best effort: a failure here is logged and the loop carries on.
    async fn force_failed(
        &self,
        job: &BatchJob,
        contact_id: i64,
        call_log_id: Option<i64>,
        reason: &str,
    ) {
        let message = reason.to_string();
        let result = self
            .db
            .call(move |db| {
                let now = Utc::now();
                let log = match call_log_id {
                    Some(id) => {
                        db.finalize_call_log(
                            id,
                            now,
                            CallOutcome::Failed,
                            None,
                            None,
                            Some(&message),
                        )?;
                        db.get_call_log(id)?
                    }
                    None => None,
                };
                let contact = db.finish_contact(contact_id, CallStatus::Failed, None, now)?;
                Ok((log, contact))
            })
            .await;

        match result {
            Ok((log, contact)) => {
                if let Some(log) = log {
                    self.emitter.contact_event(
                        job.campaign_id,
                        job.id,
                        contact_id,
                        EventPayload::CallEnded {
                            call_log_id: log.id,
                            outcome: CallOutcome::Failed,
                            interest: None,
                            duration_secs: log.duration_secs.unwrap_or(0),
                            summary: None,
                        },
                    );
                }
                self.emitter.contact_event(
                    job.campaign_id,
                    job.id,
                    contact_id,
                    EventPayload::ContactUpdated {
                        call_status: Some(contact.call_status),
                        status: None,
                        last_call_at: contact.last_call_at,
                    },
                );
            }
            Err(e) => error!(
                job_id = job.id,
                contact_id,
                error = %format!("{:#}", e),
                "could not mark contact FAILED"
            ),
        }
    }

    async fn record_progress(
        &self,
        job: &BatchJob,
        contact_id: i64,
        resolution: &Resolution,
    ) -> Result<(), BatchError> {
        let (job_id, success) = (job.id, resolution.success);
        let updated = self
            .db
            .call(move |db| db.record_progress(job_id, success))
            .await?;
        info!(
            job_id,
            contact_id,
            current_index = updated.current_index,
            total_leads = updated.total_leads,
            outcome = %resolution.outcome,
            "contact processed"
        );
        self.emitter.contact_event(
            job.campaign_id,
            job.id,
            contact_id,
            EventPayload::BatchProgress {
                current_index: updated.current_index,
                total_leads: updated.total_leads,
                success: resolution.success,
                skipped: resolution.skipped,
                reason: resolution.reason.clone(),
                success_count: updated.success_count,
                failure_count: updated.failure_count,
            },
        );
        Ok(())
    }
}
