use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{error, info, warn};

use outreach_common::*;

use super::BatchSettings;
use super::adapter::CallAdapter;
use super::claim::Eligibility;
use super::classify::InterestClassifier;
use super::db::DbHandle;
use super::emitter::EventEmitter;
use super::executor::{Halt, PipelineExecutor, SkipReason, StepResult};
use super::lease::{HeldLease, new_owner_id};
use crate::errors::BatchError;

pub const OPERATOR_PAUSE_REASON: &str = "Paused by operator";
pub const WINDOW_RETRIES_EXHAUSTED: &str = "calling window retries exhausted";

const LEASE_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Floor for lease renewal while waiting, so a tiny TTL cannot busy-loop.
const MIN_LEASE_RENEW_INTERVAL: Duration = Duration::from_millis(10);
/// Re-evaluations of a command that lost a compare-and-swap race.
const COMMAND_RACE_RETRIES: usize = 3;

/// How an executor loop ended.
#[derive(Debug, Clone, Copy, PartialEq)]
enum LoopExit {
    Completed,
    Paused,
    Cancelled,
    /// The job left RUNNING through another path before the loop saw it.
    Superseded(JobStatus),
    LeaseLost,
}

/// Owns the batch job state machine and the loops that drive running jobs.
///
/// Cheap to clone; all clones share the same loops and wakers.
#[derive(Clone)]
pub struct BatchController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    db: DbHandle,
    emitter: EventEmitter,
    executor: PipelineExecutor,
    settings: BatchSettings,
    /// Wakes a loop that is waiting for a calling window.
    wakers: Mutex<HashMap<i64, Arc<Notify>>>,
}

impl BatchController {
    pub fn new(
        db: DbHandle,
        emitter: EventEmitter,
        adapter: Arc<dyn CallAdapter>,
        classifier: Arc<dyn InterestClassifier>,
        settings: BatchSettings,
    ) -> Self {
        let executor = PipelineExecutor::new(
            db.clone(),
            emitter.clone(),
            adapter,
            classifier,
            settings.clone(),
        );
        Self {
            inner: Arc::new(ControllerInner {
                db,
                emitter,
                executor,
                settings,
                wakers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn db(&self) -> &DbHandle {
        &self.inner.db
    }

    pub fn emitter(&self) -> &EventEmitter {
        &self.inner.emitter
    }

    pub async fn get_job(&self, job_id: i64) -> Result<BatchJob, BatchError> {
        self.inner.load_job(job_id).await
    }

    /// Create a job for the campaign's currently eligible contacts and start
    /// its loop. Fails without creating anything if there is nothing to call
    /// or another job is still active.
    pub async fn start(
        &self,
        campaign_id: i64,
        cooldown_hours: u32,
        max_retries: u32,
    ) -> Result<StartBatchResponse, BatchError> {
        let excluded = self.inner.settings.excluded_statuses.clone();
        let running = self
            .inner
            .db
            .call(move |db| -> anyhow::Result<Result<BatchJob, BatchError>> {
                if db.get_campaign(campaign_id)?.is_none() {
                    return Ok(Err(BatchError::CampaignNotFound { id: campaign_id }));
                }
                if let Some(active) = db.active_job_for_campaign(campaign_id)? {
                    return Ok(Err(BatchError::JobAlreadyActive {
                        campaign_id,
                        job_id: active.id,
                    }));
                }
                let now = Utc::now();
                let eligibility =
                    Eligibility::new(excluded, cooldown_hours, now).created_until(now);
                let total = db.count_eligible(
                    campaign_id,
                    &eligibility.excluded,
                    eligibility.cooldown_cutoff,
                    eligibility.created_until,
                )?;
                if total == 0 {
                    return Ok(Err(BatchError::NoEligibleLeads { campaign_id }));
                }
                match db.insert_running_job(campaign_id, total, cooldown_hours, max_retries, now)? {
                    Some(job) => Ok(Ok(job)),
                    // Another process inserted between our check and insert.
                    None => Ok(Err(BatchError::JobAlreadyActive {
                        campaign_id,
                        job_id: db
                            .active_job_for_campaign(campaign_id)?
                            .map(|j| j.id)
                            .unwrap_or_default(),
                    })),
                }
            })
            .await??;

        let job_id = running.id;

        info!(
            job_id,
            campaign_id,
            total_leads = running.total_leads,
            "batch started"
        );
        self.inner.emitter.job_event(
            campaign_id,
            job_id,
            EventPayload::BatchStarted {
                total_leads: running.total_leads,
            },
        );
        self.inner.clone().spawn_loop(job_id, campaign_id);

        Ok(StartBatchResponse {
            job_id,
            total_leads: running.total_leads,
        })
    }

    /// Pause a running job after its in-flight call, if any.
    pub async fn pause(&self, job_id: i64) -> Result<BatchJob, BatchError> {
        let inner = &self.inner;
        for _ in 0..COMMAND_RACE_RETRIES {
            let job = inner.load_job(job_id).await?;
            match (job.status, job.pending_command) {
                (JobStatus::Running, Some(PendingCommand::Pause)) => return Ok(job),
                (JobStatus::Running, None) => {
                    let accepted = inner
                        .db
                        .call(move |db| db.request_command(job_id, PendingCommand::Pause, None))
                        .await?;
                    if !accepted {
                        continue;
                    }
                    if inner.loop_is_live(job.campaign_id, job_id).await? {
                        inner.wake(job_id);
                    } else {
                        inner
                            .pause_now(job_id, job.campaign_id, OPERATOR_PAUSE_REASON)
                            .await?;
                    }
                    return inner.load_job(job_id).await;
                }
                (status, _) => {
                    return Err(BatchError::InvalidTransition {
                        job_id,
                        command: "pause",
                        status,
                    });
                }
            }
        }
        Err(inner.contended(job_id, "pause").await)
    }

    /// Resume a paused job from where the dispatcher's ordering left off, or
    /// withdraw a pause that the loop has not applied yet.
    pub async fn resume(&self, job_id: i64) -> Result<BatchJob, BatchError> {
        let inner = &self.inner;
        for _ in 0..COMMAND_RACE_RETRIES {
            let job = inner.load_job(job_id).await?;
            match (job.status, job.pending_command) {
                (JobStatus::Paused, _) => {
                    let resumed = inner
                        .db
                        .call(move |db| {
                            db.transition_job(
                                job_id,
                                &[JobStatus::Paused],
                                JobStatus::Running,
                                Utc::now(),
                            )
                        })
                        .await?;
                    let Some(resumed) = resumed else {
                        continue;
                    };
                    info!(
                        job_id,
                        campaign_id = resumed.campaign_id,
                        current_index = resumed.current_index,
                        "batch resumed"
                    );
                    inner.emitter.job_event(
                        resumed.campaign_id,
                        job_id,
                        EventPayload::BatchResumed {
                            current_index: resumed.current_index,
                        },
                    );
                    inner.clone().spawn_loop(job_id, resumed.campaign_id);
                    return Ok(resumed);
                }
                (JobStatus::Running, Some(PendingCommand::Pause)) => {
                    let withdrawn = inner
                        .db
                        .call(move |db| db.clear_pending_command(job_id, PendingCommand::Pause))
                        .await?;
                    if withdrawn {
                        info!(job_id, "pending pause withdrawn");
                        return inner.load_job(job_id).await;
                    }
                }
                (status, _) => {
                    return Err(BatchError::InvalidTransition {
                        job_id,
                        command: "resume",
                        status,
                    });
                }
            }
        }
        Err(inner.contended(job_id, "resume").await)
    }

    /// Cancel a job. Paused jobs are cancelled immediately; running jobs
    /// after their in-flight call.
    pub async fn stop(&self, job_id: i64, cancelled_by: &str) -> Result<BatchJob, BatchError> {
        let inner = &self.inner;
        for _ in 0..COMMAND_RACE_RETRIES {
            let job = inner.load_job(job_id).await?;
            match (job.status, job.pending_command) {
                (status @ (JobStatus::Paused | JobStatus::Pending), _) => {
                    if let Some(cancelled) = inner
                        .cancel_now(job_id, job.campaign_id, status, Some(cancelled_by.to_string()))
                        .await?
                    {
                        return Ok(cancelled);
                    }
                }
                (JobStatus::Running, Some(PendingCommand::Stop)) => return Ok(job),
                (JobStatus::Running, _) => {
                    let by = cancelled_by.to_string();
                    let accepted = inner
                        .db
                        .call(move |db| {
                            db.request_command(job_id, PendingCommand::Stop, Some(&by))
                        })
                        .await?;
                    if !accepted {
                        continue;
                    }
                    if inner.loop_is_live(job.campaign_id, job_id).await? {
                        inner.wake(job_id);
                    } else {
                        inner
                            .cancel_now(job_id, job.campaign_id, JobStatus::Running, None)
                            .await?;
                    }
                    return inner.load_job(job_id).await;
                }
                (status, _) => {
                    return Err(BatchError::InvalidTransition {
                        job_id,
                        command: "stop",
                        status,
                    });
                }
            }
        }
        Err(inner.contended(job_id, "stop").await)
    }

    /// Restart loops for RUNNING jobs that no live lease covers, e.g. after
    /// the process that drove them died, and cancel PENDING jobs whose start
    /// never finished so they stop blocking new batches. Returns the number
    /// of loops started.
    pub async fn recover(&self) -> anyhow::Result<usize> {
        let orphans = self
            .inner
            .db
            .call(|db| {
                let now = Utc::now();
                let cleared = db.clear_expired_leases(now)?;
                let uncovered = |job: &BatchJob| -> anyhow::Result<bool> {
                    Ok(!db
                        .get_lease(job.campaign_id)?
                        .is_some_and(|l| l.job_id == job.id && !l.is_expired(now)))
                };
                let mut running = Vec::new();
                for job in db.list_jobs_with_status(JobStatus::Running)? {
                    if uncovered(&job)? {
                        running.push(job);
                    }
                }
                let mut pending = Vec::new();
                for job in db.list_jobs_with_status(JobStatus::Pending)? {
                    if uncovered(&job)? {
                        pending.push(job);
                    }
                }
                Ok((cleared, running, pending))
            })
            .await
            .context("Failed to scan for orphaned batch jobs")?;

        let (cleared, jobs, abandoned) = orphans;
        if cleared > 0 {
            info!(cleared, "cleared expired campaign leases");
        }
        for job in &abandoned {
            warn!(
                job_id = job.id,
                campaign_id = job.campaign_id,
                "cancelling batch job whose start never completed"
            );
            self.inner
                .cancel_now(job.id, job.campaign_id, JobStatus::Pending, None)
                .await?;
        }
        for job in &jobs {
            warn!(
                job_id = job.id,
                campaign_id = job.campaign_id,
                "recovering batch job with no live executor"
            );
            self.inner.clone().spawn_loop(job.id, job.campaign_id);
        }
        Ok(jobs.len())
    }
}

impl ControllerInner {
    async fn load_job(&self, job_id: i64) -> Result<BatchJob, BatchError> {
        self.db
            .call(move |db| db.get_job(job_id))
            .await?
            .ok_or(BatchError::JobNotFound { id: job_id })
    }

    async fn contended(&self, job_id: i64, command: &'static str) -> BatchError {
        match self.load_job(job_id).await {
            Ok(job) => BatchError::InvalidTransition {
                job_id,
                command,
                status: job.status,
            },
            Err(e) => e,
        }
    }

    /// Whether a loop currently holds this campaign's lease for `job_id`.
    async fn loop_is_live(&self, campaign_id: i64, job_id: i64) -> Result<bool, BatchError> {
        let lease = self.db.call(move |db| db.get_lease(campaign_id)).await?;
        Ok(lease.is_some_and(|l| l.job_id == job_id && !l.is_expired(Utc::now())))
    }

    fn waker(&self, job_id: i64) -> Arc<Notify> {
        let mut wakers = self.wakers.lock().unwrap_or_else(PoisonError::into_inner);
        wakers.entry(job_id).or_default().clone()
    }

    fn wake(&self, job_id: i64) {
        let wakers = self.wakers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(waker) = wakers.get(&job_id) {
            waker.notify_one();
        }
    }

    /// Remove the waker only if a newer loop has not replaced it.
    fn drop_waker(&self, job_id: i64, waker: &Arc<Notify>) {
        let mut wakers = self.wakers.lock().unwrap_or_else(PoisonError::into_inner);
        if wakers.get(&job_id).is_some_and(|w| Arc::ptr_eq(w, waker)) {
            wakers.remove(&job_id);
        }
    }

    /// RUNNING → PAUSED with `BATCH_PAUSED`. `None` if the job was not RUNNING.
    async fn pause_now(
        &self,
        job_id: i64,
        campaign_id: i64,
        reason: &str,
    ) -> Result<Option<BatchJob>, BatchError> {
        let paused = self
            .db
            .call(move |db| {
                db.transition_job(job_id, &[JobStatus::Running], JobStatus::Paused, Utc::now())
            })
            .await?;
        if let Some(job) = &paused {
            info!(job_id, campaign_id, current_index = job.current_index, reason, "batch paused");
            self.emitter.job_event(
                campaign_id,
                job_id,
                EventPayload::BatchPaused {
                    reason: reason.to_string(),
                },
            );
        }
        Ok(paused)
    }

    /// `from` → CANCELLED with `BATCH_CANCELLED`. `None` if the guard failed.
    async fn cancel_now(
        &self,
        job_id: i64,
        campaign_id: i64,
        from: JobStatus,
        cancelled_by: Option<String>,
    ) -> Result<Option<BatchJob>, BatchError> {
        let cancelled = self
            .db
            .call(move |db| {
                if db
                    .transition_job(job_id, &[from], JobStatus::Cancelled, Utc::now())?
                    .is_none()
                {
                    return Ok(None);
                }
                if let Some(by) = &cancelled_by {
                    db.set_cancelled_by(job_id, by)?;
                }
                db.get_job(job_id)
            })
            .await?;
        if let Some(job) = &cancelled {
            info!(
                job_id,
                campaign_id,
                current_index = job.current_index,
                cancelled_by = job.cancelled_by.as_deref(),
                "batch cancelled"
            );
            self.emitter.job_event(
                campaign_id,
                job_id,
                EventPayload::BatchCancelled {
                    cancelled_by: job.cancelled_by.clone(),
                },
            );
        }
        Ok(cancelled)
    }

    fn spawn_loop(self: Arc<Self>, job_id: i64, campaign_id: i64) {
        tokio::spawn(self.drive(job_id, campaign_id));
    }

    /// Acquire the lease, run the loop as its own task, and always release
    /// the lease afterwards, whether the loop finished, failed or panicked.
    async fn drive(self: Arc<Self>, job_id: i64, campaign_id: i64) {
        let owner_id = new_owner_id();
        let lease = match self.acquire_lease(campaign_id, job_id, &owner_id).await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                info!(job_id, campaign_id, "campaign lease held elsewhere, not driving job");
                return;
            }
            Err(e) => {
                error!(job_id, campaign_id, error = %format!("{:#}", e), "failed to acquire campaign lease");
                return;
            }
        };
        info!(job_id, campaign_id, owner_id = %owner_id, "executor loop started");

        let waker = self.waker(job_id);
        let steps = tokio::spawn(self.clone().run_steps(job_id, lease.clone(), waker.clone()));
        match steps.await {
            Ok(Ok(exit)) => info!(job_id, campaign_id, exit = ?exit, "executor loop finished"),
            Ok(Err(e)) => {
                error!(job_id, campaign_id, error = %e, "executor loop failed");
                self.pause_after_failure(job_id, campaign_id, &e.to_string())
                    .await;
            }
            Err(e) => {
                error!(job_id, campaign_id, error = %e, "executor loop panicked");
                self.pause_after_failure(job_id, campaign_id, "executor loop panicked")
                    .await;
            }
        }

        self.drop_waker(job_id, &waker);
        if let Err(e) = lease.release().await {
            warn!(job_id, campaign_id, error = %format!("{:#}", e), "failed to release campaign lease");
        }
    }

    /// Poll for the lease for up to one TTL, so a lease left by a loop that
    /// is just exiting, or by a crashed process, can be taken over.
    async fn acquire_lease(
        &self,
        campaign_id: i64,
        job_id: i64,
        owner_id: &str,
    ) -> anyhow::Result<Option<HeldLease>> {
        let ttl = chrono::Duration::from_std(self.settings.lease_ttl)
            .context("Lease TTL out of range")?;
        let deadline = Instant::now() + self.settings.lease_ttl;
        loop {
            if let Some(lease) =
                HeldLease::acquire(self.db.clone(), campaign_id, job_id, owner_id, ttl).await?
            {
                return Ok(Some(lease));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(LEASE_POLL_INTERVAL).await;
        }
    }

    /// A loop that dies must not leave its job RUNNING with nothing driving it.
    async fn pause_after_failure(&self, job_id: i64, campaign_id: i64, message: &str) {
        let reason = format!("executor error: {}", message);
        if let Err(e) = self.pause_now(job_id, campaign_id, &reason).await {
            error!(job_id, campaign_id, error = %e, "failed to pause job after executor error");
        }
    }

    async fn run_steps(
        self: Arc<Self>,
        job_id: i64,
        lease: HeldLease,
        waker: Arc<Notify>,
    ) -> Result<LoopExit, BatchError> {
        let job = self.load_job(job_id).await?;
        self.release_orphans(&job).await?;

        loop {
            if !lease.renew().await? {
                warn!(job_id, "campaign lease lost, stopping loop");
                return Ok(LoopExit::LeaseLost);
            }

            match self.executor.run_one(job_id).await? {
                StepResult::Processed(_) => {}
                StepResult::Skipped(SkipReason::OutsideWindow {
                    next_retry_time,
                    retry_count,
                }) => {
                    if retry_count > job.max_retries {
                        return Ok(
                            match self
                                .pause_now(job_id, job.campaign_id, WINDOW_RETRIES_EXHAUSTED)
                                .await?
                            {
                                Some(_) => LoopExit::Paused,
                                None => LoopExit::Superseded(self.load_job(job_id).await?.status),
                            },
                        );
                    }
                    if !self.wait_for_window(next_retry_time, &waker, &lease).await? {
                        return Ok(LoopExit::LeaseLost);
                    }
                }
                StepResult::Skipped(SkipReason::ClaimContention) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.settings.claim_backoff) => {}
                        _ = waker.notified() => {}
                    }
                }
                StepResult::NoWorkRemaining => {
                    let completed = self
                        .db
                        .call(move |db| {
                            db.transition_job(
                                job_id,
                                &[JobStatus::Running],
                                JobStatus::Completed,
                                Utc::now(),
                            )
                        })
                        .await?;
                    if let Some(done) = completed {
                        info!(
                            job_id,
                            campaign_id = done.campaign_id,
                            success_count = done.success_count,
                            failure_count = done.failure_count,
                            "batch completed"
                        );
                        self.emitter.job_event(
                            done.campaign_id,
                            job_id,
                            EventPayload::BatchCompleted {
                                total_leads: done.total_leads,
                            },
                        );
                        return Ok(LoopExit::Completed);
                    }
                    // Status changed under us; the next step reports how.
                }
                StepResult::Halted(Halt::Command(PendingCommand::Pause)) => {
                    return Ok(
                        match self
                            .pause_now(job_id, job.campaign_id, OPERATOR_PAUSE_REASON)
                            .await?
                        {
                            Some(_) => LoopExit::Paused,
                            None => LoopExit::Superseded(self.load_job(job_id).await?.status),
                        },
                    );
                }
                StepResult::Halted(Halt::Command(PendingCommand::Stop)) => {
                    return Ok(
                        match self
                            .cancel_now(job_id, job.campaign_id, JobStatus::Running, None)
                            .await?
                        {
                            Some(_) => LoopExit::Cancelled,
                            None => LoopExit::Superseded(self.load_job(job_id).await?.status),
                        },
                    );
                }
                StepResult::Halted(Halt::NotRunning(status)) => {
                    return Ok(LoopExit::Superseded(status));
                }
            }
        }
    }

    /// Sleep until the window reopens, capped by `max_window_wait`, renewing
    /// the lease meanwhile. Operator commands cut the wait short. Returns
    /// `false` if the lease was lost.
    async fn wait_for_window(
        &self,
        next_retry_time: chrono::DateTime<Utc>,
        waker: &Notify,
        lease: &HeldLease,
    ) -> Result<bool, BatchError> {
        let wait = (next_retry_time - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
            .min(self.settings.max_window_wait);
        let deadline = Instant::now() + wait;
        let renew_every = renew_interval(self.settings.lease_ttl);
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(true);
            }
            let chunk = (deadline - now).min(renew_every);
            tokio::select! {
                _ = tokio::time::sleep(chunk) => {
                    if !lease.renew().await? {
                        return Ok(false);
                    }
                }
                _ = waker.notified() => return Ok(true),
            }
        }
    }

    /// Close out contacts a previous loop claimed but never finished. Each
    /// counts as a processed, skipped contact so the index stays consistent.
    async fn release_orphans(&self, job: &BatchJob) -> Result<(), BatchError> {
        let job_id = job.id;
        let released = self
            .db
            .call(move |db| {
                let now = Utc::now();
                let mut out = Vec::new();
                for contact_id in db.fail_orphaned_claims(job_id, now)? {
                    let progress = db.record_progress(job_id, false)?;
                    out.push((contact_id, progress));
                }
                Ok((now, out))
            })
            .await?;

        let (now, released) = released;
        for (contact_id, progress) in released {
            warn!(job_id, contact_id, "failed contact interrupted by a previous executor");
            self.emitter.contact_event(
                job.campaign_id,
                job_id,
                contact_id,
                EventPayload::ContactUpdated {
                    call_status: Some(CallStatus::Failed),
                    status: None,
                    last_call_at: Some(now),
                },
            );
            self.emitter.contact_event(
                job.campaign_id,
                job_id,
                contact_id,
                EventPayload::BatchProgress {
                    current_index: progress.current_index,
                    total_leads: progress.total_leads,
                    success: false,
                    skipped: true,
                    reason: Some("interrupted".to_string()),
                    success_count: progress.success_count,
                    failure_count: progress.failure_count,
                },
            );
        }
        Ok(())
    }
}

fn renew_interval(lease_ttl: Duration) -> Duration {
    (lease_ttl / 3).max(MIN_LEASE_RENEW_INTERVAL)
}
