use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};

use outreach_common::*;

use super::lease::CampaignLease;

/// Async-safe handle to the outreach database.
///
/// Wraps `OutreachDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so SQLite I/O never ties up
/// async worker threads. The mutex is only held for the duration of one
/// closure, never across a call to the call adapter.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<OutreachDb>>,
}

impl DbHandle {
    pub fn new(db: OutreachDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&OutreachDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. For startup and tests only.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, OutreachDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct OutreachDb {
    conn: Connection,
}

const JOB_COLUMNS: &str = "id, campaign_id, status, current_index, total_leads, success_count, failure_count, cooldown_hours, max_retries, window_retry_count, pending_command, paused_at, cancelled_by, created_at, started_at, completed_at";

const CONTACT_COLUMNS: &str =
    "id, campaign_id, name, phone, call_status, status, last_call_at, created_at, updated_at";

const CALL_LOG_COLUMNS: &str = "id, job_id, contact_id, started_at, ended_at, duration_secs, outcome, interest, summary, error";

/// Statuses that count as "active" for the one-job-per-campaign rule.
const ACTIVE_JOB_STATUSES: &str = "('PENDING', 'RUNNING', 'PAUSED')";

impl OutreachDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .context("Failed to configure connection")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(&format!(
                "
                CREATE TABLE IF NOT EXISTS campaigns (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    calling_window TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS contacts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    campaign_id INTEGER NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    phone TEXT NOT NULL,
                    call_status TEXT NOT NULL DEFAULT 'PENDING',
                    status TEXT NOT NULL DEFAULT 'COLD',
                    last_call_at TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS batch_jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    campaign_id INTEGER NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
                    status TEXT NOT NULL DEFAULT 'PENDING',
                    current_index INTEGER NOT NULL DEFAULT 0,
                    total_leads INTEGER NOT NULL,
                    success_count INTEGER NOT NULL DEFAULT 0,
                    failure_count INTEGER NOT NULL DEFAULT 0,
                    cooldown_hours INTEGER NOT NULL DEFAULT 0,
                    max_retries INTEGER NOT NULL DEFAULT 0,
                    window_retry_count INTEGER NOT NULL DEFAULT 0,
                    pending_command TEXT,
                    paused_at TEXT,
                    cancelled_by TEXT,
                    created_at TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS call_logs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_id INTEGER NOT NULL REFERENCES batch_jobs(id) ON DELETE CASCADE,
                    contact_id INTEGER NOT NULL REFERENCES contacts(id) ON DELETE CASCADE,
                    started_at TEXT NOT NULL,
                    ended_at TEXT,
                    duration_secs INTEGER,
                    outcome TEXT,
                    interest TEXT,
                    summary TEXT,
                    error TEXT
                );

                CREATE TABLE IF NOT EXISTS campaign_leases (
                    campaign_id INTEGER PRIMARY KEY REFERENCES campaigns(id) ON DELETE CASCADE,
                    job_id INTEGER NOT NULL,
                    owner_id TEXT NOT NULL,
                    expires_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_contacts_dispatch
                    ON contacts(campaign_id, call_status, created_at);
                CREATE INDEX IF NOT EXISTS idx_batch_jobs_campaign ON batch_jobs(campaign_id);
                CREATE INDEX IF NOT EXISTS idx_call_logs_job ON call_logs(job_id);
                CREATE UNIQUE INDEX IF NOT EXISTS idx_batch_jobs_one_active
                    ON batch_jobs(campaign_id) WHERE status IN {ACTIVE_JOB_STATUSES};
                "
            ))
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Campaigns ─────────────────────────────────────────────────────

    pub fn create_campaign(
        &self,
        name: &str,
        window: &CallingWindow,
        now: DateTime<Utc>,
    ) -> Result<Campaign> {
        let window_json =
            serde_json::to_string(window).context("Failed to serialize calling window")?;
        self.conn
            .execute(
                "INSERT INTO campaigns (name, calling_window, created_at) VALUES (?1, ?2, ?3)",
                params![name, window_json, now],
            )
            .context("Failed to insert campaign")?;
        let id = self.conn.last_insert_rowid();
        self.get_campaign(id)?
            .context("Campaign not found after insert")
    }

    pub fn get_campaign(&self, id: i64) -> Result<Option<Campaign>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, name, calling_window, created_at FROM campaigns WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, DateTime<Utc>>(3)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query campaign")?;
        match row {
            Some((id, name, window_json, created_at)) => {
                let window: CallingWindow = serde_json::from_str(&window_json)
                    .context("Failed to parse calling window JSON")?;
                Ok(Some(Campaign {
                    id,
                    name,
                    window,
                    created_at,
                }))
            }
            None => Ok(None),
        }
    }

    // ── Contacts ──────────────────────────────────────────────────────

    pub fn add_contact(
        &self,
        campaign_id: i64,
        name: &str,
        phone: &str,
        status: InterestStatus,
        now: DateTime<Utc>,
    ) -> Result<Contact> {
        self.conn
            .execute(
                "INSERT INTO contacts (campaign_id, name, phone, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![campaign_id, name, phone, status.as_str(), now],
            )
            .context("Failed to insert contact")?;
        let id = self.conn.last_insert_rowid();
        self.get_contact(id)?.context("Contact not found after insert")
    }

    pub fn get_contact(&self, id: i64) -> Result<Option<Contact>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1"),
                params![id],
                read_contact_row,
            )
            .optional()
            .context("Failed to query contact")?;
        row.map(ContactRow::into_contact).transpose()
    }

    /// All contacts of a campaign in dispatch order (oldest first).
    pub fn list_contacts(&self, campaign_id: i64) -> Result<Vec<Contact>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {CONTACT_COLUMNS} FROM contacts WHERE campaign_id = ?1 ORDER BY created_at, id"
            ))
            .context("Failed to prepare list_contacts")?;
        let rows = stmt
            .query_map(params![campaign_id], read_contact_row)
            .context("Failed to query contacts")?;
        let mut contacts = Vec::new();
        for row in rows {
            let r = row.context("Failed to read contact row")?;
            contacts.push(r.into_contact()?);
        }
        Ok(contacts)
    }

    /// Count contacts that a batch started now would dispatch.
    pub fn count_eligible(
        &self,
        campaign_id: i64,
        excluded: &[InterestStatus],
        cooldown_cutoff: DateTime<Utc>,
        created_until: Option<DateTime<Utc>>,
    ) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM contacts
                 WHERE campaign_id = ?1
                   AND call_status = 'PENDING'
                   AND status NOT IN (SELECT value FROM json_each(?2))
                   AND (last_call_at IS NULL OR last_call_at < ?3)
                   AND (?4 IS NULL OR created_at <= ?4)",
                params![
                    campaign_id,
                    status_list_json(excluded)?,
                    cooldown_cutoff,
                    created_until
                ],
                |row| row.get(0),
            )
            .context("Failed to count eligible contacts")
    }

    /// Oldest-created eligible contact, without reserving it.
    pub fn next_eligible_contact_id(
        &self,
        campaign_id: i64,
        excluded: &[InterestStatus],
        cooldown_cutoff: DateTime<Utc>,
        created_until: Option<DateTime<Utc>>,
    ) -> Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT id FROM contacts
                 WHERE campaign_id = ?1
                   AND call_status = 'PENDING'
                   AND status NOT IN (SELECT value FROM json_each(?2))
                   AND (last_call_at IS NULL OR last_call_at < ?3)
                   AND (?4 IS NULL OR created_at <= ?4)
                 ORDER BY created_at, id
                 LIMIT 1",
                params![
                    campaign_id,
                    status_list_json(excluded)?,
                    cooldown_cutoff,
                    created_until
                ],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to select next eligible contact")
    }

    /// Conditionally move a contact PENDING → IN_PROGRESS.
    ///
    /// Returns `false` when zero rows matched: another dispatcher claimed the
    /// contact first, or it stopped being eligible in the meantime.
    pub fn try_claim_contact(
        &self,
        contact_id: i64,
        excluded: &[InterestStatus],
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE contacts SET call_status = 'IN_PROGRESS', updated_at = ?1
                 WHERE id = ?2
                   AND call_status = 'PENDING'
                   AND status NOT IN (SELECT value FROM json_each(?3))",
                params![now, contact_id, status_list_json(excluded)?],
            )
            .context("Failed to claim contact")?;
        Ok(changed == 1)
    }

    /// Write back the result of a call. `interest = None` keeps the current value.
    pub fn finish_contact(
        &self,
        contact_id: i64,
        call_status: CallStatus,
        interest: Option<InterestStatus>,
        last_call_at: DateTime<Utc>,
    ) -> Result<Contact> {
        self.conn
            .execute(
                "UPDATE contacts
                 SET call_status = ?1, status = COALESCE(?2, status), last_call_at = ?3, updated_at = ?3
                 WHERE id = ?4",
                params![
                    call_status.as_str(),
                    interest.map(|i| i.as_str()),
                    last_call_at,
                    contact_id
                ],
            )
            .context("Failed to write back contact")?;
        self.get_contact(contact_id)?
            .context("Contact not found after write-back")
    }

    /// Fail contacts left IN_PROGRESS by a loop that died mid-call and close
    /// their open call logs. Returns the ids of the contacts released.
    pub fn fail_orphaned_claims(&self, job_id: i64, now: DateTime<Utc>) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare(
                "UPDATE contacts SET call_status = 'FAILED', last_call_at = ?1, updated_at = ?1
                 WHERE call_status = 'IN_PROGRESS'
                   AND id IN (SELECT contact_id FROM call_logs WHERE job_id = ?2 AND ended_at IS NULL)
                 RETURNING id",
            )
            .context("Failed to prepare orphan release")?;
        let released = stmt
            .query_map(params![now, job_id], |row| row.get::<_, i64>(0))
            .context("Failed to release orphaned claims")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read released contact ids")?;
        self.conn
            .execute(
                "UPDATE call_logs SET ended_at = ?1, outcome = 'FAILED', error = 'interrupted'
                 WHERE job_id = ?2 AND ended_at IS NULL",
                params![now, job_id],
            )
            .context("Failed to close orphaned call logs")?;
        Ok(released)
    }

    // ── Batch jobs ────────────────────────────────────────────────────

    /// Insert a PENDING job. Returns `None` if the campaign already has a
    /// non-terminal job (the partial unique index rejected the row).
    pub fn insert_job(
        &self,
        campaign_id: i64,
        total_leads: i64,
        cooldown_hours: u32,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<BatchJob>> {
        let inserted = self.conn.execute(
            "INSERT INTO batch_jobs (campaign_id, status, total_leads, cooldown_hours, max_retries, created_at)
             VALUES (?1, 'PENDING', ?2, ?3, ?4, ?5)",
            params![campaign_id, total_leads, cooldown_hours, max_retries, now],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                return Ok(None);
            }
            Err(e) => return Err(anyhow::Error::new(e).context("Failed to insert batch job")),
        }
        let id = self.conn.last_insert_rowid();
        Ok(Some(
            self.get_job(id)?.context("Batch job not found after insert")?,
        ))
    }

    /// Insert a job and move it PENDING → RUNNING in one transaction, so a
    /// crash or failed write never leaves a PENDING job behind. Returns
    /// `None` if the campaign already has a non-terminal job.
    pub fn insert_running_job(
        &self,
        campaign_id: i64,
        total_leads: i64,
        cooldown_hours: u32,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<BatchJob>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin batch start")?;
        let Some(job) = self.insert_job(campaign_id, total_leads, cooldown_hours, max_retries, now)?
        else {
            return Ok(None);
        };
        let running = self
            .transition_job(job.id, &[JobStatus::Pending], JobStatus::Running, now)?
            .context("Batch job not PENDING after insert")?;
        tx.commit().context("Failed to commit batch start")?;
        Ok(Some(running))
    }

    pub fn get_job(&self, id: i64) -> Result<Option<BatchJob>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM batch_jobs WHERE id = ?1"),
                params![id],
                read_job_row,
            )
            .optional()
            .context("Failed to query batch job")?;
        row.map(JobRow::into_job).transpose()
    }

    pub fn active_job_for_campaign(&self, campaign_id: i64) -> Result<Option<BatchJob>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM batch_jobs
                     WHERE campaign_id = ?1 AND status IN {ACTIVE_JOB_STATUSES}"
                ),
                params![campaign_id],
                read_job_row,
            )
            .optional()
            .context("Failed to query active batch job")?;
        row.map(JobRow::into_job).transpose()
    }

    pub fn latest_job_for_campaign(&self, campaign_id: i64) -> Result<Option<BatchJob>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM batch_jobs WHERE campaign_id = ?1 ORDER BY id DESC LIMIT 1"
                ),
                params![campaign_id],
                read_job_row,
            )
            .optional()
            .context("Failed to query latest batch job")?;
        row.map(JobRow::into_job).transpose()
    }

    pub fn list_jobs_with_status(&self, status: JobStatus) -> Result<Vec<BatchJob>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM batch_jobs WHERE status = ?1 ORDER BY id"
            ))
            .context("Failed to prepare list_jobs_with_status")?;
        let rows = stmt
            .query_map(params![status.as_str()], read_job_row)
            .context("Failed to query batch jobs")?;
        let mut jobs = Vec::new();
        for row in rows {
            let r = row.context("Failed to read batch_job row")?;
            jobs.push(r.into_job()?);
        }
        Ok(jobs)
    }

    /// Compare-and-swap the job status.
    ///
    /// Only succeeds when the current status is one of `from`. Clears any
    /// pending command, maintains `paused_at`, stamps `started_at` on the
    /// first move to RUNNING and `completed_at` on terminal states. Returns
    /// `None` when the guard did not match.
    pub fn transition_job(
        &self,
        id: i64,
        from: &[JobStatus],
        to: JobStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<BatchJob>> {
        let from_json = serde_json::to_string(&from.iter().map(|s| s.as_str()).collect::<Vec<_>>())
            .context("Failed to encode status guard")?;
        let changed = self
            .conn
            .execute(
                "UPDATE batch_jobs SET
                    status = ?1,
                    pending_command = NULL,
                    paused_at = CASE WHEN ?1 = 'PAUSED' THEN ?2 ELSE NULL END,
                    started_at = CASE WHEN ?1 = 'RUNNING' THEN COALESCE(started_at, ?2) ELSE started_at END,
                    completed_at = CASE WHEN ?1 IN ('COMPLETED', 'CANCELLED') THEN ?2 ELSE completed_at END
                 WHERE id = ?3 AND status IN (SELECT value FROM json_each(?4))",
                params![to.as_str(), now, id, from_json],
            )
            .context("Failed to transition batch job")?;
        if changed == 0 {
            return Ok(None);
        }
        self.get_job(id)
    }

    /// Record an operator command for a RUNNING job, to be applied by its loop.
    ///
    /// A pause is only accepted when no command is pending; a stop overrides a
    /// pending pause. Returns `false` when the guard did not match.
    pub fn request_command(
        &self,
        id: i64,
        command: PendingCommand,
        cancelled_by: Option<&str>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE batch_jobs SET pending_command = ?1, cancelled_by = COALESCE(?2, cancelled_by)
                 WHERE id = ?3 AND status = 'RUNNING'
                   AND (pending_command IS NULL OR ?1 = 'stop')",
                params![command.as_str(), cancelled_by, id],
            )
            .context("Failed to record pending command")?;
        Ok(changed == 1)
    }

    /// Withdraw a pending command if it is still the expected one.
    pub fn clear_pending_command(&self, id: i64, expected: PendingCommand) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE batch_jobs SET pending_command = NULL
                 WHERE id = ?1 AND status = 'RUNNING' AND pending_command = ?2",
                params![id, expected.as_str()],
            )
            .context("Failed to clear pending command")?;
        Ok(changed == 1)
    }

    pub fn set_cancelled_by(&self, id: i64, cancelled_by: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE batch_jobs SET cancelled_by = ?1 WHERE id = ?2",
                params![cancelled_by, id],
            )
            .context("Failed to record cancelled_by")?;
        Ok(())
    }

    /// Count one processed contact. Resets the window retry counter because
    /// the loop was inside the calling window.
    pub fn record_progress(&self, id: i64, success: bool) -> Result<BatchJob> {
        let (ok, failed) = if success { (1, 0) } else { (0, 1) };
        self.conn
            .execute(
                "UPDATE batch_jobs SET
                    current_index = current_index + 1,
                    success_count = success_count + ?1,
                    failure_count = failure_count + ?2,
                    window_retry_count = 0
                 WHERE id = ?3",
                params![ok, failed, id],
            )
            .context("Failed to record batch progress")?;
        self.get_job(id)?
            .context("Batch job not found after progress update")
    }

    /// Count one outside-window pass and return the new retry count.
    pub fn record_window_skip(&self, id: i64) -> Result<u32> {
        self.conn
            .query_row(
                "UPDATE batch_jobs SET window_retry_count = window_retry_count + 1
                 WHERE id = ?1 RETURNING window_retry_count",
                params![id],
                |row| row.get(0),
            )
            .context("Failed to record window skip")
    }

    // ── Call logs ─────────────────────────────────────────────────────

    pub fn create_call_log(
        &self,
        job_id: i64,
        contact_id: i64,
        started_at: DateTime<Utc>,
    ) -> Result<CallLog> {
        self.conn
            .execute(
                "INSERT INTO call_logs (job_id, contact_id, started_at) VALUES (?1, ?2, ?3)",
                params![job_id, contact_id, started_at],
            )
            .context("Failed to insert call log")?;
        let id = self.conn.last_insert_rowid();
        self.get_call_log(id)?
            .context("Call log not found after insert")
    }

    /// Finalize a call log exactly once. Returns `false` if it was already final.
    #[allow(clippy::too_many_arguments)]
    pub fn finalize_call_log(
        &self,
        id: i64,
        ended_at: DateTime<Utc>,
        outcome: CallOutcome,
        interest: Option<InterestStatus>,
        summary: Option<&str>,
        error: Option<&str>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE call_logs SET
                    ended_at = ?1,
                    duration_secs = MAX(0, CAST(strftime('%s', ?1) AS INTEGER) - CAST(strftime('%s', started_at) AS INTEGER)),
                    outcome = ?2,
                    interest = ?3,
                    summary = ?4,
                    error = ?5
                 WHERE id = ?6 AND ended_at IS NULL",
                params![
                    ended_at,
                    outcome.as_str(),
                    interest.map(|i| i.as_str()),
                    summary,
                    error,
                    id
                ],
            )
            .context("Failed to finalize call log")?;
        Ok(changed == 1)
    }

    pub fn get_call_log(&self, id: i64) -> Result<Option<CallLog>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {CALL_LOG_COLUMNS} FROM call_logs WHERE id = ?1"),
                params![id],
                read_call_log_row,
            )
            .optional()
            .context("Failed to query call log")?;
        row.map(CallLogRow::into_call_log).transpose()
    }

    pub fn list_call_logs(&self, job_id: i64) -> Result<Vec<CallLog>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {CALL_LOG_COLUMNS} FROM call_logs WHERE job_id = ?1 ORDER BY id"
            ))
            .context("Failed to prepare list_call_logs")?;
        let rows = stmt
            .query_map(params![job_id], read_call_log_row)
            .context("Failed to query call logs")?;
        let mut logs = Vec::new();
        for row in rows {
            let r = row.context("Failed to read call_log row")?;
            logs.push(r.into_call_log()?);
        }
        Ok(logs)
    }

    // ── Campaign leases ───────────────────────────────────────────────

    /// Take the campaign lease if it is free, expired, already ours, or left
    /// behind by a job that is no longer active.
    pub fn try_acquire_lease(
        &self,
        campaign_id: i64,
        job_id: i64,
        owner_id: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "INSERT INTO campaign_leases (campaign_id, job_id, owner_id, expires_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(campaign_id) DO UPDATE SET
                    job_id = excluded.job_id,
                    owner_id = excluded.owner_id,
                    expires_at = excluded.expires_at
                 WHERE campaign_leases.owner_id = excluded.owner_id
                    OR campaign_leases.expires_at <= ?5
                    OR NOT EXISTS (
                        SELECT 1 FROM batch_jobs
                        WHERE batch_jobs.id = campaign_leases.job_id
                          AND batch_jobs.status IN ('PENDING', 'RUNNING', 'PAUSED')
                    )",
                params![campaign_id, job_id, owner_id, now + ttl, now],
            )
            .context("Failed to acquire campaign lease")?;
        Ok(changed == 1)
    }

    pub fn renew_lease(
        &self,
        campaign_id: i64,
        owner_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE campaign_leases SET expires_at = ?1 WHERE campaign_id = ?2 AND owner_id = ?3",
                params![expires_at, campaign_id, owner_id],
            )
            .context("Failed to renew campaign lease")?;
        Ok(changed == 1)
    }

    pub fn release_lease(&self, campaign_id: i64, owner_id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "DELETE FROM campaign_leases WHERE campaign_id = ?1 AND owner_id = ?2",
                params![campaign_id, owner_id],
            )
            .context("Failed to release campaign lease")?;
        Ok(changed == 1)
    }

    pub fn get_lease(&self, campaign_id: i64) -> Result<Option<CampaignLease>> {
        self.conn
            .query_row(
                "SELECT campaign_id, job_id, owner_id, expires_at FROM campaign_leases WHERE campaign_id = ?1",
                params![campaign_id],
                |row| {
                    Ok(CampaignLease {
                        campaign_id: row.get(0)?,
                        job_id: row.get(1)?,
                        owner_id: row.get(2)?,
                        expires_at: row.get(3)?,
                    })
                },
            )
            .optional()
            .context("Failed to query campaign lease")
    }

    /// Drop leases whose owners stopped renewing them.
    pub fn clear_expired_leases(&self, now: DateTime<Utc>) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM campaign_leases WHERE expires_at <= ?1",
                params![now],
            )
            .context("Failed to clear expired leases")
    }

    // ── Snapshots ─────────────────────────────────────────────────────

    /// Authoritative state for observers resynchronizing after a gap.
    ///
    /// `as_of` is stamped before the reads. Every write that lands after
    /// them publishes its event later still, so observers can order status
    /// events against it without trusting their own clock.
    pub fn campaign_snapshot(&self, campaign_id: i64) -> Result<Option<CampaignSnapshot>> {
        let as_of = Utc::now();
        if self.get_campaign(campaign_id)?.is_none() {
            return Ok(None);
        }
        let job = match self.active_job_for_campaign(campaign_id)? {
            Some(job) => Some(job),
            None => self.latest_job_for_campaign(campaign_id)?,
        };
        Ok(Some(CampaignSnapshot {
            campaign_id,
            as_of,
            job,
            contacts: self.list_contacts(campaign_id)?,
        }))
    }
}

fn status_list_json(statuses: &[InterestStatus]) -> Result<String> {
    serde_json::to_string(&statuses.iter().map(|s| s.as_str()).collect::<Vec<_>>())
        .context("Failed to encode interest status list")
}

/// Intermediate row struct for reading contacts before parsing enum strings.
struct ContactRow {
    id: i64,
    campaign_id: i64,
    name: String,
    phone: String,
    call_status: String,
    status: String,
    last_call_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn read_contact_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContactRow> {
    Ok(ContactRow {
        id: row.get(0)?,
        campaign_id: row.get(1)?,
        name: row.get(2)?,
        phone: row.get(3)?,
        call_status: row.get(4)?,
        status: row.get(5)?,
        last_call_at: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

impl ContactRow {
    fn into_contact(self) -> Result<Contact> {
        let call_status = CallStatus::from_str(&self.call_status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse contact call_status")?;
        let status = InterestStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse contact status")?;
        Ok(Contact {
            id: self.id,
            campaign_id: self.campaign_id,
            name: self.name,
            phone: self.phone,
            call_status,
            status,
            last_call_at: self.last_call_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Intermediate row struct for batch_jobs.
struct JobRow {
    id: i64,
    campaign_id: i64,
    status: String,
    current_index: i64,
    total_leads: i64,
    success_count: i64,
    failure_count: i64,
    cooldown_hours: u32,
    max_retries: u32,
    window_retry_count: u32,
    pending_command: Option<String>,
    paused_at: Option<DateTime<Utc>>,
    cancelled_by: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

fn read_job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        id: row.get(0)?,
        campaign_id: row.get(1)?,
        status: row.get(2)?,
        current_index: row.get(3)?,
        total_leads: row.get(4)?,
        success_count: row.get(5)?,
        failure_count: row.get(6)?,
        cooldown_hours: row.get(7)?,
        max_retries: row.get(8)?,
        window_retry_count: row.get(9)?,
        pending_command: row.get(10)?,
        paused_at: row.get(11)?,
        cancelled_by: row.get(12)?,
        created_at: row.get(13)?,
        started_at: row.get(14)?,
        completed_at: row.get(15)?,
    })
}

impl JobRow {
    fn into_job(self) -> Result<BatchJob> {
        let status = JobStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse batch job status")?;
        let pending_command = self
            .pending_command
            .as_deref()
            .map(PendingCommand::from_str)
            .transpose()
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse pending command")?;
        Ok(BatchJob {
            id: self.id,
            campaign_id: self.campaign_id,
            status,
            current_index: self.current_index,
            total_leads: self.total_leads,
            success_count: self.success_count,
            failure_count: self.failure_count,
            cooldown_hours: self.cooldown_hours,
            max_retries: self.max_retries,
            window_retry_count: self.window_retry_count,
            pending_command,
            paused_at: self.paused_at,
            cancelled_by: self.cancelled_by,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

/// Intermediate row struct for call_logs.
struct CallLogRow {
    id: i64,
    job_id: i64,
    contact_id: i64,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    duration_secs: Option<i64>,
    outcome: Option<String>,
    interest: Option<String>,
    summary: Option<String>,
    error: Option<String>,
}

fn read_call_log_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CallLogRow> {
    Ok(CallLogRow {
        id: row.get(0)?,
        job_id: row.get(1)?,
        contact_id: row.get(2)?,
        started_at: row.get(3)?,
        ended_at: row.get(4)?,
        duration_secs: row.get(5)?,
        outcome: row.get(6)?,
        interest: row.get(7)?,
        summary: row.get(8)?,
        error: row.get(9)?,
    })
}

impl CallLogRow {
    fn into_call_log(self) -> Result<CallLog> {
        let outcome = self
            .outcome
            .as_deref()
            .map(CallOutcome::from_str)
            .transpose()
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse call outcome")?;
        let interest = self
            .interest
            .as_deref()
            .map(InterestStatus::from_str)
            .transpose()
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse call interest")?;
        Ok(CallLog {
            id: self.id,
            job_id: self.job_id,
            contact_id: self.contact_id,
            started_at: self.started_at,
            ended_at: self.ended_at,
            duration_secs: self.duration_secs,
            outcome,
            interest,
            summary: self.summary,
            error: self.error,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
