use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use outreach_common::*;

use super::merge;

/// Local view of the batch job an observer is following.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: i64,
    pub campaign_id: i64,
    pub status: JobStatus,
    /// Time of the event (or snapshot) that set `status`.
    pub status_at: DateTime<Utc>,
    pub current_index: i64,
    pub total_leads: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub paused_at: Option<DateTime<Utc>>,
    pub pause_reason: Option<String>,
    pub cancelled_by: Option<String>,
    pub next_retry_time: Option<DateTime<Utc>>,
    pub window_retry_count: u32,
}

impl JobView {
    /// A fresh view as announced by `BATCH_STARTED`.
    pub fn started(id: i64, campaign_id: i64, total_leads: i64, at: DateTime<Utc>) -> Self {
        Self {
            id,
            campaign_id,
            status: JobStatus::Running,
            status_at: at,
            current_index: 0,
            total_leads,
            success_count: 0,
            failure_count: 0,
            paused_at: None,
            pause_reason: None,
            cancelled_by: None,
            next_retry_time: None,
            window_retry_count: 0,
        }
    }

    /// View of a job as read at `as_of` on the server.
    pub fn from_job(job: &BatchJob, as_of: DateTime<Utc>) -> Self {
        Self {
            id: job.id,
            campaign_id: job.campaign_id,
            status: job.status,
            status_at: as_of,
            current_index: job.current_index,
            total_leads: job.total_leads,
            success_count: job.success_count,
            failure_count: job.failure_count,
            paused_at: job.paused_at,
            pause_reason: None,
            cancelled_by: job.cancelled_by.clone(),
            next_retry_time: None,
            window_retry_count: job.window_retry_count,
        }
    }
}

/// Live telemetry of the call in progress for a contact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveCall {
    /// Unknown while telemetry arrived ahead of `CALL_STARTED`.
    pub call_log_id: Option<i64>,
    pub risk_level: Option<RiskLevel>,
    pub sentiment: Option<f64>,
    pub talk_ratio: Option<f64>,
    pub transcript_snippet: Option<String>,
    pub strategy_hint: Option<String>,
}

/// Result of the most recent finished call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastCall {
    pub call_log_id: i64,
    pub outcome: CallOutcome,
    pub interest: Option<InterestStatus>,
    pub duration_secs: i64,
    pub summary: Option<String>,
}

/// Fields an operator may edit locally before the server confirms them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactPatch {
    pub name: Option<String>,
    pub status: Option<InterestStatus>,
}

impl ContactPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.status.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactView {
    pub id: i64,
    pub name: String,
    pub phone: String,
    pub call_status: CallStatus,
    pub status: InterestStatus,
    pub last_call_at: Option<DateTime<Utc>>,
    pub live: Option<LiveCall>,
    pub last_call: Option<LastCall>,
    /// Local edits not yet confirmed by the server.
    pub pending: ContactPatch,
}

impl From<&Contact> for ContactView {
    fn from(c: &Contact) -> Self {
        Self {
            id: c.id,
            name: c.name.clone(),
            phone: c.phone.clone(),
            call_status: c.call_status,
            status: c.status,
            last_call_at: c.last_call_at,
            live: None,
            last_call: None,
            pending: ContactPatch::default(),
        }
    }
}

/// What applying one event did to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Changed,
    Unchanged,
    /// The event belongs to another campaign or job.
    Ignored,
    /// The event refers to something the model has never seen; fetch a snapshot.
    NeedsResync,
}

/// An observer's local replica of one campaign's batch state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadModel {
    pub campaign_id: i64,
    pub job: Option<JobView>,
    pub contacts: BTreeMap<i64, ContactView>,
    /// Copy of the contact an operator is inspecting, kept in lockstep with
    /// its entry in `contacts`.
    pub selected: Option<ContactView>,
}

impl ReadModel {
    pub fn new(campaign_id: i64) -> Self {
        Self {
            campaign_id,
            ..Self::default()
        }
    }

    pub fn from_snapshot(snapshot: &CampaignSnapshot) -> Self {
        let mut model = Self::new(snapshot.campaign_id);
        model.resync(snapshot);
        model
    }

    /// Pure form of [`ReadModel::apply`].
    pub fn reduce(&self, event: &BatchEvent) -> ReadModel {
        let mut next = self.clone();
        next.apply(event);
        next
    }

    /// Merge one event. Applying the same event again is a no-op.
    pub fn apply(&mut self, event: &BatchEvent) -> Applied {
        if event.campaign_id != self.campaign_id {
            return Applied::Ignored;
        }

        if let EventPayload::BatchStarted { total_leads } = &event.payload {
            let Some(job_id) = event.batch_job_id else {
                return Applied::Ignored;
            };
            return self.start_job(job_id, *total_leads, event.timestamp);
        }

        // Stale-job guard
        let Some(job) = self.job.as_mut() else {
            return Applied::Ignored;
        };
        if event.batch_job_id != Some(job.id) {
            return Applied::Ignored;
        }

        let before_job = job.clone();
        match &event.payload {
            EventPayload::BatchProgress {
                current_index,
                total_leads,
                success_count,
                failure_count,
                ..
            } => merge::progress(
                job,
                *current_index,
                *total_leads,
                *success_count,
                *failure_count,
            ),
            EventPayload::BatchPaused { reason } => merge::paused(job, reason, event.timestamp),
            EventPayload::BatchResumed { current_index } => {
                merge::resumed(job, *current_index, event.timestamp)
            }
            EventPayload::BatchCompleted { total_leads } => {
                merge::completed(job, *total_leads, event.timestamp)
            }
            EventPayload::BatchCancelled { cancelled_by } => {
                merge::cancelled(job, cancelled_by.as_deref(), event.timestamp)
            }
            EventPayload::BatchSkippedOutsideTimeWindow {
                next_retry_time,
                retry_count,
            } => merge::skipped_outside_window(job, *next_retry_time, *retry_count),
            EventPayload::BatchStarted { .. }
            | EventPayload::CallStarted { .. }
            | EventPayload::CallTelemetry { .. }
            | EventPayload::CallEnded { .. }
            | EventPayload::ContactUpdated { .. } => {}
        }
        let job_changed = self.job.as_ref() != Some(&before_job);

        let contact_changed = match (event.contact_id, &event.payload) {
            (None, _) => Applied::Unchanged,
            (Some(contact_id), payload) => self.merge_contact(contact_id, payload),
        };

        match contact_changed {
            Applied::NeedsResync => Applied::NeedsResync,
            Applied::Changed => Applied::Changed,
            _ if job_changed => Applied::Changed,
            _ => Applied::Unchanged,
        }
    }

    /// `BATCH_STARTED` always (re)initializes the job, except that a repeat
    /// for the job already being followed only merges.
    fn start_job(&mut self, job_id: i64, total_leads: i64, at: DateTime<Utc>) -> Applied {
        if let Some(job) = self.job.as_mut()
            && job.id == job_id
        {
            let before = job.clone();
            merge::restarted(job, total_leads, at);
            return if *job == before {
                Applied::Unchanged
            } else {
                Applied::Changed
            };
        }

        self.job = Some(JobView::started(job_id, self.campaign_id, total_leads, at));
        // Residual per-call state belongs to the previous job.
        for contact in self.contacts.values_mut() {
            merge::clear_call_state(contact);
        }
        if let Some(selected) = self.selected.as_mut() {
            merge::clear_call_state(selected);
        }
        Applied::Changed
    }

    fn merge_contact(&mut self, contact_id: i64, payload: &EventPayload) -> Applied {
        let merge_fn = |c: &mut ContactView| match payload {
            EventPayload::CallStarted { call_log_id } => merge::call_started(c, *call_log_id),
            EventPayload::CallTelemetry {
                risk_level,
                sentiment,
                talk_ratio,
                transcript_snippet,
                strategy_hint,
            } => merge::telemetry(
                c,
                *risk_level,
                *sentiment,
                *talk_ratio,
                transcript_snippet.as_deref(),
                strategy_hint.as_deref(),
            ),
            EventPayload::CallEnded {
                call_log_id,
                outcome,
                interest,
                duration_secs,
                summary,
            } => merge::call_ended(
                c,
                LastCall {
                    call_log_id: *call_log_id,
                    outcome: *outcome,
                    interest: *interest,
                    duration_secs: *duration_secs,
                    summary: summary.clone(),
                },
            ),
            EventPayload::ContactUpdated {
                call_status,
                status,
                last_call_at,
            } => merge::contact_updated(c, *call_status, *status, *last_call_at),
            _ => {}
        };

        if !self.contacts.contains_key(&contact_id) {
            return match payload {
                // Job-level events with a contact id need no contact entry.
                EventPayload::BatchProgress { .. } => Applied::Unchanged,
                _ => Applied::NeedsResync,
            };
        }
        self.update_contact(contact_id, merge_fn)
    }

    /// Apply `f` to the list entry and, if it is selected, to the selection
    /// in the same step.
    fn update_contact(&mut self, contact_id: i64, f: impl Fn(&mut ContactView)) -> Applied {
        let Some(entry) = self.contacts.get_mut(&contact_id) else {
            return Applied::NeedsResync;
        };
        let before = entry.clone();
        f(entry);
        let changed = *entry != before;

        if let Some(selected) = self.selected.as_mut()
            && selected.id == contact_id
        {
            f(selected);
        }

        if changed {
            Applied::Changed
        } else {
            Applied::Unchanged
        }
    }

    /// Replace job and contacts with authoritative state and re-project the
    /// selection. Local edits the server has not confirmed are discarded.
    ///
    /// The job status is ordered at the snapshot's server-side `as_of`, so a
    /// status event published after the read still wins however late the
    /// snapshot reaches this observer.
    pub fn resync(&mut self, snapshot: &CampaignSnapshot) {
        self.campaign_id = snapshot.campaign_id;
        self.job = snapshot
            .job
            .as_ref()
            .map(|job| JobView::from_job(job, snapshot.as_of));
        self.contacts = snapshot
            .contacts
            .iter()
            .map(|c| (c.id, ContactView::from(c)))
            .collect();
        self.selected = self
            .selected
            .as_ref()
            .and_then(|s| self.contacts.get(&s.id).cloned());
    }

    /// Start inspecting a contact. `false` if it is not in the list.
    pub fn select(&mut self, contact_id: i64) -> bool {
        self.selected = self.contacts.get(&contact_id).cloned();
        self.selected.is_some()
    }

    pub fn clear_selection(&mut self) {
        self.selected = None;
    }

    /// Optimistically apply an operator edit. It stays pending until a
    /// server event confirms or overrides it, or a snapshot replaces it.
    pub fn apply_local_edit(&mut self, contact_id: i64, patch: &ContactPatch) -> Applied {
        if patch.is_empty() {
            return Applied::Unchanged;
        }
        self.update_contact(contact_id, |c| merge::local_edit(c, patch))
    }

    pub fn pending_edits(&self) -> impl Iterator<Item = &ContactView> {
        self.contacts.values().filter(|c| !c.pending.is_empty())
    }
}
