//! Per-event merge rules.
//!
//! Every function overwrites fields with values carried by the event or
//! takes the maximum of local and event values, never increments or
//! toggles, so a duplicated event leaves the view as it was. Status changes
//! are ordered by event time, and a terminal status is final.

use chrono::{DateTime, Utc};

use outreach_common::*;

use super::read_model::{ContactPatch, ContactView, JobView, LastCall, LiveCall};

/// Whether a status event stamped `at` may replace the current status.
fn status_may_change(job: &JobView, at: DateTime<Utc>) -> bool {
    !job.status.is_terminal() && at >= job.status_at
}

pub fn progress(
    job: &mut JobView,
    current_index: i64,
    total_leads: i64,
    success_count: i64,
    failure_count: i64,
) {
    job.current_index = job.current_index.max(current_index);
    job.total_leads = total_leads;
    job.success_count = job.success_count.max(success_count);
    job.failure_count = job.failure_count.max(failure_count);
}

/// Repeated `BATCH_STARTED` for the job already followed.
pub fn restarted(job: &mut JobView, total_leads: i64, at: DateTime<Utc>) {
    job.total_leads = total_leads;
    if status_may_change(job, at) {
        job.status = JobStatus::Running;
        job.status_at = at;
    }
}

pub fn paused(job: &mut JobView, reason: &str, at: DateTime<Utc>) {
    if !status_may_change(job, at) {
        return;
    }
    job.status = JobStatus::Paused;
    job.status_at = at;
    job.paused_at = Some(at);
    job.pause_reason = Some(reason.to_string());
}

pub fn resumed(job: &mut JobView, current_index: i64, at: DateTime<Utc>) {
    job.current_index = job.current_index.max(current_index);
    if !status_may_change(job, at) {
        return;
    }
    job.status = JobStatus::Running;
    job.status_at = at;
    job.paused_at = None;
    job.pause_reason = None;
}

pub fn completed(job: &mut JobView, total_leads: i64, at: DateTime<Utc>) {
    job.total_leads = total_leads;
    if job.status.is_terminal() {
        return;
    }
    job.status = JobStatus::Completed;
    job.status_at = at;
    job.next_retry_time = None;
}

pub fn cancelled(job: &mut JobView, cancelled_by: Option<&str>, at: DateTime<Utc>) {
    if job.status.is_terminal() {
        return;
    }
    job.status = JobStatus::Cancelled;
    job.status_at = at;
    job.next_retry_time = None;
    if let Some(by) = cancelled_by {
        job.cancelled_by = Some(by.to_string());
    }
}

pub fn skipped_outside_window(job: &mut JobView, next_retry_time: DateTime<Utc>, retry_count: u32) {
    job.next_retry_time = Some(next_retry_time);
    job.window_retry_count = retry_count;
}

/// Drop per-call state left over from a previous job.
pub fn clear_call_state(contact: &mut ContactView) {
    contact.live = None;
    contact.last_call = None;
}

fn call_finished(contact: &ContactView, call_log_id: i64) -> bool {
    contact
        .last_call
        .as_ref()
        .is_some_and(|last| last.call_log_id >= call_log_id)
}

pub fn call_started(contact: &mut ContactView, call_log_id: i64) {
    if call_finished(contact, call_log_id) {
        return;
    }
    // Telemetry that raced ahead of the start belongs to this call.
    if let Some(live) = contact.live.as_mut()
        && live.call_log_id.is_none()
    {
        live.call_log_id = Some(call_log_id);
        return;
    }
    if contact
        .live
        .as_ref()
        .is_some_and(|live| live.call_log_id >= Some(call_log_id))
    {
        return;
    }
    contact.live = Some(LiveCall {
        call_log_id: Some(call_log_id),
        ..LiveCall::default()
    });
}

/// Overwrite only the telemetry fields the event carries.
pub fn telemetry(
    contact: &mut ContactView,
    risk_level: Option<RiskLevel>,
    sentiment: Option<f64>,
    talk_ratio: Option<f64>,
    transcript_snippet: Option<&str>,
    strategy_hint: Option<&str>,
) {
    if contact.live.is_none() {
        // Late telemetry of a call that already ended.
        if contact.last_call.is_some() {
            return;
        }
        contact.live = Some(LiveCall::default());
    }
    let Some(live) = contact.live.as_mut() else {
        return;
    };
    if let Some(v) = risk_level {
        live.risk_level = Some(v);
    }
    if let Some(v) = sentiment {
        live.sentiment = Some(v);
    }
    if let Some(v) = talk_ratio {
        live.talk_ratio = Some(v);
    }
    if let Some(v) = transcript_snippet {
        live.transcript_snippet = Some(v.to_string());
    }
    if let Some(v) = strategy_hint {
        live.strategy_hint = Some(v.to_string());
    }
}

pub fn call_ended(contact: &mut ContactView, ended: LastCall) {
    if contact
        .last_call
        .as_ref()
        .is_some_and(|last| last.call_log_id > ended.call_log_id)
    {
        return;
    }
    if contact
        .live
        .as_ref()
        .is_some_and(|live| live.call_log_id.is_none_or(|id| id <= ended.call_log_id))
    {
        contact.live = None;
    }
    contact.last_call = Some(ended);
}

/// Server write-back. Settles any pending local edit of the same field.
pub fn contact_updated(
    contact: &mut ContactView,
    call_status: Option<CallStatus>,
    status: Option<InterestStatus>,
    last_call_at: Option<DateTime<Utc>>,
) {
    if let Some(v) = call_status {
        contact.call_status = v;
    }
    if let Some(v) = status {
        contact.status = v;
        contact.pending.status = None;
    }
    if let Some(v) = last_call_at {
        contact.last_call_at = Some(contact.last_call_at.map_or(v, |prev| prev.max(v)));
    }
}

pub fn local_edit(contact: &mut ContactView, patch: &ContactPatch) {
    if let Some(name) = &patch.name {
        contact.name = name.clone();
        contact.pending.name = Some(name.clone());
    }
    if let Some(status) = patch.status {
        contact.status = status;
        contact.pending.status = Some(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_767_600_000 + secs, 0).unwrap()
    }

    fn view() -> ContactView {
        ContactView {
            id: 1,
            name: "Ada".into(),
            phone: "+15550001".into(),
            call_status: CallStatus::InProgress,
            status: InterestStatus::Cold,
            last_call_at: None,
            live: None,
            last_call: None,
            pending: ContactPatch::default(),
        }
    }

    #[test]
    fn test_last_call_at_never_moves_back() {
        let mut c = view();
        contact_updated(&mut c, None, None, Some(at(50)));
        contact_updated(&mut c, None, None, Some(at(10)));
        assert_eq!(c.last_call_at, Some(at(50)));
    }

    #[test]
    fn test_newer_call_replaces_live_state() {
        let mut c = view();
        call_started(&mut c, 1);
        telemetry(&mut c, Some(RiskLevel::High), None, None, None, None);
        call_started(&mut c, 2);
        let live = c.live.as_ref().unwrap();
        assert_eq!(live.call_log_id, Some(2));
        assert_eq!(live.risk_level, None);

        // An older start arriving late is ignored
        call_started(&mut c, 1);
        assert_eq!(c.live.as_ref().unwrap().call_log_id, Some(2));
    }

    #[test]
    fn test_stale_call_end_keeps_newer_result() {
        let mut c = view();
        let ended = |id| LastCall {
            call_log_id: id,
            outcome: CallOutcome::Completed,
            interest: None,
            duration_secs: id,
            summary: None,
        };
        call_ended(&mut c, ended(5));
        call_ended(&mut c, ended(3));
        assert_eq!(c.last_call.as_ref().unwrap().call_log_id, 5);
    }

    #[test]
    fn test_completed_keeps_counters() {
        let mut job = JobView::started(1, 1, 3, at(0));
        progress(&mut job, 3, 3, 2, 1);
        completed(&mut job, 3, at(10));
        completed(&mut job, 3, at(5));
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.status_at, at(10));
        assert_eq!((job.success_count, job.failure_count), (2, 1));
    }
}
