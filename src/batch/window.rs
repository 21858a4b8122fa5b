//! Calling-window evaluation.
//!
//! A [`CallingWindow`] is expressed in campaign-local minutes. Everything in
//! here converts the UTC instant into local wall-clock time with the
//! window's fixed offset, evaluates, and converts candidate opening times
//! back to UTC.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Timelike, Utc};

use outreach_common::CallingWindow;

const MINUTES_PER_DAY: u32 = 24 * 60;

/// Reject windows that can never be evaluated sensibly.
pub fn validate(window: &CallingWindow) -> Result<(), String> {
    if window.start_minute >= MINUTES_PER_DAY {
        return Err(format!(
            "startMinute must be below {}, got {}",
            MINUTES_PER_DAY, window.start_minute
        ));
    }
    if window.end_minute > MINUTES_PER_DAY {
        return Err(format!(
            "endMinute must be at most {}, got {}",
            MINUTES_PER_DAY, window.end_minute
        ));
    }
    if window.utc_offset_minutes.abs() > 14 * 60 {
        return Err(format!(
            "utcOffsetMinutes out of range: {}",
            window.utc_offset_minutes
        ));
    }
    Ok(())
}

fn to_local(window: &CallingWindow, now: DateTime<Utc>) -> NaiveDateTime {
    now.naive_utc() + Duration::minutes(window.utc_offset_minutes as i64)
}

fn minute_of_day(t: &NaiveDateTime) -> u32 {
    t.hour() * 60 + t.minute()
}

fn opens_on(window: &CallingWindow, date: NaiveDate) -> bool {
    window.days.contains(&date.weekday())
}

/// Whether an outbound call may be placed at `now`.
pub fn is_open(window: &CallingWindow, now: DateTime<Utc>) -> bool {
    let (start, end) = (window.start_minute, window.end_minute);
    if start == end || start >= MINUTES_PER_DAY {
        return false;
    }
    let local = to_local(window, now);
    let minute = minute_of_day(&local);
    let today = local.date();

    if start < end {
        return opens_on(window, today) && minute >= start && minute < end;
    }

    // Overnight: the evening half belongs to today, the early-morning half
    // to yesterday's window.
    if minute >= start && opens_on(window, today) {
        return true;
    }
    match today.pred_opt() {
        Some(yesterday) => minute < end && opens_on(window, yesterday),
        None => false,
    }
}

/// The next instant at or after `now` at which the window is open.
///
/// Returns `None` for windows that never open (no days, or zero length).
pub fn next_open(window: &CallingWindow, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if is_open(window, now) {
        return Some(now);
    }
    if window.start_minute == window.end_minute
        || window.start_minute >= MINUTES_PER_DAY
        || window.days.is_empty()
    {
        return None;
    }

    let local = to_local(window, now);
    let offset = Duration::minutes(window.utc_offset_minutes as i64);
    let (hour, minute) = (window.start_minute / 60, window.start_minute % 60);

    // A week and a day covers every weekday plus the rest of today.
    for days_ahead in 0..=7 {
        let date = local.date() + Duration::days(days_ahead);
        if !opens_on(window, date) {
            continue;
        }
        let Some(open_at) = date.and_hms_opt(hour, minute, 0) else {
            continue;
        };
        if open_at > local {
            return Some((open_at - offset).and_utc());
        }
    }
    None
}
