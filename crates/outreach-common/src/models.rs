use std::str::FromStr;

use chrono::{DateTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a batch job.
///
/// `Completed` and `Cancelled` are terminal: a job in either state is kept
/// for history but never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "PAUSED" => Ok(Self::Paused),
            "COMPLETED" => Ok(Self::Completed),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// Dialing state of a single contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            _ => Err(format!("Invalid call status: {}", s)),
        }
    }
}

/// Interest classification of a contact. `Hot` leads are reserved for
/// human follow-up and excluded from automated calling by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterestStatus {
    NotPick,
    Cold,
    Warm,
    Hot,
}

impl InterestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotPick => "NOT_PICK",
            Self::Cold => "COLD",
            Self::Warm => "WARM",
            Self::Hot => "HOT",
        }
    }
}

impl std::fmt::Display for InterestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InterestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NOT_PICK" => Ok(Self::NotPick),
            "COLD" => Ok(Self::Cold),
            "WARM" => Ok(Self::Warm),
            "HOT" => Ok(Self::Hot),
            _ => Err(format!("Invalid interest status: {}", s)),
        }
    }
}

/// Classified result of one call attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallOutcome {
    Completed,
    NoAnswer,
    Failed,
}

impl CallOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "COMPLETED",
            Self::NoAnswer => "NO_ANSWER",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for CallOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "COMPLETED" => Ok(Self::Completed),
            "NO_ANSWER" => Ok(Self::NoAnswer),
            "FAILED" => Ok(Self::Failed),
            _ => Err(format!("Invalid call outcome: {}", s)),
        }
    }
}

/// Operator command accepted for a running job but not yet applied by its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingCommand {
    Pause,
    Stop,
}

impl PendingCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Stop => "stop",
        }
    }
}

impl FromStr for PendingCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pause" => Ok(Self::Pause),
            "stop" => Ok(Self::Stop),
            _ => Err(format!("Invalid pending command: {}", s)),
        }
    }
}

/// Time-of-day / day-of-week range in which outbound calls are permitted.
///
/// Minutes are local minutes since midnight, the range is `[start, end)`.
/// A window with `start_minute > end_minute` wraps past midnight and belongs
/// to the weekday it opens on. `start_minute == end_minute` never opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallingWindow {
    pub start_minute: u32,
    pub end_minute: u32,
    pub days: Vec<Weekday>,
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

impl Default for CallingWindow {
    fn default() -> Self {
        Self {
            start_minute: 9 * 60,
            end_minute: 18 * 60,
            days: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
            ],
            utc_offset_minutes: 0,
        }
    }
}

impl CallingWindow {
    /// A window open around the clock, every day.
    pub fn always() -> Self {
        Self {
            start_minute: 0,
            end_minute: 24 * 60,
            days: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
                Weekday::Sat,
                Weekday::Sun,
            ],
            utc_offset_minutes: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Campaign {
    pub id: i64,
    pub name: String,
    pub window: CallingWindow,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: i64,
    pub campaign_id: i64,
    pub name: String,
    pub phone: String,
    pub call_status: CallStatus,
    pub status: InterestStatus,
    pub last_call_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchJob {
    pub id: i64,
    pub campaign_id: i64,
    pub status: JobStatus,
    pub current_index: i64,
    pub total_leads: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub cooldown_hours: u32,
    pub max_retries: u32,
    pub window_retry_count: u32,
    pub pending_command: Option<PendingCommand>,
    pub paused_at: Option<DateTime<Utc>>,
    pub cancelled_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One dispatched call. Created at dispatch, finalized once when the call returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallLog {
    pub id: i64,
    pub job_id: i64,
    pub contact_id: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
    pub outcome: Option<CallOutcome>,
    pub interest: Option<InterestStatus>,
    pub summary: Option<String>,
    pub error: Option<String>,
}

// API view types

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartBatchRequest {
    #[serde(default)]
    pub cooldown_hours: u32,
    #[serde(default)]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartBatchResponse {
    pub job_id: i64,
    pub total_leads: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopBatchRequest {
    pub cancelled_by: String,
}

/// Authoritative state an observer fetches to resynchronize after a gap.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignSnapshot {
    pub campaign_id: i64,
    /// Server time at which the state was read. Events stamped later were
    /// published after this read and must still apply on top of it.
    pub as_of: DateTime<Utc>,
    pub job: Option<BatchJob>,
    pub contacts: Vec<Contact>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_roundtrip() {
        for s in &["PENDING", "RUNNING", "PAUSED", "COMPLETED", "CANCELLED"] {
            let parsed: JobStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("running".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Paused.is_terminal());
    }

    #[test]
    fn test_serde_uses_screaming_case() {
        assert_eq!(
            serde_json::to_string(&CallStatus::InProgress).unwrap(),
            "\"IN_PROGRESS\""
        );
        assert_eq!(
            serde_json::to_string(&InterestStatus::NotPick).unwrap(),
            "\"NOT_PICK\""
        );
        assert_eq!(
            serde_json::from_str::<CallOutcome>("\"NO_ANSWER\"").unwrap(),
            CallOutcome::NoAnswer
        );
    }

    #[test]
    fn test_interest_status_ordering() {
        assert!(InterestStatus::Hot > InterestStatus::Warm);
        assert!(InterestStatus::Warm > InterestStatus::Cold);
        assert!(InterestStatus::Cold > InterestStatus::NotPick);
    }

    #[test]
    fn test_calling_window_default_is_business_hours() {
        let w = CallingWindow::default();
        assert_eq!(w.start_minute, 540);
        assert_eq!(w.end_minute, 1080);
        assert_eq!(w.days.len(), 5);
        assert!(!w.days.contains(&Weekday::Sat));
    }

    #[test]
    fn test_start_batch_request_defaults() {
        let req: StartBatchRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req.cooldown_hours, 0);
        assert_eq!(req.max_retries, 0);
        let req: StartBatchRequest =
            serde_json::from_str(r#"{"cooldownHours": 24, "maxRetries": 3}"#).unwrap();
        assert_eq!(req.cooldown_hours, 24);
        assert_eq!(req.max_retries, 3);
    }
}
