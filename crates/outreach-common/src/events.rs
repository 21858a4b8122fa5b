//! Wire format of the batch event stream.
//!
//! Every state change of a batch job or of a contact it touches is published
//! as one [`BatchEvent`]. On the wire an event is a flat JSON object:
//!
//! ```json
//! {
//!   "type": "BATCH_PROGRESS",
//!   "data": { "currentIndex": 2, "totalLeads": 3, "success": true, "skipped": false },
//!   "campaignId": 7,
//!   "batchJobId": 12,
//!   "contactId": 40,
//!   "timestamp": "2026-01-05T10:00:00Z"
//! }
//! ```
//!
//! Events for one `batchJobId` are published in causal order by the single
//! loop driving that job. Nothing is promised across jobs or across
//! consumers; observers that miss events resynchronize from a snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{CallOutcome, CallStatus, InterestStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEvent {
    #[serde(flatten)]
    pub payload: EventPayload,
    pub campaign_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_job_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

/// Coarse risk signal reported by a call adapter while a call is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum EventPayload {
    BatchStarted {
        total_leads: i64,
    },
    BatchProgress {
        current_index: i64,
        total_leads: i64,
        success: bool,
        skipped: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default)]
        success_count: i64,
        #[serde(default)]
        failure_count: i64,
    },
    BatchPaused {
        reason: String,
    },
    BatchResumed {
        current_index: i64,
    },
    BatchCompleted {
        total_leads: i64,
    },
    BatchCancelled {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cancelled_by: Option<String>,
    },
    BatchSkippedOutsideTimeWindow {
        next_retry_time: DateTime<Utc>,
        retry_count: u32,
    },

    // Per-contact call lifecycle
    CallStarted {
        call_log_id: i64,
    },
    /// Narrow live-call update. Absent fields mean "unchanged".
    CallTelemetry {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        risk_level: Option<RiskLevel>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sentiment: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        talk_ratio: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transcript_snippet: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        strategy_hint: Option<String>,
    },
    CallEnded {
        call_log_id: i64,
        outcome: CallOutcome,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interest: Option<InterestStatus>,
        duration_secs: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    ContactUpdated {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_status: Option<CallStatus>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<InterestStatus>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_call_at: Option<DateTime<Utc>>,
    },
}

impl EventPayload {
    /// The wire name carried in the `type` field.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::BatchStarted { .. } => "BATCH_STARTED",
            Self::BatchProgress { .. } => "BATCH_PROGRESS",
            Self::BatchPaused { .. } => "BATCH_PAUSED",
            Self::BatchResumed { .. } => "BATCH_RESUMED",
            Self::BatchCompleted { .. } => "BATCH_COMPLETED",
            Self::BatchCancelled { .. } => "BATCH_CANCELLED",
            Self::BatchSkippedOutsideTimeWindow { .. } => "BATCH_SKIPPED_OUTSIDE_TIME_WINDOW",
            Self::CallStarted { .. } => "CALL_STARTED",
            Self::CallTelemetry { .. } => "CALL_TELEMETRY",
            Self::CallEnded { .. } => "CALL_ENDED",
            Self::ContactUpdated { .. } => "CONTACT_UPDATED",
        }
    }
}

impl BatchEvent {
    pub fn new(campaign_id: i64, payload: EventPayload) -> Self {
        Self {
            payload,
            campaign_id,
            batch_job_id: None,
            contact_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn for_job(mut self, job_id: i64) -> Self {
        self.batch_job_id = Some(job_id);
        self
    }

    pub fn for_contact(mut self, contact_id: i64) -> Self {
        self.contact_id = Some(contact_id);
        self
    }

    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_is_flat_with_type_and_data() {
        let event = BatchEvent::new(
            7,
            EventPayload::BatchProgress {
                current_index: 2,
                total_leads: 3,
                success: true,
                skipped: false,
                reason: None,
                success_count: 2,
                failure_count: 0,
            },
        )
        .for_job(12)
        .for_contact(40);

        let value: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "BATCH_PROGRESS");
        assert_eq!(value["campaignId"], 7);
        assert_eq!(value["batchJobId"], 12);
        assert_eq!(value["contactId"], 40);
        assert_eq!(value["data"]["currentIndex"], 2);
        assert_eq!(value["data"]["totalLeads"], 3);
        assert!(value["data"].get("reason").is_none());
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_skipped_window_event_type_name() {
        let event = BatchEvent::new(
            1,
            EventPayload::BatchSkippedOutsideTimeWindow {
                next_retry_time: Utc::now(),
                retry_count: 2,
            },
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"BATCH_SKIPPED_OUTSIDE_TIME_WINDOW\""));
        assert!(json.contains("\"retryCount\":2"));
        assert_eq!(event.event_type(), "BATCH_SKIPPED_OUTSIDE_TIME_WINDOW");
    }

    #[test]
    fn test_deserialize_from_wire() {
        let json = r#"{
            "type": "BATCH_PAUSED",
            "data": {"reason": "operator"},
            "campaignId": 3,
            "batchJobId": 9,
            "timestamp": "2026-01-05T10:00:00Z"
        }"#;
        let event: BatchEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.campaign_id, 3);
        assert_eq!(event.batch_job_id, Some(9));
        assert_eq!(event.contact_id, None);
        assert_eq!(
            event.payload,
            EventPayload::BatchPaused {
                reason: "operator".to_string()
            }
        );
    }

    #[test]
    fn test_narrow_telemetry_omits_absent_fields() {
        let event = BatchEvent::new(
            1,
            EventPayload::CallTelemetry {
                risk_level: Some(RiskLevel::High),
                sentiment: None,
                talk_ratio: None,
                transcript_snippet: None,
                strategy_hint: None,
            },
        )
        .for_contact(5);
        let value: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "CALL_TELEMETRY");
        assert_eq!(value["data"]["riskLevel"], "HIGH");
        assert_eq!(value["data"].as_object().unwrap().len(), 1);

        let back: BatchEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_cancelled_accepts_empty_data() {
        let json = r#"{"type":"BATCH_CANCELLED","data":{},"campaignId":1,"batchJobId":2,"timestamp":"2026-01-05T10:00:00Z"}"#;
        let event: BatchEvent = serde_json::from_str(json).unwrap();
        assert_eq!(
            event.payload,
            EventPayload::BatchCancelled { cancelled_by: None }
        );
    }
}
