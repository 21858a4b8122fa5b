use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use outreach_common::{Contact, EventPayload, RiskLevel};

use super::emitter::EventEmitter;

/// How the far end responded, before any classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallDisposition {
    Answered,
    NoAnswer,
    Busy,
    Voicemail,
    Failed,
}

/// Raw result of one call attempt as reported by the adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallReport {
    pub disposition: CallDisposition,
    #[serde(default)]
    pub transcript: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    /// Live-call samples a remote adapter buffered instead of streaming.
    #[serde(default)]
    pub telemetry: Vec<Telemetry>,
}

impl CallReport {
    pub fn answered(transcript: impl Into<String>) -> Self {
        Self {
            disposition: CallDisposition::Answered,
            transcript: Some(transcript.into()),
            summary: None,
            error: None,
            telemetry: Vec::new(),
        }
    }

    pub fn with_disposition(disposition: CallDisposition) -> Self {
        Self {
            disposition,
            transcript: None,
            summary: None,
            error: None,
            telemetry: Vec::new(),
        }
    }
}

/// A partial live-call update. Absent fields leave the observer's view unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
    #[serde(default)]
    pub risk_level: Option<RiskLevel>,
    #[serde(default)]
    pub sentiment: Option<f64>,
    #[serde(default)]
    pub talk_ratio: Option<f64>,
    #[serde(default)]
    pub transcript_snippet: Option<String>,
    #[serde(default)]
    pub strategy_hint: Option<String>,
}

/// Identity of the call in progress, handed to the adapter so it can publish
/// telemetry while the executor waits on it.
#[derive(Clone)]
pub struct CallContext {
    emitter: EventEmitter,
    pub campaign_id: i64,
    pub job_id: i64,
    pub contact_id: i64,
    pub call_log_id: i64,
}

impl CallContext {
    pub fn new(
        emitter: EventEmitter,
        campaign_id: i64,
        job_id: i64,
        contact_id: i64,
        call_log_id: i64,
    ) -> Self {
        Self {
            emitter,
            campaign_id,
            job_id,
            contact_id,
            call_log_id,
        }
    }

    pub fn publish_telemetry(&self, t: Telemetry) {
        self.emitter.contact_event(
            self.campaign_id,
            self.job_id,
            self.contact_id,
            EventPayload::CallTelemetry {
                risk_level: t.risk_level,
                sentiment: t.sentiment,
                talk_ratio: t.talk_ratio,
                transcript_snippet: t.transcript_snippet,
                strategy_hint: t.strategy_hint,
            },
        );
    }
}

/// Performs one real-world call attempt.
/// Real implementation: `HttpCallAdapter`. Tests use in-process doubles.
#[async_trait]
pub trait CallAdapter: Send + Sync {
    async fn place_call(&self, ctx: &CallContext, contact: &Contact) -> Result<CallReport>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PlaceCallRequest<'a> {
    call_log_id: i64,
    campaign_id: i64,
    contact_id: i64,
    name: &'a str,
    phone: &'a str,
}

/// Delegates calls to an external telephony service over HTTP.
///
/// `POST {base_url}/calls` with the contact, expecting a [`CallReport`] as
/// JSON once the call has ended.
pub struct HttpCallAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCallAdapter {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to build HTTP client for call adapter")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl CallAdapter for HttpCallAdapter {
    async fn place_call(&self, ctx: &CallContext, contact: &Contact) -> Result<CallReport> {
        let body = PlaceCallRequest {
            call_log_id: ctx.call_log_id,
            campaign_id: ctx.campaign_id,
            contact_id: contact.id,
            name: &contact.name,
            phone: &contact.phone,
        };
        let mut report: CallReport = self
            .client
            .post(format!("{}/calls", self.base_url))
            .json(&body)
            .send()
            .await
            .context("Failed to reach call adapter")?
            .error_for_status()
            .context("Call adapter returned error status")?
            .json()
            .await
            .context("Failed to parse call adapter response")?;

        for sample in std::mem::take(&mut report.telemetry) {
            ctx.publish_telemetry(sample);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, routing::post};
    use chrono::Utc;
    use outreach_common::{BatchEvent, CallStatus, InterestStatus};

    fn contact() -> Contact {
        Contact {
            id: 5,
            campaign_id: 1,
            name: "Ada".into(),
            phone: "+15550001111".into(),
            call_status: CallStatus::InProgress,
            status: InterestStatus::Cold,
            last_call_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[test]
    fn test_report_deserializes_with_defaults() {
        let report: CallReport = serde_json::from_str(r#"{"disposition":"NO_ANSWER"}"#).unwrap();
        assert_eq!(report.disposition, CallDisposition::NoAnswer);
        assert!(report.transcript.is_none());
        assert!(report.telemetry.is_empty());
    }

    #[tokio::test]
    async fn test_http_adapter_posts_contact_and_replays_telemetry() {
        let router = Router::new().route(
            "/calls",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["phone"], "+15550001111");
                assert_eq!(body["callLogId"], 77);
                Json(serde_json::json!({
                    "disposition": "ANSWERED",
                    "transcript": "yes please send the pricing",
                    "telemetry": [{"riskLevel": "LOW"}, {"sentiment": 0.8}]
                }))
            }),
        );
        let base = serve(router).await;

        let emitter = EventEmitter::new(8);
        let mut rx = emitter.subscribe();
        let ctx = CallContext::new(emitter, 1, 2, 5, 77);
        let adapter = HttpCallAdapter::new(format!("{}/", base), Duration::from_secs(5)).unwrap();

        let report = adapter.place_call(&ctx, &contact()).await.unwrap();
        assert_eq!(report.disposition, CallDisposition::Answered);
        assert!(report.telemetry.is_empty());

        let first: BatchEvent = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first.event_type(), "CALL_TELEMETRY");
        assert_eq!(first.contact_id, Some(5));
        let second: BatchEvent = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert!(matches!(
            second.payload,
            EventPayload::CallTelemetry { sentiment: Some(s), .. } if (s - 0.8).abs() < f64::EPSILON
        ));
    }

    #[tokio::test]
    async fn test_http_adapter_surfaces_error_status() {
        let router = Router::new().route(
            "/calls",
            post(|| async { (axum::http::StatusCode::BAD_GATEWAY, "carrier down") }),
        );
        let base = serve(router).await;
        let ctx = CallContext::new(EventEmitter::new(1), 1, 2, 5, 1);
        let adapter = HttpCallAdapter::new(base, Duration::from_secs(5)).unwrap();

        let err = adapter.place_call(&ctx, &contact()).await.unwrap_err();
        assert!(format!("{:#}", err).contains("error status"));
    }
}
