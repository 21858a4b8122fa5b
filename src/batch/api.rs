use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::Deserialize;
use tracing::warn;

use outreach_common::*;

use super::controller::BatchController;
use super::window;
use super::ws::ws_handler;
use crate::errors::BatchError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub controller: BatchController,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCampaignRequest {
    pub name: String,
    #[serde(default)]
    pub window: Option<CallingWindow>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewContact {
    pub name: String,
    pub phone: String,
    #[serde(default)]
    pub status: Option<InterestStatus>,
}

#[derive(Deserialize)]
pub struct AddContactsRequest {
    pub contacts: Vec<NewContact>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(&'static str, String),
    BadRequest(String),
    Conflict(&'static str, String),
    Unprocessable(&'static str, String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::NotFound(code, msg) => (StatusCode::NOT_FOUND, code, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Conflict(code, msg) => (StatusCode::CONFLICT, code, msg),
            ApiError::Unprocessable(code, msg) => (StatusCode::UNPROCESSABLE_ENTITY, code, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", msg),
        };
        (status, Json(serde_json::json!({"error": message, "code": code}))).into_response()
    }
}

impl From<BatchError> for ApiError {
    fn from(err: BatchError) -> Self {
        let code = err.code();
        let message = err.to_string();
        match err {
            BatchError::NoEligibleLeads { .. } => ApiError::Unprocessable(code, message),
            BatchError::JobAlreadyActive { .. } | BatchError::InvalidTransition { .. } => {
                ApiError::Conflict(code, message)
            }
            BatchError::JobNotFound { .. } | BatchError::CampaignNotFound { .. } => {
                ApiError::NotFound(code, message)
            }
            BatchError::ClaimConflict { .. }
            | BatchError::CallExecutionFailure { .. }
            | BatchError::Persistence(_) => {
                warn!(code, error = %message, "request failed");
                ApiError::Internal(message)
            }
        }
    }
}

fn internal(e: anyhow::Error) -> ApiError {
    ApiError::Internal(format!("{:#}", e))
}

fn campaign_not_found(id: i64) -> ApiError {
    BatchError::CampaignNotFound { id }.into()
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/campaigns", post(create_campaign))
        .route("/api/campaigns/{id}", get(get_campaign))
        .route(
            "/api/campaigns/{id}/contacts",
            get(list_contacts).post(add_contacts),
        )
        .route("/api/campaigns/{id}/snapshot", get(get_snapshot))
        .route(
            "/api/campaigns/{id}/batch",
            get(get_campaign_batch).post(start_batch),
        )
        .route("/api/batches/{id}", get(get_batch))
        .route("/api/batches/{id}/calls", get(list_calls))
        .route("/api/batches/{id}/pause", post(pause_batch))
        .route("/api/batches/{id}/resume", post(resume_batch))
        .route("/api/batches/{id}/stop", post(stop_batch))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn create_campaign(
    State(state): State<SharedState>,
    Json(req): Json<CreateCampaignRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("Campaign name must not be empty".into()));
    }
    let calling_window = req.window.unwrap_or_default();
    window::validate(&calling_window).map_err(ApiError::BadRequest)?;
    let name = req.name;
    let campaign = state
        .controller
        .db()
        .call(move |db| db.create_campaign(&name, &calling_window, Utc::now()))
        .await
        .map_err(internal)?;
    Ok((StatusCode::CREATED, Json(campaign)))
}

async fn get_campaign(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let campaign = state
        .controller
        .db()
        .call(move |db| db.get_campaign(id))
        .await
        .map_err(internal)?;
    campaign.map(Json).ok_or_else(|| campaign_not_found(id))
}

async fn add_contacts(
    State(state): State<SharedState>,
    Path(campaign_id): Path<i64>,
    Json(req): Json<AddContactsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(bad) = req.contacts.iter().find(|c| c.name.trim().is_empty()) {
        return Err(ApiError::BadRequest(format!(
            "Contact with phone '{}' has no name",
            bad.phone
        )));
    }
    let added = state
        .controller
        .db()
        .call(move |db| {
            if db.get_campaign(campaign_id)?.is_none() {
                return Ok(None);
            }
            let now = Utc::now();
            let mut added = Vec::with_capacity(req.contacts.len());
            for c in &req.contacts {
                added.push(db.add_contact(
                    campaign_id,
                    c.name.trim(),
                    c.phone.trim(),
                    c.status.unwrap_or(InterestStatus::Cold),
                    now,
                )?);
            }
            Ok(Some(added))
        })
        .await
        .map_err(internal)?
        .ok_or_else(|| campaign_not_found(campaign_id))?;
    Ok((StatusCode::CREATED, Json(added)))
}

async fn list_contacts(
    State(state): State<SharedState>,
    Path(campaign_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state
        .controller
        .db()
        .call(move |db| db.campaign_snapshot(campaign_id))
        .await
        .map_err(internal)?
        .ok_or_else(|| campaign_not_found(campaign_id))?;
    Ok(Json(snapshot.contacts))
}

async fn get_snapshot(
    State(state): State<SharedState>,
    Path(campaign_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state
        .controller
        .db()
        .call(move |db| db.campaign_snapshot(campaign_id))
        .await
        .map_err(internal)?
        .ok_or_else(|| campaign_not_found(campaign_id))?;
    Ok(Json(snapshot))
}

async fn start_batch(
    State(state): State<SharedState>,
    Path(campaign_id): Path<i64>,
    Json(req): Json<StartBatchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let resp = state
        .controller
        .start(campaign_id, req.cooldown_hours, req.max_retries)
        .await?;
    Ok((StatusCode::CREATED, Json(resp)))
}

async fn get_campaign_batch(
    State(state): State<SharedState>,
    Path(campaign_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state
        .controller
        .db()
        .call(move |db| db.campaign_snapshot(campaign_id))
        .await
        .map_err(internal)?
        .ok_or_else(|| campaign_not_found(campaign_id))?;
    snapshot.job.map(Json).ok_or_else(|| {
        ApiError::NotFound(
            "JOB_NOT_FOUND",
            format!("Campaign {} has no batch jobs", campaign_id),
        )
    })
}

async fn get_batch(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.controller.get_job(id).await?))
}

async fn list_calls(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    state.controller.get_job(id).await?;
    let logs = state
        .controller
        .db()
        .call(move |db| db.list_call_logs(id))
        .await
        .map_err(internal)?;
    Ok(Json(logs))
}

async fn pause_batch(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.controller.pause(id).await?))
}

async fn resume_batch(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.controller.resume(id).await?))
}

async fn stop_batch(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<StopBatchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.cancelled_by.trim().is_empty() {
        return Err(ApiError::BadRequest("cancelledBy must not be empty".into()));
    }
    Ok(Json(state.controller.stop(id, req.cancelled_by.trim()).await?))
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::batch::BatchSettings;
    use crate::batch::adapter::{CallAdapter, CallContext, CallReport};
    use crate::batch::classify::FixedClassifier;
    use crate::batch::db::{DbHandle, OutreachDb};
    use crate::batch::emitter::EventEmitter;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    /// Never finishes a call, so started jobs stay RUNNING.
    struct HangingAdapter;

    #[async_trait]
    impl CallAdapter for HangingAdapter {
        async fn place_call(&self, _ctx: &CallContext, _c: &Contact) -> anyhow::Result<CallReport> {
            std::future::pending().await
        }
    }

    fn test_app() -> Router {
        let db = DbHandle::new(OutreachDb::new_in_memory().unwrap());
        let controller = BatchController::new(
            db,
            EventEmitter::new(16),
            Arc::new(HangingAdapter),
            Arc::new(FixedClassifier(InterestStatus::Cold)),
            BatchSettings::default(),
        );
        api_router().with_state(Arc::new(AppState { controller }))
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> Response {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        app.clone().oneshot(request).await.unwrap()
    }

    async fn seeded_campaign(app: &Router, contacts: usize) -> i64 {
        let response = send(
            app,
            "POST",
            "/api/campaigns",
            Some(serde_json::json!({"name": "Spring push", "window": {
                "startMinute": 0, "endMinute": 1440,
                "days": ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"]
            }})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let campaign: Campaign = body_json(response.into_body()).await;

        let list: Vec<_> = (0..contacts)
            .map(|i| serde_json::json!({"name": format!("Lead {}", i), "phone": "+15550000000"}))
            .collect();
        let response = send(
            app,
            "POST",
            &format!("/api/campaigns/{}/contacts", campaign.id),
            Some(serde_json::json!({ "contacts": list })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        campaign.id
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = test_app();
        let response = send(&app, "GET", "/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_start_batch_returns_created_with_total_leads() {
        let app = test_app();
        let campaign_id = seeded_campaign(&app, 3).await;

        let response = send(
            &app,
            "POST",
            &format!("/api/campaigns/{}/batch", campaign_id),
            Some(serde_json::json!({"cooldownHours": 0, "maxRetries": 2})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let started: StartBatchResponse = body_json(response.into_body()).await;
        assert_eq!(started.total_leads, 3);

        let response = send(&app, "GET", &format!("/api/batches/{}", started.job_id), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let job: BatchJob = body_json(response.into_body()).await;
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.max_retries, 2);

        let response = send(&app, "GET", &format!("/api/campaigns/{}/batch", campaign_id), None).await;
        let job: BatchJob = body_json(response.into_body()).await;
        assert_eq!(job.id, started.job_id);
    }

    #[tokio::test]
    async fn test_second_start_conflicts() {
        let app = test_app();
        let campaign_id = seeded_campaign(&app, 1).await;
        let uri = format!("/api/campaigns/{}/batch", campaign_id);
        let first = send(&app, "POST", &uri, Some(serde_json::json!({}))).await;
        assert_eq!(first.status(), StatusCode::CREATED);

        let second = send(&app, "POST", &uri, Some(serde_json::json!({}))).await;
        assert_eq!(second.status(), StatusCode::CONFLICT);
        let body: serde_json::Value = body_json(second.into_body()).await;
        assert_eq!(body["code"], "JOB_ALREADY_ACTIVE");
        assert!(body["error"].as_str().unwrap().contains("already has an active batch job"));
    }

    #[tokio::test]
    async fn test_start_without_eligible_leads_is_unprocessable() {
        let app = test_app();
        let campaign_id = seeded_campaign(&app, 0).await;
        let response = send(
            &app,
            "POST",
            &format!("/api/campaigns/{}/batch", campaign_id),
            Some(serde_json::json!({})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["code"], "NO_ELIGIBLE_LEADS");

        let response = send(&app, "GET", &format!("/api/campaigns/{}/batch", campaign_id), None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_commands_on_unknown_job_are_not_found() {
        let app = test_app();
        for action in ["pause", "resume"] {
            let response = send(&app, "POST", &format!("/api/batches/77/{}", action), None).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
            let body: serde_json::Value = body_json(response.into_body()).await;
            assert_eq!(body["code"], "JOB_NOT_FOUND");
        }
    }

    #[tokio::test]
    async fn test_pause_stop_and_invalid_transition() {
        let app = test_app();
        let campaign_id = seeded_campaign(&app, 2).await;
        let response = send(
            &app,
            "POST",
            &format!("/api/campaigns/{}/batch", campaign_id),
            Some(serde_json::json!({})),
        )
        .await;
        let started: StartBatchResponse = body_json(response.into_body()).await;
        let base = format!("/api/batches/{}", started.job_id);

        // Resume on a RUNNING job with nothing pending is invalid
        let response = send(&app, "POST", &format!("{}/resume", base), None).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["code"], "INVALID_TRANSITION");

        let response = send(&app, "POST", &format!("{}/pause", base), None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(
            &app,
            "POST",
            &format!("{}/stop", base),
            Some(serde_json::json!({"cancelledBy": "ops@example.com"})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let job: BatchJob = body_json(response.into_body()).await;
        assert_eq!(job.cancelled_by.as_deref(), Some("ops@example.com"));

        let response = send(
            &app,
            "POST",
            &format!("{}/stop", base),
            Some(serde_json::json!({"cancelledBy": "  "})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_snapshot_and_contacts() {
        let app = test_app();
        let campaign_id = seeded_campaign(&app, 2).await;

        let response = send(&app, "GET", &format!("/api/campaigns/{}/contacts", campaign_id), None).await;
        let contacts: Vec<Contact> = body_json(response.into_body()).await;
        assert_eq!(contacts.len(), 2);
        assert_eq!(contacts[0].status, InterestStatus::Cold);

        let response = send(&app, "GET", &format!("/api/campaigns/{}/snapshot", campaign_id), None).await;
        let snapshot: CampaignSnapshot = body_json(response.into_body()).await;
        assert!(snapshot.job.is_none());
        assert_eq!(snapshot.contacts.len(), 2);

        let response = send(&app, "GET", "/api/campaigns/999/snapshot", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_window_is_rejected() {
        let app = test_app();
        let response = send(
            &app,
            "POST",
            "/api/campaigns",
            Some(serde_json::json!({"name": "bad", "window": {
                "startMinute": 2000, "endMinute": 100, "days": ["Mon"]
            }})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
