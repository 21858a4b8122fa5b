//! End-to-end batch flows over real sockets: HTTP commands, the HTTP call
//! adapter against a fake telephony service, and an HTTP-backed follower.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use assert_cmd::cargo::cargo_bin_cmd;
use axum::{Json, Router, routing::post};
use predicates::prelude::*;
use serde_json::json;
use tokio::sync::{Semaphore, broadcast};

use outreach::batch::BatchSettings;
use outreach::batch::adapter::HttpCallAdapter;
use outreach::batch::api::AppState;
use outreach::batch::classify::KeywordClassifier;
use outreach::batch::controller::BatchController;
use outreach::batch::db::{DbHandle, OutreachDb};
use outreach::batch::emitter::EventEmitter;
use outreach::batch::server::build_router;
use outreach::reconcile::{Follower, HttpSnapshotSource};
use outreach_common::*;

const WAIT: Duration = Duration::from_secs(10);

/// Fake telephony service: every call needs a permit, then answers warmly.
async fn spawn_telephony(gate: Arc<Semaphore>) -> SocketAddr {
    let app = Router::new().route(
        "/calls",
        post(move |Json(_req): Json<serde_json::Value>| {
            let gate = gate.clone();
            async move {
                gate.acquire().await.unwrap().forget();
                Json(json!({
                    "disposition": "ANSWERED",
                    "transcript": "Could you send more info about pricing?",
                    "telemetry": [{ "riskLevel": "LOW", "sentiment": 0.6 }]
                }))
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    addr
}

struct Orchestrator {
    base_url: String,
    emitter: EventEmitter,
    client: reqwest::Client,
}

async fn spawn_orchestrator(telephony: SocketAddr) -> Orchestrator {
    let db = DbHandle::new(OutreachDb::new_in_memory().unwrap());
    let adapter = HttpCallAdapter::new(format!("http://{}", telephony), WAIT).unwrap();
    let controller = BatchController::new(
        db,
        EventEmitter::new(256),
        Arc::new(adapter),
        Arc::new(KeywordClassifier::default()),
        BatchSettings::default(),
    );
    let emitter = controller.emitter().clone();
    let app = build_router(Arc::new(AppState { controller }), false);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    Orchestrator {
        base_url: format!("http://{}", addr),
        emitter,
        client: reqwest::Client::new(),
    }
}

impl Orchestrator {
    async fn post(&self, path: &str, body: serde_json::Value) -> reqwest::Response {
        self.client
            .post(format!("{}{}", self.base_url, path))
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn seed_campaign(&self, contacts: usize) -> i64 {
        let resp = self
            .post(
                "/api/campaigns",
                json!({ "name": "Spring push", "window": CallingWindow::always() }),
            )
            .await;
        assert_eq!(resp.status(), 201);
        let campaign: Campaign = resp.json().await.unwrap();
        let list: Vec<_> = (0..contacts)
            .map(|i| json!({ "name": format!("Lead {}", i), "phone": format!("+1555000{:04}", i) }))
            .collect();
        let resp = self
            .post(
                &format!("/api/campaigns/{}/contacts", campaign.id),
                json!({ "contacts": list }),
            )
            .await;
        assert_eq!(resp.status(), 201);
        campaign.id
    }
}

/// Receive events until one of type `kind`, returning every type seen.
async fn wait_for(rx: &mut broadcast::Receiver<String>, kind: &str) -> Vec<String> {
    tokio::time::timeout(WAIT, async {
        let mut seen = Vec::new();
        loop {
            let raw = rx.recv().await.unwrap();
            let event: BatchEvent = serde_json::from_str(&raw).unwrap();
            let t = event.event_type().to_string();
            seen.push(t.clone());
            if t == kind {
                return seen;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", kind))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn three_contacts_complete_and_observers_converge() {
    let gate = Arc::new(Semaphore::new(100));
    let orch = spawn_orchestrator(spawn_telephony(gate).await).await;
    let campaign_id = orch.seed_campaign(3).await;

    let mut rx = orch.emitter.subscribe();
    let source = Arc::new(HttpSnapshotSource::new(orch.base_url.clone(), WAIT).unwrap());
    let (mut follower, _updates) = Follower::connect(campaign_id, source).await.unwrap();
    let mut follower_rx = orch.emitter.subscribe();

    let resp = orch
        .post(
            &format!("/api/campaigns/{}/batch", campaign_id),
            json!({ "cooldownHours": 0, "maxRetries": 1 }),
        )
        .await;
    assert_eq!(resp.status(), 201);
    let started: StartBatchResponse = resp.json().await.unwrap();
    assert_eq!(started.total_leads, 3);

    let seen = wait_for(&mut rx, "BATCH_COMPLETED").await;
    let progress = seen.iter().filter(|t| *t == "BATCH_PROGRESS").count();
    assert_eq!(progress, 3);
    assert_eq!(seen.first().map(String::as_str), Some("BATCH_STARTED"));
    assert!(seen.iter().any(|t| t == "CALL_TELEMETRY"));

    tokio::time::timeout(WAIT, async {
        while follower.model().job.as_ref().map(|j| j.status) != Some(JobStatus::Completed) {
            let msg = follower_rx.recv().await;
            follower.handle(msg).await.unwrap();
        }
    })
    .await
    .expect("follower did not see completion");

    let model = follower.model();
    let job = model.job.as_ref().unwrap();
    assert_eq!(job.current_index, 3);
    assert_eq!(job.success_count, 3);
    assert!(
        model
            .contacts
            .values()
            .all(|c| c.call_status == CallStatus::Completed && c.status == InterestStatus::Warm)
    );

    // A second start finds nothing left to call
    let resp = orch
        .post(&format!("/api/campaigns/{}/batch", campaign_id), json!({}))
        .await;
    assert_eq!(resp.status(), 422);

    // The CLI reads the same state through the API
    let base_url = orch.base_url.clone();
    tokio::task::spawn_blocking(move || {
        cargo_bin_cmd!("outreach")
            .args(["--server", &base_url, "status", &campaign_id.to_string(), "--json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"status\": \"COMPLETED\""));
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pause_waits_for_in_flight_call_then_resume_finishes() {
    let gate = Arc::new(Semaphore::new(0));
    let orch = spawn_orchestrator(spawn_telephony(gate.clone()).await).await;
    let campaign_id = orch.seed_campaign(3).await;
    let mut rx = orch.emitter.subscribe();

    let resp = orch
        .post(&format!("/api/campaigns/{}/batch", campaign_id), json!({}))
        .await;
    let started: StartBatchResponse = resp.json().await.unwrap();
    wait_for(&mut rx, "CALL_STARTED").await;

    // The first call is still ringing: the pause is only recorded
    let resp = orch
        .post(&format!("/api/batches/{}/pause", started.job_id), json!({}))
        .await;
    assert_eq!(resp.status(), 200);
    let job: BatchJob = resp.json().await.unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.pending_command, Some(PendingCommand::Pause));

    gate.add_permits(1);
    let seen = wait_for(&mut rx, "BATCH_PAUSED").await;
    let progress_at = seen.iter().position(|t| t == "BATCH_PROGRESS").unwrap();
    assert_eq!(progress_at + 1, seen.len() - 1, "progress must directly precede the pause");
    assert!(!seen.iter().any(|t| t == "CALL_STARTED"));

    let job: BatchJob = orch
        .client
        .get(format!("{}/api/batches/{}", orch.base_url, started.job_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Paused);
    assert_eq!(job.current_index, 1);
    assert!(job.paused_at.is_some());

    let contacts: Vec<Contact> = orch
        .client
        .get(format!("{}/api/campaigns/{}/contacts", orch.base_url, campaign_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let pending = contacts
        .iter()
        .filter(|c| c.call_status == CallStatus::Pending)
        .count();
    assert_eq!(pending, 2);

    let resp = orch
        .post(&format!("/api/batches/{}/resume", started.job_id), json!({}))
        .await;
    assert_eq!(resp.status(), 200);
    gate.add_permits(2);
    let seen = wait_for(&mut rx, "BATCH_COMPLETED").await;
    assert_eq!(seen.first().map(String::as_str), Some("BATCH_RESUMED"));
    assert_eq!(seen.iter().filter(|t| *t == "BATCH_PROGRESS").count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_during_call_cancels_after_it() {
    let gate = Arc::new(Semaphore::new(0));
    let orch = spawn_orchestrator(spawn_telephony(gate.clone()).await).await;
    let campaign_id = orch.seed_campaign(2).await;
    let mut rx = orch.emitter.subscribe();

    let started: StartBatchResponse = orch
        .post(&format!("/api/campaigns/{}/batch", campaign_id), json!({}))
        .await
        .json()
        .await
        .unwrap();
    wait_for(&mut rx, "CALL_STARTED").await;

    let resp = orch
        .post(
            &format!("/api/batches/{}/stop", started.job_id),
            json!({ "cancelledBy": "ops@example.com" }),
        )
        .await;
    assert_eq!(resp.status(), 200);

    gate.add_permits(1);
    let seen = wait_for(&mut rx, "BATCH_CANCELLED").await;
    assert!(seen.contains(&"CALL_ENDED".to_string()));

    let job: BatchJob = orch
        .client
        .get(format!("{}/api/batches/{}", orch.base_url, started.job_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.current_index, 1);
    assert_eq!(job.cancelled_by.as_deref(), Some("ops@example.com"));

    // Terminal jobs reject every command
    let resp = orch
        .post(&format!("/api/batches/{}/resume", started.job_id), json!({}))
        .await;
    assert_eq!(resp.status(), 409);
}
