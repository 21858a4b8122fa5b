//! Remote batch commands for `outreach start|pause|resume|stop|status`.
//!
//! These talk to a running `outreach serve` over its HTTP API.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

use outreach::reconcile::{Follower, HttpSnapshotSource, ReadModel};
use outreach_common::{BatchJob, StartBatchRequest, StartBatchResponse, StopBatchRequest};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Deserialize)]
struct ApiErrorBody {
    error: String,
    code: Option<String>,
}

struct ApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post<B: serde::Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to reach outreach server at {}", self.base_url))?;
        Self::decode(resp).await
    }

    async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
        let status = resp.status();
        if status.is_success() {
            return resp.json().await.context("Failed to parse server response");
        }
        let body = resp.text().await.unwrap_or_default();
        match serde_json::from_str::<ApiErrorBody>(&body) {
            Ok(err) => anyhow::bail!(
                "{} ({})",
                err.error,
                err.code.as_deref().unwrap_or(status.as_str())
            ),
            Err(_) => anyhow::bail!("Server returned {}: {}", status, body),
        }
    }
}

fn print_job(verb: &str, job: &BatchJob) {
    println!(
        "{} batch job {} (campaign {}): {} {}/{}",
        verb,
        job.id,
        job.campaign_id,
        job.status,
        job.current_index,
        job.total_leads
    );
    if let Some(cmd) = job.pending_command {
        println!("  pending: {} (applied after the in-flight call)", cmd.as_str());
    }
}

pub async fn cmd_start(
    server_url: &str,
    campaign_id: i64,
    cooldown_hours: u32,
    max_retries: u32,
) -> Result<()> {
    let api = ApiClient::new(server_url)?;
    let resp: StartBatchResponse = api
        .post(
            &format!("/api/campaigns/{}/batch", campaign_id),
            &StartBatchRequest {
                cooldown_hours,
                max_retries,
            },
        )
        .await?;
    println!(
        "Started batch job {} for campaign {} with {} leads",
        resp.job_id, campaign_id, resp.total_leads
    );
    Ok(())
}

pub async fn cmd_pause(server_url: &str, job_id: i64) -> Result<()> {
    let api = ApiClient::new(server_url)?;
    let job: BatchJob = api
        .post(&format!("/api/batches/{}/pause", job_id), &serde_json::json!({}))
        .await?;
    print_job("Paused", &job);
    Ok(())
}

pub async fn cmd_resume(server_url: &str, job_id: i64) -> Result<()> {
    let api = ApiClient::new(server_url)?;
    let job: BatchJob = api
        .post(&format!("/api/batches/{}/resume", job_id), &serde_json::json!({}))
        .await?;
    print_job("Resumed", &job);
    Ok(())
}

pub async fn cmd_stop(server_url: &str, job_id: i64, cancelled_by: &str) -> Result<()> {
    let api = ApiClient::new(server_url)?;
    let job: BatchJob = api
        .post(
            &format!("/api/batches/{}/stop", job_id),
            &StopBatchRequest {
                cancelled_by: cancelled_by.to_string(),
            },
        )
        .await?;
    print_job("Stopped", &job);
    Ok(())
}

pub async fn cmd_status(server_url: &str, campaign_id: i64, json: bool) -> Result<()> {
    let source = Arc::new(HttpSnapshotSource::new(server_url, REQUEST_TIMEOUT)?);
    let (follower, _updates) = Follower::connect(campaign_id, source)
        .await
        .with_context(|| format!("Failed to load campaign {} from {}", campaign_id, server_url))?;
    let model = follower.model();

    if json {
        println!("{}", serde_json::to_string_pretty(model)?);
        return Ok(());
    }
    print_model(model);
    Ok(())
}

fn print_model(model: &ReadModel) {
    println!();
    println!("Campaign {}", model.campaign_id);
    println!("===========");
    match &model.job {
        Some(job) => {
            println!(
                "Job {}: {} ({}/{} processed, {} ok, {} failed)",
                job.id,
                job.status,
                job.current_index,
                job.total_leads,
                job.success_count,
                job.failure_count
            );
            if let Some(paused_at) = job.paused_at {
                let mins = (Utc::now() - paused_at).num_minutes();
                println!("  paused {} min ago", mins);
            }
            if let Some(by) = &job.cancelled_by {
                println!("  cancelled by {}", by);
            }
        }
        None => println!("No batch jobs yet."),
    }
    println!();
    println!("{:<8} {:<24} {:<12} {:<9} LAST CALL", "ID", "NAME", "CALL", "INTEREST");
    for c in model.contacts.values() {
        println!(
            "{:<8} {:<24} {:<12} {:<9} {}",
            c.id,
            c.name,
            c.call_status.as_str(),
            c.status.as_str(),
            c.last_call_at
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }
    println!();
}
