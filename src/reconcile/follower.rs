use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use outreach_common::{BatchEvent, CampaignSnapshot};

use super::read_model::{Applied, ReadModel};
use crate::batch::db::DbHandle;

/// Where a follower fetches authoritative state after a gap in the stream.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self, campaign_id: i64) -> Result<CampaignSnapshot>;
}

/// Reads snapshots straight from the orchestrator's database.
pub struct DbSnapshotSource {
    db: DbHandle,
}

impl DbSnapshotSource {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SnapshotSource for DbSnapshotSource {
    async fn fetch(&self, campaign_id: i64) -> Result<CampaignSnapshot> {
        self.db
            .call(move |db| db.campaign_snapshot(campaign_id))
            .await?
            .with_context(|| format!("Campaign {} not found", campaign_id))
    }
}

/// Fetches snapshots from a running server's `/api/campaigns/{id}/snapshot`.
pub struct HttpSnapshotSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSnapshotSource {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to build HTTP client for snapshots")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    async fn fetch(&self, campaign_id: i64) -> Result<CampaignSnapshot> {
        self.client
            .get(format!(
                "{}/api/campaigns/{}/snapshot",
                self.base_url, campaign_id
            ))
            .send()
            .await
            .context("Failed to reach outreach server")?
            .error_for_status()
            .context("Snapshot request failed")?
            .json()
            .await
            .context("Failed to parse campaign snapshot")
    }
}

#[derive(Deserialize)]
struct FrameType {
    #[serde(rename = "type")]
    kind: String,
}

/// Keeps a [`ReadModel`] in sync with the event stream.
///
/// Subscribe to the stream *before* calling [`Follower::connect`]: events
/// published while the first snapshot is in flight are then merged on top
/// of it. Status events are ordered against the snapshot's server-side
/// `as_of`, so one published after the read is never mistaken for stale. Missed events are never
/// replayed; a lag or an event about an unknown contact triggers a fresh
/// snapshot instead.
pub struct Follower {
    campaign_id: i64,
    model: ReadModel,
    source: Arc<dyn SnapshotSource>,
    updates: watch::Sender<ReadModel>,
    resyncs: u64,
}

impl Follower {
    pub async fn connect(
        campaign_id: i64,
        source: Arc<dyn SnapshotSource>,
    ) -> Result<(Self, watch::Receiver<ReadModel>)> {
        let snapshot = source.fetch(campaign_id).await?;
        let model = ReadModel::from_snapshot(&snapshot);
        let (updates, rx) = watch::channel(model.clone());
        Ok((
            Self {
                campaign_id,
                model,
                source,
                updates,
                resyncs: 0,
            },
            rx,
        ))
    }

    pub fn model(&self) -> &ReadModel {
        &self.model
    }

    /// Snapshots fetched since connecting.
    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    /// Replace the model with a fresh snapshot.
    pub async fn resync(&mut self) -> Result<()> {
        let snapshot = self.source.fetch(self.campaign_id).await?;
        self.model.resync(&snapshot);
        self.resyncs += 1;
        info!(campaign_id = self.campaign_id, resyncs = self.resyncs, "read model resynchronized");
        self.updates.send_replace(self.model.clone());
        Ok(())
    }

    /// Process one stream message. Returns `false` once the stream closed.
    pub async fn handle(&mut self, msg: Result<String, broadcast::error::RecvError>) -> Result<bool> {
        let json = match msg {
            Ok(json) => json,
            Err(broadcast::error::RecvError::Closed) => return Ok(false),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(campaign_id = self.campaign_id, missed, "event stream lagged");
                self.resync().await?;
                return Ok(true);
            }
        };

        let event = match serde_json::from_str::<BatchEvent>(&json) {
            Ok(event) => event,
            Err(e) => {
                // Control frames from a remote stream share the socket.
                if serde_json::from_str::<FrameType>(&json).is_ok_and(|f| f.kind == "STREAM_LAGGED")
                {
                    warn!(campaign_id = self.campaign_id, "server reported a lagged stream");
                    self.resync().await?;
                } else {
                    debug!(error = %e, "skipping unrecognized stream frame");
                }
                return Ok(true);
            }
        };

        match self.model.apply(&event) {
            Applied::Changed => {
                self.updates.send_replace(self.model.clone());
            }
            Applied::NeedsResync => {
                debug!(
                    event_type = event.event_type(),
                    contact_id = event.contact_id,
                    "event refers to unknown state"
                );
                self.resync().await?;
            }
            Applied::Unchanged | Applied::Ignored => {}
        }
        Ok(true)
    }

    /// Follow the stream until it closes. Returns the final model.
    pub async fn run(mut self, mut rx: broadcast::Receiver<String>) -> Result<ReadModel> {
        loop {
            let msg = rx.recv().await;
            if !self.handle(msg).await? {
                return Ok(self.model);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::batch::BatchSettings;
    use crate::batch::adapter::{CallAdapter, CallContext, CallReport};
    use crate::batch::api::{AppState, api_router};
    use crate::batch::classify::FixedClassifier;
    use crate::batch::controller::BatchController;
    use crate::batch::db::OutreachDb;
    use crate::batch::emitter::EventEmitter;
    use crate::reconcile::read_model::ContactView;
    use outreach_common::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct InstantAdapter;

    #[async_trait]
    impl CallAdapter for InstantAdapter {
        async fn place_call(&self, _ctx: &CallContext, _c: &Contact) -> Result<CallReport> {
            Ok(CallReport::answered("thanks, not right now"))
        }
    }

    /// Serves a fixed snapshot and counts fetches.
    struct StaticSource {
        snapshot: CampaignSnapshot,
        fetches: AtomicU64,
    }

    #[async_trait]
    impl SnapshotSource for StaticSource {
        async fn fetch(&self, _campaign_id: i64) -> Result<CampaignSnapshot> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.snapshot.clone())
        }
    }

    fn static_source() -> Arc<StaticSource> {
        Arc::new(StaticSource {
            snapshot: CampaignSnapshot {
                campaign_id: 1,
                as_of: Utc::now(),
                job: None,
                contacts: vec![],
            },
            fetches: AtomicU64::new(0),
        })
    }

    fn seeded(contacts: usize) -> (BatchController, i64) {
        let db = DbHandle::new(OutreachDb::new_in_memory().unwrap());
        let campaign_id = {
            let guard = db.lock_sync().unwrap();
            let now = Utc::now();
            let campaign = guard
                .create_campaign("Follow", &CallingWindow::always(), now)
                .unwrap();
            for i in 0..contacts {
                guard
                    .add_contact(
                        campaign.id,
                        &format!("Lead {}", i),
                        "+15550000000",
                        InterestStatus::Cold,
                        now,
                    )
                    .unwrap();
            }
            campaign.id
        };
        let controller = BatchController::new(
            db,
            EventEmitter::new(256),
            Arc::new(InstantAdapter),
            Arc::new(FixedClassifier(InterestStatus::Warm)),
            BatchSettings::default(),
        );
        (controller, campaign_id)
    }

    #[tokio::test]
    async fn test_follower_converges_with_database() {
        let (controller, campaign_id) = seeded(3);
        let mut rx = controller.emitter().subscribe();
        let source = Arc::new(DbSnapshotSource::new(controller.db().clone()));
        let (mut follower, updates) = Follower::connect(campaign_id, source.clone())
            .await
            .unwrap();
        assert!(follower.model().job.is_none());

        controller.start(campaign_id, 0, 0).await.unwrap();

        tokio::time::timeout(Duration::from_secs(10), async {
            while follower.model().job.as_ref().map(|j| j.status) != Some(JobStatus::Completed) {
                follower.handle(rx.recv().await).await.unwrap();
            }
        })
        .await
        .expect("job did not complete");

        let job = follower.model().job.clone().unwrap();
        assert_eq!(job.current_index, 3);
        assert_eq!(job.success_count, 3);
        assert_eq!(follower.resyncs(), 0);

        let truth = ReadModel::from_snapshot(&source.fetch(campaign_id).await.unwrap());
        let strip = |c: &ContactView| (c.id, c.call_status, c.status, c.last_call_at);
        let local: Vec<_> = follower.model().contacts.values().map(strip).collect();
        let remote: Vec<_> = truth.contacts.values().map(strip).collect();
        assert_eq!(local, remote);
        assert!(local.iter().all(|c| c.2 == InterestStatus::Warm));

        assert_eq!(updates.borrow().job.as_ref().unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_lag_triggers_resync() {
        let source = static_source();
        let (mut follower, _updates) = Follower::connect(1, source.clone()).await.unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);

        let alive = follower
            .handle(Err(broadcast::error::RecvError::Lagged(12)))
            .await
            .unwrap();
        assert!(alive);
        assert_eq!(follower.resyncs(), 1);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_lagged_control_frame_triggers_resync() {
        let source = static_source();
        let (mut follower, _updates) = Follower::connect(1, source.clone()).await.unwrap();
        let frame = crate::batch::ws::lagged_notice(4);
        follower.handle(Ok(frame)).await.unwrap();
        follower.handle(Ok("garbage".into())).await.unwrap();
        assert_eq!(follower.resyncs(), 1);
    }

    #[tokio::test]
    async fn test_unknown_contact_triggers_resync() {
        let source = static_source();
        let (mut follower, _updates) = Follower::connect(1, source.clone()).await.unwrap();
        let started = BatchEvent::new(1, EventPayload::BatchStarted { total_leads: 1 }).for_job(3);
        follower
            .handle(Ok(serde_json::to_string(&started).unwrap()))
            .await
            .unwrap();
        let call = BatchEvent::new(1, EventPayload::CallStarted { call_log_id: 1 })
            .for_job(3)
            .for_contact(77);
        follower
            .handle(Ok(serde_json::to_string(&call).unwrap()))
            .await
            .unwrap();
        assert_eq!(follower.resyncs(), 1);
    }

    #[tokio::test]
    async fn test_run_returns_when_stream_closes() {
        let source = static_source();
        let (follower, _updates) = Follower::connect(1, source).await.unwrap();
        let (tx, rx) = broadcast::channel::<String>(4);
        let started = BatchEvent::new(1, EventPayload::BatchStarted { total_leads: 2 }).for_job(9);
        tx.send(serde_json::to_string(&started).unwrap()).unwrap();
        drop(tx);
        let model = follower.run(rx).await.unwrap();
        assert_eq!(model.job.unwrap().id, 9);
    }

    #[tokio::test]
    async fn test_http_snapshot_source() {
        let (controller, campaign_id) = seeded(2);
        let app = api_router().with_state(Arc::new(AppState { controller }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let source =
            HttpSnapshotSource::new(format!("http://{}/", addr), Duration::from_secs(5)).unwrap();
        let snapshot = source.fetch(campaign_id).await.unwrap();
        assert_eq!(snapshot.campaign_id, campaign_id);
        assert_eq!(snapshot.contacts.len(), 2);

        assert!(source.fetch(campaign_id + 100).await.is_err());
    }
}
