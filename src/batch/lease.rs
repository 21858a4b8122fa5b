//! Per-campaign executor leases.
//!
//! A campaign has an executor loop running exactly when a live lease row
//! exists for it. The row names the owning orchestrator instance and an
//! expiry, so a crashed process stops counting as active once its lease
//! lapses and another instance can take the campaign over.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::db::DbHandle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignLease {
    pub campaign_id: i64,
    pub job_id: i64,
    pub owner_id: String,
    pub expires_at: DateTime<Utc>,
}

impl CampaignLease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Identity of this orchestrator process when it holds leases.
pub fn new_owner_id() -> String {
    format!("outreach-{}", Uuid::new_v4())
}

/// A lease this process holds for one campaign's executor loop.
///
/// Renewed after every contact and while the loop waits for a calling
/// window. Released explicitly by the loop's cleanup step; if the process
/// dies instead, the row simply expires.
#[derive(Clone)]
pub struct HeldLease {
    db: DbHandle,
    campaign_id: i64,
    job_id: i64,
    owner_id: String,
    ttl: Duration,
}

impl HeldLease {
    /// Try to take the campaign lease for `job_id`. Returns `None` while a
    /// different owner holds an unexpired lease.
    pub async fn acquire(
        db: DbHandle,
        campaign_id: i64,
        job_id: i64,
        owner_id: &str,
        ttl: Duration,
    ) -> anyhow::Result<Option<Self>> {
        let owner = owner_id.to_string();
        let acquired = db
            .call(move |db| db.try_acquire_lease(campaign_id, job_id, &owner, Utc::now(), ttl))
            .await?;
        if !acquired {
            return Ok(None);
        }
        Ok(Some(Self {
            db,
            campaign_id,
            job_id,
            owner_id: owner_id.to_string(),
            ttl,
        }))
    }

    pub fn campaign_id(&self) -> i64 {
        self.campaign_id
    }

    pub fn job_id(&self) -> i64 {
        self.job_id
    }

    /// Extend the lease. Returns `false` if it was lost to another owner.
    pub async fn renew(&self) -> anyhow::Result<bool> {
        let (campaign_id, owner, ttl) = (self.campaign_id, self.owner_id.clone(), self.ttl);
        self.db
            .call(move |db| db.renew_lease(campaign_id, &owner, Utc::now() + ttl))
            .await
    }

    pub async fn release(self) -> anyhow::Result<()> {
        let (campaign_id, owner) = (self.campaign_id, self.owner_id.clone());
        self.db
            .call(move |db| db.release_lease(campaign_id, &owner).map(|_| ()))
            .await
    }
}
