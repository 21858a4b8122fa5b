//! Work claim dispatcher.
//!
//! `claim_next` picks the oldest-created eligible contact and reserves it
//! with a conditional write keyed on its id and expected PENDING state. The
//! select and the write are separate statements, so another dispatcher can
//! take the same contact in between; the write then reports zero rows and
//! the dispatcher selects again.

use chrono::{DateTime, Utc};
use tracing::debug;

use outreach_common::{Contact, InterestStatus};

use super::db::DbHandle;
use crate::errors::BatchError;

/// Selection rounds before giving up on a heavily contended campaign.
const MAX_CLAIM_ATTEMPTS: usize = 32;

/// Eligibility filter shared by claiming and lead counting.
#[derive(Debug, Clone)]
pub struct Eligibility {
    pub excluded: Vec<InterestStatus>,
    /// Contacts last called at or after this instant are still cooling down.
    pub cooldown_cutoff: DateTime<Utc>,
    /// Contacts created after this instant are outside the job.
    pub created_until: Option<DateTime<Utc>>,
}

impl Eligibility {
    pub fn new(excluded: Vec<InterestStatus>, cooldown_hours: u32, now: DateTime<Utc>) -> Self {
        Self {
            excluded,
            cooldown_cutoff: now - chrono::Duration::hours(cooldown_hours as i64),
            created_until: None,
        }
    }

    /// Restrict to contacts that existed when a job was created, so its
    /// `total_leads` stays an upper bound on the contacts it dials.
    pub fn created_until(mut self, at: DateTime<Utc>) -> Self {
        self.created_until = Some(at);
        self
    }
}

/// Reserve one specific contact. Fails with `ClaimConflict` if it is no
/// longer PENDING or no longer eligible.
pub async fn try_claim(
    db: &DbHandle,
    contact_id: i64,
    excluded: Vec<InterestStatus>,
) -> Result<Contact, BatchError> {
    let claimed = db
        .call(move |db| {
            if !db.try_claim_contact(contact_id, &excluded, Utc::now())? {
                return Ok(None);
            }
            db.get_contact(contact_id)
        })
        .await?;
    claimed.ok_or(BatchError::ClaimConflict { contact_id })
}

/// Claim the next eligible contact of a campaign, or `None` when there is
/// no work left.
pub async fn claim_next(
    db: &DbHandle,
    campaign_id: i64,
    eligibility: &Eligibility,
) -> Result<Option<Contact>, BatchError> {
    let mut last_conflict = None;
    for attempt in 0..MAX_CLAIM_ATTEMPTS {
        let filter = eligibility.clone();
        let candidate = db
            .call(move |db| {
                db.next_eligible_contact_id(
                    campaign_id,
                    &filter.excluded,
                    filter.cooldown_cutoff,
                    filter.created_until,
                )
            })
            .await?;
        let Some(contact_id) = candidate else {
            return Ok(None);
        };

        match try_claim(db, contact_id, eligibility.excluded.clone()).await {
            Ok(contact) => return Ok(Some(contact)),
            Err(BatchError::ClaimConflict { contact_id }) => {
                debug!(campaign_id, contact_id, attempt, "claim conflict, reselecting");
                last_conflict = Some(contact_id);
            }
            Err(e) => return Err(e),
        }
    }
    Err(BatchError::ClaimConflict {
        contact_id: last_conflict.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::db::OutreachDb;
    use outreach_common::{CallStatus, CallingWindow};

    fn seeded(names: &[&str]) -> (DbHandle, i64) {
        let db = OutreachDb::new_in_memory().unwrap();
        let now = Utc::now();
        let campaign = db
            .create_campaign("claims", &CallingWindow::always(), now)
            .unwrap();
        for (i, name) in names.iter().enumerate() {
            db.add_contact(
                campaign.id,
                name,
                "+15550000000",
                InterestStatus::Cold,
                now + chrono::Duration::milliseconds(i as i64),
            )
            .unwrap();
        }
        (DbHandle::new(db), campaign.id)
    }

    fn default_filter() -> Eligibility {
        Eligibility::new(vec![InterestStatus::Hot], 0, Utc::now())
    }

    #[tokio::test]
    async fn test_claims_oldest_first() {
        let (db, campaign_id) = seeded(&["first", "second"]);
        let a = claim_next(&db, campaign_id, &default_filter()).await.unwrap().unwrap();
        let b = claim_next(&db, campaign_id, &default_filter()).await.unwrap().unwrap();
        assert_eq!(a.name, "first");
        assert_eq!(b.name, "second");
        assert_eq!(a.call_status, CallStatus::InProgress);
        assert!(claim_next(&db, campaign_id, &default_filter()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_claim_on_same_contact_conflicts() {
        let (db, campaign_id) = seeded(&["only"]);
        let contact_id = db
            .call(move |db| Ok(db.list_contacts(campaign_id)?[0].id))
            .await
            .unwrap();

        try_claim(&db, contact_id, vec![]).await.unwrap();
        let err = try_claim(&db, contact_id, vec![]).await.unwrap_err();
        assert!(matches!(err, BatchError::ClaimConflict { contact_id: id } if id == contact_id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_never_share_a_contact() {
        let (db, campaign_id) = seeded(&["a", "b", "c"]);
        let mut handles = Vec::new();
        for _ in 0..6 {
            let db = db.clone();
            handles.push(tokio::spawn(async move {
                claim_next(&db, campaign_id, &default_filter()).await.unwrap()
            }));
        }
        let mut claimed: Vec<i64> = Vec::new();
        for h in handles {
            if let Some(c) = h.await.unwrap() {
                claimed.push(c.id);
            }
        }
        claimed.sort();
        let before = claimed.len();
        claimed.dedup();
        assert_eq!(before, 3, "exactly three claims should succeed");
        assert_eq!(claimed.len(), 3, "no contact may be claimed twice");
    }

    #[tokio::test]
    async fn test_hot_contacts_are_never_claimed() {
        let (db, campaign_id) = seeded(&[]);
        db.call(move |db| {
            db.add_contact(campaign_id, "hot", "+1555", InterestStatus::Hot, Utc::now())?;
            Ok(())
        })
        .await
        .unwrap();
        assert!(claim_next(&db, campaign_id, &default_filter()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cooldown_filters_recent_calls() {
        let (db, campaign_id) = seeded(&["recent"]);
        db.call(move |db| {
            let id = db.list_contacts(campaign_id)?[0].id;
            db.finish_contact(id, outreach_common::CallStatus::Pending, None, Utc::now())?;
            Ok(())
        })
        .await
        .unwrap();

        let cooling = Eligibility::new(vec![], 24, Utc::now());
        assert!(claim_next(&db, campaign_id, &cooling).await.unwrap().is_none());
        let no_cooldown = Eligibility::new(vec![], 0, Utc::now() + chrono::Duration::seconds(1));
        assert!(claim_next(&db, campaign_id, &no_cooldown).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_contacts_added_after_job_creation_are_not_claimed() {
        let (db, campaign_id) = seeded(&[]);
        let job_created = Utc::now() - chrono::Duration::seconds(10);
        db.call(move |db| {
            db.add_contact(
                campaign_id,
                "original",
                "+1555",
                InterestStatus::Cold,
                job_created - chrono::Duration::seconds(1),
            )?;
            db.add_contact(campaign_id, "late", "+1556", InterestStatus::Cold, Utc::now())?;
            Ok(())
        })
        .await
        .unwrap();

        let filter = default_filter().created_until(job_created);
        let first = claim_next(&db, campaign_id, &filter).await.unwrap().unwrap();
        assert_eq!(first.name, "original");
        assert!(claim_next(&db, campaign_id, &filter).await.unwrap().is_none());
        // Unbounded selection still sees the late contact
        assert!(claim_next(&db, campaign_id, &default_filter()).await.unwrap().is_some());
    }
}
