use tokio::sync::broadcast;
use tracing::{debug, warn};

use outreach_common::{BatchEvent, EventPayload};

/// Default number of serialized events buffered per subscriber.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Fire-and-forget broadcast of batch events.
///
/// Events are serialized once and fanned out as JSON strings. Publishing
/// never blocks: with no subscribers the event is dropped, and a slow
/// subscriber that falls behind by more than the channel capacity observes
/// `RecvError::Lagged` and is expected to resynchronize from a snapshot.
#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<String>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn publish(&self, event: &BatchEvent) {
        match serde_json::to_string(event) {
            Ok(json) => {
                // No subscribers is not an error.
                let delivered = self.tx.send(json).unwrap_or(0);
                debug!(
                    event_type = event.event_type(),
                    campaign_id = event.campaign_id,
                    batch_job_id = event.batch_job_id,
                    contact_id = event.contact_id,
                    delivered,
                    "published event"
                );
            }
            Err(e) => warn!(
                event_type = event.event_type(),
                error = %e,
                "failed to serialize event"
            ),
        }
    }

    /// Publish a job-scoped event.
    pub fn job_event(&self, campaign_id: i64, job_id: i64, payload: EventPayload) {
        self.publish(&BatchEvent::new(campaign_id, payload).for_job(job_id));
    }

    /// Publish an event about one contact of a job.
    pub fn contact_event(
        &self,
        campaign_id: i64,
        job_id: i64,
        contact_id: i64,
        payload: EventPayload,
    ) {
        self.publish(
            &BatchEvent::new(campaign_id, payload)
                .for_job(job_id)
                .for_contact(contact_id),
        );
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let emitter = EventEmitter::new(4);
        emitter.job_event(1, 2, EventPayload::BatchStarted { total_leads: 3 });
        assert_eq!(emitter.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribers_receive_serialized_events() {
        let emitter = EventEmitter::new(4);
        let mut rx = emitter.subscribe();
        emitter.contact_event(
            1,
            2,
            3,
            EventPayload::CallStarted { call_log_id: 9 },
        );

        let msg = rx.recv().await.unwrap();
        let event: BatchEvent = serde_json::from_str(&msg).unwrap();
        assert_eq!(event.event_type(), "CALL_STARTED");
        assert_eq!(event.batch_job_id, Some(2));
        assert_eq!(event.contact_id, Some(3));
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags_instead_of_blocking() {
        let emitter = EventEmitter::new(2);
        let mut rx = emitter.subscribe();
        for i in 0..5 {
            emitter.job_event(1, 1, EventPayload::BatchResumed { current_index: i });
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }
}
