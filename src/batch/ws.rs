use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

use super::api::SharedState;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamFilter {
    /// Only forward events of this campaign.
    pub campaign_id: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventCampaign {
    campaign_id: i64,
}

impl StreamFilter {
    fn admits(&self, json: &str) -> bool {
        let Some(wanted) = self.campaign_id else {
            return true;
        };
        serde_json::from_str::<EventCampaign>(json).is_ok_and(|e| e.campaign_id == wanted)
    }
}

/// Control frame telling a client it missed events and must refetch snapshots.
pub fn lagged_notice(missed: u64) -> String {
    serde_json::json!({ "type": "STREAM_LAGGED", "data": { "missed": missed } }).to_string()
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(filter): Query<StreamFilter>,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    let rx = state.controller.emitter().subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, rx, filter))
}

async fn handle_socket(socket: WebSocket, rx: broadcast::Receiver<String>, filter: StreamFilter) {
    let (sender, receiver) = socket.split();
    run_socket_loop(sender, receiver, rx, filter).await;
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Combines broadcast forwarding, client message receiving, and periodic
/// ping/pong health checking into a single select loop. If no Pong is
/// received within [`PONG_TIMEOUT`] after a Ping is sent, the connection
/// is considered dead and the loop exits.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<String>,
    filter: StreamFilter,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            // ── Periodic ping ───────────────────────────────────────
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    debug!("websocket pong timeout, closing");
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Event forwarding ────────────────────────────────────
            result = rx.recv() => {
                match result {
                    Ok(msg) => {
                        if !filter.admits(&msg) {
                            continue;
                        }
                        if sender.send(Message::Text(msg.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(missed, "websocket subscriber lagged");
                        if sender.send(Message::Text(lagged_notice(missed).into())).await.is_err() {
                            break;
                        }
                    }
                }
            }

            // ── Client messages (pong, close, etc.) ─────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Ignore other messages from client (Text, Binary, Ping)
                    }
                    Some(Err(_)) => break,
                }
            }
        }
    }

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_admits_matching_campaign_only() {
        let filter = StreamFilter {
            campaign_id: Some(7),
        };
        assert!(filter.admits(r#"{"type":"BATCH_STARTED","campaignId":7,"data":{}}"#));
        assert!(!filter.admits(r#"{"type":"BATCH_STARTED","campaignId":8,"data":{}}"#));
        assert!(!filter.admits("not json"));
        assert!(StreamFilter::default().admits("anything"));
    }

    #[test]
    fn test_lagged_notice_shape() {
        let v: serde_json::Value = serde_json::from_str(&lagged_notice(12)).unwrap();
        assert_eq!(v["type"], "STREAM_LAGGED");
        assert_eq!(v["data"]["missed"], 12);
    }
}
