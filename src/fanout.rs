//! Live update fan-out
//!
//! Each session gets a broadcast channel carrying transcript and status
//! events. Delivery is best-effort per subscriber: a slow or dropped
//! receiver lags or closes without ever blocking the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use crate::session::SessionStatus;

const CHANNEL_CAPACITY: usize = 256;

/// Event delivered to session subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SessionEvent {
    #[serde(rename_all = "camelCase")]
    TranscriptUpdate {
        session_id: String,
        chunk_index: u32,
        text: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Status {
        session_id: String,
        status: SessionStatus,
    },
    #[serde(rename_all = "camelCase")]
    Completed {
        session_id: String,
        transcript: String,
        summary: String,
    },
}

#[derive(Clone, Default)]
pub struct Fanout {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<SessionEvent>>>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a session's events, creating its channel if needed
    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<SessionEvent> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish an event to all current subscribers of a session.
    /// No subscribers is not an error.
    pub fn publish(&self, session_id: &str, event: SessionEvent) {
        let sender = {
            let channels = self.channels.lock().unwrap();
            channels.get(session_id).cloned()
        };
        if let Some(sender) = sender {
            let _ = sender.send(event);
        }
    }

    pub fn publish_status(&self, session_id: &str, status: SessionStatus) {
        self.publish(
            session_id,
            SessionEvent::Status {
                session_id: session_id.to_string(),
                status,
            },
        );
    }

    /// Drop a session's channel; existing receivers observe Closed
    pub fn remove(&self, session_id: &str) {
        self.channels.lock().unwrap().remove(session_id);
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        let channels = self.channels.lock().unwrap();
        channels
            .get(session_id)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_arrive_in_publish_order() {
        let fanout = Fanout::new();
        let mut rx = fanout.subscribe("sess-a");

        for i in 0..3 {
            fanout.publish(
                "sess-a",
                SessionEvent::TranscriptUpdate {
                    session_id: "sess-a".to_string(),
                    chunk_index: i,
                    text: format!("line {}", i),
                    timestamp: Utc::now(),
                },
            );
        }

        for expected in 0..3 {
            match rx.recv().await.unwrap() {
                SessionEvent::TranscriptUpdate { chunk_index, .. } => {
                    assert_eq!(chunk_index, expected)
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let fanout = Fanout::new();
        fanout.publish_status("sess-a", SessionStatus::Recording);
        assert_eq!(fanout.subscriber_count("sess-a"), 0);
    }

    #[tokio::test]
    async fn test_remove_closes_receivers() {
        let fanout = Fanout::new();
        let mut rx = fanout.subscribe("sess-a");
        fanout.remove("sess-a");
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }
}
