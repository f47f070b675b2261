//! Status fan-out to observers.
//!
//! Status changes and progress samples are published once and delivered to
//! every live subscriber whose topic matches. Delivery is best-effort: there
//! is no replay for late joiners, and a subscriber that falls too far behind
//! skips the messages it missed.

use crate::stream::{StreamId, StreamStatus};
use crate::transcode::ProgressSample;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Messages buffered per subscriber before it starts missing updates.
const CHANNEL_CAPACITY: usize = 256;

/// Point-in-time view of one stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamSummary {
    pub stream_id: StreamId,
    pub status: StreamStatus,
    pub video_count: usize,
    pub audio_count: usize,
    pub is_running: bool,
}

/// Message delivered to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Status {
        stream_id: StreamId,
        status: StreamStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Progress {
        stream_id: StreamId,
        #[serde(flatten)]
        sample: ProgressSample,
    },
    /// Sent to a new websocket observer before any live update.
    Snapshot { streams: Vec<StreamSummary> },
}

impl StreamEvent {
    pub fn status(stream_id: &StreamId, status: StreamStatus, message: Option<String>) -> Self {
        StreamEvent::Status {
            stream_id: stream_id.clone(),
            status,
            message,
        }
    }

    /// The stream this event concerns, if it concerns exactly one.
    pub fn stream_id(&self) -> Option<&StreamId> {
        match self {
            StreamEvent::Status { stream_id, .. } | StreamEvent::Progress { stream_id, .. } => {
                Some(stream_id)
            }
            StreamEvent::Snapshot { .. } => None,
        }
    }
}

/// What a subscriber wants to hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    All,
    Stream(StreamId),
}

impl Topic {
    pub fn matches(&self, event: &StreamEvent) -> bool {
        match (self, event.stream_id()) {
            (Topic::All, _) => true,
            (Topic::Stream(wanted), Some(id)) => wanted == id,
            (Topic::Stream(_), None) => false,
        }
    }
}

/// Publishes [`StreamEvent`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct StatusBroadcaster {
    tx: broadcast::Sender<StreamEvent>,
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publishes to current subscribers; with none, the event is dropped.
    pub fn publish(&self, event: StreamEvent) {
        if let Err(broadcast::error::SendError(event)) = self.tx.send(event) {
            debug!(?event, "no observers for event");
        }
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        Subscription {
            id: Uuid::new_v4(),
            topic,
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// A live registration. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    topic: Topic,
    rx: broadcast::Receiver<StreamEvent>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Next matching event; `None` once the broadcaster is gone.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.topic.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(observer = %self.id, skipped, "observer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
