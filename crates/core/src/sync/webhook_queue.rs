use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TrySendError};

use super::webhook_model::WebhookPayload;
use crate::errors::{Error, Result};

/// Bounded two-lane queue in front of the webhook handler.
///
/// `contract_signed` payloads use the priority lane; each lane holds at most
/// `capacity` payloads and a full lane rejects instead of growing.
#[derive(Debug, Clone)]
pub struct WebhookQueue {
    priority: mpsc::Sender<WebhookPayload>,
    normal: mpsc::Sender<WebhookPayload>,
}

/// Draining side of a [`WebhookQueue`].
#[derive(Debug)]
pub struct WebhookQueueReceiver {
    priority: mpsc::Receiver<WebhookPayload>,
    normal: mpsc::Receiver<WebhookPayload>,
}

impl WebhookQueue {
    pub fn bounded(capacity: usize) -> (Self, WebhookQueueReceiver) {
        let capacity = capacity.max(1);
        let (priority_tx, priority_rx) = mpsc::channel(capacity);
        let (normal_tx, normal_rx) = mpsc::channel(capacity);
        (
            Self {
                priority: priority_tx,
                normal: normal_tx,
            },
            WebhookQueueReceiver {
                priority: priority_rx,
                normal: normal_rx,
            },
        )
    }

    /// Enqueues without waiting. A full or closed queue is a connection error so
    /// the sender redelivers later.
    pub fn enqueue(&self, payload: WebhookPayload) -> Result<()> {
        let lane = if payload.event_type.is_priority() {
            &self.priority
        } else {
            &self.normal
        };
        lane.try_send(payload).map_err(|err| match err {
            TrySendError::Full(p) => Error::connection(format!(
                "Webhook queue is full, rejecting event {}",
                p.event_id
            )),
            TrySendError::Closed(p) => Error::connection(format!(
                "Webhook queue is closed, rejecting event {}",
                p.event_id
            )),
        })
    }
}

impl WebhookQueueReceiver {
    /// Next payload, preferring the priority lane. `None` once both lanes are closed.
    pub async fn recv(&mut self) -> Option<WebhookPayload> {
        tokio::select! {
            biased;
            Some(payload) = self.priority.recv() => Some(payload),
            Some(payload) = self.normal.recv() => Some(payload),
            else => None,
        }
    }
}

/// Long-lived push transport delivering webhook-shaped notifications.
///
/// Reconnecting after a drop is the transport's job; `None` ends the listener.
#[async_trait]
pub trait SyncEventStream: Send {
    async fn next_payload(&mut self) -> Option<WebhookPayload>;
}

/// Adapts an mpsc receiver into a [`SyncEventStream`].
#[derive(Debug)]
pub struct ChannelEventStream {
    receiver: mpsc::Receiver<WebhookPayload>,
}

impl ChannelEventStream {
    pub fn new(receiver: mpsc::Receiver<WebhookPayload>) -> Self {
        Self { receiver }
    }
}

#[async_trait]
impl SyncEventStream for ChannelEventStream {
    async fn next_payload(&mut self) -> Option<WebhookPayload> {
        self.receiver.recv().await
    }
}
