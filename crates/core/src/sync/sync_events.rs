//! Sync events and the sinks that receive them.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::config::SystemId;
use crate::conflicts::ConflictPriority;
use crate::ledger::{BatchSyncResult, OperationKind, SyncTrigger};

/// Notable engine activity, for alerting and live status views.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SyncEvent {
    BatchStarted {
        batch_id: String,
        trigger: SyncTrigger,
    },
    BatchCompleted {
        result: BatchSyncResult,
    },
    OperationCompleted {
        operation_id: String,
        kind: OperationKind,
        source_id: String,
        target_id: Option<String>,
    },
    OperationFailed {
        operation_id: String,
        source_id: String,
        code: String,
        error: String,
    },
    ConflictDetected {
        conflict_id: String,
        external_id: String,
        field: String,
        priority: ConflictPriority,
    },
    ConflictResolved {
        conflict_id: String,
        policy: String,
    },
    WebhookProcessed {
        source: SystemId,
        event_id: String,
        outcome: String,
    },
}

/// Receives engine events. Implementations must not block.
pub trait SyncEventSink: Send + Sync {
    fn emit(&self, event: SyncEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpSyncEventSink;

impl SyncEventSink for NoOpSyncEventSink {
    fn emit(&self, _event: SyncEvent) {}
}

/// Fans events out to any number of subscribers.
///
/// Slow subscribers lag and lose the oldest events; emitting never waits.
#[derive(Debug, Clone)]
pub struct BroadcastSyncEventSink {
    sender: broadcast::Sender<SyncEvent>,
}

impl BroadcastSyncEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl SyncEventSink for BroadcastSyncEventSink {
    fn emit(&self, event: SyncEvent) {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }
}
