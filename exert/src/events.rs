use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::exertion::ExertionId;
use crate::lease::{Cookie, LeaseEnd};
use crate::strategy::AccessType;

/// Metadata attached to every exertion event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    /// Shared by every event emitted for one top-level dispatch.
    pub correlation_id: Uuid,
    pub exertion_id: ExertionId,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(exertion_id: ExertionId, correlation_id: Option<Uuid>) -> Self {
        Self {
            version: 1,
            correlation_id: correlation_id.unwrap_or_else(Uuid::now_v7),
            exertion_id,
            timestamp: Utc::now(),
        }
    }
}

/// Lifecycle event for one exertion.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExertionEvent {
    pub meta: EventMeta,
    pub payload: ExertionEventPayload,
}

impl ExertionEvent {
    pub fn new(
        exertion_id: ExertionId,
        correlation_id: Option<Uuid>,
        payload: ExertionEventPayload,
    ) -> Self {
        Self {
            meta: EventMeta::new(exertion_id, correlation_id),
            payload,
        }
    }
}

/// Event payloads for exertion lifecycle transitions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ExertionEventPayload {
    /// Handed to the dispatcher.
    Submitted {
        name: String,
        kind: String,
        access: AccessType,
    },
    /// Moved to RUNNING.
    Started { name: String },
    Completed {
        name: String,
        elapsed_ms: u64,
    },
    Failed {
        name: String,
        error: String,
    },
    /// Written to the exertion space for pull execution.
    Published { capability: String },
    /// Claimed from the space by a worker.
    Claimed { worker_id: String },
    /// Monitor lost its session; the lease is still live.
    Suspended,
    LeaseRenewed { cookie: Cookie, renewals: u32 },
    LeaseEnded { cookie: Cookie, end: LeaseEnd },
}

/// In-process broadcast bus for [`ExertionEvent`]s.
///
/// Publishing never blocks. Events published with no subscribers are
/// dropped, and slow subscribers observe `RecvError::Lagged`.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ExertionEvent>,
    capacity: usize,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn publish(&self, event: ExertionEvent) {
        let _ = self.sender.send(event);
    }

    /// Build and publish an event.
    pub fn emit(
        &self,
        exertion_id: ExertionId,
        correlation_id: Option<Uuid>,
        payload: ExertionEventPayload,
    ) {
        self.publish(ExertionEvent::new(exertion_id, correlation_id, payload));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExertionEvent> {
        self.sender.subscribe()
    }
}
