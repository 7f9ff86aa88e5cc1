// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed observation streams.
//!
//! Components report noteworthy facts (queue overflow, per-item batch
//! failures, webhook delivery outcomes) on a broadcast bus instead of
//! inheriting from an event-emitter base. Observations are advisory: nothing
//! blocks on them, and a bus with no subscribers drops them silently.

use tokio::sync::broadcast;
use uuid::Uuid;

/// One observation emitted by an engine component.
#[derive(Debug, Clone)]
pub enum Observation {
    /// A queue crossed its warning depth.
    QueueOverflow {
        component: &'static str,
        depth: usize,
    },
    /// An operation was unusually slow.
    PerformanceAlert {
        component: &'static str,
        message: String,
    },
    /// Some items in a pipelined batch failed.
    BatchPartial { failed: usize, total: usize },
    /// A location exhausted its bulk retries.
    LocationFailed { user_id: String, error: String },
    /// A webhook delivery succeeded.
    WebhookDelivered {
        webhook_id: Uuid,
        event_id: Uuid,
        elapsed_ms: u64,
    },
    /// A webhook delivery exhausted its retries.
    WebhookFailed {
        webhook_id: Uuid,
        event_id: Uuid,
        error: String,
    },
    /// An index connection became usable.
    ConnectionUp { connection_id: String },
    /// An index connection was lost.
    ConnectionDown {
        connection_id: String,
        error: String,
    },
}

impl Observation {
    /// Short tag for logging and counters.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::QueueOverflow { .. } => "queue_overflow",
            Self::PerformanceAlert { .. } => "performance_alert",
            Self::BatchPartial { .. } => "batch_partial",
            Self::LocationFailed { .. } => "location_failed",
            Self::WebhookDelivered { .. } => "webhook_delivered",
            Self::WebhookFailed { .. } => "webhook_failed",
            Self::ConnectionUp { .. } => "connection_up",
            Self::ConnectionDown { .. } => "connection_down",
        }
    }
}

/// Broadcast bus carrying [`Observation`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct ObservationBus {
    tx: broadcast::Sender<Observation>,
}

impl ObservationBus {
    /// Create a bus with the given buffered capacity per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Emit an observation. Never blocks; with no subscribers it is dropped.
    pub fn emit(&self, observation: Observation) {
        let _ = self.tx.send(observation);
    }

    /// Subscribe to the stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Observation> {
        self.tx.subscribe()
    }

    /// Current subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ObservationBus {
    fn default() -> Self {
        Self::new(256)
    }
}
