// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable event sink seam.
//!
//! The engine is authoritative for live state; the durable store is a
//! trailing log behind this trait. The default implementation drops events.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::GeofenceEvent;

/// Receives detected events for durable history.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Record one detected event. Failures are logged by the caller and do
    /// not block detection or delivery.
    async fn record_event(&self, event: &GeofenceEvent) -> Result<()>;
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    async fn record_event(&self, _event: &GeofenceEvent) -> Result<()> {
        Ok(())
    }
}
