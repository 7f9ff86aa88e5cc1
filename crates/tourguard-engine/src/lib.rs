// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Geofencing engine for the tourguard tourist-safety platform.
//!
//! The engine ingests per-user location updates at scale, maintains polygonal
//! safety zones in a spatial index, detects zone enter/inside/exit events and
//! fans them out to subscribed HTTP webhooks with signing, retries and
//! delivery accounting.
//!
//! Subsystems, wired by [`EngineBuilder`]:
//! - connection pool and wire protocol: `tourguard-protocol`
//! - [`governor`] — rate limiting, priority queueing, health-aware routing
//! - [`cache`] — lookaside cache with per-class TTLs
//! - [`zones`] — zone validation, persistence and search
//! - [`locations`] — batched location indexing and point queries
//! - [`bulk`] — queued bulk ingestion with bounded concurrency
//! - [`detector`] — periodic sweep and per-update membership diffing
//! - [`webhooks`] — matching, signing, delivery with retries
//! - [`engine`] — the orchestrator tying it all together

pub mod bulk;
pub mod cache;
pub mod config;
pub mod detector;
pub mod error;
pub mod governor;
pub mod locations;
pub mod observations;
pub mod sink;
pub mod types;
pub mod webhooks;
pub mod zones;

pub mod engine;

pub use config::{EngineConfig, Profile};
pub use engine::{Engine, EngineBuilder, EngineStats, HealthReport, UpdateOutcome};
pub use error::{EngineError, Result};
pub use observations::{Observation, ObservationBus};
pub use sink::{EventSink, NoopEventSink};
pub use types::{
    AlertLevel, DistanceMatrixRequest, DistanceRequest, DistanceResult, GeofenceEvent,
    GeofenceEventType, HealthState, LocationUpdate, NearbyQuery, NearestRequest, NearestResult,
    RetryConfig, UserPoint, WebhookConfig, WebhookPatch, WebhookPayload, WebhookRegistration,
    WithinQuery, Zone, ZoneDraft, ZonePatch, ZoneQuery, ZoneStatus, ZoneType,
};
