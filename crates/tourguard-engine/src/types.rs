// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain types shared across the engine.
//!
//! Wire-facing structs serialize `camelCase` to match the payloads the REST
//! shim and webhook consumers see; internal-only types stay plain.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tourguard_geo::{BoundingBox, Coordinate};
use uuid::Uuid;

// ============================================================================
// Zones
// ============================================================================

/// Safety classification of a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneType {
    Safe,
    Caution,
    Restricted,
    HighRisk,
    Emergency,
    TouristFriendly,
}

impl ZoneType {
    /// Default risk level assigned when a zone is created without one.
    pub fn default_risk_level(&self) -> u8 {
        match self {
            Self::Safe => 2,
            Self::TouristFriendly => 3,
            Self::Caution => 5,
            Self::Restricted => 7,
            Self::HighRisk => 9,
            Self::Emergency => 10,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Caution => "caution",
            Self::Restricted => "restricted",
            Self::HighRisk => "high_risk",
            Self::Emergency => "emergency",
            Self::TouristFriendly => "tourist_friendly",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "safe" => Some(Self::Safe),
            "caution" => Some(Self::Caution),
            "restricted" => Some(Self::Restricted),
            "high_risk" => Some(Self::HighRisk),
            "emergency" => Some(Self::Emergency),
            "tourist_friendly" => Some(Self::TouristFriendly),
            _ => None,
        }
    }
}

/// Lifecycle status of a zone. Only `Active` zones participate in overlap
/// checks and event detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneStatus {
    Active,
    Inactive,
    Maintenance,
}

impl ZoneStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Maintenance => "maintenance",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            "maintenance" => Some(Self::Maintenance),
            _ => None,
        }
    }
}

/// A persistent polygonal zone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Zone {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub zone_type: ZoneType,
    pub status: ZoneStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Closed vertex ring (first == last).
    pub coordinates: Vec<Coordinate>,
    pub bounding_box: BoundingBox,
    pub risk_level: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert_message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub emergency_contacts: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Zone creation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneDraft {
    pub name: String,
    #[serde(rename = "type")]
    pub zone_type: ZoneType,
    #[serde(default)]
    pub status: Option<ZoneStatus>,
    #[serde(default)]
    pub description: Option<String>,
    pub coordinates: Vec<Coordinate>,
    #[serde(default)]
    pub risk_level: Option<u8>,
    #[serde(default)]
    pub alert_message: Option<String>,
    #[serde(default)]
    pub emergency_contacts: Vec<String>,
    #[serde(default)]
    pub created_by: Option<String>,
}

/// Partial zone update; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZonePatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub zone_type: Option<ZoneType>,
    #[serde(default)]
    pub status: Option<ZoneStatus>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub coordinates: Option<Vec<Coordinate>>,
    #[serde(default)]
    pub risk_level: Option<u8>,
    #[serde(default)]
    pub alert_message: Option<String>,
}

/// Zone search filter; all criteria are conjunctive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneQuery {
    #[serde(default)]
    pub bounds: Option<BoundingBox>,
    #[serde(default, rename = "type")]
    pub zone_type: Option<ZoneType>,
    #[serde(default)]
    pub status: Option<ZoneStatus>,
    #[serde(default)]
    pub min_risk_level: Option<u8>,
    #[serde(default)]
    pub max_risk_level: Option<u8>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

// ============================================================================
// Locations
// ============================================================================

/// One location reading for one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    pub user_id: String,
    #[serde(flatten)]
    pub coordinate: Coordinate,
    /// Stamped on ingest when absent.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearing: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
}

/// A user point returned from spatial queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPoint {
    pub user_id: String,
    #[serde(flatten)]
    pub coordinate: Coordinate,
    /// Meters from the query center, when the index reported it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_m: Option<f64>,
}

/// Radius query around a center point.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NearbyQuery {
    #[serde(flatten)]
    pub center: Coordinate,
    pub radius_m: f64,
    #[serde(default)]
    pub limit: Option<usize>,
    /// Sort results by distance ascending (client-side).
    #[serde(default)]
    pub sort_by_distance: bool,
}

/// Containment query by bounding box or polygon. Exactly one area must be
/// present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithinQuery {
    #[serde(default)]
    pub bounds: Option<BoundingBox>,
    #[serde(default)]
    pub polygon: Option<Vec<Coordinate>>,
    #[serde(default)]
    pub limit: Option<usize>,
}

// ============================================================================
// Distance API
// ============================================================================

fn default_unit() -> tourguard_geo::LengthUnit {
    tourguard_geo::LengthUnit::Meters
}

/// Point-to-point distance request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistanceRequest {
    pub from: Coordinate,
    pub to: Coordinate,
    #[serde(default)]
    pub algorithm: tourguard_geo::DistanceAlgorithm,
    #[serde(default = "default_unit")]
    pub unit: tourguard_geo::LengthUnit,
}

/// Distance result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistanceResult {
    pub distance: f64,
    pub unit: tourguard_geo::LengthUnit,
    pub algorithm: tourguard_geo::DistanceAlgorithm,
}

/// Pairwise distance matrix request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistanceMatrixRequest {
    pub points: Vec<Coordinate>,
    #[serde(default)]
    pub algorithm: tourguard_geo::DistanceAlgorithm,
    #[serde(default = "default_unit")]
    pub unit: tourguard_geo::LengthUnit,
}

/// Nearest-candidate request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NearestRequest {
    pub origin: Coordinate,
    pub candidates: Vec<Coordinate>,
}

/// Nearest-candidate result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NearestResult {
    pub index: usize,
    #[serde(flatten)]
    pub coordinate: Coordinate,
    pub distance_m: f64,
}

// ============================================================================
// Geofence events
// ============================================================================

/// Kind of zone intersection fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeofenceEventType {
    Enter,
    Exit,
    Inside,
    Outside,
}

impl GeofenceEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enter => "enter",
            Self::Exit => "exit",
            Self::Inside => "inside",
            Self::Outside => "outside",
        }
    }
}

/// Alerting urgency, derived from the zone's risk level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertLevel {
    /// Risk-to-alert table: >=9 critical, >=7 high, >=5 medium, else low.
    pub fn from_risk_level(risk: u8) -> Self {
        match risk {
            9..=u8::MAX => Self::Critical,
            7..=8 => Self::High,
            5..=6 => Self::Medium,
            _ => Self::Low,
        }
    }
}

/// Event metadata block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    pub alert_level: AlertLevel,
    pub event_source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_zone_id: Option<Uuid>,
    /// Seconds spent in the zone, set on `exit` events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_in_zone_secs: Option<u64>,
}

/// A detected zone intersection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeofenceEvent {
    pub id: Uuid,
    pub user_id: String,
    pub zone_id: Uuid,
    pub zone_name: String,
    pub zone_type: ZoneType,
    pub event_type: GeofenceEventType,
    #[serde(flatten)]
    pub coordinate: Coordinate,
    pub timestamp: DateTime<Utc>,
    pub processed: bool,
    pub webhook_delivered: bool,
    pub metadata: EventMetadata,
}

// ============================================================================
// Webhooks
// ============================================================================

/// Per-webhook retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Linear backoff (`delay * attempt`) by default; exponential
    /// (`delay * 2^(attempt-1)`) when set.
    pub exponential_backoff: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
            exponential_backoff: false,
        }
    }
}

impl RetryConfig {
    /// Delay before the given 1-indexed retry attempt.
    pub fn delay_before(&self, attempt: u32) -> std::time::Duration {
        let ms = if self.exponential_backoff {
            self.retry_delay_ms.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16))
        } else {
            self.retry_delay_ms.saturating_mul(attempt as u64)
        };
        std::time::Duration::from_millis(ms)
    }
}

/// A webhook subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    /// HMAC-SHA256 signing secret; payloads are unsigned without it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    pub enabled: bool,
    /// Empty = all zones.
    #[serde(default)]
    pub zone_ids: Vec<Uuid>,
    /// Empty = all zone types.
    #[serde(default)]
    pub zone_types: Vec<ZoneType>,
    /// Required, non-empty.
    pub event_types: Vec<GeofenceEventType>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookConfig {
    /// The matching rule: enabled, event type subscribed, and both zone
    /// filters either empty or containing the event's zone.
    pub fn matches(&self, event: &GeofenceEvent) -> bool {
        self.enabled
            && self.event_types.contains(&event.event_type)
            && (self.zone_ids.is_empty() || self.zone_ids.contains(&event.zone_id))
            && (self.zone_types.is_empty() || self.zone_types.contains(&event.zone_type))
    }
}

/// Webhook registration request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRegistration {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub zone_ids: Vec<Uuid>,
    #[serde(default)]
    pub zone_types: Vec<ZoneType>,
    pub event_types: Vec<GeofenceEventType>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

/// Partial webhook update; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub zone_ids: Option<Vec<Uuid>>,
    #[serde(default)]
    pub zone_types: Option<Vec<ZoneType>>,
    #[serde(default)]
    pub event_types: Option<Vec<GeofenceEventType>>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
}

/// The delivered POST body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub event: GeofenceEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone: Option<Zone>,
    pub user: WebhookUser,
    pub timestamp: DateTime<Utc>,
    /// Hex HMAC-SHA256 of the JSON `event` field, present when the webhook
    /// carries a secret.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// User reference in a webhook payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookUser {
    pub id: String,
}

// ============================================================================
// Health
// ============================================================================

/// Aggregate engine health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}
