// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Zone manager: validation, persistence, retrieval and search.
//!
//! Zones live in the spatial index as GeoJSON polygons with side fields
//! carrying their attributes. The manager owns all zone mutations (single
//! writer for the in-memory zone cache) and applies the geometry invariants
//! on every create and on any update that touches coordinates: auto-closed
//! ring, no self-intersection, area within bounds, and no overlap with any
//! other active zone. The overlap check reads a possibly stale snapshot; the
//! final `SET` on the primary is the linearization point.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use tourguard_geo::{BoundingBox, polygon};
use tourguard_protocol::{Command, FieldMap, QueryArea, reply};

use crate::cache::{CacheClass, EngineCache, keys};
use crate::error::{EngineError, Result, expect_reply};
use crate::governor::{PRIORITY_LOW, PRIORITY_NORMAL, RequestGovernor};
use crate::types::{Zone, ZoneDraft, ZonePatch, ZoneQuery, ZoneStatus, ZoneType};

/// In-memory zone cache TTL.
const ZONE_MEMORY_TTL: Duration = Duration::from_secs(300);

/// Name constraints.
const NAME_MIN: usize = 3;
const NAME_MAX: usize = 100;

/// The zone manager.
pub struct ZoneManager {
    governor: Arc<RequestGovernor>,
    cache: Arc<EngineCache>,
    collection: String,
    memory: RwLock<HashMap<Uuid, (Zone, Instant)>>,
}

impl ZoneManager {
    pub fn new(governor: Arc<RequestGovernor>, cache: Arc<EngineCache>, collection: String) -> Self {
        Self {
            governor,
            cache,
            collection,
            memory: RwLock::new(HashMap::new()),
        }
    }

    // ========== Creation / mutation ==========

    /// Validate and persist a new zone.
    #[instrument(skip(self, draft), fields(name = %draft.name))]
    pub async fn create_zone(&self, draft: ZoneDraft) -> Result<Zone> {
        validate_name(&draft.name)?;
        let risk_level = match draft.risk_level {
            Some(level) => validate_risk(level)?,
            None => draft.zone_type.default_risk_level(),
        };
        let ring = polygon::validate_ring(&draft.coordinates)?;
        let status = draft.status.unwrap_or(ZoneStatus::Active);

        if status == ZoneStatus::Active {
            self.check_overlap(&ring, None).await?;
        }

        let now = Utc::now();
        let bounding_box = BoundingBox::from_ring(&ring).ok_or_else(|| EngineError::ZoneValidation {
            message: "empty ring".to_string(),
        })?;
        let zone = Zone {
            id: Uuid::new_v4(),
            name: draft.name,
            zone_type: draft.zone_type,
            status,
            description: draft.description,
            coordinates: ring,
            bounding_box,
            risk_level,
            alert_message: draft.alert_message,
            emergency_contacts: draft.emergency_contacts,
            created_by: draft.created_by,
            created_at: now,
            updated_at: now,
        };

        self.persist(&zone).await?;
        self.remember(zone.clone()).await;
        info!(zone_id = %zone.id, zone_type = zone.zone_type.as_str(), "zone created");
        Ok(zone)
    }

    /// Apply a partial update. Coordinate changes re-run full validation and
    /// the overlap check (excluding the zone itself).
    #[instrument(skip(self, patch), fields(zone_id = %id))]
    pub async fn update_zone(&self, id: Uuid, patch: ZonePatch) -> Result<Zone> {
        let mut zone = self.get_zone(id).await?;

        if let Some(name) = patch.name {
            validate_name(&name)?;
            zone.name = name;
        }
        if let Some(zone_type) = patch.zone_type {
            // Re-derive the default when the risk level was never customized.
            if patch.risk_level.is_none() && zone.risk_level == zone.zone_type.default_risk_level() {
                zone.risk_level = zone_type.default_risk_level();
            }
            zone.zone_type = zone_type;
        }
        if let Some(level) = patch.risk_level {
            zone.risk_level = validate_risk(level)?;
        }
        if let Some(status) = patch.status {
            zone.status = status;
        }
        if let Some(description) = patch.description {
            zone.description = Some(description);
        }
        if let Some(alert_message) = patch.alert_message {
            zone.alert_message = Some(alert_message);
        }
        if let Some(coordinates) = patch.coordinates {
            let ring = polygon::validate_ring(&coordinates)?;
            if zone.status == ZoneStatus::Active {
                self.check_overlap(&ring, Some(id)).await?;
            }
            zone.bounding_box = BoundingBox::from_ring(&ring).ok_or_else(|| {
                EngineError::ZoneValidation {
                    message: "empty ring".to_string(),
                }
            })?;
            zone.coordinates = ring;
        } else if zone.status == ZoneStatus::Active && patch.status.is_some() {
            // A zone reactivated without new geometry still may not overlap.
            self.check_overlap(&zone.coordinates, Some(id)).await?;
        }

        zone.updated_at = Utc::now();
        self.persist(&zone).await?;
        self.remember(zone.clone()).await;
        info!(zone_id = %zone.id, "zone updated");
        Ok(zone)
    }

    /// Remove a zone from the index and all caches. Idempotent: deleting an
    /// absent zone succeeds.
    #[instrument(skip(self), fields(zone_id = %id))]
    pub async fn delete_zone(&self, id: Uuid) -> Result<()> {
        let command = Command::Del {
            collection: self.collection.clone(),
            id: id.to_string(),
        };
        match self.governor.execute_write(command, PRIORITY_NORMAL).await {
            Ok(reply) => {
                if let tourguard_protocol::RespValue::Error(message) = reply {
                    if !message.contains("not found") {
                        return Err(EngineError::Index { message });
                    }
                }
            }
            Err(e) => return Err(e),
        }
        self.forget(id).await;
        info!(zone_id = %id, "zone deleted");
        Ok(())
    }

    // ========== Retrieval ==========

    /// Fetch a zone: memory cache, then lookaside cache, then the index.
    pub async fn get_zone(&self, id: Uuid) -> Result<Zone> {
        if let Some(zone) = self.recall(id).await {
            return Ok(zone);
        }

        let key = keys::zone(&id);
        if let Some(zone) = self.cache.get::<Zone>(&key).await {
            self.remember(zone.clone()).await;
            return Ok(zone);
        }

        let command = Command::Get {
            collection: self.collection.clone(),
            id: id.to_string(),
        };
        let raw = self.governor.execute_read(command, PRIORITY_NORMAL).await?;
        let decoded = reply::decode_get_reply(raw)?;
        let (object, fields) = decoded.ok_or_else(|| EngineError::NotFound {
            entity: "zone",
            id: id.to_string(),
        })?;
        let ring = object
            .as_ring()
            .ok_or_else(|| EngineError::Internal {
                message: format!("zone {id} is not a polygon"),
            })?
            .to_vec();
        let zone = zone_from_parts(id, ring, &fields)?;

        self.cache.set(&key, &zone, CacheClass::Zone).await;
        self.remember(zone.clone()).await;
        Ok(zone)
    }

    /// Zones whose polygon contains the point.
    pub async fn zones_containing_point(
        &self,
        point: tourguard_geo::Coordinate,
    ) -> Result<Vec<Zone>> {
        let command = Command::IntersectsPoint {
            collection: self.collection.clone(),
            point,
        };
        let raw = self.governor.execute_read(command, PRIORITY_NORMAL).await?;
        self.decode_zone_entries(raw)
    }

    /// Up to `limit` active zones, for the detector sweep.
    pub async fn active_zones(&self, limit: usize) -> Result<Vec<Zone>> {
        let command = Command::Scan {
            collection: self.collection.clone(),
            limit: Some(limit),
            with_fields: true,
        };
        let raw = self.governor.execute_read(command, PRIORITY_LOW).await?;
        let zones = self.decode_zone_entries(raw)?;
        Ok(zones
            .into_iter()
            .filter(|z| z.status == ZoneStatus::Active)
            .collect())
    }

    /// Search with post-filtering for fields the index does not key on.
    #[instrument(skip(self, query))]
    pub async fn search_zones(&self, query: ZoneQuery) -> Result<Vec<Zone>> {
        let command = match query.bounds {
            Some(bounds) => Command::Within {
                collection: self.collection.clone(),
                limit: query.limit,
                area: QueryArea::Bounds(bounds),
            },
            None => Command::Scan {
                collection: self.collection.clone(),
                limit: query.limit,
                with_fields: true,
            },
        };
        let raw = self.governor.execute_read(command, PRIORITY_NORMAL).await?;
        let mut zones = self.decode_zone_entries(raw)?;

        zones.retain(|z| {
            query.zone_type.is_none_or(|t| z.zone_type == t)
                && query.status.is_none_or(|s| z.status == s)
                && query.min_risk_level.is_none_or(|min| z.risk_level >= min)
                && query.max_risk_level.is_none_or(|max| z.risk_level <= max)
                && query
                    .created_by
                    .as_deref()
                    .is_none_or(|by| z.created_by.as_deref() == Some(by))
        });
        if let Some(limit) = query.limit {
            zones.truncate(limit);
        }
        Ok(zones)
    }

    // ========== Internals ==========

    async fn persist(&self, zone: &Zone) -> Result<()> {
        let command = Command::SetObject {
            collection: self.collection.clone(),
            id: zone.id.to_string(),
            fields: zone_fields(zone),
            ttl_secs: None,
            ring: zone.coordinates.clone(),
        };
        let reply = self.governor.execute_write(command, PRIORITY_NORMAL).await?;
        expect_reply(reply)?;
        self.cache
            .set(&keys::zone(&zone.id), zone, CacheClass::Zone)
            .await;
        // Zone geometry changed: cached containment answers are stale.
        self.cache.delete_prefix("geofence:").await;
        Ok(())
    }

    /// Reject the ring when it overlaps any other active zone.
    async fn check_overlap(&self, ring: &[tourguard_geo::Coordinate], exclude: Option<Uuid>) -> Result<()> {
        let existing = self.load_zone_snapshot().await?;
        for other in existing {
            if Some(other.id) == exclude || other.status != ZoneStatus::Active {
                continue;
            }
            if polygon::polygons_overlap(ring, &other.coordinates) {
                return Err(EngineError::ZoneOverlap {
                    zone_id: exclude,
                    conflicting_zone_id: other.id,
                });
            }
        }
        Ok(())
    }

    async fn load_zone_snapshot(&self) -> Result<Vec<Zone>> {
        let command = Command::Scan {
            collection: self.collection.clone(),
            limit: None,
            with_fields: true,
        };
        let raw = self.governor.execute_read(command, PRIORITY_NORMAL).await?;
        self.decode_zone_entries(raw)
    }

    fn decode_zone_entries(&self, raw: tourguard_protocol::RespValue) -> Result<Vec<Zone>> {
        let entries = reply::decode_search_reply(raw)?;
        let mut zones = Vec::with_capacity(entries.len());
        for entry in entries {
            let Ok(id) = Uuid::parse_str(&entry.id) else {
                debug!(id = %entry.id, "skipping zone entry with non-uuid id");
                continue;
            };
            let Some(ring) = entry.object.as_ring() else {
                debug!(id = %entry.id, "skipping non-polygon zone entry");
                continue;
            };
            match zone_from_parts(id, ring.to_vec(), &entry.fields) {
                Ok(zone) => zones.push(zone),
                Err(e) => warn!(zone_id = %id, error = %e, "skipping undecodable zone entry"),
            }
        }
        Ok(zones)
    }

    async fn remember(&self, zone: Zone) {
        self.memory
            .write()
            .await
            .insert(zone.id, (zone, Instant::now()));
    }

    async fn recall(&self, id: Uuid) -> Option<Zone> {
        {
            let memory = self.memory.read().await;
            if let Some((zone, cached_at)) = memory.get(&id) {
                if cached_at.elapsed() < ZONE_MEMORY_TTL {
                    return Some(zone.clone());
                }
            } else {
                return None;
            }
        }
        self.memory.write().await.remove(&id);
        None
    }

    async fn forget(&self, id: Uuid) {
        self.memory.write().await.remove(&id);
        self.cache.delete(&keys::zone(&id)).await;
        self.cache.delete_prefix("geofence:").await;
    }
}

// ============================================================================
// Field mapping
// ============================================================================

/// Zone attributes as index side fields.
fn zone_fields(zone: &Zone) -> FieldMap {
    let mut fields = FieldMap::new();
    fields.insert("name".to_string(), zone.name.clone());
    fields.insert("type".to_string(), zone.zone_type.as_str().to_string());
    fields.insert("status".to_string(), zone.status.as_str().to_string());
    fields.insert("riskLevel".to_string(), zone.risk_level.to_string());
    if let Some(description) = &zone.description {
        fields.insert("description".to_string(), description.clone());
    }
    if let Some(alert_message) = &zone.alert_message {
        fields.insert("alertMessage".to_string(), alert_message.clone());
    }
    if !zone.emergency_contacts.is_empty() {
        fields.insert(
            "contacts".to_string(),
            serde_json::to_string(&zone.emergency_contacts).unwrap_or_default(),
        );
    }
    if let Some(created_by) = &zone.created_by {
        fields.insert("createdBy".to_string(), created_by.clone());
    }
    fields.insert("createdAt".to_string(), zone.created_at.to_rfc3339());
    fields.insert("updatedAt".to_string(), zone.updated_at.to_rfc3339());
    fields
}

/// Rebuild a zone from its ring and side fields.
fn zone_from_parts(id: Uuid, ring: Vec<tourguard_geo::Coordinate>, fields: &FieldMap) -> Result<Zone> {
    let name = fields
        .get("name")
        .cloned()
        .ok_or_else(|| EngineError::Internal {
            message: format!("zone {id} missing name field"),
        })?;
    let zone_type = fields
        .get("type")
        .and_then(|t| ZoneType::parse(t))
        .ok_or_else(|| EngineError::Internal {
            message: format!("zone {id} missing or invalid type field"),
        })?;
    let status = fields
        .get("status")
        .and_then(|s| ZoneStatus::parse(s))
        .unwrap_or(ZoneStatus::Active);
    let risk_level = fields
        .get("riskLevel")
        .and_then(|r| r.parse().ok())
        .unwrap_or_else(|| zone_type.default_risk_level());
    let emergency_contacts = fields
        .get("contacts")
        .and_then(|c| serde_json::from_str(c).ok())
        .unwrap_or_default();
    let bounding_box = BoundingBox::from_ring(&ring).ok_or_else(|| EngineError::Internal {
        message: format!("zone {id} has an empty ring"),
    })?;

    Ok(Zone {
        id,
        name,
        zone_type,
        status,
        description: fields.get("description").cloned(),
        coordinates: ring,
        bounding_box,
        risk_level,
        alert_message: fields.get("alertMessage").cloned(),
        emergency_contacts,
        created_by: fields.get("createdBy").cloned(),
        created_at: parse_time(fields.get("createdAt")),
        updated_at: parse_time(fields.get("updatedAt")),
    })
}

fn parse_time(raw: Option<&String>) -> DateTime<Utc> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

fn validate_name(name: &str) -> Result<()> {
    let len = name.chars().count();
    if !(NAME_MIN..=NAME_MAX).contains(&len) {
        return Err(EngineError::validation(
            "name",
            format!("length must be {NAME_MIN}-{NAME_MAX} characters"),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == ' ' || c == '_' || c == '-')
    {
        return Err(EngineError::validation(
            "name",
            "only letters, digits, spaces, underscores and dashes are allowed",
        ));
    }
    Ok(())
}

fn validate_risk(level: u8) -> Result<u8> {
    if (1..=10).contains(&level) {
        Ok(level)
    } else {
        Err(EngineError::validation("riskLevel", "must be within [1, 10]"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tourguard_geo::Coordinate;

    fn ring() -> Vec<Coordinate> {
        vec![
            Coordinate { lat: 28.6139, lon: 77.2090 },
            Coordinate { lat: 28.6139, lon: 77.2100 },
            Coordinate { lat: 28.6149, lon: 77.2100 },
            Coordinate { lat: 28.6149, lon: 77.2090 },
            Coordinate { lat: 28.6139, lon: 77.2090 },
        ]
    }

    fn sample_zone() -> Zone {
        Zone {
            id: Uuid::new_v4(),
            name: "Connaught Place".to_string(),
            zone_type: ZoneType::TouristFriendly,
            status: ZoneStatus::Active,
            description: Some("central market".to_string()),
            bounding_box: BoundingBox::from_ring(&ring()).unwrap(),
            coordinates: ring(),
            risk_level: 3,
            alert_message: None,
            emergency_contacts: vec!["+91-100".to_string()],
            created_by: Some("admin".to_string()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_validate_name_bounds() {
        assert!(validate_name("ab").is_err());
        assert!(validate_name("abc").is_ok());
        assert!(validate_name(&"a".repeat(100)).is_ok());
        assert!(validate_name(&"a".repeat(101)).is_err());
    }

    #[test]
    fn test_validate_name_charset() {
        assert!(validate_name("Old Town_7-B").is_ok());
        assert!(validate_name("bad!name").is_err());
        assert!(validate_name("emoji🗺️").is_err());
    }

    #[test]
    fn test_validate_risk_bounds() {
        assert!(validate_risk(0).is_err());
        assert_eq!(validate_risk(1).unwrap(), 1);
        assert_eq!(validate_risk(10).unwrap(), 10);
        assert!(validate_risk(11).is_err());
    }

    #[test]
    fn test_zone_fields_round_trip() {
        let zone = sample_zone();
        let fields = zone_fields(&zone);
        let rebuilt = zone_from_parts(zone.id, zone.coordinates.clone(), &fields).unwrap();
        assert_eq!(rebuilt.name, zone.name);
        assert_eq!(rebuilt.zone_type, zone.zone_type);
        assert_eq!(rebuilt.status, zone.status);
        assert_eq!(rebuilt.risk_level, zone.risk_level);
        assert_eq!(rebuilt.description, zone.description);
        assert_eq!(rebuilt.emergency_contacts, zone.emergency_contacts);
        assert_eq!(rebuilt.created_by, zone.created_by);
        assert_eq!(rebuilt.coordinates, zone.coordinates);
        assert_eq!(rebuilt.bounding_box, zone.bounding_box);
        // RFC 3339 round-trip is lossless at the precision chrono emits.
        assert_eq!(rebuilt.created_at, zone.created_at);
    }

    #[test]
    fn test_zone_from_parts_requires_name_and_type() {
        let zone = sample_zone();
        let mut fields = zone_fields(&zone);
        fields.remove("name");
        assert!(zone_from_parts(zone.id, zone.coordinates.clone(), &fields).is_err());

        let mut fields = zone_fields(&zone);
        fields.remove("type");
        assert!(zone_from_parts(zone.id, zone.coordinates.clone(), &fields).is_err());
    }

    #[test]
    fn test_zone_from_parts_defaults() {
        let zone = sample_zone();
        let mut fields = zone_fields(&zone);
        fields.remove("status");
        fields.remove("riskLevel");
        fields.remove("createdAt");
        let rebuilt = zone_from_parts(zone.id, zone.coordinates.clone(), &fields).unwrap();
        assert_eq!(rebuilt.status, ZoneStatus::Active);
        assert_eq!(rebuilt.risk_level, ZoneType::TouristFriendly.default_risk_level());
    }
}
