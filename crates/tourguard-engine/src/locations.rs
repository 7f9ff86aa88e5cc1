// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Location indexer: validated writes, batched flushes, point queries.
//!
//! Updates are validated, stamped and buffered; the buffer flushes as one
//! pipelined write when it reaches `batch_size` or when the flush timer
//! fires. Live points carry a TTL so users who go silent age out of the
//! index. An optional history lane writes each reading under
//! `<userId>:<millis>` with a longer TTL.
//!
//! Per-user ordering is preserved up to the buffer; concurrent batch chunks
//! may interleave, so consumers order by `timestamp`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use tourguard_geo::{Coordinate, DistanceAlgorithm, MAX_QUERY_RADIUS_M, distance};
use tourguard_protocol::{Command, FieldMap, QueryArea, reply};

use crate::cache::{CacheClass, EngineCache, keys};
use crate::config::LocationSettings;
use crate::error::{EngineError, Result};
use crate::governor::{PRIORITY_NORMAL, RequestGovernor};
use crate::observations::{Observation, ObservationBus};
use crate::types::{LocationUpdate, NearbyQuery, UserPoint, WithinQuery};

/// The location indexer.
pub struct LocationIndexer {
    governor: Arc<RequestGovernor>,
    cache: Arc<EngineCache>,
    settings: LocationSettings,
    collection: String,
    history_collection: String,
    bus: ObservationBus,
    buffer: Mutex<Vec<LocationUpdate>>,
}

impl LocationIndexer {
    pub fn new(
        governor: Arc<RequestGovernor>,
        cache: Arc<EngineCache>,
        settings: LocationSettings,
        collection: String,
        history_collection: String,
        bus: ObservationBus,
    ) -> Self {
        Self {
            governor,
            cache,
            settings,
            collection,
            history_collection,
            bus,
            buffer: Mutex::new(Vec::new()),
        }
    }

    // ========== Write path ==========

    /// Validate, stamp and buffer one update. Returns the stamped update.
    /// Triggers an immediate flush when the buffer fills.
    #[instrument(skip(self, location), fields(user_id = %location.user_id))]
    pub async fn update_location(&self, mut location: LocationUpdate) -> Result<LocationUpdate> {
        validate_location(&location)?;
        if location.timestamp.is_none() {
            location.timestamp = Some(Utc::now());
        }

        let should_flush = {
            let mut buffer = self.buffer.lock().await;
            buffer.push(location.clone());
            buffer.len() >= self.settings.batch_size
        };
        if should_flush {
            self.flush().await?;
        }
        Ok(location)
    }

    /// Flush the buffer as one pipelined write. Per-entry failures are
    /// reported as a `BatchPartial` observation; the flush itself succeeds.
    pub async fn flush(&self) -> Result<usize> {
        let batch: Vec<LocationUpdate> = {
            let mut buffer = self.buffer.lock().await;
            std::mem::take(&mut *buffer)
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let mut commands = Vec::with_capacity(batch.len() * 2);
        for location in &batch {
            commands.push(self.live_set_command(location));
            if self.settings.enable_history {
                commands.push(self.history_set_command(location));
            }
        }

        let replies = self
            .governor
            .execute_write_batch(commands, PRIORITY_NORMAL)
            .await?;

        let failed = replies
            .iter()
            .filter(|r| matches!(r, tourguard_protocol::RespValue::Error(_)))
            .count();
        if failed > 0 {
            warn!(failed, total = replies.len(), "location flush had per-entry failures");
            self.bus.emit(Observation::BatchPartial {
                failed,
                total: replies.len(),
            });
        }

        for location in &batch {
            self.cache
                .set(
                    &keys::location(&location.user_id),
                    location,
                    CacheClass::Location,
                )
                .await;
        }

        debug!(count = batch.len(), "location batch flushed");
        Ok(batch.len())
    }

    fn live_set_command(&self, location: &LocationUpdate) -> Command {
        Command::SetPoint {
            collection: self.collection.clone(),
            id: location.user_id.clone(),
            fields: location_fields(location),
            ttl_secs: Some(self.settings.location_ttl.as_secs()),
            point: location.coordinate,
        }
    }

    fn history_set_command(&self, location: &LocationUpdate) -> Command {
        let millis = location
            .timestamp
            .map(|t| t.timestamp_millis())
            .unwrap_or_default();
        Command::SetPoint {
            collection: self.history_collection.clone(),
            id: format!("{}:{millis}", location.user_id),
            fields: location_fields(location),
            ttl_secs: Some(self.settings.history_ttl.as_secs()),
            point: location.coordinate,
        }
    }

    /// Number of buffered, un-flushed updates.
    pub async fn buffered(&self) -> usize {
        self.buffer.lock().await.len()
    }

    // ========== Read path ==========

    /// Last known location for a user: cache first, then the index.
    #[instrument(skip(self))]
    pub async fn get_current_location(&self, user_id: &str) -> Result<Option<LocationUpdate>> {
        if user_id.is_empty() {
            return Err(EngineError::validation("userId", "must not be empty"));
        }

        let key = keys::location(user_id);
        if let Some(location) = self.cache.get::<LocationUpdate>(&key).await {
            return Ok(Some(location));
        }

        let command = Command::Get {
            collection: self.collection.clone(),
            id: user_id.to_string(),
        };
        let raw = self.governor.execute_read(command, PRIORITY_NORMAL).await?;
        let Some((object, fields)) = reply::decode_get_reply(raw)? else {
            return Ok(None);
        };
        let Some(point) = object.as_point() else {
            return Err(EngineError::Internal {
                message: format!("location for {user_id} is not a point"),
            });
        };

        let location = location_from_parts(user_id, point, &fields);
        self.cache.set(&key, &location, CacheClass::Location).await;
        Ok(Some(location))
    }

    /// Users within a radius. Radius must be within (0, 100 km].
    #[instrument(skip(self, query), fields(radius_m = query.radius_m))]
    pub async fn find_nearby(&self, query: NearbyQuery) -> Result<Vec<UserPoint>> {
        Coordinate::new(query.center.lat, query.center.lon)
            .map_err(|e| EngineError::validation("center", e.to_string()))?;
        if !(query.radius_m > 0.0 && query.radius_m <= MAX_QUERY_RADIUS_M) {
            return Err(EngineError::validation(
                "radiusM",
                format!("must be within (0, {MAX_QUERY_RADIUS_M}] meters"),
            ));
        }

        let key = keys::nearby(&query.center, query.radius_m);
        let mut points = match self.cache.get::<Vec<UserPoint>>(&key).await {
            Some(points) => points,
            None => {
                let command = Command::Nearby {
                    collection: self.collection.clone(),
                    limit: query.limit,
                    point: query.center,
                    radius_m: query.radius_m,
                };
                let raw = self.governor.execute_read(command, PRIORITY_NORMAL).await?;
                let points = decode_user_points(raw, Some(query.center))?;
                self.cache.set(&key, &points, CacheClass::Nearby).await;
                points
            }
        };

        if query.sort_by_distance {
            points.sort_by(|a, b| {
                a.distance_m
                    .unwrap_or(f64::MAX)
                    .total_cmp(&b.distance_m.unwrap_or(f64::MAX))
            });
        }
        if let Some(limit) = query.limit {
            points.truncate(limit);
        }
        Ok(points)
    }

    /// Users within a bounding box or polygon. Exactly one area is required.
    #[instrument(skip(self, query))]
    pub async fn find_within(&self, query: WithinQuery) -> Result<Vec<UserPoint>> {
        let area = match (query.bounds, &query.polygon) {
            (Some(bounds), None) => QueryArea::Bounds(bounds),
            (None, Some(polygon)) => {
                if polygon.len() < 3 {
                    return Err(EngineError::validation(
                        "polygon",
                        "needs at least 3 vertices",
                    ));
                }
                for c in polygon {
                    Coordinate::new(c.lat, c.lon)
                        .map_err(|e| EngineError::validation("polygon", e.to_string()))?;
                }
                QueryArea::Polygon(polygon.clone())
            }
            (Some(_), Some(_)) => {
                return Err(EngineError::validation(
                    "area",
                    "bounds and polygon are mutually exclusive",
                ));
            }
            (None, None) => {
                return Err(EngineError::validation(
                    "area",
                    "either bounds or polygon is required",
                ));
            }
        };

        let command = Command::Within {
            collection: self.collection.clone(),
            limit: query.limit,
            area,
        };
        let raw = self.governor.execute_read(command, PRIORITY_NORMAL).await?;
        decode_user_points(raw, None)
    }

    /// Erase a user's live point (logout / gone offline).
    #[instrument(skip(self))]
    pub async fn remove_user_location(&self, user_id: &str) -> Result<()> {
        if user_id.is_empty() {
            return Err(EngineError::validation("userId", "must not be empty"));
        }
        let command = Command::Del {
            collection: self.collection.clone(),
            id: user_id.to_string(),
        };
        match self.governor.execute_write(command, PRIORITY_NORMAL).await {
            Ok(tourguard_protocol::RespValue::Error(message)) if !message.contains("not found") => {
                return Err(EngineError::Index { message });
            }
            Ok(_) => {}
            Err(e) => return Err(e),
        }
        self.cache.delete(&keys::location(user_id)).await;
        self.cache
            .delete_prefix(&format!("geofence:{user_id}:"))
            .await;
        info!(user_id, "user location removed");
        Ok(())
    }

    // ========== Background flusher ==========

    /// Spawn the periodic flusher; performs a final flush on shutdown.
    pub fn spawn_flusher(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let indexer = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                interval_ms = indexer.settings.flush_interval.as_millis() as u64,
                batch_size = indexer.settings.batch_size,
                "location flusher started"
            );
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            if let Err(e) = indexer.flush().await {
                                warn!(error = %e, "final location flush failed");
                            }
                            break;
                        }
                    }

                    _ = tokio::time::sleep(indexer.settings.flush_interval) => {
                        if let Err(e) = indexer.flush().await {
                            warn!(error = %e, "scheduled location flush failed");
                        }
                    }
                }
            }
            info!("location flusher stopped");
        })
    }
}

// ============================================================================
// Validation and field mapping
// ============================================================================

/// Validate one location update against the ingest constraints.
pub fn validate_location(location: &LocationUpdate) -> Result<()> {
    if location.user_id.trim().is_empty() {
        return Err(EngineError::validation("userId", "must not be empty"));
    }
    Coordinate::new(location.coordinate.lat, location.coordinate.lon)
        .map_err(|e| EngineError::validation("coordinate", e.to_string()))?;
    if let Some(accuracy) = location.accuracy {
        if !(0.0..=10_000.0).contains(&accuracy) {
            return Err(EngineError::validation("accuracy", "must be within [0, 10000] meters"));
        }
    }
    if let Some(battery) = location.battery {
        if !(0.0..=100.0).contains(&battery) {
            return Err(EngineError::validation("battery", "must be within [0, 100]"));
        }
    }
    if let Some(speed) = location.speed {
        if speed < 0.0 {
            return Err(EngineError::validation("speed", "must be non-negative"));
        }
    }
    if let Some(bearing) = location.bearing {
        if !(0.0..=360.0).contains(&bearing) {
            return Err(EngineError::validation("bearing", "must be within [0, 360] degrees"));
        }
    }
    Ok(())
}

fn location_fields(location: &LocationUpdate) -> FieldMap {
    let mut fields = FieldMap::new();
    if let Some(timestamp) = location.timestamp {
        fields.insert("timestamp".to_string(), timestamp.to_rfc3339());
    }
    if let Some(accuracy) = location.accuracy {
        fields.insert("accuracy".to_string(), accuracy.to_string());
    }
    if let Some(battery) = location.battery {
        fields.insert("battery".to_string(), battery.to_string());
    }
    if let Some(speed) = location.speed {
        fields.insert("speed".to_string(), speed.to_string());
    }
    if let Some(bearing) = location.bearing {
        fields.insert("bearing".to_string(), bearing.to_string());
    }
    if let Some(device_id) = &location.device_id {
        fields.insert("deviceId".to_string(), device_id.clone());
    }
    if let Some(network_type) = &location.network_type {
        fields.insert("networkType".to_string(), network_type.clone());
    }
    if let Some(app_version) = &location.app_version {
        fields.insert("appVersion".to_string(), app_version.clone());
    }
    fields
}

fn location_from_parts(user_id: &str, point: Coordinate, fields: &FieldMap) -> LocationUpdate {
    LocationUpdate {
        user_id: user_id.to_string(),
        coordinate: point,
        timestamp: fields
            .get("timestamp")
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc)),
        accuracy: fields.get("accuracy").and_then(|v| v.parse().ok()),
        battery: fields.get("battery").and_then(|v| v.parse().ok()),
        speed: fields.get("speed").and_then(|v| v.parse().ok()),
        bearing: fields.get("bearing").and_then(|v| v.parse().ok()),
        device_id: fields.get("deviceId").cloned(),
        network_type: fields.get("networkType").cloned(),
        app_version: fields.get("appVersion").cloned(),
    }
}

/// Decode user points from a search reply. When `center` is given, missing
/// distances are filled in client-side.
fn decode_user_points(
    raw: tourguard_protocol::RespValue,
    center: Option<Coordinate>,
) -> Result<Vec<UserPoint>> {
    let entries = reply::decode_search_reply(raw)?;
    let mut points = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(coordinate) = entry.object.as_point() else {
            continue;
        };
        let distance_m = entry.distance.or_else(|| {
            center.map(|c| distance(&c, &coordinate, DistanceAlgorithm::Haversine))
        });
        points.push(UserPoint {
            user_id: entry.id,
            coordinate,
            distance_m,
        });
    }
    Ok(points)
}
