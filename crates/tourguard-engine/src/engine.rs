// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine orchestrator.
//!
//! [`EngineBuilder`] wires the subsystems in dependency order and hands back
//! a fully initialized [`Engine`]; there is no construct-then-wait-for-ready
//! race. Every public operation guards against use before initialization or
//! after shutdown. Shutdown is ordered: the bulk queue drains, the webhook
//! queue drains once, the governor rejects whatever is still queued, then the
//! pool closes.
//!
//! # Example
//!
//! ```rust,ignore
//! use tourguard_engine::{Engine, EngineConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = Engine::builder()
//!         .config(EngineConfig::from_env()?)
//!         .build()
//!         .await?;
//!
//!     // ... serve traffic ...
//!
//!     engine.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use tourguard_geo::{distance_matrix, distance_in, nearest, LengthUnit};
use tourguard_protocol::{Command, ConnectionConfig, IndexPool, PoolConfig, PoolStatus};

use crate::bulk::{BulkProcessor, ProcessingStats};
use crate::cache::{CacheStats, EngineCache};
use crate::config::EngineConfig;
use crate::detector::GeofenceDetector;
use crate::error::{EngineError, Result, expect_reply};
use crate::governor::{GovernorStats, PRIORITY_HIGH, RequestGovernor};
use crate::locations::LocationIndexer;
use crate::observations::{Observation, ObservationBus};
use crate::sink::{EventSink, NoopEventSink};
use crate::types::{
    DistanceMatrixRequest, DistanceRequest, DistanceResult, GeofenceEvent, HealthState,
    LocationUpdate, NearbyQuery, NearestRequest, NearestResult, UserPoint, WebhookConfig,
    WebhookPatch, WebhookRegistration, WithinQuery, Zone, ZoneDraft, ZonePatch, ZoneQuery,
};
use crate::webhooks::{WebhookDispatcher, WebhookStatistics};
use crate::zones::ZoneManager;

/// Engine lifecycle states.
const STATE_READY: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Join budget per background task on shutdown.
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Builder for a fully wired [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    sink: Option<Arc<dyn EventSink>>,
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .field("sink", &self.sink.as_ref().map(|_| "..."))
            .finish()
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            sink: None,
        }
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the engine configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the durable event sink (default: discard).
    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Wire every subsystem and start the background tasks.
    ///
    /// Connections to the index open lazily on first use; readiness is
    /// reported through [`Engine::get_health_status`].
    pub async fn build(self) -> Result<Engine> {
        let config = self.config;
        let sink = self.sink.unwrap_or_else(|| Arc::new(NoopEventSink));
        let bus = ObservationBus::default();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        // C1: spatial-index client pool.
        let pool = Arc::new(IndexPool::new(PoolConfig {
            primary_addr: config.index.primary_addr.clone(),
            replica_addrs: config.index.replica_addrs.clone(),
            connection: ConnectionConfig {
                addr: config.index.primary_addr.clone(),
                connect_timeout: config.index.connect_timeout,
                request_timeout: config.index.query_timeout,
                ..Default::default()
            },
            probe_interval: config.index.probe_interval,
            ..Default::default()
        }));
        tasks.push(pool.spawn_probe(shutdown_rx.clone()));
        tasks.push(spawn_connection_observer(
            Arc::clone(&pool),
            bus.clone(),
            config.index.probe_interval,
            shutdown_rx.clone(),
        ));

        // C2: request governor.
        let (governor, governor_task) = RequestGovernor::spawn(
            Arc::clone(&pool),
            config.governor.clone(),
            bus.clone(),
            shutdown_rx.clone(),
        );
        tasks.push(governor_task);

        // C3: lookaside cache.
        let cache = Arc::new(EngineCache::new(config.cache.clone()));
        tasks.push(cache.spawn_sweeper(shutdown_rx.clone()));

        // C4: zone manager.
        let zones = Arc::new(ZoneManager::new(
            Arc::clone(&governor),
            Arc::clone(&cache),
            config.index.zones_collection.clone(),
        ));

        // C5: location indexer.
        let locations = Arc::new(LocationIndexer::new(
            Arc::clone(&governor),
            Arc::clone(&cache),
            config.locations.clone(),
            config.index.tourists_collection.clone(),
            config.index.history_collection.clone(),
            bus.clone(),
        ));
        tasks.push(locations.spawn_flusher(shutdown_rx.clone()));

        // C8 before C7: the detector feeds the dispatcher.
        let webhooks = Arc::new(WebhookDispatcher::new(
            Arc::clone(&governor),
            Arc::clone(&zones),
            config.webhooks.clone(),
            config.index.tourists_collection.clone(),
            bus.clone(),
        ));
        tasks.push(webhooks.spawn_drainer(shutdown_rx.clone()));

        // C7: geofence detector.
        let detector = Arc::new(GeofenceDetector::new(
            Arc::clone(&zones),
            Arc::clone(&locations),
            Arc::clone(&webhooks),
            sink,
            config.detector.clone(),
        ));
        tasks.push(detector.spawn_sweeper(shutdown_rx.clone()));

        // C6: bulk processor.
        let bulk = Arc::new(BulkProcessor::new(
            Arc::clone(&locations),
            Arc::clone(&detector),
            config.bulk.clone(),
            bus.clone(),
        ));
        tasks.push(bulk.spawn_worker(shutdown_rx.clone()));

        info!(
            primary = %config.index.primary_addr,
            replicas = config.index.replica_addrs.len(),
            "engine wired"
        );

        Ok(Engine {
            inner: Arc::new(EngineInner {
                config,
                pool,
                governor,
                cache,
                zones,
                locations,
                bulk,
                detector,
                webhooks,
                bus,
                shutdown_tx,
                tasks: Mutex::new(tasks),
                state: AtomicU8::new(STATE_READY),
            }),
        })
    }
}

struct EngineInner {
    config: EngineConfig,
    pool: Arc<IndexPool>,
    governor: Arc<RequestGovernor>,
    cache: Arc<EngineCache>,
    zones: Arc<ZoneManager>,
    locations: Arc<LocationIndexer>,
    bulk: Arc<BulkProcessor>,
    detector: Arc<GeofenceDetector>,
    webhooks: Arc<WebhookDispatcher>,
    bus: ObservationBus,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    state: AtomicU8,
}

/// Outcome of a synchronous location update.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOutcome {
    pub location: LocationUpdate,
    pub events: Vec<GeofenceEvent>,
}

/// Aggregate statistics surface (`/stats/*`).
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub processing: ProcessingStats,
    pub performance: GovernorStats,
    pub cache: CacheStats,
    pub webhooks: WebhookStatistics,
}

/// Aggregate health report.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub state: HealthState,
    pub primary_connected: bool,
    pub connected_handles: usize,
    pub total_handles: usize,
    pub failure_rate: f64,
    pub governor_queue_depth: usize,
    pub bulk_queue_depth: usize,
    pub webhook_queue_depth: usize,
    pub buffered_locations: usize,
}

/// The wired engine. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Create a builder.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    fn guard(&self) -> Result<()> {
        if self.inner.state.load(Ordering::Acquire) == STATE_READY {
            Ok(())
        } else {
            Err(EngineError::NotInitialized)
        }
    }

    /// Subscribe to the engine's observation stream.
    pub fn observations(&self) -> broadcast::Receiver<Observation> {
        self.inner.bus.subscribe()
    }

    /// The configuration the engine was built with.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    // ========== Locations ==========

    /// Synchronous path: index the update, evaluate zone membership, hand
    /// resulting events to the dispatcher.
    #[instrument(skip(self, location), fields(user_id = %location.user_id))]
    pub async fn update_location(&self, location: LocationUpdate) -> Result<UpdateOutcome> {
        self.guard()?;
        let stamped = self.inner.locations.update_location(location).await?;
        let events = self
            .inner
            .detector
            .process_location(&stamped, "realtime")
            .await?;
        Ok(UpdateOutcome {
            location: stamped,
            events,
        })
    }

    /// Enqueue one update for the bulk processor.
    pub async fn queue_location_update(&self, location: LocationUpdate) -> Result<()> {
        self.guard()?;
        self.inner.bulk.enqueue(location).await
    }

    /// Enqueue a whole batch for the bulk processor.
    pub async fn process_bulk_locations(&self, updates: Vec<LocationUpdate>) -> Result<usize> {
        self.guard()?;
        self.inner.bulk.enqueue_batch(updates).await
    }

    /// Last known location of a user.
    pub async fn get_user_location(&self, user_id: &str) -> Result<Option<LocationUpdate>> {
        self.guard()?;
        self.inner.locations.get_current_location(user_id).await
    }

    /// Users within a radius.
    pub async fn find_nearby_users(&self, query: NearbyQuery) -> Result<Vec<UserPoint>> {
        self.guard()?;
        self.inner.locations.find_nearby(query).await
    }

    /// Users within a bounding box or polygon.
    pub async fn find_users_in_zone(&self, query: WithinQuery) -> Result<Vec<UserPoint>> {
        self.guard()?;
        self.inner.locations.find_within(query).await
    }

    /// Erase a user's live point.
    pub async fn remove_user_location(&self, user_id: &str) -> Result<()> {
        self.guard()?;
        self.inner.locations.remove_user_location(user_id).await
    }

    // ========== Zones ==========

    pub async fn create_zone(&self, draft: ZoneDraft) -> Result<Zone> {
        self.guard()?;
        self.inner.zones.create_zone(draft).await
    }

    pub async fn get_zone(&self, id: Uuid) -> Result<Zone> {
        self.guard()?;
        self.inner.zones.get_zone(id).await
    }

    pub async fn update_zone(&self, id: Uuid, patch: ZonePatch) -> Result<Zone> {
        self.guard()?;
        self.inner.zones.update_zone(id, patch).await
    }

    pub async fn delete_zone(&self, id: Uuid) -> Result<()> {
        self.guard()?;
        self.inner.zones.delete_zone(id).await
    }

    pub async fn search_zones(&self, query: ZoneQuery) -> Result<Vec<Zone>> {
        self.guard()?;
        self.inner.zones.search_zones(query).await
    }

    /// Zones containing a point.
    pub async fn zones_at(&self, point: tourguard_geo::Coordinate) -> Result<Vec<Zone>> {
        self.guard()?;
        self.inner.zones.zones_containing_point(point).await
    }

    // ========== Events ==========

    /// Feed an externally generated event through matching and delivery.
    pub async fn process_geofence_event(&self, event: GeofenceEvent) -> Result<()> {
        self.guard()?;
        self.inner.detector.process_geofence_event(event).await
    }

    // ========== Webhooks ==========

    pub async fn register_webhook(&self, registration: WebhookRegistration) -> Result<WebhookConfig> {
        self.guard()?;
        self.inner.webhooks.register_webhook(registration).await
    }

    pub async fn update_webhook(&self, id: Uuid, patch: WebhookPatch) -> Result<WebhookConfig> {
        self.guard()?;
        self.inner.webhooks.update_webhook(id, patch).await
    }

    pub async fn remove_webhook(&self, id: Uuid) -> Result<()> {
        self.guard()?;
        self.inner.webhooks.remove_webhook(id).await
    }

    pub async fn get_webhook(&self, id: Uuid) -> Result<WebhookConfig> {
        self.guard()?;
        self.inner.webhooks.get_webhook(id).await
    }

    pub async fn list_webhooks(&self) -> Result<Vec<WebhookConfig>> {
        self.guard()?;
        Ok(self.inner.webhooks.list_webhooks().await)
    }

    pub async fn test_webhook(&self, id: Uuid) -> Result<()> {
        self.guard()?;
        self.inner.webhooks.test_webhook(id).await
    }

    // ========== Geospatial math (pure) ==========

    /// Point-to-point distance. Pure computation; works even when the index
    /// is unreachable.
    pub fn calculate_distance(&self, request: DistanceRequest) -> Result<DistanceResult> {
        self.guard()?;
        validate_coordinate("from", &request.from)?;
        validate_coordinate("to", &request.to)?;
        Ok(DistanceResult {
            distance: distance_in(&request.from, &request.to, request.algorithm, request.unit),
            unit: request.unit,
            algorithm: request.algorithm,
        })
    }

    /// Pairwise distance matrix.
    pub fn calculate_distance_matrix(&self, request: DistanceMatrixRequest) -> Result<Vec<Vec<f64>>> {
        self.guard()?;
        for (i, point) in request.points.iter().enumerate() {
            validate_coordinate(&format!("points[{i}]"), point)?;
        }
        let meters = distance_matrix(&request.points, request.algorithm);
        let factor = LengthUnit::convert(1.0, LengthUnit::Meters, request.unit);
        Ok(meters
            .into_iter()
            .map(|row| row.into_iter().map(|d| d * factor).collect())
            .collect())
    }

    /// Closest candidate to an origin.
    pub fn find_nearest_point(&self, request: NearestRequest) -> Result<Option<NearestResult>> {
        self.guard()?;
        validate_coordinate("origin", &request.origin)?;
        for (i, point) in request.candidates.iter().enumerate() {
            validate_coordinate(&format!("candidates[{i}]"), point)?;
        }
        Ok(nearest(&request.origin, &request.candidates).map(|(index, distance_m)| {
            NearestResult {
                index,
                coordinate: request.candidates[index],
                distance_m,
            }
        }))
    }

    // ========== Maintenance / introspection ==========

    /// Ask the index to rewrite its append-only file.
    pub async fn optimize(&self) -> Result<()> {
        self.guard()?;
        let reply = self
            .inner
            .governor
            .execute_write(Command::RewriteAof, PRIORITY_HIGH)
            .await?;
        expect_reply(reply)?;
        Ok(())
    }

    /// Pool snapshot, for operational tooling.
    pub async fn pool_status(&self) -> Result<PoolStatus> {
        self.guard()?;
        Ok(self.inner.pool.status().await)
    }

    /// Index-side statistics: per-collection `STATS` plus `SERVER` info.
    pub async fn index_stats(&self) -> Result<serde_json::Value> {
        self.guard()?;
        let tourists = self
            .inner
            .governor
            .execute_read(
                Command::Stats {
                    collection: self.inner.config.index.tourists_collection.clone(),
                },
                PRIORITY_HIGH,
            )
            .await?;
        let zones = self
            .inner
            .governor
            .execute_read(
                Command::Stats {
                    collection: self.inner.config.index.zones_collection.clone(),
                },
                PRIORITY_HIGH,
            )
            .await?;
        let server = self
            .inner
            .governor
            .execute_read(Command::Server, PRIORITY_HIGH)
            .await?;
        Ok(serde_json::json!({
            "tourists": reply_to_json(tourists),
            "zones": reply_to_json(zones),
            "server": reply_to_json(server),
        }))
    }

    /// Aggregate statistics.
    pub async fn get_stats(&self) -> Result<EngineStats> {
        self.guard()?;
        Ok(EngineStats {
            processing: self.inner.bulk.stats().await,
            performance: self.inner.governor.stats(),
            cache: self.inner.cache.stats().await,
            webhooks: self.inner.webhooks.statistics().await,
        })
    }

    /// Aggregate health: failure rate above 50% or a queue above 1000 is
    /// unhealthy; above 20% / 100 is degraded; a disconnected primary caps
    /// the report at degraded.
    pub async fn get_health_status(&self) -> HealthReport {
        let pool_status = self.inner.pool.status().await;
        let governor_stats = self.inner.governor.stats();
        let bulk_depth = self.inner.bulk.queue_len().await;
        let webhook_depth = self.inner.webhooks.queue_len().await;
        let buffered = self.inner.locations.buffered().await;

        let failure_rate = governor_stats.failure_rate();
        let max_depth = governor_stats
            .queue_depth
            .max(bulk_depth)
            .max(webhook_depth);

        let mut state = if failure_rate > 0.5 || max_depth > 1000 {
            HealthState::Unhealthy
        } else if failure_rate > 0.2 || max_depth > 100 {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };
        if self.inner.state.load(Ordering::Acquire) != STATE_READY {
            state = HealthState::Unhealthy;
        } else if !pool_status.primary_connected() && state == HealthState::Healthy {
            // Writes will fail until the primary (re)connects.
            state = HealthState::Degraded;
        }

        HealthReport {
            state,
            primary_connected: pool_status.primary_connected(),
            connected_handles: pool_status.connected_count(),
            total_handles: pool_status.connections.len(),
            failure_rate,
            governor_queue_depth: governor_stats.queue_depth,
            bulk_queue_depth: bulk_depth,
            webhook_queue_depth: webhook_depth,
            buffered_locations: buffered,
        }
    }

    // ========== Lifecycle ==========

    /// Ordered, bounded-time shutdown. In-flight successful deliveries are
    /// not discarded: the bulk queue drains fully and the webhook queue gets
    /// a final drain before the governor clears.
    #[instrument(skip(self))]
    pub async fn shutdown(self) -> Result<()> {
        if self
            .inner
            .state
            .swap(STATE_STOPPED, Ordering::AcqRel)
            == STATE_STOPPED
        {
            return Ok(());
        }
        info!("engine shutting down");

        // Stop accepting new work (guard() now fails), drain what is queued.
        self.inner.bulk.drain().await;
        self.inner.webhooks.drain_once().await;

        // Signal every background loop, then the governor clears its queue.
        let _ = self.inner.shutdown_tx.send(true);

        let mut tasks = self.inner.tasks.lock().await;
        for task in tasks.drain(..) {
            match tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "background task panicked during shutdown"),
                Err(_) => warn!("background task did not stop within the join budget"),
            }
        }

        self.inner.pool.close().await;
        info!("engine shutdown complete");
        Ok(())
    }
}

/// Render an index reply as JSON for the stats surface.
fn reply_to_json(reply: tourguard_protocol::RespValue) -> serde_json::Value {
    use tourguard_protocol::RespValue;
    match reply {
        RespValue::Simple(s) => serde_json::Value::String(s),
        RespValue::Bulk(s) => {
            serde_json::from_str(&s).unwrap_or(serde_json::Value::String(s))
        }
        RespValue::Integer(n) => serde_json::Value::from(n),
        RespValue::Null => serde_json::Value::Null,
        RespValue::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(reply_to_json).collect())
        }
        RespValue::Error(message) => serde_json::json!({ "error": message }),
    }
}

/// Watch pool connection records and report up/down transitions on the bus.
fn spawn_connection_observer(
    pool: Arc<IndexPool>,
    bus: ObservationBus,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last: std::collections::HashMap<String, bool> = std::collections::HashMap::new();
        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }

                _ = tokio::time::sleep(interval) => {
                    for record in pool.status().await.connections {
                        let previous = last.insert(record.id.clone(), record.connected);
                        match (previous, record.connected) {
                            (Some(false) | None, true) => bus.emit(Observation::ConnectionUp {
                                connection_id: record.id,
                            }),
                            (Some(true), false) => bus.emit(Observation::ConnectionDown {
                                connection_id: record.id,
                                error: record.last_error.unwrap_or_default(),
                            }),
                            _ => {}
                        }
                    }
                }
            }
        }
    })
}

fn validate_coordinate(field: &str, c: &tourguard_geo::Coordinate) -> Result<()> {
    tourguard_geo::Coordinate::new(c.lat, c.lon)
        .map(|_| ())
        .map_err(|e| EngineError::validation(field, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tourguard_geo::{Coordinate, DistanceAlgorithm};

    fn test_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        // Point at ports that have no server and keep every timer fast so
        // build/shutdown cycles stay quick.
        config.index.primary_addr = "127.0.0.1:59921".to_string();
        config.index.connect_timeout = Duration::from_millis(50);
        config.index.query_timeout = Duration::from_millis(100);
        config.index.probe_interval = Duration::from_millis(200);
        config.governor.retry_attempts = 0;
        config.governor.retry_delay = Duration::from_millis(1);
        config.detector.check_interval = Duration::from_millis(200);
        config.locations.flush_interval = Duration::from_millis(100);
        config.bulk.flush_interval = Duration::from_millis(100);
        config.webhooks.drain_interval = Duration::from_millis(50);
        config.cache.sweep_interval = Duration::from_millis(100);
        config
    }

    #[tokio::test]
    async fn test_build_and_shutdown() {
        let engine = Engine::builder().config(test_config()).build().await.unwrap();
        let health = engine.get_health_status().await;
        // Lazy connections: nothing is connected yet, so degraded at most.
        assert!(health.state != HealthState::Unhealthy);
        assert!(!health.primary_connected);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_operations_fail_after_shutdown() {
        let engine = Engine::builder().config(test_config()).build().await.unwrap();
        let clone = engine.clone();
        engine.shutdown().await.unwrap();

        let result = clone
            .calculate_distance(DistanceRequest {
                from: Coordinate { lat: 0.0, lon: 0.0 },
                to: Coordinate { lat: 1.0, lon: 1.0 },
                algorithm: DistanceAlgorithm::Haversine,
                unit: LengthUnit::Meters,
            });
        match result {
            Err(e) => assert_eq!(e.error_code(), "NOT_INITIALIZED"),
            Ok(_) => panic!("expected NotInitialized"),
        }
    }

    #[tokio::test]
    async fn test_calculate_distance_scenario() {
        let engine = Engine::builder().config(test_config()).build().await.unwrap();
        let result = engine
            .calculate_distance(DistanceRequest {
                from: Coordinate { lat: 28.6139, lon: 77.2090 },
                to: Coordinate { lat: 28.6149, lon: 77.2100 },
                algorithm: DistanceAlgorithm::Haversine,
                unit: LengthUnit::Meters,
            })
            .unwrap();
        assert!((result.distance - 148.0).abs() < 1.0, "got {}", result.distance);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_calculate_distance_rejects_bad_coordinate() {
        let engine = Engine::builder().config(test_config()).build().await.unwrap();
        let result = engine.calculate_distance(DistanceRequest {
            from: Coordinate { lat: 99.0, lon: 0.0 },
            to: Coordinate { lat: 0.0, lon: 0.0 },
            algorithm: DistanceAlgorithm::Auto,
            unit: LengthUnit::Meters,
        });
        assert!(result.is_err());
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_distance_matrix_units() {
        let engine = Engine::builder().config(test_config()).build().await.unwrap();
        let points = vec![
            Coordinate { lat: 28.6139, lon: 77.2090 },
            Coordinate { lat: 28.6149, lon: 77.2100 },
        ];
        let meters = engine
            .calculate_distance_matrix(DistanceMatrixRequest {
                points: points.clone(),
                algorithm: DistanceAlgorithm::Haversine,
                unit: LengthUnit::Meters,
            })
            .unwrap();
        let km = engine
            .calculate_distance_matrix(DistanceMatrixRequest {
                points,
                algorithm: DistanceAlgorithm::Haversine,
                unit: LengthUnit::Kilometers,
            })
            .unwrap();
        assert!((meters[0][1] / 1000.0 - km[0][1]).abs() < 1e-9);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_find_nearest_point() {
        let engine = Engine::builder().config(test_config()).build().await.unwrap();
        let result = engine
            .find_nearest_point(NearestRequest {
                origin: Coordinate { lat: 28.6139, lon: 77.2090 },
                candidates: vec![
                    Coordinate { lat: 28.70, lon: 77.30 },
                    Coordinate { lat: 28.6149, lon: 77.2100 },
                ],
            })
            .unwrap()
            .unwrap();
        assert_eq!(result.index, 1);
        assert!(result.distance_m < 200.0);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_queue_rejects_invalid_location() {
        let engine = Engine::builder().config(test_config()).build().await.unwrap();
        let bad = LocationUpdate {
            user_id: String::new(),
            coordinate: Coordinate { lat: 0.0, lon: 0.0 },
            timestamp: None,
            accuracy: None,
            battery: None,
            speed: None,
            bearing: None,
            device_id: None,
            network_type: None,
            app_version: None,
        };
        let result = engine.queue_location_update(bad).await;
        match result {
            Err(e) => assert_eq!(e.error_code(), "VALIDATION"),
            Ok(()) => panic!("expected validation failure"),
        }
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_get_stats_shape() {
        let engine = Engine::builder().config(test_config()).build().await.unwrap();
        let stats = engine.get_stats().await.unwrap();
        assert_eq!(stats.processing.total_processed, 0);
        assert_eq!(stats.cache.hits, 0);
        assert_eq!(stats.webhooks.webhook_count, 0);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_double_shutdown_is_idempotent() {
        let engine = Engine::builder().config(test_config()).build().await.unwrap();
        let clone = engine.clone();
        engine.shutdown().await.unwrap();
        clone.shutdown().await.unwrap();
    }
}
