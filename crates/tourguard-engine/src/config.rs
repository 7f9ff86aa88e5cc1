// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine configuration.
//!
//! All settings resolve from the environment under the `TOURGUARD_` prefix
//! with per-profile defaults (dev/test/prod adjust the timeout table). The
//! root [`EngineConfig`] is built once and handed to the engine builder; no
//! setting is read from the environment after construction.

use std::env;
use std::time::Duration;

use crate::error::{EngineError, Result};

/// Runtime profile. Adjusts timeouts, nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Profile {
    #[default]
    Dev,
    Test,
    Prod,
}

impl Profile {
    /// Read `TOURGUARD_PROFILE` (dev/test/prod, default dev).
    pub fn from_env() -> Self {
        match env::var("TOURGUARD_PROFILE").as_deref() {
            Ok("prod") | Ok("production") => Self::Prod,
            Ok("test") => Self::Test,
            _ => Self::Dev,
        }
    }

    /// Spatial-index query budget for this profile.
    pub fn query_timeout(&self) -> Duration {
        match self {
            Self::Prod => Duration::from_millis(3000),
            _ => Duration::from_millis(5000),
        }
    }

    /// Webhook delivery budget for this profile.
    pub fn webhook_timeout(&self) -> Duration {
        match self {
            Self::Prod => Duration::from_millis(5000),
            _ => Duration::from_millis(10_000),
        }
    }
}

/// Spatial-index connection settings.
#[derive(Debug, Clone)]
pub struct IndexSettings {
    /// Primary `host:port`.
    pub primary_addr: String,
    /// Replica `host:port` list.
    pub replica_addrs: Vec<String>,
    /// Point collection name.
    pub tourists_collection: String,
    /// Polygon collection name.
    pub zones_collection: String,
    /// History-lane collection name.
    pub history_collection: String,
    /// Query round-trip budget.
    pub query_timeout: Duration,
    /// Connection ready-wait budget.
    pub connect_timeout: Duration,
    /// Health probe interval.
    pub probe_interval: Duration,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            primary_addr: "127.0.0.1:9851".to_string(),
            replica_addrs: Vec::new(),
            tourists_collection: "tourists".to_string(),
            zones_collection: "zones".to_string(),
            history_collection: "tourists_history".to_string(),
            query_timeout: Duration::from_millis(5000),
            connect_timeout: Duration::from_secs(30),
            probe_interval: Duration::from_secs(30),
        }
    }
}

/// Request governor settings.
#[derive(Debug, Clone)]
pub struct GovernorSettings {
    /// Sliding-window cap.
    pub max_requests_per_second: usize,
    /// Sliding-window width.
    pub window: Duration,
    /// Concurrent in-flight operations.
    pub max_concurrent_queries: usize,
    /// Per-request retry attempts.
    pub retry_attempts: u32,
    /// Base retry delay; doubled per retry.
    pub retry_delay: Duration,
    /// Queue depth that triggers an overflow observation.
    pub queue_warn_depth: usize,
}

impl Default for GovernorSettings {
    fn default() -> Self {
        Self {
            max_requests_per_second: 1000,
            window: Duration::from_millis(1000),
            max_concurrent_queries: 10,
            retry_attempts: 3,
            retry_delay: Duration::from_millis(100),
            queue_warn_depth: 100,
        }
    }
}

/// Lookaside cache settings.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub location_ttl: Duration,
    pub zone_ttl: Duration,
    pub nearby_ttl: Duration,
    pub event_ttl: Duration,
    /// Interval for the expired-entry sweep.
    pub sweep_interval: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            location_ttl: Duration::from_secs(300),
            zone_ttl: Duration::from_secs(300),
            nearby_ttl: Duration::from_secs(300),
            event_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Location indexer settings.
#[derive(Debug, Clone)]
pub struct LocationSettings {
    /// Batch buffer size that triggers a flush.
    pub batch_size: usize,
    /// Time trigger for flushing a partial batch.
    pub flush_interval: Duration,
    /// Live-index TTL per location.
    pub location_ttl: Duration,
    /// Write a longer-TTL history lane per flush.
    pub enable_history: bool,
    /// History-lane TTL.
    pub history_ttl: Duration,
}

impl Default for LocationSettings {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            flush_interval: Duration::from_secs(1),
            location_ttl: Duration::from_secs(3600),
            enable_history: false,
            history_ttl: Duration::from_secs(86_400),
        }
    }
}

/// Bulk processor settings.
#[derive(Debug, Clone)]
pub struct BulkSettings {
    /// Queue size trigger.
    pub batch_size: usize,
    /// Time trigger.
    pub flush_interval: Duration,
    /// Parallel chunks per batch.
    pub concurrency: usize,
    /// Per-location retries before the item is dropped.
    pub max_retries: u32,
    /// Queue depth that triggers an overflow observation.
    pub queue_warn_depth: usize,
}

impl Default for BulkSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: Duration::from_secs(1),
            concurrency: 5,
            max_retries: 3,
            queue_warn_depth: 1000,
        }
    }
}

/// Geofence detector settings.
#[derive(Debug, Clone)]
pub struct DetectorSettings {
    /// Sweep period.
    pub check_interval: Duration,
    /// Zones examined per tick.
    pub zone_batch_size: usize,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(1),
            zone_batch_size: 100,
        }
    }
}

/// Webhook dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Delivery-queue drain period.
    pub drain_interval: Duration,
    /// Events drained per cycle.
    pub batch_size: usize,
    /// Concurrent deliveries per drain cycle.
    pub concurrency: usize,
    /// POST round-trip budget.
    pub timeout: Duration,
    /// HEAD pre-flight budget for URL validation.
    pub validation_timeout: Duration,
    /// Queue depth that triggers an overflow observation.
    pub queue_warn_depth: usize,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            drain_interval: Duration::from_millis(100),
            batch_size: 50,
            concurrency: 5,
            timeout: Duration::from_millis(10_000),
            validation_timeout: Duration::from_millis(5000),
            queue_warn_depth: 1000,
        }
    }
}

/// Root configuration handed to the engine builder.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub profile: Profile,
    pub index: IndexSettings,
    pub governor: GovernorSettings,
    pub cache: CacheSettings,
    pub locations: LocationSettings,
    pub bulk: BulkSettings,
    pub detector: DetectorSettings,
    pub webhooks: DispatcherSettings,
}

impl EngineConfig {
    /// Defaults for the given profile (applies the profile timeout table).
    pub fn for_profile(profile: Profile) -> Self {
        let mut config = Self {
            profile,
            ..Default::default()
        };
        config.index.query_timeout = profile.query_timeout();
        config.webhooks.timeout = profile.webhook_timeout();
        config
    }

    /// Load configuration from environment variables.
    ///
    /// # Optional Environment Variables
    /// - `TOURGUARD_PROFILE` - dev / test / prod (default: dev)
    /// - `TOURGUARD_INDEX_ADDR` - primary `host:port` (default: 127.0.0.1:9851)
    /// - `TOURGUARD_INDEX_REPLICAS` - comma-separated replica `host:port` list
    /// - `TOURGUARD_TOURISTS_COLLECTION` / `TOURGUARD_ZONES_COLLECTION`
    /// - `TOURGUARD_QUERY_TIMEOUT_MS` - overrides the profile budget
    /// - `TOURGUARD_MAX_RPS` / `TOURGUARD_MAX_CONCURRENT_QUERIES`
    /// - `TOURGUARD_CACHE_ENABLED` / `TOURGUARD_CACHE_TTL_SECS`
    /// - `TOURGUARD_LOCATION_BATCH_SIZE` / `TOURGUARD_LOCATION_TTL_SECS`
    /// - `TOURGUARD_ENABLE_HISTORY`
    /// - `TOURGUARD_BULK_CONCURRENCY`
    /// - `TOURGUARD_WEBHOOK_TIMEOUT_MS` / `TOURGUARD_WEBHOOK_CONCURRENCY` /
    ///   `TOURGUARD_WEBHOOK_QUEUE_SIZE`
    pub fn from_env() -> Result<Self> {
        let profile = Profile::from_env();
        let mut config = Self::for_profile(profile);

        if let Ok(addr) = env::var("TOURGUARD_INDEX_ADDR") {
            if !addr.contains(':') {
                return Err(EngineError::validation(
                    "TOURGUARD_INDEX_ADDR",
                    "expected host:port",
                ));
            }
            config.index.primary_addr = addr;
        }
        if let Ok(replicas) = env::var("TOURGUARD_INDEX_REPLICAS") {
            config.index.replica_addrs = replicas
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(name) = env::var("TOURGUARD_TOURISTS_COLLECTION") {
            config.index.tourists_collection = name;
        }
        if let Ok(name) = env::var("TOURGUARD_ZONES_COLLECTION") {
            config.index.zones_collection = name;
        }
        if let Some(ms) = env_u64("TOURGUARD_QUERY_TIMEOUT_MS") {
            config.index.query_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = env_u64("TOURGUARD_MAX_RPS") {
            config.governor.max_requests_per_second = n as usize;
        }
        if let Some(n) = env_u64("TOURGUARD_MAX_CONCURRENT_QUERIES") {
            config.governor.max_concurrent_queries = (n as usize).max(1);
        }
        if let Ok(v) = env::var("TOURGUARD_CACHE_ENABLED") {
            config.cache.enabled = v == "true" || v == "1";
        }
        if let Some(secs) = env_u64("TOURGUARD_CACHE_TTL_SECS") {
            let ttl = Duration::from_secs(secs);
            config.cache.location_ttl = ttl;
            config.cache.zone_ttl = ttl;
            config.cache.nearby_ttl = ttl;
        }
        if let Some(n) = env_u64("TOURGUARD_LOCATION_BATCH_SIZE") {
            config.locations.batch_size = (n as usize).max(1);
        }
        if let Some(secs) = env_u64("TOURGUARD_LOCATION_TTL_SECS") {
            config.locations.location_ttl = Duration::from_secs(secs);
        }
        if let Ok(v) = env::var("TOURGUARD_ENABLE_HISTORY") {
            config.locations.enable_history = v == "true" || v == "1";
        }
        if let Some(n) = env_u64("TOURGUARD_BULK_CONCURRENCY") {
            config.bulk.concurrency = (n as usize).max(1);
        }
        if let Some(ms) = env_u64("TOURGUARD_WEBHOOK_TIMEOUT_MS") {
            config.webhooks.timeout = Duration::from_millis(ms);
        }
        if let Some(n) = env_u64("TOURGUARD_WEBHOOK_CONCURRENCY") {
            config.webhooks.concurrency = (n as usize).max(1);
        }
        if let Some(n) = env_u64("TOURGUARD_WEBHOOK_QUEUE_SIZE") {
            config.webhooks.queue_warn_depth = n as usize;
        }

        Ok(config)
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}
