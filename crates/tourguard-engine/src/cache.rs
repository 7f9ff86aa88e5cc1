// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lookaside cache for locations, zones and query results.
//!
//! Values are JSON strings with per-class TTLs. Lookups never fail: a decode
//! problem or an expired entry is just a miss. Keys are namespaced by prefix
//! (`location:`, `zone:`, `nearby:`, `geofence:`) and coordinates in keys are
//! quantized to 6 decimal places (~0.11 m).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::CacheSettings;

/// Cache key constructors. Key shape is part of the engine contract.
pub mod keys {
    use tourguard_geo::Coordinate;

    /// Quantize a coordinate axis to 6 decimal places.
    fn q6(v: f64) -> String {
        format!("{v:.6}")
    }

    /// `location:<userId>`
    pub fn location(user_id: &str) -> String {
        format!("location:{user_id}")
    }

    /// `zone:<zoneId>`
    pub fn zone(zone_id: &uuid::Uuid) -> String {
        format!("zone:{zone_id}")
    }

    /// `nearby:<lat6>:<lon6>:<radius>`. The radius stays unquantized so
    /// equal-center queries with different radii never collide.
    pub fn nearby(center: &Coordinate, radius_m: f64) -> String {
        format!("nearby:{}:{}:{radius_m}", q6(center.lat), q6(center.lon))
    }

    /// `geofence:<userId>:<lat6>:<lon6>`
    pub fn geofence(user_id: &str, coordinate: &Coordinate) -> String {
        format!(
            "geofence:{user_id}:{}:{}",
            q6(coordinate.lat),
            q6(coordinate.lon)
        )
    }
}

/// Value class, selecting the TTL default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheClass {
    Location,
    Zone,
    Nearby,
    Event,
}

/// Monotonic counters; snapshots are taken by [`EngineCache::stats`].
#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
}

/// Point-in-time view of the cache counters.
#[derive(Debug, Clone, Copy, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub entries: usize,
    pub hit_rate: f64,
}

struct Entry {
    value: String,
    expires_at: Instant,
}

/// The in-process lookaside cache.
pub struct EngineCache {
    settings: CacheSettings,
    store: RwLock<HashMap<String, Entry>>,
    counters: Counters,
}

impl EngineCache {
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            settings,
            store: RwLock::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    /// TTL for a value class.
    pub fn ttl_for(&self, class: CacheClass) -> Duration {
        match class {
            CacheClass::Location => self.settings.location_ttl,
            CacheClass::Zone => self.settings.zone_ttl,
            CacheClass::Nearby => self.settings.nearby_ttl,
            CacheClass::Event => self.settings.event_ttl,
        }
    }

    /// Raw get. Expired entries are dropped and counted as misses.
    pub async fn get_raw(&self, key: &str) -> Option<String> {
        if !self.settings.enabled {
            return None;
        }
        {
            let store = self.store.read().await;
            if let Some(entry) = store.get(key) {
                if entry.expires_at > Instant::now() {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
            } else {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        }
        // Present but expired: evict under the write lock.
        self.store.write().await.remove(key);
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Typed get; a decode failure degrades to a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get_raw(key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "cache entry failed to decode, treating as miss");
                None
            }
        }
    }

    /// Typed set; a serialize failure is logged and ignored.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, class: CacheClass) {
        if !self.settings.enabled {
            return;
        }
        match serde_json::to_string(value) {
            Ok(raw) => self.set_raw(key, raw, self.ttl_for(class)).await,
            Err(e) => warn!(key, error = %e, "cache value failed to serialize, skipping"),
        }
    }

    /// Raw set with an explicit TTL.
    pub async fn set_raw(&self, key: &str, value: String, ttl: Duration) {
        if !self.settings.enabled {
            return;
        }
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.store.write().await.insert(key.to_string(), entry);
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
    }

    /// Delete one key. Counts whether or not the key existed.
    pub async fn delete(&self, key: &str) {
        if self.store.write().await.remove(key).is_some() {
            self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Delete every key under a prefix; returns how many were removed.
    pub async fn delete_prefix(&self, prefix: &str) -> usize {
        let mut store = self.store.write().await;
        let before = store.len();
        store.retain(|key, _| !key.starts_with(prefix));
        let removed = before - store.len();
        if removed > 0 {
            self.counters
                .deletes
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!(prefix, removed, "cache prefix invalidated");
        }
        removed
    }

    /// Drop expired entries.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut store = self.store.write().await;
        let before = store.len();
        store.retain(|_, entry| entry.expires_at > now);
        before - store.len()
    }

    /// Counter snapshot.
    pub async fn stats(&self) -> CacheStats {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            sets: self.counters.sets.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            entries: self.store.read().await.len(),
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    /// Spawn the periodic expired-entry sweep.
    pub fn spawn_sweeper(
        self: &std::sync::Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let cache = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            info!(
                interval_secs = cache.settings.sweep_interval.as_secs(),
                "cache sweeper started"
            );
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }

                    _ = tokio::time::sleep(cache.settings.sweep_interval) => {
                        let removed = cache.sweep().await;
                        if removed > 0 {
                            debug!(removed, "cache sweep evicted expired entries");
                        }
                    }
                }
            }
            info!("cache sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tourguard_geo::Coordinate;

    fn fast_settings() -> CacheSettings {
        CacheSettings {
            enabled: true,
            location_ttl: Duration::from_millis(50),
            zone_ttl: Duration::from_secs(300),
            nearby_ttl: Duration::from_secs(300),
            event_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_key_shapes() {
        let center = Coordinate { lat: 28.61443567, lon: 77.20951234 };
        assert_eq!(keys::location("u1"), "location:u1");
        assert_eq!(
            keys::nearby(&center, 500.0),
            "nearby:28.614436:77.209512:500"
        );
        assert_eq!(
            keys::geofence("u1", &center),
            "geofence:u1:28.614436:77.209512"
        );
        let id = uuid::Uuid::nil();
        assert_eq!(keys::zone(&id), format!("zone:{id}"));
    }

    #[test]
    fn test_nearby_keys_distinguish_radius() {
        let center = Coordinate { lat: 1.0, lon: 2.0 };
        assert_ne!(keys::nearby(&center, 100.0), keys::nearby(&center, 200.0));
    }

    #[tokio::test]
    async fn test_set_get_round_trip() {
        let cache = EngineCache::new(fast_settings());
        cache.set("zone:a", &vec![1, 2, 3], CacheClass::Zone).await;
        let got: Option<Vec<i32>> = cache.get("zone:a").await;
        assert_eq!(got, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let cache = EngineCache::new(fast_settings());
        cache.set("location:u1", &"here", CacheClass::Location).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        let got: Option<String> = cache.get("location:u1").await;
        assert!(got.is_none());
        let stats = cache.stats().await;
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_decode_failure_is_a_miss() {
        let cache = EngineCache::new(fast_settings());
        cache
            .set_raw("zone:bad", "not json".to_string(), Duration::from_secs(60))
            .await;
        let got: Option<Vec<i32>> = cache.get("zone:bad").await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_disabled_cache_is_inert() {
        let settings = CacheSettings {
            enabled: false,
            ..fast_settings()
        };
        let cache = EngineCache::new(settings);
        cache.set("zone:a", &1, CacheClass::Zone).await;
        let got: Option<i32> = cache.get("zone:a").await;
        assert!(got.is_none());
        assert_eq!(cache.stats().await.sets, 0);
    }

    #[tokio::test]
    async fn test_delete_prefix() {
        let cache = EngineCache::new(fast_settings());
        cache.set("geofence:u1:1:2", &1, CacheClass::Event).await;
        cache.set("geofence:u1:3:4", &2, CacheClass::Event).await;
        cache.set("geofence:u2:1:2", &3, CacheClass::Event).await;
        cache.set("zone:z", &4, CacheClass::Zone).await;
        let removed = cache.delete_prefix("geofence:u1:").await;
        assert_eq!(removed, 2);
        assert!(cache.get::<i32>("geofence:u2:1:2").await.is_some());
        assert!(cache.get::<i32>("zone:z").await.is_some());
    }

    #[tokio::test]
    async fn test_stats_hit_rate() {
        let cache = EngineCache::new(fast_settings());
        cache.set("zone:a", &1, CacheClass::Zone).await;
        let _: Option<i32> = cache.get("zone:a").await;
        let _: Option<i32> = cache.get("zone:a").await;
        let _: Option<i32> = cache.get("zone:missing").await;
        let stats = cache.stats().await;
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_hit_rate_zero_denominator() {
        let cache = EngineCache::new(fast_settings());
        assert_eq!(cache.stats().await.hit_rate, 0.0);
    }

    #[tokio::test]
    async fn test_sweep_removes_expired() {
        let cache = EngineCache::new(fast_settings());
        cache.set("location:u1", &1, CacheClass::Location).await;
        cache.set("zone:z", &2, CacheClass::Zone).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        let removed = cache.sweep().await;
        assert_eq!(removed, 1);
        assert_eq!(cache.stats().await.entries, 1);
    }

    #[tokio::test]
    async fn test_ttl_classes() {
        let cache = EngineCache::new(CacheSettings::default());
        assert_eq!(cache.ttl_for(CacheClass::Location), Duration::from_secs(300));
        assert_eq!(cache.ttl_for(CacheClass::Event), Duration::from_secs(60));
    }
}
