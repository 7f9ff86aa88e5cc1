// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Webhook dispatcher: subscriptions, matching, signing, delivery.
//!
//! Registrations are pre-flighted with a HEAD request; accepted webhooks may
//! also place per-zone hook intents in the spatial index (`SETHOOK`) as
//! server-side triggers, best effort. Detected events land in an in-memory
//! queue that a drain timer empties in batches; each (event, webhook) pair is
//! delivered with the webhook's own retry policy. Delivery failures surface
//! as observations only and never reach the location-update caller.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use tourguard_geo::Coordinate;
use tourguard_protocol::Command;

use crate::config::DispatcherSettings;
use crate::error::{EngineError, Result};
use crate::governor::{PRIORITY_HIGH, RequestGovernor};
use crate::observations::{Observation, ObservationBus};
use crate::types::{
    AlertLevel, EventMetadata, GeofenceEvent, GeofenceEventType, WebhookConfig, WebhookPatch,
    WebhookPayload, WebhookRegistration, WebhookUser,
};
use crate::zones::ZoneManager;

type HmacSha256 = Hmac<Sha256>;

/// Rolling delivery-time sample cap.
const DELIVERY_SAMPLES: usize = 1000;

/// Delivery statistics snapshot.
#[derive(Debug, Clone, Copy, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookStatistics {
    pub total_deliveries: u64,
    pub failed_deliveries: u64,
    pub queue_size: usize,
    pub average_delivery_ms: f64,
    pub webhook_count: usize,
}

#[derive(Default)]
struct DeliveryStats {
    delivered: AtomicU64,
    failed: AtomicU64,
    samples: std::sync::Mutex<VecDeque<u64>>,
}

impl DeliveryStats {
    fn record(&self, elapsed_ms: u64) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        let mut samples = self.samples.lock().expect("delivery samples poisoned");
        if samples.len() >= DELIVERY_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(elapsed_ms);
    }

    fn average_ms(&self) -> f64 {
        let samples = self.samples.lock().expect("delivery samples poisoned");
        if samples.is_empty() {
            0.0
        } else {
            samples.iter().sum::<u64>() as f64 / samples.len() as f64
        }
    }
}

/// The webhook dispatcher.
pub struct WebhookDispatcher {
    http: reqwest::Client,
    governor: Arc<RequestGovernor>,
    zones: Arc<ZoneManager>,
    settings: DispatcherSettings,
    /// Collection the server-side hook intents watch.
    hook_collection: String,
    hooks: RwLock<HashMap<Uuid, WebhookConfig>>,
    queue: Mutex<VecDeque<GeofenceEvent>>,
    stats: DeliveryStats,
    bus: ObservationBus,
}

impl WebhookDispatcher {
    pub fn new(
        governor: Arc<RequestGovernor>,
        zones: Arc<ZoneManager>,
        settings: DispatcherSettings,
        hook_collection: String,
        bus: ObservationBus,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            governor,
            zones,
            settings,
            hook_collection,
            hooks: RwLock::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            stats: DeliveryStats::default(),
            bus,
        }
    }

    // ========== Subscription management ==========

    /// Validate and store a new webhook subscription.
    #[instrument(skip(self, registration), fields(name = %registration.name))]
    pub async fn register_webhook(&self, registration: WebhookRegistration) -> Result<WebhookConfig> {
        if registration.name.trim().is_empty() {
            return Err(EngineError::validation("name", "must not be empty"));
        }
        if registration.event_types.is_empty() {
            return Err(EngineError::validation(
                "eventTypes",
                "at least one event type is required",
            ));
        }
        validate_url(&registration.url)?;
        self.preflight(&registration.url).await?;

        let now = Utc::now();
        let webhook = WebhookConfig {
            id: Uuid::new_v4(),
            name: registration.name,
            url: registration.url,
            secret: registration.secret,
            enabled: registration.enabled,
            zone_ids: registration.zone_ids,
            zone_types: registration.zone_types,
            event_types: registration.event_types,
            retry: registration.retry.unwrap_or_default(),
            headers: registration.headers,
            created_at: now,
            updated_at: now,
        };

        self.sync_hook_intents(&webhook).await;
        self.hooks.write().await.insert(webhook.id, webhook.clone());
        info!(webhook_id = %webhook.id, url = %webhook.url, "webhook registered");
        Ok(webhook)
    }

    /// Apply a partial update; URL changes are re-validated and hook intents
    /// re-synchronized.
    #[instrument(skip(self, patch), fields(webhook_id = %id))]
    pub async fn update_webhook(&self, id: Uuid, patch: WebhookPatch) -> Result<WebhookConfig> {
        let mut webhook = self.get_webhook(id).await?;

        let url_changed = patch.url.as_deref().is_some_and(|u| u != webhook.url);
        if let Some(url) = patch.url {
            validate_url(&url)?;
            webhook.url = url;
        }
        if url_changed {
            self.preflight(&webhook.url).await?;
        }
        if let Some(name) = patch.name {
            if name.trim().is_empty() {
                return Err(EngineError::validation("name", "must not be empty"));
            }
            webhook.name = name;
        }
        if let Some(secret) = patch.secret {
            webhook.secret = Some(secret);
        }
        if let Some(enabled) = patch.enabled {
            webhook.enabled = enabled;
        }
        let zones_changed = patch.zone_ids.is_some();
        if let Some(zone_ids) = patch.zone_ids {
            webhook.zone_ids = zone_ids;
        }
        if let Some(zone_types) = patch.zone_types {
            webhook.zone_types = zone_types;
        }
        if let Some(event_types) = patch.event_types {
            if event_types.is_empty() {
                return Err(EngineError::validation(
                    "eventTypes",
                    "at least one event type is required",
                ));
            }
            webhook.event_types = event_types;
        }
        if let Some(retry) = patch.retry {
            webhook.retry = retry;
        }
        if let Some(headers) = patch.headers {
            webhook.headers = headers;
        }
        webhook.updated_at = Utc::now();

        if url_changed || zones_changed {
            self.clear_hook_intents(id).await;
            self.sync_hook_intents(&webhook).await;
        }
        self.hooks.write().await.insert(id, webhook.clone());
        info!(webhook_id = %id, "webhook updated");
        Ok(webhook)
    }

    /// Remove a subscription and its hook intents.
    #[instrument(skip(self), fields(webhook_id = %id))]
    pub async fn remove_webhook(&self, id: Uuid) -> Result<()> {
        let removed = self.hooks.write().await.remove(&id);
        if removed.is_none() {
            return Err(EngineError::NotFound {
                entity: "webhook",
                id: id.to_string(),
            });
        }
        self.clear_hook_intents(id).await;
        info!(webhook_id = %id, "webhook removed");
        Ok(())
    }

    pub async fn get_webhook(&self, id: Uuid) -> Result<WebhookConfig> {
        self.hooks
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound {
                entity: "webhook",
                id: id.to_string(),
            })
    }

    pub async fn list_webhooks(&self) -> Vec<WebhookConfig> {
        self.hooks.read().await.values().cloned().collect()
    }

    /// Send a deterministic test event through the delivery path without
    /// touching delivery statistics.
    #[instrument(skip(self), fields(webhook_id = %id))]
    pub async fn test_webhook(&self, id: Uuid) -> Result<()> {
        let webhook = self.get_webhook(id).await?;
        let event = test_event(&webhook);
        self.deliver(&webhook, &event, false).await
    }

    // ========== Delivery queue ==========

    /// Queue an event for delivery.
    pub async fn enqueue(&self, event: GeofenceEvent) {
        let depth = {
            let mut queue = self.queue.lock().await;
            queue.push_back(event);
            queue.len()
        };
        if depth > self.settings.queue_warn_depth {
            self.bus.emit(Observation::QueueOverflow {
                component: "webhooks",
                depth,
            });
        }
    }

    /// Current delivery-queue depth.
    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Drain up to one batch from the queue. Returns the number of events
    /// taken.
    pub async fn drain_once(self: &Arc<Self>) -> usize {
        let batch: Vec<GeofenceEvent> = {
            let mut queue = self.queue.lock().await;
            let take = queue.len().min(self.settings.batch_size);
            queue.drain(..take).collect()
        };
        if batch.is_empty() {
            return 0;
        }

        let hooks = self.hooks.read().await.clone();
        let mut deliveries = JoinSet::new();
        for event in batch.iter() {
            for webhook in hooks.values().filter(|w| w.matches(event)) {
                let dispatcher = Arc::clone(self);
                let webhook = webhook.clone();
                let event = event.clone();
                // Bounded concurrency: wait for a slot past the cap.
                while deliveries.len() >= self.settings.concurrency {
                    let _ = deliveries.join_next().await;
                }
                deliveries.spawn(async move {
                    let _ = dispatcher.deliver(&webhook, &event, true).await;
                });
            }
        }
        while deliveries.join_next().await.is_some() {}
        batch.len()
    }

    /// Deliver one event to one webhook with its retry policy.
    async fn deliver(
        &self,
        webhook: &WebhookConfig,
        event: &GeofenceEvent,
        record_stats: bool,
    ) -> Result<()> {
        let payload = self.build_payload(webhook, event).await;
        let mut last_error = String::new();

        for attempt in 0..=webhook.retry.max_retries {
            if attempt > 0 {
                tokio::time::sleep(webhook.retry.delay_before(attempt)).await;
            }
            let started = Instant::now();
            match self.post(webhook, &payload).await {
                Ok(()) => {
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    if record_stats {
                        self.stats.record(elapsed_ms);
                    }
                    self.bus.emit(Observation::WebhookDelivered {
                        webhook_id: webhook.id,
                        event_id: event.id,
                        elapsed_ms,
                    });
                    debug!(webhook_id = %webhook.id, event_id = %event.id, elapsed_ms, "webhook delivered");
                    return Ok(());
                }
                Err(e) => {
                    debug!(webhook_id = %webhook.id, attempt, error = %e, "webhook delivery attempt failed");
                    last_error = e;
                }
            }
        }

        if record_stats {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.bus.emit(Observation::WebhookFailed {
            webhook_id: webhook.id,
            event_id: event.id,
            error: last_error.clone(),
        });
        warn!(webhook_id = %webhook.id, event_id = %event.id, error = %last_error, "webhook delivery exhausted retries");
        Err(EngineError::WebhookDeliveryFailed {
            webhook_id: webhook.id,
            message: last_error,
        })
    }

    async fn post(&self, webhook: &WebhookConfig, payload: &WebhookPayload) -> std::result::Result<(), String> {
        let mut request = self
            .http
            .post(&webhook.url)
            .timeout(self.settings.timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(
                reqwest::header::USER_AGENT,
                "Smart-Tourist-Safety-Webhook/1.0",
            );
        for (key, value) in &webhook.headers {
            request = request.header(key, value);
        }
        let response = request
            .json(payload)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("status {}", response.status().as_u16()))
        }
    }

    /// Assemble the POST body, signing the JSON `event` field when the
    /// webhook carries a secret.
    async fn build_payload(&self, webhook: &WebhookConfig, event: &GeofenceEvent) -> WebhookPayload {
        let zone = self.zones.get_zone(event.zone_id).await.ok();
        let signature = webhook
            .secret
            .as_deref()
            .and_then(|secret| sign_event(secret, event));
        WebhookPayload {
            event: event.clone(),
            zone,
            user: WebhookUser {
                id: event.user_id.clone(),
            },
            timestamp: Utc::now(),
            signature,
        }
    }

    /// Delivery statistics snapshot.
    pub async fn statistics(&self) -> WebhookStatistics {
        WebhookStatistics {
            total_deliveries: self.stats.delivered.load(Ordering::Relaxed),
            failed_deliveries: self.stats.failed.load(Ordering::Relaxed),
            queue_size: self.queue.lock().await.len(),
            average_delivery_ms: self.stats.average_ms(),
            webhook_count: self.hooks.read().await.len(),
        }
    }

    // ========== Hook intents ==========

    /// Place one server-side hook intent per filtered zone. Best effort: the
    /// engine's own sweep is the source of truth, so failures only log.
    async fn sync_hook_intents(&self, webhook: &WebhookConfig) {
        for zone_id in &webhook.zone_ids {
            let zone = match self.zones.get_zone(*zone_id).await {
                Ok(zone) => zone,
                Err(e) => {
                    warn!(webhook_id = %webhook.id, zone_id = %zone_id, error = %e, "skipping hook intent for unknown zone");
                    continue;
                }
            };
            let command = Command::SetHook {
                name: hook_intent_name(webhook.id, *zone_id),
                url: webhook.url.clone(),
                collection: self.hook_collection.clone(),
                ring: zone.coordinates.clone(),
            };
            if let Err(e) = self.governor.execute_write(command, PRIORITY_HIGH).await {
                warn!(webhook_id = %webhook.id, zone_id = %zone_id, error = %e, "failed to place hook intent");
            }
        }
    }

    async fn clear_hook_intents(&self, webhook_id: Uuid) {
        let command = Command::DelHook {
            pattern: format!("wh-{webhook_id}-*"),
        };
        if let Err(e) = self.governor.execute_write(command, PRIORITY_HIGH).await {
            warn!(webhook_id = %webhook_id, error = %e, "failed to clear hook intents");
        }
    }

    /// HEAD pre-flight: the target must answer with a status below 400.
    async fn preflight(&self, url: &str) -> Result<()> {
        let response = self
            .http
            .head(url)
            .timeout(self.settings.validation_timeout)
            .send()
            .await
            .map_err(|e| EngineError::validation("url", format!("unreachable: {e}")))?;
        if response.status().as_u16() < 400 {
            Ok(())
        } else {
            Err(EngineError::validation(
                "url",
                format!("pre-flight returned status {}", response.status().as_u16()),
            ))
        }
    }

    // ========== Drain loop ==========

    /// Spawn the delivery drain timer. Performs one final drain on shutdown.
    pub fn spawn_drainer(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                interval_ms = dispatcher.settings.drain_interval.as_millis() as u64,
                batch_size = dispatcher.settings.batch_size,
                "webhook drainer started"
            );
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            dispatcher.drain_once().await;
                            break;
                        }
                    }

                    _ = tokio::time::sleep(dispatcher.settings.drain_interval) => {
                        dispatcher.drain_once().await;
                    }
                }
            }
            info!("webhook drainer stopped");
        })
    }
}

/// `wh-<webhookId>-<zoneId>`, matched by `wh-<webhookId>-*` on removal.
fn hook_intent_name(webhook_id: Uuid, zone_id: Uuid) -> String {
    format!("wh-{webhook_id}-{zone_id}")
}

fn validate_url(url: &str) -> Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(EngineError::validation(
            "url",
            "must be an absolute http(s) URL",
        ))
    }
}

/// Hex HMAC-SHA256 over the UTF-8 JSON of the event.
pub fn sign_event(secret: &str, event: &GeofenceEvent) -> Option<String> {
    let json = serde_json::to_string(event).ok()?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(json.as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Deterministic event used by `test_webhook`.
fn test_event(webhook: &WebhookConfig) -> GeofenceEvent {
    GeofenceEvent {
        id: Uuid::nil(),
        user_id: "webhook-test-user".to_string(),
        zone_id: webhook.zone_ids.first().copied().unwrap_or(Uuid::nil()),
        zone_name: "Webhook Test Zone".to_string(),
        zone_type: webhook
            .zone_types
            .first()
            .copied()
            .unwrap_or(crate::types::ZoneType::Safe),
        event_type: webhook
            .event_types
            .first()
            .copied()
            .unwrap_or(GeofenceEventType::Inside),
        coordinate: Coordinate { lat: 0.0, lon: 0.0 },
        timestamp: Utc::now(),
        processed: false,
        webhook_delivered: false,
        metadata: EventMetadata {
            alert_level: AlertLevel::Low,
            event_source: "test".to_string(),
            previous_zone_id: None,
            time_in_zone_secs: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RetryConfig;

    fn sample_event() -> GeofenceEvent {
        GeofenceEvent {
            id: Uuid::new_v4(),
            user_id: "u1".to_string(),
            zone_id: Uuid::new_v4(),
            zone_name: "Old Town".to_string(),
            zone_type: crate::types::ZoneType::Safe,
            event_type: GeofenceEventType::Inside,
            coordinate: Coordinate { lat: 28.6144, lon: 77.2095 },
            timestamp: Utc::now(),
            processed: false,
            webhook_delivered: false,
            metadata: EventMetadata {
                alert_level: AlertLevel::Low,
                event_source: "sweep".to_string(),
                previous_zone_id: None,
                time_in_zone_secs: None,
            },
        }
    }

    #[test]
    fn test_validate_url() {
        assert!(validate_url("https://example.com/hook").is_ok());
        assert!(validate_url("http://10.0.0.1/hook").is_ok());
        assert!(validate_url("ftp://example.com").is_err());
        assert!(validate_url("example.com/hook").is_err());
    }

    #[test]
    fn test_hook_intent_name_pattern() {
        let webhook_id = Uuid::new_v4();
        let zone_id = Uuid::new_v4();
        let name = hook_intent_name(webhook_id, zone_id);
        assert!(name.starts_with(&format!("wh-{webhook_id}-")));
        assert!(name.ends_with(&zone_id.to_string()));
    }

    #[test]
    fn test_sign_event_is_deterministic() {
        let event = sample_event();
        let a = sign_event("s3cr3t", &event).unwrap();
        let b = sign_event("s3cr3t", &event).unwrap();
        assert_eq!(a, b);
        // Hex-encoded SHA-256 output.
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_sign_event_depends_on_secret_and_event() {
        let event = sample_event();
        let a = sign_event("s3cr3t", &event).unwrap();
        let b = sign_event("other", &event).unwrap();
        assert_ne!(a, b);

        let mut changed = event.clone();
        changed.user_id = "u2".to_string();
        let c = sign_event("s3cr3t", &changed).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_signature_matches_manual_hmac_of_event_json() {
        // Invariant: the signature is the HMAC of the JSON `event` field
        // exactly as serialized into the payload.
        let event = sample_event();
        let signature = sign_event("s3cr3t", &event).unwrap();

        let json = serde_json::to_string(&event).unwrap();
        let mut mac = HmacSha256::new_from_slice(b"s3cr3t").unwrap();
        mac.update(json.as_bytes());
        assert_eq!(signature, hex::encode(mac.finalize().into_bytes()));
    }

    #[test]
    fn test_test_event_is_deterministic_id() {
        let webhook = WebhookConfig {
            id: Uuid::new_v4(),
            name: "t".to_string(),
            url: "https://example.com".to_string(),
            secret: None,
            enabled: true,
            zone_ids: Vec::new(),
            zone_types: Vec::new(),
            event_types: vec![GeofenceEventType::Enter],
            retry: RetryConfig::default(),
            headers: Default::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let event = test_event(&webhook);
        assert_eq!(event.id, Uuid::nil());
        assert_eq!(event.event_type, GeofenceEventType::Enter);
        assert_eq!(event.metadata.event_source, "test");
    }
}
