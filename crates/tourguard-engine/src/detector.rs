// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Geofence event detector.
//!
//! Two paths produce events:
//! - the periodic sweep pulls a batch of active zones and asks the index who
//!   is inside each one;
//! - the per-update path (`process_location`) checks a single user's point
//!   against the zones containing it, used by the synchronous and bulk write
//!   paths.
//!
//! Both maintain a per-user membership set and diff it: new membership emits
//! `enter`, retained membership emits `inside`, lost membership emits `exit`
//! with the time spent in the zone. A sweep only diffs the zones it actually
//! examined this tick, so a zone outside the current batch never produces a
//! false exit.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use tourguard_geo::Coordinate;

use crate::config::DetectorSettings;
use crate::error::Result;
use crate::locations::LocationIndexer;
use crate::sink::EventSink;
use crate::types::{
    AlertLevel, EventMetadata, GeofenceEvent, GeofenceEventType, LocationUpdate, WithinQuery, Zone,
    ZoneStatus,
};
use crate::webhooks::WebhookDispatcher;
use crate::zones::ZoneManager;

struct UserMembership {
    /// Zone id -> when the user entered it.
    zones: HashMap<Uuid, Instant>,
    last_coordinate: Coordinate,
}

/// The geofence event detector.
pub struct GeofenceDetector {
    zones: Arc<ZoneManager>,
    locations: Arc<LocationIndexer>,
    dispatcher: Arc<WebhookDispatcher>,
    sink: Arc<dyn EventSink>,
    settings: DetectorSettings,
    membership: RwLock<HashMap<String, UserMembership>>,
}

impl GeofenceDetector {
    pub fn new(
        zones: Arc<ZoneManager>,
        locations: Arc<LocationIndexer>,
        dispatcher: Arc<WebhookDispatcher>,
        sink: Arc<dyn EventSink>,
        settings: DetectorSettings,
    ) -> Self {
        Self {
            zones,
            locations,
            dispatcher,
            sink,
            settings,
            membership: RwLock::new(HashMap::new()),
        }
    }

    // ========== Periodic sweep ==========

    /// One sweep over up to `zone_batch_size` active zones. Returns the
    /// number of events emitted.
    #[instrument(skip(self))]
    pub async fn sweep_once(&self) -> Result<usize> {
        let zones = self.zones.active_zones(self.settings.zone_batch_size).await?;
        if zones.is_empty() {
            return Ok(0);
        }
        let swept: HashSet<Uuid> = zones.iter().map(|z| z.id).collect();
        let by_id: HashMap<Uuid, &Zone> = zones.iter().map(|z| (z.id, z)).collect();

        // Who is inside which zone right now.
        let mut present: HashMap<String, (Coordinate, HashSet<Uuid>)> = HashMap::new();
        for zone in &zones {
            let users = self
                .locations
                .find_within(WithinQuery {
                    bounds: None,
                    polygon: Some(zone.coordinates.clone()),
                    limit: None,
                })
                .await?;
            for user in users {
                let entry = present
                    .entry(user.user_id)
                    .or_insert_with(|| (user.coordinate, HashSet::new()));
                entry.0 = user.coordinate;
                entry.1.insert(zone.id);
            }
        }

        let mut events = Vec::new();
        {
            let mut membership = self.membership.write().await;

            for (user_id, (coordinate, inside_now)) in &present {
                let state = membership
                    .entry(user_id.clone())
                    .or_insert_with(|| UserMembership {
                        zones: HashMap::new(),
                        last_coordinate: *coordinate,
                    });
                state.last_coordinate = *coordinate;

                for zone_id in inside_now {
                    let zone = by_id[zone_id];
                    if state.zones.contains_key(zone_id) {
                        events.push(build_event(
                            zone,
                            user_id,
                            *coordinate,
                            GeofenceEventType::Inside,
                            "sweep",
                            None,
                            None,
                        ));
                    } else {
                        state.zones.insert(*zone_id, Instant::now());
                        events.push(build_event(
                            zone,
                            user_id,
                            *coordinate,
                            GeofenceEventType::Enter,
                            "sweep",
                            None,
                            None,
                        ));
                    }
                }

                events.extend(take_exits(state, &swept, inside_now, &by_id, user_id, "sweep"));
            }

            // Users we tracked that no zone reported this tick.
            let empty = HashSet::new();
            for (user_id, state) in membership.iter_mut() {
                if present.contains_key(user_id) {
                    continue;
                }
                events.extend(take_exits(state, &swept, &empty, &by_id, user_id, "sweep"));
            }

            membership.retain(|_, state| !state.zones.is_empty());
        }

        let count = events.len();
        for event in events {
            self.publish(event).await;
        }
        if count > 0 {
            debug!(events = count, zones = zones.len(), "sweep emitted events");
        }
        Ok(count)
    }

    // ========== Per-update path ==========

    /// Evaluate one user's fresh location against the zones containing it.
    /// The containment answer is authoritative for the user, so exits are
    /// diffed against the full membership set.
    #[instrument(skip(self, location), fields(user_id = %location.user_id))]
    pub async fn process_location(
        &self,
        location: &LocationUpdate,
        source: &str,
    ) -> Result<Vec<GeofenceEvent>> {
        let containing = self
            .zones
            .zones_containing_point(location.coordinate)
            .await?;
        let active: Vec<&Zone> = containing
            .iter()
            .filter(|z| z.status == ZoneStatus::Active)
            .collect();
        let inside_now: HashSet<Uuid> = active.iter().map(|z| z.id).collect();

        let mut events = Vec::new();
        {
            let mut membership = self.membership.write().await;
            let state = membership
                .entry(location.user_id.clone())
                .or_insert_with(|| UserMembership {
                    zones: HashMap::new(),
                    last_coordinate: location.coordinate,
                });
            state.last_coordinate = location.coordinate;

            // Exits first, so enter events can reference the zone just left.
            let exited: Vec<(Uuid, Instant)> = state
                .zones
                .iter()
                .filter(|(id, _)| !inside_now.contains(*id))
                .map(|(id, entered)| (*id, *entered))
                .collect();
            let previous_zone_id = (exited.len() == 1).then(|| exited[0].0);
            for (zone_id, entered) in exited {
                state.zones.remove(&zone_id);
                match self.zones.get_zone(zone_id).await {
                    Ok(zone) => events.push(build_event(
                        &zone,
                        &location.user_id,
                        location.coordinate,
                        GeofenceEventType::Exit,
                        source,
                        None,
                        Some(entered.elapsed().as_secs()),
                    )),
                    Err(e) => {
                        // Zone deleted while the user was inside; membership
                        // is already cleaned up.
                        debug!(zone_id = %zone_id, error = %e, "exited zone no longer resolvable");
                    }
                }
            }

            for zone in active {
                if state.zones.contains_key(&zone.id) {
                    events.push(build_event(
                        zone,
                        &location.user_id,
                        location.coordinate,
                        GeofenceEventType::Inside,
                        source,
                        None,
                        None,
                    ));
                } else {
                    state.zones.insert(zone.id, Instant::now());
                    events.push(build_event(
                        zone,
                        &location.user_id,
                        location.coordinate,
                        GeofenceEventType::Enter,
                        source,
                        previous_zone_id,
                        None,
                    ));
                }
            }

            if state.zones.is_empty() {
                membership.remove(&location.user_id);
            }
        }

        for event in &events {
            self.publish(event.clone()).await;
        }
        Ok(events)
    }

    /// On-demand path for externally generated events.
    pub async fn process_geofence_event(&self, event: GeofenceEvent) -> Result<()> {
        self.publish(event).await;
        Ok(())
    }

    /// Zones the user is currently believed to be inside.
    pub async fn memberships_of(&self, user_id: &str) -> Vec<Uuid> {
        self.membership
            .read()
            .await
            .get(user_id)
            .map(|state| state.zones.keys().copied().collect())
            .unwrap_or_default()
    }

    async fn publish(&self, event: GeofenceEvent) {
        if let Err(e) = self.sink.record_event(&event).await {
            warn!(event_id = %event.id, error = %e, "event sink rejected event");
        }
        self.dispatcher.enqueue(event).await;
    }

    // ========== Sweep loop ==========

    /// Spawn the periodic sweeper.
    pub fn spawn_sweeper(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let detector = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                interval_ms = detector.settings.check_interval.as_millis() as u64,
                zone_batch = detector.settings.zone_batch_size,
                "geofence sweeper started"
            );
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }

                    _ = tokio::time::sleep(detector.settings.check_interval) => {
                        if let Err(e) = detector.sweep_once().await {
                            warn!(error = %e, "geofence sweep failed");
                        }
                    }
                }
            }
            info!("geofence sweeper stopped");
        })
    }
}

/// Exit events for membership zones that were swept but no longer contain
/// the user. Only zones in `swept` are considered.
fn take_exits(
    state: &mut UserMembership,
    swept: &HashSet<Uuid>,
    inside_now: &HashSet<Uuid>,
    by_id: &HashMap<Uuid, &Zone>,
    user_id: &str,
    source: &str,
) -> Vec<GeofenceEvent> {
    let gone: Vec<Uuid> = state
        .zones
        .keys()
        .filter(|id| swept.contains(*id) && !inside_now.contains(*id))
        .copied()
        .collect();
    let mut events = Vec::with_capacity(gone.len());
    for zone_id in gone {
        let entered = state.zones.remove(&zone_id);
        if let Some(zone) = by_id.get(&zone_id) {
            events.push(build_event(
                zone,
                user_id,
                state.last_coordinate,
                GeofenceEventType::Exit,
                source,
                None,
                entered.map(|t| t.elapsed().as_secs()),
            ));
        }
    }
    events
}

fn build_event(
    zone: &Zone,
    user_id: &str,
    coordinate: Coordinate,
    event_type: GeofenceEventType,
    source: &str,
    previous_zone_id: Option<Uuid>,
    time_in_zone_secs: Option<u64>,
) -> GeofenceEvent {
    GeofenceEvent {
        id: Uuid::new_v4(),
        user_id: user_id.to_string(),
        zone_id: zone.id,
        zone_name: zone.name.clone(),
        zone_type: zone.zone_type,
        event_type,
        coordinate,
        timestamp: Utc::now(),
        processed: false,
        webhook_delivered: false,
        metadata: EventMetadata {
            alert_level: AlertLevel::from_risk_level(zone.risk_level),
            event_source: source.to_string(),
            previous_zone_id,
            time_in_zone_secs,
        },
    }
}
