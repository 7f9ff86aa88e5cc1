// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Coordinate and bounding-box types plus length-unit conversion.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum number of vertices accepted in a zone ring (before auto-closure).
pub const MAX_RING_VERTICES: usize = 100;

/// Minimum accepted zone area in square meters.
pub const MIN_ZONE_AREA_M2: f64 = 100.0;

/// Maximum accepted zone area in square meters.
pub const MAX_ZONE_AREA_M2: f64 = 1e9;

/// Maximum radius for nearby queries, in meters.
pub const MAX_QUERY_RADIUS_M: f64 = 100_000.0;

/// Errors produced by geometry validation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeoError {
    #[error("latitude {0} out of range [-90, 90]")]
    InvalidLatitude(f64),

    #[error("longitude {0} out of range [-180, 180]")]
    InvalidLongitude(f64),

    #[error("polygon ring needs at least 3 distinct vertices, got {0}")]
    RingTooSmall(usize),

    #[error("polygon ring exceeds {MAX_RING_VERTICES} vertices, got {0}")]
    RingTooLarge(usize),

    #[error("polygon ring is self-intersecting")]
    SelfIntersecting,

    #[error("polygon area {0:.2} m2 outside [{MIN_ZONE_AREA_M2}, {MAX_ZONE_AREA_M2}] m2")]
    AreaOutOfRange(f64),

    #[error("radius {0} m outside (0, {MAX_QUERY_RADIUS_M}] m")]
    InvalidRadius(f64),
}

/// A geographic point. Latitude and longitude in degrees, WGS-84.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    /// Construct a validated coordinate.
    ///
    /// The poles and the antimeridian are accepted (inclusive bounds).
    pub fn new(lat: f64, lon: f64) -> Result<Self, GeoError> {
        if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
            return Err(GeoError::InvalidLatitude(lat));
        }
        if !lon.is_finite() || !(-180.0..=180.0).contains(&lon) {
            return Err(GeoError::InvalidLongitude(lon));
        }
        Ok(Self { lat, lon })
    }

    /// Check the stored values without constructing.
    pub fn is_valid(&self) -> bool {
        Self::new(self.lat, self.lon).is_ok()
    }
}

/// Axis-aligned bounding box derived from a polygon ring.
///
/// Invariant: `min <= max` on both axes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    /// Compute the bounding box of a non-empty ring.
    ///
    /// Returns `None` for an empty ring.
    pub fn from_ring(ring: &[Coordinate]) -> Option<Self> {
        let first = ring.first()?;
        let mut bbox = Self {
            min_lat: first.lat,
            max_lat: first.lat,
            min_lon: first.lon,
            max_lon: first.lon,
        };
        for c in &ring[1..] {
            bbox.min_lat = bbox.min_lat.min(c.lat);
            bbox.max_lat = bbox.max_lat.max(c.lat);
            bbox.min_lon = bbox.min_lon.min(c.lon);
            bbox.max_lon = bbox.max_lon.max(c.lon);
        }
        Some(bbox)
    }

    /// Whether the point lies inside or on the edge of the box.
    pub fn contains(&self, c: &Coordinate) -> bool {
        c.lat >= self.min_lat && c.lat <= self.max_lat && c.lon >= self.min_lon && c.lon <= self.max_lon
    }

    /// Whether two boxes share any area (touching edges count).
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_lat <= other.max_lat
            && self.max_lat >= other.min_lat
            && self.min_lon <= other.max_lon
            && self.max_lon >= other.min_lon
    }
}

/// Length units supported by the distance surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LengthUnit {
    Meters,
    Kilometers,
    Miles,
    Feet,
    NauticalMiles,
}

impl LengthUnit {
    /// Meters per one unit.
    pub fn to_meters(&self) -> f64 {
        match self {
            Self::Meters => 1.0,
            Self::Kilometers => 1000.0,
            Self::Miles => 1609.344,
            Self::Feet => 0.3048,
            Self::NauticalMiles => 1852.0,
        }
    }

    /// Convert a value between units.
    pub fn convert(value: f64, from: LengthUnit, to: LengthUnit) -> f64 {
        value * from.to_meters() / to.to_meters()
    }
}
