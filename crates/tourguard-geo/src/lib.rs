// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pure geospatial primitives for the tourguard geofencing engine.
//!
//! Everything in this crate is side-effect free: coordinate and bounding-box
//! types, distance algorithms (Haversine and Vincenty on WGS-84), length-unit
//! conversion, and the polygon predicates the zone manager builds on
//! (auto-closure, self-intersection, point-in-polygon, overlap, spherical
//! area).
//!
//! Coordinates are stored `(lat, lon)` throughout. The `(lon, lat)` order many
//! wire formats use appears only where those formats are produced, never here.

pub mod coord;
pub mod distance;
pub mod polygon;

pub use coord::{
    BoundingBox, Coordinate, GeoError, LengthUnit, MAX_QUERY_RADIUS_M, MAX_RING_VERTICES,
    MAX_ZONE_AREA_M2, MIN_ZONE_AREA_M2,
};
pub use distance::{DistanceAlgorithm, distance, distance_in, distance_matrix, nearest};
pub use polygon::{close_ring, contains_point, is_self_intersecting, polygons_overlap, spherical_area_m2, validate_ring};
