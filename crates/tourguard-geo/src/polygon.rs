// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Polygon predicates for zone geometry.
//!
//! Rings are ordered vertex lists in `(lat, lon)` degrees. Predicates
//! (intersection, containment, overlap) work in degree space, which is exact
//! for the planar topology questions they answer. Area uses the spherical
//! shoelace formula on the WGS-84 sphere.

use crate::coord::{
    BoundingBox, Coordinate, GeoError, MAX_RING_VERTICES, MAX_ZONE_AREA_M2, MIN_ZONE_AREA_M2,
};
use crate::distance::EARTH_RADIUS_M;

/// Tolerance for collinearity in the segment predicates, degree space.
const EPSILON: f64 = 1e-12;

/// Close a ring by appending the first vertex when first != last.
///
/// Empty rings are returned untouched.
pub fn close_ring(mut ring: Vec<Coordinate>) -> Vec<Coordinate> {
    if let (Some(first), Some(last)) = (ring.first().copied(), ring.last()) {
        if first != *last {
            ring.push(first);
        }
    }
    ring
}

/// Number of distinct vertices in a ring (the closing duplicate, if present,
/// is not counted).
fn distinct_vertices(ring: &[Coordinate]) -> usize {
    let mut seen: Vec<Coordinate> = Vec::with_capacity(ring.len());
    for c in ring {
        if !seen.contains(c) {
            seen.push(*c);
        }
    }
    seen.len()
}

/// Validate a zone ring against the zone-geometry invariants and return it
/// auto-closed.
///
/// Checks, in order: per-vertex coordinate ranges, vertex count (>= 3
/// distinct, <= [`MAX_RING_VERTICES`] supplied), self-intersection, and
/// spherical area within `[MIN_ZONE_AREA_M2, MAX_ZONE_AREA_M2]`.
pub fn validate_ring(coords: &[Coordinate]) -> Result<Vec<Coordinate>, GeoError> {
    for c in coords {
        Coordinate::new(c.lat, c.lon)?;
    }

    // Count supplied vertices without the closing duplicate.
    let supplied = if coords.len() >= 2 && coords.first() == coords.last() {
        coords.len() - 1
    } else {
        coords.len()
    };
    if supplied > MAX_RING_VERTICES {
        return Err(GeoError::RingTooLarge(supplied));
    }

    let distinct = distinct_vertices(coords);
    if distinct < 3 {
        return Err(GeoError::RingTooSmall(distinct));
    }

    let ring = close_ring(coords.to_vec());

    if is_self_intersecting(&ring) {
        return Err(GeoError::SelfIntersecting);
    }

    let area = spherical_area_m2(&ring);
    if !(MIN_ZONE_AREA_M2..=MAX_ZONE_AREA_M2).contains(&area) {
        return Err(GeoError::AreaOutOfRange(area));
    }

    Ok(ring)
}

/// Orientation of the ordered triple (p, q, r) in (lon, lat) space.
///
/// Positive = counter-clockwise, negative = clockwise, zero = collinear.
fn orientation(p: &Coordinate, q: &Coordinate, r: &Coordinate) -> f64 {
    (q.lon - p.lon) * (r.lat - p.lat) - (q.lat - p.lat) * (r.lon - p.lon)
}

/// Whether q lies on the closed segment p-r, assuming the three are collinear.
fn on_segment(p: &Coordinate, q: &Coordinate, r: &Coordinate) -> bool {
    q.lon <= p.lon.max(r.lon) + EPSILON
        && q.lon >= p.lon.min(r.lon) - EPSILON
        && q.lat <= p.lat.max(r.lat) + EPSILON
        && q.lat >= p.lat.min(r.lat) - EPSILON
}

/// Segment intersection test with collinear-overlap handling.
pub fn segments_intersect(
    p1: &Coordinate,
    p2: &Coordinate,
    p3: &Coordinate,
    p4: &Coordinate,
) -> bool {
    let o1 = orientation(p1, p2, p3);
    let o2 = orientation(p1, p2, p4);
    let o3 = orientation(p3, p4, p1);
    let o4 = orientation(p3, p4, p2);

    if (o1 > EPSILON && o2 < -EPSILON || o1 < -EPSILON && o2 > EPSILON)
        && (o3 > EPSILON && o4 < -EPSILON || o3 < -EPSILON && o4 > EPSILON)
    {
        return true;
    }

    // Collinear cases: an endpoint of one segment lying on the other.
    (o1.abs() <= EPSILON && on_segment(p1, p3, p2))
        || (o2.abs() <= EPSILON && on_segment(p1, p4, p2))
        || (o3.abs() <= EPSILON && on_segment(p3, p1, p4))
        || (o4.abs() <= EPSILON && on_segment(p3, p2, p4))
}

/// Whether a closed ring self-intersects.
///
/// Adjacent segments (sharing a vertex) are exempt; any other pair touching
/// counts, including collinear overlap.
pub fn is_self_intersecting(ring: &[Coordinate]) -> bool {
    if ring.len() < 4 {
        return false;
    }
    let n = ring.len() - 1; // segment count of the closed ring
    for i in 0..n {
        for j in (i + 1)..n {
            // Skip adjacent segments and the first/last pair that share the
            // closing vertex.
            if j == i + 1 || (i == 0 && j == n - 1) {
                continue;
            }
            if segments_intersect(&ring[i], &ring[i + 1], &ring[j], &ring[j + 1]) {
                return true;
            }
        }
    }
    false
}

/// Ray-casting point-in-polygon on (lon, lat).
///
/// The ring may be open or closed; boundary behavior follows the classic
/// crossing rule.
pub fn contains_point(ring: &[Coordinate], point: &Coordinate) -> bool {
    if ring.len() < 3 {
        return false;
    }
    let mut inside = false;
    let n = ring.len();
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = (ring[i].lon, ring[i].lat);
        let (xj, yj) = (ring[j].lon, ring[j].lat);
        if ((yi > point.lat) != (yj > point.lat))
            && point.lon < (xj - xi) * (point.lat - yi) / (yj - yi) + xi
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Whether two rings overlap: any vertex of one inside the other, or any
/// edge pair intersecting.
pub fn polygons_overlap(a: &[Coordinate], b: &[Coordinate]) -> bool {
    if a.len() < 3 || b.len() < 3 {
        return false;
    }

    // Cheap reject on bounding boxes first.
    match (BoundingBox::from_ring(a), BoundingBox::from_ring(b)) {
        (Some(ba), Some(bb)) if !ba.intersects(&bb) => return false,
        _ => {}
    }

    if a.iter().any(|v| contains_point(b, v)) || b.iter().any(|v| contains_point(a, v)) {
        return true;
    }

    let closed_a = close_ring(a.to_vec());
    let closed_b = close_ring(b.to_vec());
    for i in 0..closed_a.len() - 1 {
        for j in 0..closed_b.len() - 1 {
            if segments_intersect(&closed_a[i], &closed_a[i + 1], &closed_b[j], &closed_b[j + 1]) {
                return true;
            }
        }
    }
    false
}

/// Spherical shoelace area of a ring, in square meters.
///
/// The ring may be open or closed. Result is orientation-independent.
pub fn spherical_area_m2(ring: &[Coordinate]) -> f64 {
    if ring.len() < 3 {
        return 0.0;
    }
    let closed = close_ring(ring.to_vec());
    let mut sum = 0.0;
    for w in closed.windows(2) {
        let lambda1 = w[0].lon.to_radians();
        let lambda2 = w[1].lon.to_radians();
        let phi1 = w[0].lat.to_radians();
        let phi2 = w[1].lat.to_radians();
        sum += (lambda2 - lambda1) * (2.0 + phi1.sin() + phi2.sin());
    }
    (sum * EARTH_RADIUS_M * EARTH_RADIUS_M / 2.0).abs()
}

/// Arithmetic centroid of the distinct ring vertices.
///
/// Adequate for the small zones this engine manages; not an area-weighted
/// centroid.
pub fn centroid(ring: &[Coordinate]) -> Option<Coordinate> {
    let open: &[Coordinate] = if ring.len() >= 2 && ring.first() == ring.last() {
        &ring[..ring.len() - 1]
    } else {
        ring
    };
    if open.is_empty() {
        return None;
    }
    let n = open.len() as f64;
    Some(Coordinate {
        lat: open.iter().map(|c| c.lat).sum::<f64>() / n,
        lon: open.iter().map(|c| c.lon).sum::<f64>() / n,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(lat: f64, lon: f64) -> Coordinate {
        Coordinate { lat, lon }
    }

    fn delhi_square() -> Vec<Coordinate> {
        vec![
            c(28.6139, 77.2090),
            c(28.6139, 77.2100),
            c(28.6149, 77.2100),
            c(28.6149, 77.2090),
        ]
    }

    fn unit_square() -> Vec<Coordinate> {
        vec![c(0.0, 0.0), c(0.0, 1.0), c(1.0, 1.0), c(1.0, 0.0)]
    }

    #[test]
    fn test_close_ring_appends_first() {
        let closed = close_ring(delhi_square());
        assert_eq!(closed.len(), 5);
        assert_eq!(closed.first(), closed.last());
    }

    #[test]
    fn test_close_ring_idempotent() {
        let once = close_ring(delhi_square());
        let twice = close_ring(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_validate_ring_accepts_square() {
        let ring = validate_ring(&delhi_square()).unwrap();
        assert_eq!(ring.first(), ring.last());
        assert_eq!(ring.len(), 5);
    }

    #[test]
    fn test_validate_ring_accepts_triangle() {
        let tri = vec![c(28.6139, 77.2090), c(28.6139, 77.2100), c(28.6149, 77.2095)];
        assert!(validate_ring(&tri).is_ok());
    }

    #[test]
    fn test_validate_ring_rejects_two_vertices() {
        let two = vec![c(0.0, 0.0), c(0.0, 1.0)];
        assert!(matches!(validate_ring(&two), Err(GeoError::RingTooSmall(2))));
    }

    #[test]
    fn test_validate_ring_rejects_duplicate_only_vertices() {
        // Three supplied vertices but only two distinct.
        let dup = vec![c(0.0, 0.0), c(0.0, 1.0), c(0.0, 0.0)];
        assert!(matches!(validate_ring(&dup), Err(GeoError::RingTooSmall(2))));
    }

    #[test]
    fn test_validate_ring_vertex_count_boundary() {
        // 100 vertices accepted, 101 rejected. Build a circle-ish ring with
        // ~1 km radius so the area constraint is comfortably satisfied.
        let make_ring = |n: usize| -> Vec<Coordinate> {
            (0..n)
                .map(|i| {
                    let theta = 2.0 * std::f64::consts::PI * (i as f64) / (n as f64);
                    c(28.6 + 0.01 * theta.cos(), 77.2 + 0.01 * theta.sin())
                })
                .collect()
        };
        assert!(validate_ring(&make_ring(100)).is_ok());
        assert!(matches!(
            validate_ring(&make_ring(101)),
            Err(GeoError::RingTooLarge(101))
        ));
    }

    #[test]
    fn test_validate_ring_rejects_bowtie() {
        // Vertices ordered so the edges cross.
        let bowtie = vec![c(0.0, 0.0), c(0.0, 1.0), c(1.0, 0.0), c(1.0, 1.0)];
        assert!(matches!(
            validate_ring(&bowtie),
            Err(GeoError::SelfIntersecting)
        ));
    }

    #[test]
    fn test_validate_ring_rejects_tiny_area() {
        // ~5 m square, well under the 100 m2 floor.
        let tiny = vec![
            c(28.61390, 77.20900),
            c(28.61390, 77.20905),
            c(28.61394, 77.20905),
            c(28.61394, 77.20900),
        ];
        assert!(matches!(
            validate_ring(&tiny),
            Err(GeoError::AreaOutOfRange(_))
        ));
    }

    #[test]
    fn test_validate_ring_rejects_invalid_vertex() {
        let bad = vec![c(0.0, 0.0), c(0.0, 1.0), c(91.0, 0.5)];
        assert!(matches!(
            validate_ring(&bad),
            Err(GeoError::InvalidLatitude(_))
        ));
    }

    #[test]
    fn test_self_intersection_square_ok() {
        assert!(!is_self_intersecting(&close_ring(unit_square())));
    }

    #[test]
    fn test_self_intersection_bowtie() {
        let bowtie = close_ring(vec![c(0.0, 0.0), c(0.0, 1.0), c(1.0, 0.0), c(1.0, 1.0)]);
        assert!(is_self_intersecting(&bowtie));
    }

    #[test]
    fn test_segments_intersect_crossing() {
        assert!(segments_intersect(
            &c(0.0, 0.0),
            &c(1.0, 1.0),
            &c(0.0, 1.0),
            &c(1.0, 0.0)
        ));
    }

    #[test]
    fn test_segments_intersect_parallel() {
        assert!(!segments_intersect(
            &c(0.0, 0.0),
            &c(0.0, 1.0),
            &c(1.0, 0.0),
            &c(1.0, 1.0)
        ));
    }

    #[test]
    fn test_segments_intersect_collinear_overlap() {
        assert!(segments_intersect(
            &c(0.0, 0.0),
            &c(0.0, 2.0),
            &c(0.0, 1.0),
            &c(0.0, 3.0)
        ));
    }

    #[test]
    fn test_contains_point_inside() {
        assert!(contains_point(&delhi_square(), &c(28.6144, 77.2095)));
    }

    #[test]
    fn test_contains_point_outside() {
        assert!(!contains_point(&delhi_square(), &c(28.6160, 77.2095)));
        assert!(!contains_point(&delhi_square(), &c(28.6144, 77.2110)));
    }

    #[test]
    fn test_contains_point_works_on_closed_ring() {
        let closed = close_ring(delhi_square());
        assert!(contains_point(&closed, &c(28.6144, 77.2095)));
    }

    #[test]
    fn test_polygons_overlap_offset_squares() {
        // Scenario: unit square vs half-offset square.
        let a = unit_square();
        let b = vec![c(0.5, 0.5), c(0.5, 1.5), c(1.5, 1.5), c(1.5, 0.5)];
        assert!(polygons_overlap(&a, &b));
        assert!(polygons_overlap(&b, &a));
    }

    #[test]
    fn test_polygons_overlap_contained() {
        let outer = unit_square();
        let inner = vec![c(0.25, 0.25), c(0.25, 0.75), c(0.75, 0.75), c(0.75, 0.25)];
        assert!(polygons_overlap(&outer, &inner));
    }

    #[test]
    fn test_polygons_disjoint() {
        let a = unit_square();
        let b = vec![c(5.0, 5.0), c(5.0, 6.0), c(6.0, 6.0), c(6.0, 5.0)];
        assert!(!polygons_overlap(&a, &b));
    }

    #[test]
    fn test_spherical_area_delhi_square() {
        // ~111 m x ~98 m at 28.6 degrees north.
        let area = spherical_area_m2(&delhi_square());
        assert!((area - 10_800.0).abs() < 500.0, "got {area}");
    }

    #[test]
    fn test_spherical_area_orientation_independent() {
        let mut reversed = delhi_square();
        reversed.reverse();
        let a1 = spherical_area_m2(&delhi_square());
        let a2 = spherical_area_m2(&reversed);
        assert!((a1 - a2).abs() < 1e-6);
    }

    #[test]
    fn test_centroid() {
        let center = centroid(&delhi_square()).unwrap();
        assert!((center.lat - 28.6144).abs() < 1e-9);
        assert!((center.lon - 77.2095).abs() < 1e-9);
    }

    #[test]
    fn test_centroid_ignores_closing_vertex() {
        let open = centroid(&delhi_square()).unwrap();
        let closed = centroid(&close_ring(delhi_square())).unwrap();
        assert!((open.lat - closed.lat).abs() < 1e-12);
        assert!((open.lon - closed.lon).abs() < 1e-12);
    }
}
