// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Great-circle and ellipsoidal distance.
//!
//! Two algorithms are provided:
//! - **Haversine** on a sphere of radius 6 378 137 m. Cheap, accurate to
//!   ~0.5% which is plenty for short ranges.
//! - **Vincenty** inverse formula on the WGS-84 ellipsoid. Millimeter-grade
//!   but iterative; it can fail to converge for near-antipodal pairs, in
//!   which case callers fall back to Haversine.
//!
//! `Auto` selection: rough Haversine distance under 100 m stays Haversine,
//! anything longer goes through Vincenty with Haversine fallback.

use serde::{Deserialize, Serialize};

use crate::coord::{Coordinate, LengthUnit};

/// Sphere radius used by the Haversine formula (WGS-84 semi-major axis).
pub const EARTH_RADIUS_M: f64 = 6_378_137.0;

/// WGS-84 semi-major axis.
const WGS84_A: f64 = 6_378_137.0;
/// WGS-84 semi-minor axis.
const WGS84_B: f64 = 6_356_752.314245;
/// WGS-84 flattening.
const WGS84_F: f64 = 1.0 / 298.257223563;

/// Vincenty iteration cap.
const VINCENTY_MAX_ITERATIONS: usize = 100;
/// Vincenty convergence tolerance on delta-lambda.
const VINCENTY_TOLERANCE: f64 = 1e-12;

/// Rough-distance threshold below which `Auto` keeps Haversine.
const AUTO_HAVERSINE_CUTOFF_M: f64 = 100.0;

/// Distance algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceAlgorithm {
    Haversine,
    Vincenty,
    #[default]
    Auto,
}

/// Haversine distance in meters.
pub fn haversine(a: &Coordinate, b: &Coordinate) -> f64 {
    let phi1 = a.lat.to_radians();
    let phi2 = b.lat.to_radians();
    let dphi = (b.lat - a.lat).to_radians();
    let dlambda = (b.lon - a.lon).to_radians();

    let h = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// Vincenty inverse distance in meters on the WGS-84 ellipsoid.
///
/// Returns `None` when the iteration does not converge (near-antipodal
/// points); callers are expected to fall back to [`haversine`].
pub fn vincenty(a: &Coordinate, b: &Coordinate) -> Option<f64> {
    let l = (b.lon - a.lon).to_radians();
    let u1 = ((1.0 - WGS84_F) * a.lat.to_radians().tan()).atan();
    let u2 = ((1.0 - WGS84_F) * b.lat.to_radians().tan()).atan();
    let (sin_u1, cos_u1) = u1.sin_cos();
    let (sin_u2, cos_u2) = u2.sin_cos();

    let mut lambda = l;
    let mut iterations = 0;

    let (cos_sq_alpha, sin_sigma, cos_sigma, sigma, cos2_sigma_m) = loop {
        let (sin_lambda, cos_lambda) = lambda.sin_cos();
        let sin_sigma = ((cos_u2 * sin_lambda).powi(2)
            + (cos_u1 * sin_u2 - sin_u1 * cos_u2 * cos_lambda).powi(2))
        .sqrt();
        if sin_sigma == 0.0 {
            // Coincident points.
            return Some(0.0);
        }
        let cos_sigma = sin_u1 * sin_u2 + cos_u1 * cos_u2 * cos_lambda;
        let sigma = sin_sigma.atan2(cos_sigma);
        let sin_alpha = cos_u1 * cos_u2 * sin_lambda / sin_sigma;
        let cos_sq_alpha = 1.0 - sin_alpha * sin_alpha;
        let cos2_sigma_m = if cos_sq_alpha.abs() < f64::EPSILON {
            // Equatorial line.
            0.0
        } else {
            cos_sigma - 2.0 * sin_u1 * sin_u2 / cos_sq_alpha
        };
        let c = WGS84_F / 16.0 * cos_sq_alpha * (4.0 + WGS84_F * (4.0 - 3.0 * cos_sq_alpha));
        let lambda_prev = lambda;
        lambda = l
            + (1.0 - c)
                * WGS84_F
                * sin_alpha
                * (sigma
                    + c * sin_sigma
                        * (cos2_sigma_m
                            + c * cos_sigma * (-1.0 + 2.0 * cos2_sigma_m * cos2_sigma_m)));

        if (lambda - lambda_prev).abs() < VINCENTY_TOLERANCE {
            break (cos_sq_alpha, sin_sigma, cos_sigma, sigma, cos2_sigma_m);
        }
        iterations += 1;
        if iterations >= VINCENTY_MAX_ITERATIONS {
            return None;
        }
    };

    let u_sq = cos_sq_alpha * (WGS84_A * WGS84_A - WGS84_B * WGS84_B) / (WGS84_B * WGS84_B);
    let a_coef = 1.0 + u_sq / 16384.0 * (4096.0 + u_sq * (-768.0 + u_sq * (320.0 - 175.0 * u_sq)));
    let b_coef = u_sq / 1024.0 * (256.0 + u_sq * (-128.0 + u_sq * (74.0 - 47.0 * u_sq)));
    let delta_sigma = b_coef
        * sin_sigma
        * (cos2_sigma_m
            + b_coef / 4.0
                * (cos_sigma * (-1.0 + 2.0 * cos2_sigma_m * cos2_sigma_m)
                    - b_coef / 6.0
                        * cos2_sigma_m
                        * (-3.0 + 4.0 * sin_sigma * sin_sigma)
                        * (-3.0 + 4.0 * cos2_sigma_m * cos2_sigma_m)));

    Some(WGS84_B * a_coef * (sigma - delta_sigma))
}

/// Distance in meters using the selected algorithm.
pub fn distance(a: &Coordinate, b: &Coordinate, algorithm: DistanceAlgorithm) -> f64 {
    match algorithm {
        DistanceAlgorithm::Haversine => haversine(a, b),
        DistanceAlgorithm::Vincenty => vincenty(a, b).unwrap_or_else(|| haversine(a, b)),
        DistanceAlgorithm::Auto => {
            let rough = haversine(a, b);
            if rough < AUTO_HAVERSINE_CUTOFF_M {
                rough
            } else {
                vincenty(a, b).unwrap_or(rough)
            }
        }
    }
}

/// Distance converted to the requested unit.
pub fn distance_in(
    a: &Coordinate,
    b: &Coordinate,
    algorithm: DistanceAlgorithm,
    unit: LengthUnit,
) -> f64 {
    LengthUnit::convert(distance(a, b, algorithm), LengthUnit::Meters, unit)
}

/// Full pairwise distance matrix in meters. `matrix[i][j] == matrix[j][i]`.
pub fn distance_matrix(points: &[Coordinate], algorithm: DistanceAlgorithm) -> Vec<Vec<f64>> {
    let n = points.len();
    let mut matrix = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in (i + 1)..n {
            let d = distance(&points[i], &points[j], algorithm);
            matrix[i][j] = d;
            matrix[j][i] = d;
        }
    }
    matrix
}

/// Index and distance (meters) of the candidate closest to `origin`.
///
/// Returns `None` for an empty candidate list.
pub fn nearest(origin: &Coordinate, candidates: &[Coordinate]) -> Option<(usize, f64)> {
    candidates
        .iter()
        .enumerate()
        .map(|(i, c)| (i, distance(origin, c, DistanceAlgorithm::Auto)))
        .min_by(|(_, d1), (_, d2)| d1.total_cmp(d2))
}
