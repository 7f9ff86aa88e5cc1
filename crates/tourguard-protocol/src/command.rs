// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed builders for the spatial-index command vocabulary.
//!
//! Every command the engine can issue is a [`Command`] variant; serialization
//! to the wire argument list happens in exactly one place ([`Command::to_args`]).
//! Coordinate order: the protocol takes `POINT <lat> <lon>` but polygon vertex
//! lists and GeoJSON take `(lon, lat)` — that conversion lives here and
//! nowhere else.

use std::collections::BTreeMap;

use serde_json::json;
use tourguard_geo::{BoundingBox, Coordinate};

/// A search area for `WITHIN` queries.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryArea {
    Bounds(BoundingBox),
    Polygon(Vec<Coordinate>),
}

/// One spatial-index command.
///
/// Side fields use a `BTreeMap` so encoded commands are deterministic, which
/// keeps pipelined batches and tests stable.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `PING`
    Ping,
    /// `SET <coll> <id> [FIELD k v]... [EX ttl] POINT <lat> <lon>`
    SetPoint {
        collection: String,
        id: String,
        fields: BTreeMap<String, String>,
        ttl_secs: Option<u64>,
        point: Coordinate,
    },
    /// `SET <coll> <id> [FIELD k v]... [EX ttl] OBJECT <GeoJSON polygon>`
    SetObject {
        collection: String,
        id: String,
        fields: BTreeMap<String, String>,
        ttl_secs: Option<u64>,
        ring: Vec<Coordinate>,
    },
    /// `GET <coll> <id> WITHFIELDS`
    Get { collection: String, id: String },
    /// `DEL <coll> <id>`
    Del { collection: String, id: String },
    /// `NEARBY <coll> [LIMIT n] POINT <lat> <lon> <radius-m>`
    Nearby {
        collection: String,
        limit: Option<usize>,
        point: Coordinate,
        radius_m: f64,
    },
    /// `WITHIN <coll> [LIMIT n] (BOUNDS ... | POLYGON ...)`
    Within {
        collection: String,
        limit: Option<usize>,
        area: QueryArea,
    },
    /// `INTERSECTS <coll> POINT <lat> <lon>`
    IntersectsPoint {
        collection: String,
        point: Coordinate,
    },
    /// `INTERSECTS <coll> POLYGON <lon lat>...`
    IntersectsPolygon {
        collection: String,
        ring: Vec<Coordinate>,
    },
    /// `SETHOOK <name> <url> WITHIN <coll> POLYGON <lon lat>...`
    SetHook {
        name: String,
        url: String,
        collection: String,
        ring: Vec<Coordinate>,
    },
    /// `PDELHOOK <pattern>`
    DelHook { pattern: String },
    /// `STATS <coll>`
    Stats { collection: String },
    /// `SERVER`
    Server,
    /// `SCAN <coll> [LIMIT n] [WITHFIELDS]`
    Scan {
        collection: String,
        limit: Option<usize>,
        with_fields: bool,
    },
    /// `BGREWRITEAOF`
    RewriteAof,
}

/// Format a float the shortest way that round-trips.
fn num(v: f64) -> String {
    format!("{v}")
}

/// GeoJSON `Polygon` for a ring, `(lon, lat)` vertex order, explicitly closed.
pub fn polygon_geojson(ring: &[Coordinate]) -> String {
    let mut positions: Vec<[f64; 2]> = ring.iter().map(|c| [c.lon, c.lat]).collect();
    if let (Some(first), Some(last)) = (positions.first().copied(), positions.last()) {
        if first != *last {
            positions.push(first);
        }
    }
    json!({ "type": "Polygon", "coordinates": [positions] }).to_string()
}

impl Command {
    /// Wire name of the command, for logging and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ping => "PING",
            Self::SetPoint { .. } | Self::SetObject { .. } => "SET",
            Self::Get { .. } => "GET",
            Self::Del { .. } => "DEL",
            Self::Nearby { .. } => "NEARBY",
            Self::Within { .. } => "WITHIN",
            Self::IntersectsPoint { .. } | Self::IntersectsPolygon { .. } => "INTERSECTS",
            Self::SetHook { .. } => "SETHOOK",
            Self::DelHook { .. } => "PDELHOOK",
            Self::Stats { .. } => "STATS",
            Self::Server => "SERVER",
            Self::Scan { .. } => "SCAN",
            Self::RewriteAof => "BGREWRITEAOF",
        }
    }

    /// Whether the command mutates index state (and therefore must run on the
    /// primary connection).
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Self::SetPoint { .. }
                | Self::SetObject { .. }
                | Self::Del { .. }
                | Self::SetHook { .. }
                | Self::DelHook { .. }
                | Self::RewriteAof
        )
    }

    /// Serialize to the wire argument list.
    pub fn to_args(&self) -> Vec<String> {
        match self {
            Self::Ping => vec!["PING".into()],

            Self::SetPoint {
                collection,
                id,
                fields,
                ttl_secs,
                point,
            } => {
                let mut args = vec!["SET".into(), collection.clone(), id.clone()];
                push_fields(&mut args, fields);
                push_ttl(&mut args, *ttl_secs);
                args.push("POINT".into());
                args.push(num(point.lat));
                args.push(num(point.lon));
                args
            }

            Self::SetObject {
                collection,
                id,
                fields,
                ttl_secs,
                ring,
            } => {
                let mut args = vec!["SET".into(), collection.clone(), id.clone()];
                push_fields(&mut args, fields);
                push_ttl(&mut args, *ttl_secs);
                args.push("OBJECT".into());
                args.push(polygon_geojson(ring));
                args
            }

            Self::Get { collection, id } => {
                vec!["GET".into(), collection.clone(), id.clone(), "WITHFIELDS".into()]
            }

            Self::Del { collection, id } => {
                vec!["DEL".into(), collection.clone(), id.clone()]
            }

            Self::Nearby {
                collection,
                limit,
                point,
                radius_m,
            } => {
                let mut args = vec!["NEARBY".into(), collection.clone()];
                push_limit(&mut args, *limit);
                args.push("POINT".into());
                args.push(num(point.lat));
                args.push(num(point.lon));
                args.push(num(*radius_m));
                args
            }

            Self::Within {
                collection,
                limit,
                area,
            } => {
                let mut args = vec!["WITHIN".into(), collection.clone()];
                push_limit(&mut args, *limit);
                match area {
                    QueryArea::Bounds(b) => {
                        args.push("BOUNDS".into());
                        args.push(num(b.min_lat));
                        args.push(num(b.min_lon));
                        args.push(num(b.max_lat));
                        args.push(num(b.max_lon));
                    }
                    QueryArea::Polygon(ring) => {
                        args.push("POLYGON".into());
                        push_ring(&mut args, ring);
                    }
                }
                args
            }

            Self::IntersectsPoint { collection, point } => {
                vec![
                    "INTERSECTS".into(),
                    collection.clone(),
                    "POINT".into(),
                    num(point.lat),
                    num(point.lon),
                ]
            }

            Self::IntersectsPolygon { collection, ring } => {
                let mut args = vec!["INTERSECTS".into(), collection.clone(), "POLYGON".into()];
                push_ring(&mut args, ring);
                args
            }

            Self::SetHook {
                name,
                url,
                collection,
                ring,
            } => {
                let mut args = vec![
                    "SETHOOK".into(),
                    name.clone(),
                    url.clone(),
                    "WITHIN".into(),
                    collection.clone(),
                    "POLYGON".into(),
                ];
                push_ring(&mut args, ring);
                args
            }

            Self::DelHook { pattern } => vec!["PDELHOOK".into(), pattern.clone()],

            Self::Stats { collection } => vec!["STATS".into(), collection.clone()],

            Self::Server => vec!["SERVER".into()],

            Self::Scan {
                collection,
                limit,
                with_fields,
            } => {
                let mut args = vec!["SCAN".into(), collection.clone()];
                push_limit(&mut args, *limit);
                if *with_fields {
                    args.push("WITHFIELDS".into());
                }
                args
            }

            Self::RewriteAof => vec!["BGREWRITEAOF".into()],
        }
    }
}

fn push_fields(args: &mut Vec<String>, fields: &BTreeMap<String, String>) {
    for (k, v) in fields {
        args.push("FIELD".into());
        args.push(k.clone());
        args.push(v.clone());
    }
}

fn push_ttl(args: &mut Vec<String>, ttl_secs: Option<u64>) {
    if let Some(ttl) = ttl_secs {
        args.push("EX".into());
        args.push(ttl.to_string());
    }
}

fn push_limit(args: &mut Vec<String>, limit: Option<usize>) {
    if let Some(n) = limit {
        args.push("LIMIT".into());
        args.push(n.to_string());
    }
}

/// Polygon vertices on the wire are `(lon, lat)` pairs.
fn push_ring(args: &mut Vec<String>, ring: &[Coordinate]) {
    for c in ring {
        args.push(num(c.lon));
        args.push(num(c.lat));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coord(lat: f64, lon: f64) -> Coordinate {
        Coordinate { lat, lon }
    }

    #[test]
    fn test_ping() {
        assert_eq!(Command::Ping.to_args(), vec!["PING"]);
    }

    #[test]
    fn test_set_point_minimal() {
        let cmd = Command::SetPoint {
            collection: "tourists".into(),
            id: "u1".into(),
            fields: BTreeMap::new(),
            ttl_secs: None,
            point: coord(28.6144, 77.2095),
        };
        assert_eq!(
            cmd.to_args(),
            vec!["SET", "tourists", "u1", "POINT", "28.6144", "77.2095"]
        );
    }

    #[test]
    fn test_set_point_fields_and_ttl() {
        let mut fields = BTreeMap::new();
        fields.insert("battery".to_string(), "80".to_string());
        fields.insert("accuracy".to_string(), "5".to_string());
        let cmd = Command::SetPoint {
            collection: "tourists".into(),
            id: "u1".into(),
            fields,
            ttl_secs: Some(3600),
            point: coord(1.0, 2.0),
        };
        // BTreeMap keeps field order deterministic (accuracy before battery).
        assert_eq!(
            cmd.to_args(),
            vec![
                "SET", "tourists", "u1", "FIELD", "accuracy", "5", "FIELD", "battery", "80", "EX",
                "3600", "POINT", "1", "2"
            ]
        );
    }

    #[test]
    fn test_set_object_geojson_lon_lat_closed() {
        let ring = vec![coord(0.0, 10.0), coord(0.0, 11.0), coord(1.0, 11.0)];
        let cmd = Command::SetObject {
            collection: "zones".into(),
            id: "z1".into(),
            fields: BTreeMap::new(),
            ttl_secs: None,
            ring,
        };
        let args = cmd.to_args();
        assert_eq!(&args[..4], &["SET", "zones", "z1", "OBJECT"]);
        let geojson: serde_json::Value = serde_json::from_str(&args[4]).unwrap();
        assert_eq!(geojson["type"], "Polygon");
        let positions = geojson["coordinates"][0].as_array().unwrap();
        // Auto-closed: 3 vertices in, 4 positions out, first == last.
        assert_eq!(positions.len(), 4);
        assert_eq!(positions[0], positions[3]);
        // (lon, lat) order.
        assert_eq!(positions[0][0], 10.0);
        assert_eq!(positions[0][1], 0.0);
    }

    #[test]
    fn test_get_withfields() {
        let cmd = Command::Get {
            collection: "tourists".into(),
            id: "u1".into(),
        };
        assert_eq!(cmd.to_args(), vec!["GET", "tourists", "u1", "WITHFIELDS"]);
    }

    #[test]
    fn test_nearby_with_limit() {
        let cmd = Command::Nearby {
            collection: "tourists".into(),
            limit: Some(50),
            point: coord(28.6144, 77.2095),
            radius_m: 500.0,
        };
        assert_eq!(
            cmd.to_args(),
            vec![
                "NEARBY", "tourists", "LIMIT", "50", "POINT", "28.6144", "77.2095", "500"
            ]
        );
    }

    #[test]
    fn test_within_bounds() {
        let cmd = Command::Within {
            collection: "tourists".into(),
            limit: None,
            area: QueryArea::Bounds(BoundingBox {
                min_lat: 28.0,
                max_lat: 29.0,
                min_lon: 77.0,
                max_lon: 78.0,
            }),
        };
        assert_eq!(
            cmd.to_args(),
            vec!["WITHIN", "tourists", "BOUNDS", "28", "77", "29", "78"]
        );
    }

    #[test]
    fn test_within_polygon_lon_lat_pairs() {
        let cmd = Command::Within {
            collection: "tourists".into(),
            limit: Some(10),
            area: QueryArea::Polygon(vec![coord(0.0, 5.0), coord(1.0, 5.0), coord(1.0, 6.0)]),
        };
        assert_eq!(
            cmd.to_args(),
            vec![
                "WITHIN", "tourists", "LIMIT", "10", "POLYGON", "5", "0", "5", "1", "6", "1"
            ]
        );
    }

    #[test]
    fn test_intersects_point() {
        let cmd = Command::IntersectsPoint {
            collection: "zones".into(),
            point: coord(28.6144, 77.2095),
        };
        assert_eq!(
            cmd.to_args(),
            vec!["INTERSECTS", "zones", "POINT", "28.6144", "77.2095"]
        );
    }

    #[test]
    fn test_sethook() {
        let cmd = Command::SetHook {
            name: "hook-z1".into(),
            url: "https://example.com/hook".into(),
            collection: "tourists".into(),
            ring: vec![coord(0.0, 5.0), coord(1.0, 5.0), coord(1.0, 6.0)],
        };
        let args = cmd.to_args();
        assert_eq!(
            &args[..6],
            &[
                "SETHOOK",
                "hook-z1",
                "https://example.com/hook",
                "WITHIN",
                "tourists",
                "POLYGON"
            ]
        );
        assert_eq!(args.len(), 6 + 6);
    }

    #[test]
    fn test_delhook_scan_stats_server_aof() {
        assert_eq!(
            Command::DelHook { pattern: "hook-z1*".into() }.to_args(),
            vec!["PDELHOOK", "hook-z1*"]
        );
        assert_eq!(
            Command::Stats { collection: "zones".into() }.to_args(),
            vec!["STATS", "zones"]
        );
        assert_eq!(Command::Server.to_args(), vec!["SERVER"]);
        assert_eq!(Command::RewriteAof.to_args(), vec!["BGREWRITEAOF"]);
        assert_eq!(
            Command::Scan {
                collection: "zones".into(),
                limit: Some(100),
                with_fields: true
            }
            .to_args(),
            vec!["SCAN", "zones", "LIMIT", "100", "WITHFIELDS"]
        );
    }

    #[test]
    fn test_is_write_classification() {
        assert!(Command::Del { collection: "z".into(), id: "1".into() }.is_write());
        assert!(Command::RewriteAof.is_write());
        assert!(!Command::Ping.is_write());
        assert!(!Command::Server.is_write());
        assert!(
            !Command::Nearby {
                collection: "t".into(),
                limit: None,
                point: coord(0.0, 0.0),
                radius_m: 1.0
            }
            .is_write()
        );
    }

    #[test]
    fn test_command_names() {
        assert_eq!(Command::Ping.name(), "PING");
        assert_eq!(Command::RewriteAof.name(), "BGREWRITEAOF");
        assert_eq!(
            Command::Get { collection: "t".into(), id: "u".into() }.name(),
            "GET"
        );
    }
}
