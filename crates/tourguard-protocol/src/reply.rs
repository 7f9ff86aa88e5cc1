// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Decoding of spatial-index reply shapes.
//!
//! The index returns GeoJSON objects as bulk strings and search results as
//! `[count, [[id, object, fields?, distance?], ...]]` arrays. Decoders here
//! are tolerant about optional elements (fields and distance are present only
//! when the query asked for them) but strict about the overall shape.

use std::collections::BTreeMap;

use thiserror::Error;
use tourguard_geo::Coordinate;

use crate::resp::RespValue;

/// Side fields attached to an index object.
pub type FieldMap = BTreeMap<String, String>;

/// Errors produced while decoding replies.
#[derive(Debug, Error)]
pub enum ReplyError {
    #[error("index error reply: {0}")]
    Index(String),

    #[error("unexpected reply shape: {0}")]
    UnexpectedShape(&'static str),

    #[error("invalid GeoJSON object: {0}")]
    BadGeoJson(String),
}

/// A decoded geometry from the index.
#[derive(Debug, Clone, PartialEq)]
pub enum GeoObject {
    Point(Coordinate),
    Polygon(Vec<Coordinate>),
}

impl GeoObject {
    /// Point view; polygons yield `None`.
    pub fn as_point(&self) -> Option<Coordinate> {
        match self {
            Self::Point(c) => Some(*c),
            Self::Polygon(_) => None,
        }
    }

    /// Ring view; points yield `None`.
    pub fn as_ring(&self) -> Option<&[Coordinate]> {
        match self {
            Self::Polygon(ring) => Some(ring),
            Self::Point(_) => None,
        }
    }
}

/// One entry of a `NEARBY` / `WITHIN` / `INTERSECTS` / `SCAN` result set.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchEntry {
    pub id: String,
    pub object: GeoObject,
    pub fields: FieldMap,
    /// Present when the query asked the index for distances, meters.
    pub distance: Option<f64>,
}

/// Parse a GeoJSON `Point` or `Polygon` bulk string.
///
/// GeoJSON positions are `(lon, lat)`; the returned types are `(lat, lon)`.
pub fn decode_object(raw: &str) -> Result<GeoObject, ReplyError> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| ReplyError::BadGeoJson(e.to_string()))?;

    let position = |v: &serde_json::Value| -> Result<Coordinate, ReplyError> {
        let lon = v
            .get(0)
            .and_then(serde_json::Value::as_f64)
            .ok_or_else(|| ReplyError::BadGeoJson("position missing longitude".into()))?;
        let lat = v
            .get(1)
            .and_then(serde_json::Value::as_f64)
            .ok_or_else(|| ReplyError::BadGeoJson("position missing latitude".into()))?;
        Ok(Coordinate { lat, lon })
    };

    match value.get("type").and_then(serde_json::Value::as_str) {
        Some("Point") => {
            let coords = value
                .get("coordinates")
                .ok_or_else(|| ReplyError::BadGeoJson("Point without coordinates".into()))?;
            Ok(GeoObject::Point(position(coords)?))
        }
        Some("Polygon") => {
            let outer = value
                .get("coordinates")
                .and_then(|c| c.get(0))
                .and_then(serde_json::Value::as_array)
                .ok_or_else(|| ReplyError::BadGeoJson("Polygon without outer ring".into()))?;
            let ring = outer.iter().map(position).collect::<Result<Vec<_>, _>>()?;
            Ok(GeoObject::Polygon(ring))
        }
        other => Err(ReplyError::BadGeoJson(format!(
            "unsupported GeoJSON type: {other:?}"
        ))),
    }
}

/// Decode an alternating `[k, v, k, v, ...]` field array.
fn decode_fields(value: &RespValue) -> FieldMap {
    let mut fields = FieldMap::new();
    if let RespValue::Array(items) = value {
        for pair in items.chunks(2) {
            if let (Some(k), Some(v)) = (
                pair.first().and_then(RespValue::as_str),
                pair.get(1).and_then(RespValue::as_str),
            ) {
                fields.insert(k.to_string(), v.to_string());
            }
        }
    }
    fields
}

/// Decode a `GET ... WITHFIELDS` reply.
///
/// `None` when the key does not exist.
pub fn decode_get_reply(reply: RespValue) -> Result<Option<(GeoObject, FieldMap)>, ReplyError> {
    match reply {
        RespValue::Null => Ok(None),
        RespValue::Error(msg) => {
            // "key not found" is an absence, not a failure.
            if msg.contains("not found") {
                Ok(None)
            } else {
                Err(ReplyError::Index(msg))
            }
        }
        RespValue::Bulk(raw) => Ok(Some((decode_object(&raw)?, FieldMap::new()))),
        RespValue::Array(items) => {
            let mut iter = items.into_iter();
            let raw = iter
                .next()
                .and_then(|v| v.as_str().map(str::to_string))
                .ok_or(ReplyError::UnexpectedShape("GET reply without object"))?;
            let fields = iter.next().map(|v| decode_fields(&v)).unwrap_or_default();
            Ok(Some((decode_object(&raw)?, fields)))
        }
        _ => Err(ReplyError::UnexpectedShape("GET reply kind")),
    }
}

/// Decode a search reply (`NEARBY`, `WITHIN`, `INTERSECTS`, `SCAN`).
///
/// The index replies `[cursor, [entry, ...]]`; each entry is either a bare id
/// or `[id, object, fields?, distance?]`. Bare-id entries are skipped since
/// the engine always needs the geometry.
pub fn decode_search_reply(reply: RespValue) -> Result<Vec<SearchEntry>, ReplyError> {
    let items = match reply {
        RespValue::Null => return Ok(Vec::new()),
        RespValue::Error(msg) => return Err(ReplyError::Index(msg)),
        RespValue::Array(items) => items,
        _ => return Err(ReplyError::UnexpectedShape("search reply kind")),
    };

    // [cursor, entries]
    let entries = match items.into_iter().nth(1) {
        Some(RespValue::Array(entries)) => entries,
        Some(RespValue::Null) | None => return Ok(Vec::new()),
        Some(_) => return Err(ReplyError::UnexpectedShape("search entry list")),
    };

    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let RespValue::Array(parts) = entry else {
            continue;
        };
        let mut iter = parts.into_iter();
        let Some(id) = iter.next().and_then(|v| v.as_str().map(str::to_string)) else {
            continue;
        };
        let Some(raw) = iter.next().and_then(|v| v.as_str().map(str::to_string)) else {
            continue;
        };
        let object = decode_object(&raw)?;

        let mut fields = FieldMap::new();
        let mut distance = None;
        for extra in iter {
            match &extra {
                RespValue::Array(_) => fields = decode_fields(&extra),
                RespValue::Bulk(s) => {
                    if let Ok(d) = s.parse::<f64>() {
                        distance = Some(d);
                    }
                }
                RespValue::Integer(n) => distance = Some(*n as f64),
                _ => {}
            }
        }

        out.push(SearchEntry {
            id,
            object,
            fields,
            distance,
        });
    }
    Ok(out)
}
