// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process doubles for the spatial index and a webhook receiver.
//!
//! The mock index implements just enough of the wire vocabulary for the
//! engine's end-to-end paths: SET (POINT/OBJECT), GET, DEL, SCAN, NEARBY,
//! WITHIN, INTERSECTS, hooks and PING. Geometry answers use the same
//! predicates as the engine, which is exactly what a real index provides.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use tourguard_geo::{Coordinate, DistanceAlgorithm, contains_point, distance};

#[derive(Debug, Clone)]
struct Entry {
    object: String,
    fields: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
enum Geom {
    Point(Coordinate),
    Polygon(Vec<Coordinate>),
}

type Store = Arc<Mutex<HashMap<String, BTreeMap<String, Entry>>>>;

pub struct MockIndex {
    pub addr: String,
    _server: JoinHandle<()>,
}

pub async fn spawn_mock_index() -> MockIndex {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let store: Store = Arc::new(Mutex::new(HashMap::new()));
    let server = tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(serve(socket, Arc::clone(&store)));
        }
    });
    MockIndex {
        addr,
        _server: server,
    }
}

async fn serve(socket: TcpStream, store: Store) {
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);
    while let Some(args) = read_request(&mut reader).await {
        let reply = handle(&args, &store).await;
        if write_half.write_all(reply.as_bytes()).await.is_err() {
            break;
        }
    }
}

async fn read_request(reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>) -> Option<Vec<String>> {
    let mut line = String::new();
    if reader.read_line(&mut line).await.ok()? == 0 {
        return None;
    }
    let count: usize = line.trim().strip_prefix('*')?.parse().ok()?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        let mut len_line = String::new();
        reader.read_line(&mut len_line).await.ok()?;
        let len: usize = len_line.trim().strip_prefix('$')?.parse().ok()?;
        let mut payload = vec![0u8; len + 2];
        reader.read_exact(&mut payload).await.ok()?;
        payload.truncate(len);
        args.push(String::from_utf8(payload).ok()?);
    }
    Some(args)
}

// ---- reply encoding ----

fn bulk(s: &str) -> String {
    format!("${}\r\n{s}\r\n", s.len())
}

fn int(n: i64) -> String {
    format!(":{n}\r\n")
}

fn array(items: Vec<String>) -> String {
    format!("*{}\r\n{}", items.len(), items.concat())
}

fn fields_array(fields: &[(String, String)]) -> String {
    let mut flat = Vec::with_capacity(fields.len() * 2);
    for (k, v) in fields {
        flat.push(bulk(k));
        flat.push(bulk(v));
    }
    array(flat)
}

fn entry_reply(id: &str, entry: &Entry, distance_m: Option<f64>) -> String {
    let mut parts = vec![bulk(id), bulk(&entry.object)];
    if !entry.fields.is_empty() {
        parts.push(fields_array(&entry.fields));
    }
    if let Some(d) = distance_m {
        parts.push(bulk(&format!("{d}")));
    }
    array(parts)
}

fn search_reply(entries: Vec<String>) -> String {
    array(vec![int(0), array(entries)])
}

// ---- geometry ----

fn parse_geom(raw: &str) -> Option<Geom> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    let position = |p: &serde_json::Value| -> Option<Coordinate> {
        Some(Coordinate {
            lon: p.get(0)?.as_f64()?,
            lat: p.get(1)?.as_f64()?,
        })
    };
    match value.get("type")?.as_str()? {
        "Point" => Some(Geom::Point(position(value.get("coordinates")?)?)),
        "Polygon" => {
            let ring = value
                .get("coordinates")?
                .get(0)?
                .as_array()?
                .iter()
                .map(position)
                .collect::<Option<Vec<_>>>()?;
            Some(Geom::Polygon(ring))
        }
        _ => None,
    }
}

// ---- command handling ----

async fn handle(args: &[String], store: &Store) -> String {
    let cmd = args.first().map(String::as_str).unwrap_or("");
    match cmd {
        "PING" => "+PONG\r\n".to_string(),
        "SET" => handle_set(args, store).await,
        "GET" => handle_get(args, store).await,
        "DEL" => {
            let mut store = store.lock().await;
            if let Some(coll) = store.get_mut(&args[1]) {
                if coll.remove(&args[2]).is_none() {
                    return "-ERR key not found\r\n".to_string();
                }
            }
            "+OK\r\n".to_string()
        }
        "SCAN" => handle_scan(args, store).await,
        "NEARBY" => handle_nearby(args, store).await,
        "WITHIN" => handle_within(args, store).await,
        "INTERSECTS" => handle_intersects(args, store).await,
        "SETHOOK" | "PDELHOOK" | "BGREWRITEAOF" => "+OK\r\n".to_string(),
        "SERVER" | "STATS" => bulk("{}"),
        _ => format!("-ERR unknown command '{cmd}'\r\n"),
    }
}

async fn handle_set(args: &[String], store: &Store) -> String {
    let collection = args[1].clone();
    let id = args[2].clone();
    let mut fields = Vec::new();
    let mut i = 3;
    let mut object = None;
    while i < args.len() {
        match args[i].as_str() {
            "FIELD" => {
                fields.push((args[i + 1].clone(), args[i + 2].clone()));
                i += 3;
            }
            "EX" => i += 2,
            "POINT" => {
                let lat: f64 = args[i + 1].parse().unwrap_or(0.0);
                let lon: f64 = args[i + 2].parse().unwrap_or(0.0);
                object = Some(format!(
                    r#"{{"type":"Point","coordinates":[{lon},{lat}]}}"#
                ));
                i += 3;
            }
            "OBJECT" => {
                object = Some(args[i + 1].clone());
                i += 2;
            }
            _ => i += 1,
        }
    }
    let Some(object) = object else {
        return "-ERR missing geometry\r\n".to_string();
    };
    store
        .lock()
        .await
        .entry(collection)
        .or_default()
        .insert(id, Entry { object, fields });
    "+OK\r\n".to_string()
}

async fn handle_get(args: &[String], store: &Store) -> String {
    let store = store.lock().await;
    match store.get(&args[1]).and_then(|coll| coll.get(&args[2])) {
        Some(entry) => array(vec![bulk(&entry.object), fields_array(&entry.fields)]),
        None => "$-1\r\n".to_string(),
    }
}

async fn handle_scan(args: &[String], store: &Store) -> String {
    let limit = parse_limit(args);
    let store = store.lock().await;
    let entries = store
        .get(&args[1])
        .map(|coll| {
            coll.iter()
                .take(limit)
                .map(|(id, entry)| entry_reply(id, entry, None))
                .collect()
        })
        .unwrap_or_default();
    search_reply(entries)
}

async fn handle_nearby(args: &[String], store: &Store) -> String {
    let limit = parse_limit(args);
    let Some(point_at) = args.iter().position(|a| a == "POINT") else {
        return "-ERR syntax\r\n".to_string();
    };
    let center = Coordinate {
        lat: args[point_at + 1].parse().unwrap_or(0.0),
        lon: args[point_at + 2].parse().unwrap_or(0.0),
    };
    let radius: f64 = args[point_at + 3].parse().unwrap_or(0.0);

    let store = store.lock().await;
    let mut entries = Vec::new();
    if let Some(coll) = store.get(&args[1]) {
        for (id, entry) in coll {
            if entries.len() >= limit {
                break;
            }
            if let Some(Geom::Point(p)) = parse_geom(&entry.object) {
                let d = distance(&center, &p, DistanceAlgorithm::Haversine);
                if d <= radius {
                    entries.push(entry_reply(id, entry, Some(d)));
                }
            }
        }
    }
    search_reply(entries)
}

async fn handle_within(args: &[String], store: &Store) -> String {
    let limit = parse_limit(args);
    let inside: Box<dyn Fn(&Coordinate) -> bool + Send> =
        if let Some(at) = args.iter().position(|a| a == "BOUNDS") {
            let min_lat: f64 = args[at + 1].parse().unwrap_or(0.0);
            let min_lon: f64 = args[at + 2].parse().unwrap_or(0.0);
            let max_lat: f64 = args[at + 3].parse().unwrap_or(0.0);
            let max_lon: f64 = args[at + 4].parse().unwrap_or(0.0);
            Box::new(move |c| {
                c.lat >= min_lat && c.lat <= max_lat && c.lon >= min_lon && c.lon <= max_lon
            })
        } else if let Some(at) = args.iter().position(|a| a == "POLYGON") {
            let ring: Vec<Coordinate> = args[at + 1..]
                .chunks(2)
                .filter_map(|pair| {
                    Some(Coordinate {
                        lon: pair.first()?.parse().ok()?,
                        lat: pair.get(1)?.parse().ok()?,
                    })
                })
                .collect();
            Box::new(move |c| contains_point(&ring, c))
        } else {
            return "-ERR syntax\r\n".to_string();
        };

    let store = store.lock().await;
    let mut entries = Vec::new();
    if let Some(coll) = store.get(&args[1]) {
        for (id, entry) in coll {
            if entries.len() >= limit {
                break;
            }
            if let Some(Geom::Point(p)) = parse_geom(&entry.object) {
                if inside(&p) {
                    entries.push(entry_reply(id, entry, None));
                }
            }
        }
    }
    search_reply(entries)
}

async fn handle_intersects(args: &[String], store: &Store) -> String {
    let Some(at) = args.iter().position(|a| a == "POINT") else {
        return "-ERR syntax\r\n".to_string();
    };
    let point = Coordinate {
        lat: args[at + 1].parse().unwrap_or(0.0),
        lon: args[at + 2].parse().unwrap_or(0.0),
    };
    let store = store.lock().await;
    let mut entries = Vec::new();
    if let Some(coll) = store.get(&args[1]) {
        for (id, entry) in coll {
            if let Some(Geom::Polygon(ring)) = parse_geom(&entry.object) {
                if contains_point(&ring, &point) {
                    entries.push(entry_reply(id, entry, None));
                }
            }
        }
    }
    search_reply(entries)
}

fn parse_limit(args: &[String]) -> usize {
    args.iter()
        .position(|a| a == "LIMIT")
        .and_then(|at| args.get(at + 1))
        .and_then(|n| n.parse().ok())
        .unwrap_or(usize::MAX)
}

// ============================================================================
// Webhook receiver
// ============================================================================

pub struct MockWebhookReceiver {
    pub url: String,
    pub received: Arc<Mutex<Vec<serde_json::Value>>>,
    _server: JoinHandle<()>,
}

/// Minimal HTTP server: 200 to every HEAD, captures every POST body.
pub async fn spawn_webhook_receiver() -> MockWebhookReceiver {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let received: Arc<Mutex<Vec<serde_json::Value>>> = Arc::new(Mutex::new(Vec::new()));
    let captured = Arc::clone(&received);
    let server = tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(serve_http(socket, Arc::clone(&captured)));
        }
    });
    MockWebhookReceiver {
        url: format!("http://{addr}/hook"),
        received,
        _server: server,
    }
}

async fn serve_http(socket: TcpStream, received: Arc<Mutex<Vec<serde_json::Value>>>) {
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);
    loop {
        let mut request_line = String::new();
        match reader.read_line(&mut request_line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let is_post = request_line.starts_with("POST");

        let mut content_length = 0usize;
        loop {
            let mut header = String::new();
            match reader.read_line(&mut header).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            let header = header.trim();
            if header.is_empty() {
                break;
            }
            if let Some(value) = header
                .to_ascii_lowercase()
                .strip_prefix("content-length:")
                .map(str::trim)
                .and_then(|v| v.parse().ok())
            {
                content_length = value;
            }
        }

        if content_length > 0 {
            let mut body = vec![0u8; content_length];
            if reader.read_exact(&mut body).await.is_err() {
                return;
            }
            if is_post {
                if let Ok(value) = serde_json::from_slice(&body) {
                    received.lock().await.push(value);
                }
            }
        }

        let response = "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";
        if write_half.write_all(response.as_bytes()).await.is_err() {
            break;
        }
    }
}
