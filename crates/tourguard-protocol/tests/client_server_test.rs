// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Loopback tests: a minimal in-process index server answering the wire
//! protocol, exercised through the connection and the pool.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use tourguard_protocol::{
    Command, Connection, ConnectionConfig, ConnectionError, IndexPool, PoolConfig, RespValue,
};

/// Read one RESP array-of-bulk-strings request.
async fn read_request(reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>) -> Option<Vec<String>> {
    use tokio::io::AsyncBufReadExt;
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

/// Spawn a server that answers `PING` with `+PONG` and everything else with
/// an echo of its command name as a bulk string.
async fn spawn_echo_server() -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let handle = tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(handle_conn(socket));
        }
    });
    (addr, handle)
}

async fn handle_conn(socket: TcpStream) {
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);
    while let Some(args) = read_request(&mut reader).await {
        let reply = match args.first().map(String::as_str) {
            Some("PING") => "+PONG\r\n".to_string(),
            Some(other) => format!("${}\r\n{other}\r\n", other.len()),
            None => "-ERR empty\r\n".to_string(),
        };
        if write_half.write_all(reply.as_bytes()).await.is_err() {
            break;
        }
    }
}

fn fast_config(addr: &str) -> ConnectionConfig {
    ConnectionConfig {
        addr: addr.to_string(),
        connect_timeout: Duration::from_millis(500),
        request_timeout: Duration::from_millis(500),
        reconnect_initial_delay: Duration::from_millis(1),
        reconnect_max_attempts: 2,
    }
}

#[tokio::test]
async fn test_ping_round_trip() {
    let (addr, _server) = spawn_echo_server().await;
    let conn = Connection::new(fast_config(&addr));
    assert!(conn.ping().await.unwrap());
    assert!(conn.is_connected().await);
}

#[tokio::test]
async fn test_lazy_connect_on_execute() {
    let (addr, _server) = spawn_echo_server().await;
    let conn = Connection::new(fast_config(&addr));
    assert!(!conn.is_connected().await);
    let reply = conn.execute(&Command::Server).await.unwrap();
    assert_eq!(reply, RespValue::Bulk("SERVER".to_string()));
    assert!(conn.is_connected().await);
}

#[tokio::test]
async fn test_pipelined_batch_preserves_order() {
    let (addr, _server) = spawn_echo_server().await;
    let conn = Connection::new(fast_config(&addr));
    let replies = conn
        .execute_batch(&[Command::Ping, Command::Server, Command::RewriteAof])
        .await
        .unwrap();
    assert_eq!(replies.len(), 3);
    assert_eq!(replies[0], RespValue::Simple("PONG".to_string()));
    assert_eq!(replies[1], RespValue::Bulk("SERVER".to_string()));
    assert_eq!(replies[2], RespValue::Bulk("BGREWRITEAOF".to_string()));
}

#[tokio::test]
async fn test_reconnect_after_close() {
    let (addr, _server) = spawn_echo_server().await;
    let conn = Connection::new(fast_config(&addr));
    assert!(conn.ping().await.unwrap());
    conn.close().await;
    assert!(!conn.is_connected().await);
    // Next execute lazily reconnects.
    assert!(conn.ping().await.unwrap());
}

#[tokio::test]
async fn test_connect_with_backoff_succeeds_live() {
    let (addr, _server) = spawn_echo_server().await;
    let conn = Connection::new(fast_config(&addr));
    conn.connect_with_backoff().await.unwrap();
    assert!(conn.is_connected().await);
}

#[tokio::test]
async fn test_request_timeout_drops_socket() {
    // A listener that accepts but never answers.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let _server = tokio::spawn(async move {
        let mut sockets = Vec::new();
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            sockets.push(socket);
        }
    });

    let config = ConnectionConfig {
        request_timeout: Duration::from_millis(100),
        ..fast_config(&addr)
    };
    let conn = Connection::new(config);
    match conn.execute(&Command::Ping).await {
        Err(ConnectionError::RequestTimeout(ms)) => assert_eq!(ms, 100),
        other => panic!("expected RequestTimeout, got {other:?}"),
    }
    // Socket was dropped so the connection reports disconnected.
    assert!(!conn.is_connected().await);
}

#[tokio::test]
async fn test_pool_probe_restores_rotation() {
    let (addr, _server) = spawn_echo_server().await;
    let pool = IndexPool::new(PoolConfig {
        primary_addr: addr.clone(),
        replica_addrs: vec![addr],
        connection: fast_config("unused"),
        probe_interval: Duration::from_millis(50),
        retry_delays: vec![Duration::from_millis(1)],
    });
    assert_eq!(pool.status().await.connected_count(), 0);
    pool.probe_once().await;
    let status = pool.status().await;
    assert_eq!(status.connected_count(), 2);
    assert!(status.primary_connected());
    for record in &status.connections {
        assert!(record.last_ping_age_secs.is_some());
    }
}

#[tokio::test]
async fn test_pool_write_goes_to_primary() {
    let (addr, _server) = spawn_echo_server().await;
    let pool = IndexPool::new(PoolConfig {
        primary_addr: addr,
        replica_addrs: Vec::new(),
        connection: fast_config("unused"),
        probe_interval: Duration::from_secs(60),
        retry_delays: vec![Duration::from_millis(1)],
    });
    let reply = pool.execute_write(&Command::Server).await.unwrap();
    assert_eq!(reply, RespValue::Bulk("SERVER".to_string()));
    assert!(pool.status().await.primary_connected());
}

#[tokio::test]
async fn test_pool_read_round_robin_live() {
    let (addr, _server) = spawn_echo_server().await;
    let pool = IndexPool::new(PoolConfig {
        primary_addr: addr.clone(),
        replica_addrs: vec![addr],
        connection: fast_config("unused"),
        probe_interval: Duration::from_secs(60),
        retry_delays: vec![Duration::from_millis(1)],
    });
    for _ in 0..4 {
        let reply = pool.execute_read(&Command::Ping).await.unwrap();
        assert_eq!(reply, RespValue::Simple("PONG".to_string()));
    }
    // Both members served at least one read.
    let status = pool.status().await;
    assert_eq!(status.connected_count(), 2);
}
