// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! One managed TCP connection to the spatial index.
//!
//! The connection opens lazily on first use and is reused while healthy, the
//! same discipline the engine applies to every external link. A failed
//! request drops the socket so the next call (or the pool's health probe)
//! re-establishes it. [`Connection::execute_batch`] pipelines a whole batch
//! in one write/read cycle.

use std::time::Duration;

use thiserror::Error;
use tokio::io::BufStream;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::command::Command;
use crate::resp::{self, RespError, RespValue};

/// Errors surfaced by a single connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connect to {addr} timed out after {timeout_ms}ms")]
    ConnectTimeout { addr: String, timeout_ms: u64 },

    #[error("connection retry budget exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },

    #[error("request timed out after {0}ms")]
    RequestTimeout(u64),

    #[error("protocol error: {0}")]
    Resp(#[from] RespError),

    #[error("not connected")]
    NotConnected,
}

/// Configuration for one index connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// `host:port` of the index server.
    pub addr: String,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Full request/response round-trip timeout.
    pub request_timeout: Duration,
    /// First reconnect delay; doubles per attempt.
    pub reconnect_initial_delay: Duration,
    /// Reconnect attempts before giving up.
    pub reconnect_max_attempts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:9851".to_string(),
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(5),
            reconnect_initial_delay: Duration::from_secs(1),
            reconnect_max_attempts: 5,
        }
    }
}

impl ConnectionConfig {
    /// Config for the given address with default timeouts.
    pub fn for_addr(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Default::default()
        }
    }
}

/// A lazily-opened, reusable connection to the index.
pub struct Connection {
    config: ConnectionConfig,
    stream: Mutex<Option<BufStream<TcpStream>>>,
}

impl Connection {
    /// Create an unopened connection.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            stream: Mutex::new(None),
        }
    }

    /// Remote address this connection targets.
    pub fn addr(&self) -> &str {
        &self.config.addr
    }

    /// Open the socket if it is not already open. Single attempt.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let mut guard = self.stream.lock().await;
        if guard.is_some() {
            debug!(addr = %self.config.addr, "reusing existing index connection");
            return Ok(());
        }
        *guard = Some(self.open_socket().await?);
        info!(addr = %self.config.addr, "connected to spatial index");
        Ok(())
    }

    /// Open with exponential backoff: initial delay, doubled per attempt, up
    /// to the configured attempt cap.
    pub async fn connect_with_backoff(&self) -> Result<(), ConnectionError> {
        let mut delay = self.config.reconnect_initial_delay;
        let mut last = String::new();
        for attempt in 1..=self.config.reconnect_max_attempts {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        addr = %self.config.addr,
                        attempt,
                        error = %e,
                        "index connect attempt failed"
                    );
                    last = e.to_string();
                }
            }
            if attempt < self.config.reconnect_max_attempts {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
        Err(ConnectionError::Exhausted {
            attempts: self.config.reconnect_max_attempts,
            last,
        })
    }

    async fn open_socket(&self) -> Result<BufStream<TcpStream>, ConnectionError> {
        let connect = TcpStream::connect(&self.config.addr);
        let stream = tokio::time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| ConnectionError::ConnectTimeout {
                addr: self.config.addr.clone(),
                timeout_ms: self.config.connect_timeout.as_millis() as u64,
            })?
            .map_err(|source| ConnectionError::Connect {
                addr: self.config.addr.clone(),
                source,
            })?;
        stream.set_nodelay(true).ok();
        Ok(BufStream::new(stream))
    }

    /// Execute one command and return the raw reply.
    ///
    /// Lazily connects when needed. Any transport failure drops the socket so
    /// the next call starts clean.
    pub async fn execute(&self, command: &Command) -> Result<RespValue, ConnectionError> {
        let mut replies = self.execute_batch(std::slice::from_ref(command)).await?;
        replies.pop().ok_or(ConnectionError::NotConnected)
    }

    /// Pipeline a batch: write every request, then read the replies in order.
    pub async fn execute_batch(
        &self,
        commands: &[Command],
    ) -> Result<Vec<RespValue>, ConnectionError> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }

        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            *guard = Some(self.open_socket().await?);
            info!(addr = %self.config.addr, "connected to spatial index");
        }
        let stream = guard.as_mut().ok_or(ConnectionError::NotConnected)?;

        let timeout_ms = self.config.request_timeout.as_millis() as u64;
        let round_trip = async {
            for command in commands {
                let args = command.to_args();
                resp::write_request(stream, &args).await?;
            }
            let mut replies = Vec::with_capacity(commands.len());
            for _ in commands {
                replies.push(resp::read_value(stream).await?);
            }
            Ok::<_, RespError>(replies)
        };

        match tokio::time::timeout(self.config.request_timeout, round_trip).await {
            Ok(Ok(replies)) => Ok(replies),
            Ok(Err(e)) => {
                // Transport is suspect; force a fresh socket next time.
                *guard = None;
                Err(e.into())
            }
            Err(_) => {
                *guard = None;
                Err(ConnectionError::RequestTimeout(timeout_ms))
            }
        }
    }

    /// Health probe: `PING` answered with `PONG` (or `OK`).
    pub async fn ping(&self) -> Result<bool, ConnectionError> {
        let reply = self.execute(&Command::Ping).await?;
        Ok(matches!(
            reply.as_str(),
            Some("PONG") | Some("OK") | Some("pong")
        ))
    }

    /// Whether a socket is currently open.
    pub async fn is_connected(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    /// Drop the socket.
    pub async fn close(&self) {
        let mut guard = self.stream.lock().await;
        if guard.take().is_some() {
            debug!(addr = %self.config.addr, "index connection closed");
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.config.addr)
            .finish()
    }
}
