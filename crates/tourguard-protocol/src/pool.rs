// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Primary/replica connection pool with health tracking.
//!
//! One primary carries every write; reads round-robin across the primary and
//! any healthy replica. Each member keeps a connection record (role, health
//! score 0-100 starting at 50, last error, last good ping). A background
//! probe pings every member on an interval and restores recovered members to
//! the read rotation.
//!
//! Writes are never redirected to a replica: a failing primary surfaces
//! [`PoolError::PrimaryUnavailable`] after the retry budget.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::command::Command;
use crate::connection::{Connection, ConnectionConfig, ConnectionError};
use crate::resp::RespValue;

/// Health score bounds and starting point.
const SCORE_MIN: i32 = 0;
const SCORE_MAX: i32 = 100;
const SCORE_START: i32 = 50;

/// Errors surfaced by the pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("primary index connection unavailable: {0}")]
    PrimaryUnavailable(String),

    #[error("no healthy index connection for reads")]
    NoHealthyConnection,

    #[error("unknown connection id: {0}")]
    UnknownConnection(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Role of a pool member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Primary,
    Replica,
}

impl ConnectionRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Replica => "replica",
        }
    }
}

/// Snapshot of one member's record.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub id: String,
    pub role: ConnectionRole,
    pub addr: String,
    pub connected: bool,
    pub health_score: i32,
    pub last_error: Option<String>,
    /// Seconds since the last successful ping, if any.
    pub last_ping_age_secs: Option<u64>,
}

/// Snapshot of the whole pool.
#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub connections: Vec<ConnectionRecord>,
}

impl PoolStatus {
    /// Whether the primary is currently connected.
    pub fn primary_connected(&self) -> bool {
        self.connections
            .iter()
            .any(|c| c.role == ConnectionRole::Primary && c.connected)
    }

    /// Number of connected members.
    pub fn connected_count(&self) -> usize {
        self.connections.iter().filter(|c| c.connected).count()
    }
}

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Primary `host:port`.
    pub primary_addr: String,
    /// Replica `host:port` list, possibly empty.
    pub replica_addrs: Vec<String>,
    /// Per-connection transport settings.
    pub connection: ConnectionConfig,
    /// Health probe interval.
    pub probe_interval: Duration,
    /// Delays between operation retries (attempt count = len + 1).
    pub retry_delays: Vec<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            primary_addr: "127.0.0.1:9851".to_string(),
            replica_addrs: Vec::new(),
            connection: ConnectionConfig::default(),
            probe_interval: Duration::from_secs(30),
            retry_delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(3),
            ],
        }
    }
}

struct MemberState {
    connected: bool,
    health_score: i32,
    last_error: Option<String>,
    last_ping_ok: Option<Instant>,
}

struct Member {
    id: String,
    role: ConnectionRole,
    conn: Connection,
    state: RwLock<MemberState>,
}

impl Member {
    fn new(id: String, role: ConnectionRole, addr: &str, config: &ConnectionConfig) -> Self {
        let conn_config = ConnectionConfig {
            addr: addr.to_string(),
            ..config.clone()
        };
        Self {
            id,
            role,
            conn: Connection::new(conn_config),
            state: RwLock::new(MemberState {
                connected: false,
                health_score: SCORE_START,
                last_error: None,
                last_ping_ok: None,
            }),
        }
    }

    async fn mark_up(&self) {
        let mut state = self.state.write().await;
        state.connected = true;
        state.last_error = None;
    }

    async fn mark_down(&self, error: &str) {
        let mut state = self.state.write().await;
        state.connected = false;
        state.last_error = Some(error.to_string());
    }

    async fn record(&self) -> ConnectionRecord {
        let state = self.state.read().await;
        ConnectionRecord {
            id: self.id.clone(),
            role: self.role,
            addr: self.conn.addr().to_string(),
            connected: state.connected,
            health_score: state.health_score,
            last_error: state.last_error.clone(),
            last_ping_age_secs: state.last_ping_ok.map(|t| t.elapsed().as_secs()),
        }
    }
}

/// The primary/replica pool.
pub struct IndexPool {
    members: Vec<Arc<Member>>,
    config: PoolConfig,
    read_cursor: AtomicUsize,
}

impl IndexPool {
    /// Build the pool. No I/O happens here; connections open lazily.
    pub fn new(config: PoolConfig) -> Self {
        let mut members = Vec::with_capacity(1 + config.replica_addrs.len());
        members.push(Arc::new(Member::new(
            "primary".to_string(),
            ConnectionRole::Primary,
            &config.primary_addr,
            &config.connection,
        )));
        for (i, addr) in config.replica_addrs.iter().enumerate() {
            members.push(Arc::new(Member::new(
                format!("replica-{i}"),
                ConnectionRole::Replica,
                addr,
                &config.connection,
            )));
        }
        Self {
            members,
            config,
            read_cursor: AtomicUsize::new(0),
        }
    }

    fn primary(&self) -> &Arc<Member> {
        // Construction always places the primary first.
        &self.members[0]
    }

    fn member(&self, id: &str) -> Option<&Arc<Member>> {
        self.members.iter().find(|m| m.id == id)
    }

    /// Snapshot of every member record.
    pub async fn status(&self) -> PoolStatus {
        let mut connections = Vec::with_capacity(self.members.len());
        for member in &self.members {
            connections.push(member.record().await);
        }
        PoolStatus { connections }
    }

    /// Ids eligible for reads: connected members, or every member when none
    /// is connected yet (lets lazy connects happen on first use).
    pub async fn read_candidates(&self) -> Vec<String> {
        let mut connected = Vec::new();
        for member in &self.members {
            if member.state.read().await.connected {
                connected.push(member.id.clone());
            }
        }
        if connected.is_empty() {
            self.members.iter().map(|m| m.id.clone()).collect()
        } else {
            connected
        }
    }

    /// Current health score of a member.
    pub async fn score_of(&self, id: &str) -> Option<i32> {
        match self.member(id) {
            Some(m) => Some(m.state.read().await.health_score),
            None => None,
        }
    }

    /// Apply the success scoring rule: +5 under 100 ms, +2 under 500 ms,
    /// otherwise +1. Clamped to [0, 100].
    pub async fn note_success(&self, id: &str, latency: Duration) {
        if let Some(member) = self.member(id) {
            let bump = if latency < Duration::from_millis(100) {
                5
            } else if latency < Duration::from_millis(500) {
                2
            } else {
                1
            };
            let mut state = member.state.write().await;
            state.health_score = (state.health_score + bump).min(SCORE_MAX);
            state.connected = true;
            state.last_error = None;
        }
    }

    /// Apply the failure scoring rule: -10, clamped to [0, 100].
    pub async fn note_failure(&self, id: &str, error: &str) {
        if let Some(member) = self.member(id) {
            let mut state = member.state.write().await;
            state.health_score = (state.health_score - 10).max(SCORE_MIN);
            state.last_error = Some(error.to_string());
        }
    }

    /// Execute a command on a specific member (used by health-aware routing).
    pub async fn execute_on(&self, id: &str, command: &Command) -> Result<RespValue, PoolError> {
        let member = self
            .member(id)
            .ok_or_else(|| PoolError::UnknownConnection(id.to_string()))?;
        match member.conn.execute(command).await {
            Ok(reply) => {
                member.mark_up().await;
                Ok(reply)
            }
            Err(e) => {
                member.mark_down(&e.to_string()).await;
                Err(e.into())
            }
        }
    }

    /// Execute a read with round-robin handle selection and per-operation
    /// retries (fresh handle each attempt).
    pub async fn execute_read(&self, command: &Command) -> Result<RespValue, PoolError> {
        let attempts = self.config.retry_delays.len() + 1;
        let mut last_error: Option<PoolError> = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry_delays[attempt - 1]).await;
            }
            let candidates = self.read_candidates().await;
            if candidates.is_empty() {
                return Err(PoolError::NoHealthyConnection);
            }
            let idx = self.read_cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
            let id = &candidates[idx];
            match self.execute_on(id, command).await {
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    debug!(connection = %id, attempt, error = %e, "read attempt failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or(PoolError::NoHealthyConnection))
    }

    /// Execute a write on the primary with retries. Never touches replicas.
    pub async fn execute_write(&self, command: &Command) -> Result<RespValue, PoolError> {
        let attempts = self.config.retry_delays.len() + 1;
        let primary = self.primary();
        let mut last = String::new();

        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry_delays[attempt - 1]).await;
            }
            match primary.conn.execute(command).await {
                Ok(reply) => {
                    primary.mark_up().await;
                    return Ok(reply);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "primary write attempt failed");
                    last = e.to_string();
                    primary.mark_down(&last).await;
                }
            }
        }
        Err(PoolError::PrimaryUnavailable(last))
    }

    /// Pipeline a batch of writes on the primary. One retry cycle for the
    /// whole batch; partial replies are never returned.
    pub async fn execute_write_batch(
        &self,
        commands: &[Command],
    ) -> Result<Vec<RespValue>, PoolError> {
        let attempts = self.config.retry_delays.len() + 1;
        let primary = self.primary();
        let mut last = String::new();

        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry_delays[attempt - 1]).await;
            }
            match primary.conn.execute_batch(commands).await {
                Ok(replies) => {
                    primary.mark_up().await;
                    return Ok(replies);
                }
                Err(e) => {
                    warn!(attempt, batch = commands.len(), error = %e, "primary batch attempt failed");
                    last = e.to_string();
                    primary.mark_down(&last).await;
                }
            }
        }
        Err(PoolError::PrimaryUnavailable(last))
    }

    /// Close every member connection.
    pub async fn close(&self) {
        for member in &self.members {
            member.conn.close().await;
            member.mark_down("closed").await;
        }
        info!("index pool closed");
    }

    /// Spawn the periodic health probe.
    ///
    /// Pings every member on the configured interval; a successful ping marks
    /// the member connected (restoring it to the read rotation), a failure
    /// marks it down and attempts one reconnect in the background of the next
    /// cycle.
    pub fn spawn_probe(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                interval_secs = pool.config.probe_interval.as_secs(),
                members = pool.members.len(),
                "index health probe started"
            );
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("index health probe received shutdown signal");
                            break;
                        }
                    }

                    _ = tokio::time::sleep(pool.config.probe_interval) => {
                        pool.probe_once().await;
                    }
                }
            }
            info!("index health probe stopped");
        })
    }

    /// One probe cycle over every member.
    pub async fn probe_once(&self) {
        for member in &self.members {
            match member.conn.ping().await {
                Ok(true) => {
                    let mut state = member.state.write().await;
                    state.connected = true;
                    state.last_error = None;
                    state.last_ping_ok = Some(Instant::now());
                }
                Ok(false) => {
                    warn!(connection = %member.id, "unexpected ping reply");
                    member.mark_down("unexpected ping reply").await;
                }
                Err(e) => {
                    debug!(connection = %member.id, error = %e, "ping failed");
                    member.mark_down(&e.to_string()).await;
                }
            }
        }
    }
}

impl std::fmt::Debug for IndexPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexPool")
            .field("primary", &self.config.primary_addr)
            .field("replicas", &self.config.replica_addrs)
            .finish()
    }
}
