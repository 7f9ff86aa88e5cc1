// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request governor fronting the index pool.
//!
//! A single loop owns the priority queue, the sliding rate-limit window and
//! the concurrency budget; workers it spawns execute against the pool. Higher
//! priority is served first, FIFO within a priority. Reads are routed to the
//! highest-scoring connected handle and the scoring rules (+5/+2/+1 by
//! latency, -10 on failure) are applied per attempt. Writes delegate to the
//! pool's primary-only retry cycle, so the governor does not retry them
//! again.
//!
//! On shutdown every queued request is rejected with `QueueCleared`.

use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use tokio::sync::{Semaphore, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tourguard_protocol::{Command, IndexPool, RespValue};

use crate::config::GovernorSettings;
use crate::error::{EngineError, Result};
use crate::observations::{Observation, ObservationBus};

/// Background sweeps and maintenance.
pub const PRIORITY_LOW: i32 = -10;
/// Interactive operations.
pub const PRIORITY_NORMAL: i32 = 0;
/// Health probes and admin operations.
pub const PRIORITY_HIGH: i32 = 10;

/// Rolling latency sample cap.
const LATENCY_SAMPLES: usize = 1000;

struct PendingRequest {
    priority: i32,
    seq: u64,
    commands: Vec<Command>,
    write: bool,
    respond: oneshot::Sender<Result<Vec<RespValue>>>,
}

impl PartialEq for PendingRequest {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for PendingRequest {}
impl PartialOrd for PendingRequest {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for PendingRequest {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority first, then lower sequence (FIFO).
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct SharedStats {
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    queue_depth: AtomicUsize,
    latencies: std::sync::Mutex<VecDeque<u64>>,
}

impl SharedStats {
    fn record_latency(&self, elapsed_ms: u64) {
        let mut samples = self.latencies.lock().expect("latency samples poisoned");
        if samples.len() >= LATENCY_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(elapsed_ms);
    }

    fn average_latency_ms(&self) -> f64 {
        let samples = self.latencies.lock().expect("latency samples poisoned");
        if samples.is_empty() {
            0.0
        } else {
            samples.iter().sum::<u64>() as f64 / samples.len() as f64
        }
    }
}

/// Point-in-time governor statistics.
#[derive(Debug, Clone, Copy, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GovernorStats {
    pub total_requests: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub queue_depth: usize,
    pub average_latency_ms: f64,
}

impl GovernorStats {
    /// Failure rate in [0, 1]; 0 when nothing has completed yet.
    pub fn failure_rate(&self) -> f64 {
        let done = self.succeeded + self.failed;
        if done == 0 {
            0.0
        } else {
            self.failed as f64 / done as f64
        }
    }
}

/// Handle for submitting operations to the governor loop.
pub struct RequestGovernor {
    tx: mpsc::UnboundedSender<PendingRequest>,
    seq: AtomicU64,
    stats: Arc<SharedStats>,
}

impl RequestGovernor {
    /// Spawn the governor loop. Returns the submit handle and the loop task.
    pub fn spawn(
        pool: Arc<IndexPool>,
        settings: GovernorSettings,
        bus: ObservationBus,
        shutdown: watch::Receiver<bool>,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(SharedStats::default());
        let governor = Arc::new(Self {
            tx,
            seq: AtomicU64::new(0),
            stats: Arc::clone(&stats),
        });
        let handle = tokio::spawn(run_loop(pool, settings, bus, stats, rx, shutdown));
        (governor, handle)
    }

    /// Execute a read at the given priority.
    pub async fn execute_read(&self, command: Command, priority: i32) -> Result<RespValue> {
        let mut replies = self.submit(vec![command], false, priority).await?;
        replies.pop().ok_or(EngineError::Internal {
            message: "empty reply set".to_string(),
        })
    }

    /// Execute a write at the given priority.
    pub async fn execute_write(&self, command: Command, priority: i32) -> Result<RespValue> {
        let mut replies = self.submit(vec![command], true, priority).await?;
        replies.pop().ok_or(EngineError::Internal {
            message: "empty reply set".to_string(),
        })
    }

    /// Execute a pipelined write batch as one governed operation.
    pub async fn execute_write_batch(
        &self,
        commands: Vec<Command>,
        priority: i32,
    ) -> Result<Vec<RespValue>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        self.submit(commands, true, priority).await
    }

    async fn submit(
        &self,
        commands: Vec<Command>,
        write: bool,
        priority: i32,
    ) -> Result<Vec<RespValue>> {
        let (respond, rx) = oneshot::channel();
        let request = PendingRequest {
            priority,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            commands,
            write,
            respond,
        };
        self.stats.total.fetch_add(1, Ordering::Relaxed);
        self.tx.send(request).map_err(|_| EngineError::QueueCleared)?;
        rx.await.map_err(|_| EngineError::QueueCleared)?
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> GovernorStats {
        GovernorStats {
            total_requests: self.stats.total.load(Ordering::Relaxed),
            succeeded: self.stats.succeeded.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            queue_depth: self.stats.queue_depth.load(Ordering::Relaxed),
            average_latency_ms: self.stats.average_latency_ms(),
        }
    }
}

async fn run_loop(
    pool: Arc<IndexPool>,
    settings: GovernorSettings,
    bus: ObservationBus,
    stats: Arc<SharedStats>,
    mut rx: mpsc::UnboundedReceiver<PendingRequest>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        max_rps = settings.max_requests_per_second,
        max_concurrent = settings.max_concurrent_queries,
        "request governor started"
    );

    let mut heap: BinaryHeap<PendingRequest> = BinaryHeap::new();
    let mut window: VecDeque<Instant> = VecDeque::new();
    let semaphore = Arc::new(Semaphore::new(settings.max_concurrent_queries.max(1)));

    let enqueue = |heap: &mut BinaryHeap<PendingRequest>,
                   request: PendingRequest,
                   stats: &SharedStats,
                   bus: &ObservationBus| {
        heap.push(request);
        stats.queue_depth.store(heap.len(), Ordering::Relaxed);
        if heap.len() > settings.queue_warn_depth {
            bus.emit(Observation::QueueOverflow {
                component: "governor",
                depth: heap.len(),
            });
        }
    };

    'main: loop {
        // Age out window slots.
        let now = Instant::now();
        while window
            .front()
            .is_some_and(|t| now.duration_since(*t) >= settings.window)
        {
            window.pop_front();
        }

        if heap.is_empty() {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break 'main;
                    }
                }

                request = rx.recv() => match request {
                    Some(request) => enqueue(&mut heap, request, &stats, &bus),
                    None => break 'main,
                }
            }
            continue;
        }

        // Rate limit: wait for the oldest slot to age out of the window.
        if window.len() >= settings.max_requests_per_second {
            // With a zero cap the window can be empty; wait a full window.
            let wait = window
                .front()
                .map(|oldest| settings.window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(settings.window);
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break 'main;
                    }
                }

                request = rx.recv() => {
                    if let Some(request) = request {
                        enqueue(&mut heap, request, &stats, &bus);
                    }
                }

                _ = tokio::time::sleep(wait) => {}
            }
            continue;
        }

        // Concurrency budget.
        let permit = tokio::select! {
            biased;

            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break 'main;
                }
                continue;
            }

            request = rx.recv() => {
                if let Some(request) = request {
                    enqueue(&mut heap, request, &stats, &bus);
                }
                continue;
            }

            permit = Arc::clone(&semaphore).acquire_owned() => {
                permit.expect("governor semaphore closed")
            }
        };

        let Some(request) = heap.pop() else {
            continue;
        };
        stats.queue_depth.store(heap.len(), Ordering::Relaxed);
        window.push_back(Instant::now());

        let pool = Arc::clone(&pool);
        let stats = Arc::clone(&stats);
        let settings = settings.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let result = dispatch(&pool, &settings, &request.commands, request.write).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            stats.record_latency(elapsed_ms);
            match &result {
                Ok(_) => stats.succeeded.fetch_add(1, Ordering::Relaxed),
                Err(_) => stats.failed.fetch_add(1, Ordering::Relaxed),
            };
            let _ = request.respond.send(result);
            drop(permit);
        });
    }

    // Reject everything still queued.
    let mut cleared = 0usize;
    while let Some(request) = heap.pop() {
        let _ = request.respond.send(Err(EngineError::QueueCleared));
        cleared += 1;
    }
    while let Ok(request) = rx.try_recv() {
        let _ = request.respond.send(Err(EngineError::QueueCleared));
        cleared += 1;
    }
    stats.queue_depth.store(0, Ordering::Relaxed);
    if cleared > 0 {
        warn!(cleared, "governor cleared queued requests on shutdown");
    }
    info!("request governor stopped");
}

/// Execute one request with per-request retries.
///
/// Only transport-class errors are retried; index error replies come back as
/// values and validation never reaches this layer.
async fn dispatch(
    pool: &IndexPool,
    settings: &GovernorSettings,
    commands: &[Command],
    write: bool,
) -> Result<Vec<RespValue>> {
    let mut last: Option<EngineError> = None;
    for attempt in 0..=settings.retry_attempts {
        if attempt > 0 {
            let delay = settings.retry_delay * (1u32 << (attempt - 1).min(16));
            tokio::time::sleep(delay).await;
        }

        let result = if write {
            execute_write(pool, commands).await
        } else {
            execute_read(pool, commands).await
        };

        match result {
            Ok(replies) => return Ok(replies),
            Err(e) if e.is_retryable() && attempt < settings.retry_attempts => {
                debug!(attempt, error = %e, "governed operation failed, retrying");
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last.unwrap_or(EngineError::NoHealthyConnection))
}

async fn execute_write(pool: &IndexPool, commands: &[Command]) -> Result<Vec<RespValue>> {
    // The pool owns the primary retry cycle (fresh attempt, 1s/2s/3s).
    if commands.len() == 1 {
        Ok(vec![pool.execute_write(&commands[0]).await?])
    } else {
        Ok(pool.execute_write_batch(commands).await?)
    }
}

async fn execute_read(pool: &IndexPool, commands: &[Command]) -> Result<Vec<RespValue>> {
    // Health-aware routing: pick the highest-scoring candidate.
    let candidates = pool.read_candidates().await;
    let mut best: Option<(String, i32)> = None;
    for id in candidates {
        if let Some(score) = pool.score_of(&id).await {
            if best.as_ref().is_none_or(|(_, s)| score > *s) {
                best = Some((id, score));
            }
        }
    }
    let (handle, _) = best.ok_or(EngineError::NoHealthyConnection)?;

    let mut replies = Vec::with_capacity(commands.len());
    for command in commands {
        let started = Instant::now();
        match pool.execute_on(&handle, command).await {
            Ok(reply) => {
                pool.note_success(&handle, started.elapsed()).await;
                replies.push(reply);
            }
            Err(e) => {
                pool.note_failure(&handle, &e.to_string()).await;
                return Err(e.into());
            }
        }
    }
    Ok(replies)
}
