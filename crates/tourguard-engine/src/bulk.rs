// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bulk location processor.
//!
//! A FIFO queue feeds a single worker: batches start on a size trigger or a
//! time trigger, and exactly one batch is in flight at a time. Each batch is
//! split into `concurrency` chunks processed in parallel; every location is
//! written through the indexer and evaluated against zones, with resulting
//! events handed to the dispatcher. A failed location re-enters the head of
//! the queue with an incremented retry count until `max_retries`, after which
//! it surfaces as a `LocationFailed` observation, never a crash.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::{Mutex, Notify, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, instrument, warn};

use crate::config::BulkSettings;
use crate::detector::GeofenceDetector;
use crate::error::Result;
use crate::locations::{LocationIndexer, validate_location};
use crate::observations::{Observation, ObservationBus};
use crate::types::LocationUpdate;

/// Rolling processing-time sample cap.
const PROCESSING_SAMPLES: usize = 1000;

/// Throughput window.
const THROUGHPUT_WINDOW_SECS: u64 = 5;

#[derive(Debug, Clone)]
struct QueuedLocation {
    location: LocationUpdate,
    retries: u32,
}

#[derive(Default)]
struct BulkCounters {
    total_processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    samples: std::sync::Mutex<VecDeque<u64>>,
    completions: std::sync::Mutex<VecDeque<Instant>>,
}

impl BulkCounters {
    fn record_success(&self, elapsed_ms: u64) {
        self.total_processed.fetch_add(1, Ordering::Relaxed);
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        {
            let mut samples = self.samples.lock().expect("bulk samples poisoned");
            if samples.len() >= PROCESSING_SAMPLES {
                samples.pop_front();
            }
            samples.push_back(elapsed_ms);
        }
        let mut completions = self.completions.lock().expect("bulk completions poisoned");
        let now = Instant::now();
        completions.push_back(now);
        while completions
            .front()
            .is_some_and(|t| now.duration_since(*t).as_secs() >= THROUGHPUT_WINDOW_SECS)
        {
            completions.pop_front();
        }
    }

    fn record_failure(&self) {
        self.total_processed.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    fn average_ms(&self) -> f64 {
        let samples = self.samples.lock().expect("bulk samples poisoned");
        if samples.is_empty() {
            0.0
        } else {
            samples.iter().sum::<u64>() as f64 / samples.len() as f64
        }
    }

    fn throughput_per_second(&self) -> f64 {
        let mut completions = self.completions.lock().expect("bulk completions poisoned");
        let now = Instant::now();
        while completions
            .front()
            .is_some_and(|t| now.duration_since(*t).as_secs() >= THROUGHPUT_WINDOW_SECS)
        {
            completions.pop_front();
        }
        completions.len() as f64 / THROUGHPUT_WINDOW_SECS as f64
    }
}

/// Processing statistics snapshot.
#[derive(Debug, Clone, Copy, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingStats {
    pub total_processed: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub average_processing_ms: f64,
    pub queue_size: usize,
    pub throughput_per_second: f64,
}

/// The bulk processor.
pub struct BulkProcessor {
    locations: Arc<LocationIndexer>,
    detector: Arc<GeofenceDetector>,
    settings: BulkSettings,
    bus: ObservationBus,
    queue: Mutex<VecDeque<QueuedLocation>>,
    wake: Notify,
    counters: BulkCounters,
}

impl BulkProcessor {
    pub fn new(
        locations: Arc<LocationIndexer>,
        detector: Arc<GeofenceDetector>,
        settings: BulkSettings,
        bus: ObservationBus,
    ) -> Self {
        Self {
            locations,
            detector,
            settings,
            bus,
            queue: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            counters: BulkCounters::default(),
        }
    }

    // ========== Enqueue ==========

    /// Queue one update. Validation failures are returned to the caller
    /// immediately and never enter the queue.
    #[instrument(skip(self, location), fields(user_id = %location.user_id))]
    pub async fn enqueue(&self, location: LocationUpdate) -> Result<()> {
        validate_location(&location)?;
        self.push_back(vec![QueuedLocation {
            location,
            retries: 0,
        }])
        .await;
        Ok(())
    }

    /// Queue a whole batch. The batch is validated up front; one invalid item
    /// rejects the batch without enqueueing anything.
    #[instrument(skip(self, batch), fields(count = batch.len()))]
    pub async fn enqueue_batch(&self, batch: Vec<LocationUpdate>) -> Result<usize> {
        for location in &batch {
            validate_location(location)?;
        }
        let count = batch.len();
        self.push_back(
            batch
                .into_iter()
                .map(|location| QueuedLocation {
                    location,
                    retries: 0,
                })
                .collect(),
        )
        .await;
        Ok(count)
    }

    async fn push_back(&self, items: Vec<QueuedLocation>) {
        let depth = {
            let mut queue = self.queue.lock().await;
            queue.extend(items);
            queue.len()
        };
        if depth > self.settings.queue_warn_depth {
            self.bus.emit(Observation::QueueOverflow {
                component: "bulk",
                depth,
            });
        }
        if depth >= self.settings.batch_size {
            self.wake.notify_one();
        }
    }

    /// Current queue depth.
    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Statistics snapshot.
    pub async fn stats(&self) -> ProcessingStats {
        ProcessingStats {
            total_processed: self.counters.total_processed.load(Ordering::Relaxed),
            success_count: self.counters.succeeded.load(Ordering::Relaxed),
            error_count: self.counters.failed.load(Ordering::Relaxed),
            average_processing_ms: self.counters.average_ms(),
            queue_size: self.queue.lock().await.len(),
            throughput_per_second: self.counters.throughput_per_second(),
        }
    }

    // ========== Processing ==========

    /// Process one batch from the queue head. Returns the number of items
    /// taken. The worker loop guarantees single-flight; callers during
    /// shutdown reuse this for draining.
    pub async fn process_batch(self: &Arc<Self>) -> usize {
        let batch: Vec<QueuedLocation> = {
            let mut queue = self.queue.lock().await;
            let take = queue.len().min(self.settings.batch_size);
            queue.drain(..take).collect()
        };
        if batch.is_empty() {
            return 0;
        }
        let taken = batch.len();

        // Split into `concurrency` chunks processed in parallel. Ordering
        // across chunks is not preserved; consumers order by timestamp.
        let chunk_count = self.settings.concurrency.max(1).min(taken);
        let chunk_size = taken.div_ceil(chunk_count);
        let mut tasks: JoinSet<Vec<QueuedLocation>> = JoinSet::new();
        for chunk in batch.chunks(chunk_size) {
            let processor = Arc::clone(self);
            let chunk = chunk.to_vec();
            tasks.spawn(async move { processor.process_chunk(chunk).await });
        }

        let mut requeue: Vec<QueuedLocation> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(mut failed) => requeue.append(&mut failed),
                Err(e) => warn!(error = %e, "bulk chunk task panicked"),
            }
        }

        if !requeue.is_empty() {
            // Retried items re-enter the head so per-user FIFO degrades as
            // little as possible.
            let mut queue = self.queue.lock().await;
            for item in requeue.into_iter().rev() {
                queue.push_front(item);
            }
        }
        taken
    }

    /// Process one chunk sequentially; returns items to requeue.
    async fn process_chunk(&self, chunk: Vec<QueuedLocation>) -> Vec<QueuedLocation> {
        let mut requeue = Vec::new();
        for mut item in chunk {
            let started = Instant::now();
            match self.process_one(&item.location).await {
                Ok(()) => {
                    self.counters
                        .record_success(started.elapsed().as_millis() as u64);
                }
                Err(e) => {
                    item.retries += 1;
                    if item.retries <= self.settings.max_retries {
                        debug!(
                            user_id = %item.location.user_id,
                            retries = item.retries,
                            error = %e,
                            "bulk item failed, requeueing"
                        );
                        requeue.push(item);
                    } else {
                        self.counters.record_failure();
                        warn!(
                            user_id = %item.location.user_id,
                            error = %e,
                            "bulk item dropped after retry budget"
                        );
                        self.bus.emit(Observation::LocationFailed {
                            user_id: item.location.user_id.clone(),
                            error: e.to_string(),
                        });
                    }
                }
            }
        }
        requeue
    }

    /// Index the location, evaluate zone membership, dispatch events.
    async fn process_one(&self, location: &LocationUpdate) -> Result<()> {
        let stamped = self.locations.update_location(location.clone()).await?;
        self.detector.process_location(&stamped, "bulk").await?;
        Ok(())
    }

    /// Drain the queue completely (used on shutdown). Terminates because
    /// items either succeed or exhaust their retry budget and are dropped.
    pub async fn drain(self: &Arc<Self>) {
        loop {
            if self.process_batch().await == 0 {
                break;
            }
        }
    }

    // ========== Worker ==========

    /// Spawn the single batch worker: wakes on the size trigger or the time
    /// trigger, drains what is queued on shutdown.
    pub fn spawn_worker(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let processor = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                batch_size = processor.settings.batch_size,
                concurrency = processor.settings.concurrency,
                "bulk worker started"
            );
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            processor.drain().await;
                            break;
                        }
                    }

                    _ = processor.wake.notified() => {
                        processor.process_batch().await;
                    }

                    _ = tokio::time::sleep(processor.settings.flush_interval) => {
                        processor.process_batch().await;
                    }
                }
            }
            info!("bulk worker stopped");
        })
    }
}
