//! Parallel ingest with consistent customer-to-worker hashing.
//!
//! A single dispatcher reads the feed and routes each event to the worker
//! that owns its customer. Every customer maps to exactly one worker, so
//! events for one customer are applied in feed order, while different
//! customers proceed in parallel. The dedup set stays shared through the
//! engine.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::engine::{AggregationEngine, IngestStats};
use crate::event::RawEvent;
use crate::sink::SnapshotSink;

/// Per-worker statistics.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    pub worker_id: usize,
    pub outcomes: IngestStats,
    /// Distinct customers this worker applied events for.
    pub customers: usize,
}

/// Result of a sharded run.
#[derive(Debug)]
pub struct ShardReport<S> {
    pub total_events: u64,
    pub workers: Vec<WorkerStats>,
    /// One sink per worker, in worker order.
    pub sinks: Vec<S>,
    pub duration: Duration,
}

impl<S> ShardReport<S> {
    pub fn outcomes(&self) -> IngestStats {
        let mut total = IngestStats::default();
        for worker in &self.workers {
            total += worker.outcomes;
        }
        total
    }

    pub fn throughput(&self) -> f64 {
        if self.duration.as_secs_f64() > 0.0 {
            self.total_events as f64 / self.duration.as_secs_f64()
        } else {
            0.0
        }
    }
}

/// Fans a feed out to worker threads partitioned by `customer_id`.
pub struct ShardedIngest {
    engine: Arc<AggregationEngine>,
    worker_count: usize,
    channel_capacity: usize,
}

impl ShardedIngest {
    pub fn new(engine: Arc<AggregationEngine>, worker_count: usize) -> Self {
        Self {
            engine,
            worker_count: worker_count.max(1),
            channel_capacity: 1000,
        }
    }

    /// Use the worker count and channel capacity from the engine's config.
    pub fn from_config(engine: Arc<AggregationEngine>) -> Self {
        let workers = engine.config().workers;
        let capacity = engine.config().channel_capacity;
        Self::new(engine, workers).channel_capacity(capacity)
    }

    /// Set channel capacity (default: 1000).
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Worker that owns `customer_id`.
    pub fn worker_for(&self, customer_id: &str) -> usize {
        hash_customer_to_worker(customer_id, self.worker_count)
    }

    /// Ingest `events`, giving each worker its own sink from `sink_factory`.
    pub fn run<I, S, F>(&self, events: I, sink_factory: F) -> Result<ShardReport<S>>
    where
        I: IntoIterator<Item = RawEvent>,
        S: SnapshotSink + Send + 'static,
        F: FnMut(usize) -> S,
    {
        let sinks = (0..self.worker_count).map(sink_factory).collect();
        self.run_with_sinks(events, sinks)
    }

    /// Ingest `events` with one pre-built sink per worker, in worker order.
    pub fn run_with_sinks<I, S>(&self, events: I, sinks: Vec<S>) -> Result<ShardReport<S>>
    where
        I: IntoIterator<Item = RawEvent>,
        S: SnapshotSink + Send + 'static,
    {
        if sinks.len() != self.worker_count {
            return Err(anyhow!(
                "expected {} sinks, got {}",
                self.worker_count,
                sinks.len()
            ));
        }

        let mut worker_txs = Vec::with_capacity(self.worker_count);
        let mut worker_handles = Vec::with_capacity(self.worker_count);

        for (worker_id, mut sink) in sinks.into_iter().enumerate() {
            let (tx, rx) = mpsc::sync_channel::<RawEvent>(self.channel_capacity);
            worker_txs.push(tx);

            let engine = Arc::clone(&self.engine);
            let handle = thread::Builder::new()
                .name(format!("ingest-worker-{}", worker_id))
                .spawn(move || -> Result<(WorkerStats, S)> {
                    let mut stats = WorkerStats {
                        worker_id,
                        ..WorkerStats::default()
                    };
                    let mut customers = HashSet::new();

                    while let Ok(raw) = rx.recv() {
                        let outcome = engine.ingest_raw(raw);
                        if let Ok(snapshot) = &outcome {
                            sink.publish(snapshot)
                                .map_err(|e| anyhow!("worker {} sink failed: {}", worker_id, e))?;
                            if !customers.contains(&snapshot.customer_id) {
                                customers.insert(snapshot.customer_id.clone());
                            }
                        }
                        stats.outcomes.record(&outcome);
                    }

                    sink.flush()
                        .map_err(|e| anyhow!("worker {} sink flush failed: {}", worker_id, e))?;
                    stats.customers = customers.len();
                    Ok((stats, sink))
                })
                .map_err(|e| anyhow!("Failed to spawn worker thread: {}", e))?;

            worker_handles.push(handle);
        }

        let mut total_events = 0;
        let mut dispatch_error = None;
        let start = Instant::now();

        for raw in events {
            // Events without a customer cannot be routed; worker 0 rejects them.
            let worker_id = raw
                .customer_id
                .as_deref()
                .map(|id| hash_customer_to_worker(id, self.worker_count))
                .unwrap_or(0);

            if worker_txs[worker_id].send(raw).is_err() {
                dispatch_error = Some(anyhow!("worker {} stopped accepting events", worker_id));
                break;
            }

            total_events += 1;
            if total_events % 100_000 == 0 {
                let elapsed = start.elapsed().as_secs_f64();
                let throughput = total_events as f64 / elapsed;
                log::info!("Dispatched {} events ({:.0} events/sec)", total_events, throughput);
            }
        }

        // Close all channels
        drop(worker_txs);

        let mut workers = Vec::with_capacity(worker_handles.len());
        let mut sinks = Vec::with_capacity(worker_handles.len());
        let mut worker_error = None;
        for handle in worker_handles {
            match handle.join() {
                Ok(Ok((stats, sink))) => {
                    workers.push(stats);
                    sinks.push(sink);
                }
                Ok(Err(err)) => {
                    worker_error.get_or_insert(err);
                }
                Err(_) => {
                    worker_error.get_or_insert(anyhow!("worker thread panicked"));
                }
            }
        }
        // A stopped worker is the cause of a failed send; report it first.
        if let Some(err) = worker_error.or(dispatch_error) {
            return Err(err);
        }

        Ok(ShardReport {
            total_events,
            workers,
            sinks,
            duration: start.elapsed(),
        })
    }
}

/// Hash a customer to a worker ID (consistent hashing).
fn hash_customer_to_worker(customer_id: &str, worker_count: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    customer_id.hash(&mut hasher);
    (hasher.finish() as usize) % worker_count
}
