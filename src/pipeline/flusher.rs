use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::backend_handler::BackendHandler;
use crate::stats::Statser;
use crate::types::{MetricMap, Tags};

/// Drives the periodic flush: snapshot every shard, merge, and hand the
/// result to every backend.
///
/// Ticks are absolute (a slow flush does not compound drift) and never
/// overlap: the flush runs inline in the tick loop, and ticks missed while
/// flushing are skipped and counted.
pub struct Flusher {
    handler: BackendHandler,
    interval: Duration,
    statser: Statser,
    cancel: CancellationToken,
    /// Only touched by the run loop.
    flush_skipped: u64,
}

impl Flusher {
    pub fn new(
        handler: BackendHandler,
        interval: Duration,
        statser: Statser,
        cancel: CancellationToken,
    ) -> Self {
        Flusher {
            handler,
            interval,
            statser,
            cancel,
            flush_skipped: 0,
        }
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; consume it so the first
        // flush happens one interval after startup.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {
                    self.flush_once().await;
                }
            }
        }
    }

    /// One flush cycle: flush + snapshot + reset on every shard, merge the
    /// snapshots, send to every backend.
    pub async fn flush_once(&mut self) {
        let started = Instant::now();

        let snapshots: Arc<Mutex<Vec<MetricMap>>> = Arc::new(Mutex::new(Vec::new()));
        let collected = Arc::clone(&snapshots);
        let interval = self.interval;
        let wait = self
            .handler
            .process(Arc::new(move |_, aggr| {
                aggr.flush(interval);
                let snapshot = aggr.reset();
                if !snapshot.is_empty() {
                    collected.lock().push(snapshot);
                }
            }))
            .await;
        wait.wait().await;

        let mut merged = MetricMap::new();
        for snapshot in snapshots.lock().drain(..) {
            merged.merge(snapshot);
        }

        if !merged.is_empty() {
            let merged = Arc::new(merged);
            for backend in self.handler.backends() {
                let name = backend.name();
                backend.send_metrics_async(
                    self.cancel.clone(),
                    Arc::clone(&merged),
                    Box::new(move |errors| {
                        for e in errors {
                            warn!(backend = name, error = %e, "failed to flush metrics");
                        }
                    }),
                );
            }
        }

        let elapsed = started.elapsed();
        if elapsed > self.interval {
            // Every full interval spent flushing suppressed one tick.
            self.flush_skipped += (elapsed.as_nanos() / self.interval.as_nanos().max(1)) as u64;
            warn!(
                elapsed = ?elapsed,
                interval = ?self.interval,
                "flush took longer than the flush interval"
            );
        }
        self.statser
            .gauge("flusher.flush_skipped", self.flush_skipped as f64, &Tags::new());

        // Wake everything that emits self-metrics per flush.
        self.statser.notify_flush();

        debug!(elapsed = ?elapsed, "flush complete");
    }
}
