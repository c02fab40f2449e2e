//! Internal self-metrics.
//!
//! Components report their own health (queue depths, cache hit rates, batch
//! counters) as ordinary gauges that are fed back into the pipeline after
//! the cloud handler, so they are aggregated and forwarded like any other
//! metric. Emission is driven by a flush notification so that most counters
//! can stay as plain fields on their owning task.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::types::{Metric, MetricMap, MetricValue, Nanotime, Source, Tags};

/// Counting barrier for in-flight work.
///
/// `add` before handing work off, `done` when it completes; `wait` resolves
/// once the count returns to zero.
#[derive(Clone, Default)]
pub struct WaitGroup {
    inner: Arc<WaitInner>,
}

#[derive(Default)]
struct WaitInner {
    count: AtomicUsize,
    notify: Notify,
}

impl WaitGroup {
    pub fn new() -> Self {
        WaitGroup::default()
    }

    pub fn add(&self, n: usize) {
        self.inner.count.fetch_add(n, Ordering::AcqRel);
    }

    pub fn done(&self) {
        let prev = self.inner.count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "WaitGroup::done without matching add");
        if prev == 1 {
            self.inner.notify.notify_waiters();
        }
    }

    /// Resolves once the count reaches zero. Safe to call from multiple
    /// tasks concurrently.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.inner.count.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Cheap cloneable handle for reporting internal gauges.
///
/// Gauges are funneled through an unbounded channel into a [`StatsPump`]
/// which batches them into `MetricMap`s and dispatches them downstream.
/// A disconnected statser (`Statser::null`) silently drops everything.
#[derive(Clone)]
pub struct Statser {
    tx: Option<mpsc::UnboundedSender<Metric>>,
    flush: broadcast::Sender<()>,
    tags: Tags,
}

impl Statser {
    /// Creates a statser and the receiving end for its pump task.
    pub fn new() -> (Statser, mpsc::UnboundedReceiver<Metric>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (flush, _) = broadcast::channel(1);
        (
            Statser {
                tx: Some(tx),
                flush,
                tags: Tags::new(),
            },
            rx,
        )
    }

    /// Creates a statser that discards all metrics. Flush notifications
    /// still work.
    pub fn null() -> Statser {
        let (flush, _) = broadcast::channel(1);
        Statser {
            tx: None,
            flush,
            tags: Tags::new(),
        }
    }

    /// Returns a statser that appends `tags` to every reported metric.
    pub fn with_tags(&self, tags: Tags) -> Statser {
        Statser {
            tx: self.tx.clone(),
            flush: self.flush.clone(),
            tags: self.tags.concat(&tags),
        }
    }

    /// Reports a gauge value.
    pub fn gauge(&self, name: &str, value: f64, tags: &Tags) {
        let Some(tx) = &self.tx else {
            return;
        };
        let _ = tx.send(Metric::new(
            name,
            MetricValue::Gauge(value),
            self.tags.concat(tags),
            Source::Unknown,
            Nanotime::now(),
        ));
    }

    /// Subscribes to flush notifications. The flusher pings all subscribers
    /// after every completed flush; components use this to drive emission of
    /// their counters.
    pub fn register_flush(&self) -> broadcast::Receiver<()> {
        self.flush.subscribe()
    }

    /// Notifies all flush subscribers. Fire and forget.
    pub fn notify_flush(&self) {
        let _ = self.flush.send(());
    }
}

/// Forwards internally reported metrics into the pipeline.
///
/// Internal metrics carry no source, so they bypass cloud enrichment and can
/// be dispatched straight into the backend handler.
pub async fn run_pump<H: crate::pipeline::PipelineHandler>(
    mut rx: mpsc::UnboundedReceiver<Metric>,
    handler: H,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            first = rx.recv() => {
                let Some(first) = first else { return };
                let mut mm = MetricMap::new();
                mm.receive(first);
                // Drain whatever else is already queued without blocking.
                while let Ok(m) = rx.try_recv() {
                    mm.receive(m);
                }
                handler.dispatch_metric_map(mm).await;
            }
        }
    }
}

/// Periodically samples a queue depth and reports it as a gauge.
pub async fn watch_queue_depth(
    statser: Statser,
    name: &'static str,
    tags: Tags,
    depth: impl Fn() -> usize + Send + 'static,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                statser.gauge(name, depth() as f64, &tags);
            }
        }
    }
}
