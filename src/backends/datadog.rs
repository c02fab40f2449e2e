use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::SendCallback;
use crate::config::{Config, RetryBudget, TimerSubtypes};
use crate::stats::Statser;
use crate::transport::TransportPool;
use crate::types::{Event, MetricMap, Nanotime, Source, Tags};

/// Name of this backend.
pub const BACKEND_NAME: &str = "datadog";

const DOGSTATSD_VERSION: &str = "5.6.3";
/// Maximum response body read back for diagnostics.
const MAX_RESPONSE_SIZE: usize = 1024;
/// Concurrency cap (and buffer pool size) for the events endpoint.
const MAX_CONCURRENT_EVENTS: usize = 20;

const SERIES_PATH: &str = "/api/v1/series";
const EVENTS_PATH: &str = "/api/v1/events";

const KIND_RATE: &str = "rate";
const KIND_GAUGE: &str = "gauge";
const KIND_COUNT: &str = "count";

/// Datadog API client.
///
/// Cloning is cheap; all state lives behind one `Arc` so spawned post tasks
/// share the counters and buffer pools.
#[derive(Clone, Debug)]
pub struct DatadogClient {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    batches_created: AtomicU64,
    batches_dropped: AtomicU64,
    batches_sent: AtomicU64,
    batches_retried: AtomicU64,
    series_sent: AtomicU64,

    api_key: String,
    api_endpoint: String,
    user_agent: String,
    /// Per-post retry budget; `None` retries forever.
    retry_budget: Option<Duration>,
    client: reqwest::Client,
    metrics_per_batch: usize,
    metrics_buffers: BufferPool,
    events_buffers: BufferPool,
    compress_payload: bool,
    flush_interval: Duration,
    disabled_subtypes: TimerSubtypes,
}

/// One series payload: `{"series": [...]}`.
#[derive(Debug, Serialize)]
struct TimeSeries {
    series: Vec<SeriesMetric>,
}

#[derive(Debug, Serialize)]
struct SeriesMetric {
    #[serde(skip_serializing_if = "String::is_empty")]
    host: String,
    /// Flush interval in seconds; only meaningful for rates.
    #[serde(skip_serializing_if = "interval_is_unset")]
    interval: f64,
    metric: String,
    points: [[f64; 2]; 1],
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tags: Vec<String>,
    #[serde(rename = "type")]
    kind: &'static str,
}

fn interval_is_unset(v: &f64) -> bool {
    *v == 0.0
}

/// Event payload for the events endpoint.
#[derive(Debug, Serialize)]
struct WireEvent<'a> {
    title: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "date_is_unset")]
    date_happened: i64,
    #[serde(rename = "host", skip_serializing_if = "str::is_empty")]
    hostname: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    aggregation_key: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    source_type_name: &'a str,
    #[serde(skip_serializing_if = "tags_are_empty")]
    tags: &'a [String],
    #[serde(skip_serializing_if = "str::is_empty")]
    priority: &'static str,
    #[serde(skip_serializing_if = "str::is_empty")]
    alert_type: &'static str,
}

fn date_is_unset(v: &i64) -> bool {
    *v == 0
}

fn tags_are_empty(v: &&[String]) -> bool {
    v.is_empty()
}

impl DatadogClient {
    /// Builds a client from the `datadog` config section. Fails on missing
    /// credentials or nonsensical batching limits.
    pub fn from_config(cfg: &Config, pool: &TransportPool) -> Result<DatadogClient> {
        let dd = &cfg.datadog;
        if dd.api_endpoint.is_empty() {
            bail!("[{BACKEND_NAME}] api_endpoint is required");
        }
        if dd.api_key.is_empty() {
            bail!("[{BACKEND_NAME}] api_key is required");
        }
        if dd.user_agent.is_empty() {
            bail!("[{BACKEND_NAME}] user_agent is required");
        }
        if dd.metrics_per_batch == 0 {
            bail!("[{BACKEND_NAME}] metrics_per_batch must be positive");
        }
        if dd.max_requests == 0 {
            bail!("[{BACKEND_NAME}] max_requests must be positive");
        }

        let client = pool
            .get(&dd.transport)
            .context("resolving datadog transport")?;

        info!(
            max_request_elapsed_time = ?dd.max_request_elapsed_time,
            max_requests = dd.max_requests,
            metrics_per_batch = dd.metrics_per_batch,
            compress_payload = dd.compress_payload,
            "created backend"
        );

        Ok(DatadogClient {
            inner: Arc::new(Inner {
                batches_created: AtomicU64::new(0),
                batches_dropped: AtomicU64::new(0),
                batches_sent: AtomicU64::new(0),
                batches_retried: AtomicU64::new(0),
                series_sent: AtomicU64::new(0),
                api_key: dd.api_key.clone(),
                api_endpoint: dd.api_endpoint.trim_end_matches('/').to_string(),
                user_agent: dd.user_agent.clone(),
                retry_budget: match dd.max_request_elapsed_time {
                    RetryBudget::Bounded(d) => Some(d),
                    RetryBudget::Unbounded => None,
                },
                client,
                metrics_per_batch: dd.metrics_per_batch,
                metrics_buffers: BufferPool::new(dd.max_requests),
                events_buffers: BufferPool::new(MAX_CONCURRENT_EVENTS),
                compress_payload: dd.compress_payload,
                flush_interval: cfg.flush_interval,
                disabled_subtypes: cfg.timer_subtypes(),
            }),
        })
    }

    pub fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    /// Serializes the snapshot into batches and posts them concurrently.
    /// Concurrency is capped by the metrics buffer pool; `cb` receives one
    /// error per failed batch once all batches resolve.
    pub fn send_metrics_async(
        &self,
        cancel: CancellationToken,
        metrics: Arc<MetricMap>,
        cb: SendCallback,
    ) {
        let now = Nanotime::now().unix_seconds();
        let mut batches = Vec::new();
        self.inner
            .process_metrics(now, &metrics, &mut |ts| batches.push(ts));

        let count = batches.len();
        let (results_tx, mut results_rx) = mpsc::channel::<Result<()>>(count.max(1));
        for ts in batches {
            self.inner.batches_created.fetch_add(1, Ordering::Relaxed);
            let inner = Arc::clone(&self.inner);
            let cancel = cancel.clone();
            let results_tx = results_tx.clone();
            tokio::spawn(async move {
                let res = tokio::select! {
                    _ = cancel.cancelled() => return,
                    guard = inner.metrics_buffers.acquire() => {
                        let Some(mut guard) = guard else { return };
                        inner.post_metrics(&cancel, guard.buf(), &ts).await
                    }
                };
                let _ = results_tx.send(res).await;
            });
        }
        drop(results_tx);

        tokio::spawn(async move {
            let mut errs = Vec::new();
            for _ in 0..count {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        errs.push(anyhow!("flush cancelled"));
                        break;
                    }
                    res = results_rx.recv() => match res {
                        Some(Err(e)) => errs.push(e),
                        Some(Ok(())) => {}
                        None => break,
                    }
                }
            }
            cb(errs);
        });
    }

    /// Sends a single event. Concurrency is capped by the events buffer
    /// pool; event payloads are never compressed.
    pub async fn send_event(&self, cancel: &CancellationToken, e: &Event) -> Result<()> {
        let guard = tokio::select! {
            _ = cancel.cancelled() => return Err(anyhow!("event send cancelled")),
            guard = self.inner.events_buffers.acquire() => guard,
        };
        let Some(mut guard) = guard else {
            return Err(anyhow!("events buffer pool closed"));
        };
        let wire = WireEvent {
            title: &e.title,
            text: &e.text,
            date_happened: e.date_happened,
            hostname: e.source.as_str(),
            aggregation_key: &e.aggregation_key,
            source_type_name: &e.source_type_name,
            tags: e.tags.as_slice(),
            priority: e.priority.as_wire_str(),
            alert_type: e.alert_type.as_wire_str(),
        };
        self.inner
            .post(cancel, guard.buf(), EVENTS_PATH, "events", &wire)
            .await
    }

    /// Emits the accumulated counters as gauges on every flush.
    pub async fn run_metrics(&self, cancel: CancellationToken, statser: Statser) {
        use tokio::sync::broadcast::error::RecvError;

        let statser = statser.with_tags(Tags::from(&["backend:datadog"][..]));
        let mut flushed = statser.register_flush();
        let none = Tags::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                res = flushed.recv() => {
                    match res {
                        Ok(()) => {}
                        // A missed notification only delays the gauges by
                        // one flush.
                        Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => return,
                    }
                    let inner = &self.inner;
                    statser.gauge("backend.created", inner.batches_created.load(Ordering::Relaxed) as f64, &none);
                    statser.gauge("backend.retried", inner.batches_retried.load(Ordering::Relaxed) as f64, &none);
                    statser.gauge("backend.dropped", inner.batches_dropped.load(Ordering::Relaxed) as f64, &none);
                    statser.gauge("backend.sent", inner.batches_sent.load(Ordering::Relaxed) as f64, &none);
                    statser.gauge("backend.series.sent", inner.series_sent.load(Ordering::Relaxed) as f64, &none);
                }
            }
        }
    }

    #[cfg(test)]
    fn counters(&self) -> (u64, u64, u64, u64, u64) {
        (
            self.inner.batches_created.load(Ordering::Relaxed),
            self.inner.batches_sent.load(Ordering::Relaxed),
            self.inner.batches_dropped.load(Ordering::Relaxed),
            self.inner.batches_retried.load(Ordering::Relaxed),
            self.inner.series_sent.load(Ordering::Relaxed),
        )
    }

    #[cfg(test)]
    fn available_buffers(&self) -> usize {
        self.inner.metrics_buffers.available()
    }
}

impl Inner {
    /// Walks the snapshot by metric type, appending series and handing off a
    /// full batch whenever `metrics_per_batch` is reached.
    fn process_metrics(&self, now: f64, metrics: &MetricMap, cb: &mut dyn FnMut(TimeSeries)) {
        let mut fl = FlushState {
            series: Vec::with_capacity(self.metrics_per_batch.min(1024)),
            timestamp: now,
            flush_interval_sec: self.flush_interval.as_secs_f64(),
            metrics_per_batch: self.metrics_per_batch,
            cb,
        };

        for (key, by_key) in &metrics.counters {
            for c in by_key.values() {
                fl.add_metric(KIND_RATE, c.per_second, &c.source, c.tags.clone(), key.clone());
                fl.add_metric(
                    KIND_GAUGE,
                    c.value,
                    &c.source,
                    c.tags.clone(),
                    format!("{key}.count"),
                );
                fl.maybe_flush();
            }
        }

        for (key, by_key) in &metrics.timers {
            for t in by_key.values() {
                if let Some(histogram) = &t.histogram {
                    for bucket in histogram {
                        let bucket_tag = if bucket.le.is_infinite() {
                            "le:+Inf".to_string()
                        } else {
                            format!("le:{}", bucket.le)
                        };
                        let mut tags = t.tags.clone();
                        tags.push(bucket_tag);
                        fl.add_metric(
                            KIND_COUNT,
                            bucket.count as f64,
                            &t.source,
                            tags,
                            format!("{key}.histogram"),
                        );
                    }
                } else {
                    let d = &self.disabled_subtypes;
                    if !d.lower {
                        fl.add_metric(KIND_GAUGE, t.min, &t.source, t.tags.clone(), format!("{key}.lower"));
                    }
                    if !d.upper {
                        fl.add_metric(KIND_GAUGE, t.max, &t.source, t.tags.clone(), format!("{key}.upper"));
                    }
                    if !d.count {
                        fl.add_metric(KIND_GAUGE, t.count as f64, &t.source, t.tags.clone(), format!("{key}.count"));
                    }
                    if !d.count_per_second {
                        fl.add_metric(KIND_RATE, t.per_second, &t.source, t.tags.clone(), format!("{key}.count_ps"));
                    }
                    if !d.mean {
                        fl.add_metric(KIND_GAUGE, t.mean, &t.source, t.tags.clone(), format!("{key}.mean"));
                    }
                    if !d.median {
                        fl.add_metric(KIND_GAUGE, t.median, &t.source, t.tags.clone(), format!("{key}.median"));
                    }
                    if !d.std_dev {
                        fl.add_metric(KIND_GAUGE, t.std_dev, &t.source, t.tags.clone(), format!("{key}.std"));
                    }
                    if !d.sum {
                        fl.add_metric(KIND_GAUGE, t.sum, &t.source, t.tags.clone(), format!("{key}.sum"));
                    }
                    if !d.sum_squares {
                        fl.add_metric(KIND_GAUGE, t.sum_squares, &t.source, t.tags.clone(), format!("{key}.sum_squares"));
                    }
                    for pct in &t.percentiles {
                        fl.add_metric(
                            KIND_GAUGE,
                            pct.value,
                            &t.source,
                            t.tags.clone(),
                            format!("{key}.{}", pct.label),
                        );
                    }
                }
                fl.maybe_flush();
            }
        }

        for (key, by_key) in &metrics.gauges {
            for g in by_key.values() {
                fl.add_metric(KIND_GAUGE, g.value, &g.source, g.tags.clone(), key.clone());
                fl.maybe_flush();
            }
        }

        for (key, by_key) in &metrics.sets {
            for s in by_key.values() {
                fl.add_metric(
                    KIND_GAUGE,
                    s.values.len() as f64,
                    &s.source,
                    s.tags.clone(),
                    key.clone(),
                );
                fl.maybe_flush();
            }
        }

        fl.finish();
    }

    async fn post_metrics(
        &self,
        cancel: &CancellationToken,
        buffer: &mut Vec<u8>,
        ts: &TimeSeries,
    ) -> Result<()> {
        self.post(cancel, buffer, SERIES_PATH, "metrics", ts).await?;
        self.series_sent
            .fetch_add(ts.series.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Serializes `data` into `buffer` and posts it, retrying transient
    /// failures until the retry budget runs out. A marshal failure is
    /// non-retryable and drops the batch immediately.
    async fn post(
        &self,
        cancel: &CancellationToken,
        buffer: &mut Vec<u8>,
        path: &str,
        type_of_post: &'static str,
        data: &impl Serialize,
    ) -> Result<()> {
        // The metrics endpoint supports deflate encoding, the events
        // endpoint does not.
        let compress = self.compress_payload && type_of_post == "metrics";
        if let Err(e) = marshal(buffer, data, compress) {
            self.batches_dropped.fetch_add(1, Ordering::Relaxed);
            return Err(anyhow!("[{BACKEND_NAME}] unable to marshal {type_of_post}: {e}"));
        }

        let mut backoff = Backoff::new(self.retry_budget);
        loop {
            match self.do_post(buffer, path, compress).await {
                Ok(()) => {
                    self.batches_sent.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(e) => {
                    if cancel.is_cancelled() {
                        return Err(e.context("flush cancelled"));
                    }
                    let Some(sleep) = backoff.next() else {
                        self.batches_dropped.fetch_add(1, Ordering::Relaxed);
                        return Err(anyhow!("[{BACKEND_NAME}] {e}"));
                    };
                    warn!(
                        kind = type_of_post,
                        sleep = ?sleep,
                        error = %e,
                        "failed to send"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(e.context("flush cancelled")),
                        _ = tokio::time::sleep(sleep) => {}
                    }
                    self.batches_retried.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// One POST attempt. Transient transport errors and non-2xx statuses are
    /// returned for the retry loop; credentials are redacted from errors.
    async fn do_post(&self, body: &[u8], path: &str, compressed: bool) -> Result<()> {
        let mut request = self
            .client
            .post(format!("{}{}", self.api_endpoint, path))
            .query(&[("api_key", self.api_key.as_str())])
            .header("Content-Type", "application/json")
            .header("DD-Dogstatsd-Version", DOGSTATSD_VERSION)
            .header("User-Agent", &self.user_agent)
            .body(body.to_vec());
        if compressed {
            request = request.header("Content-Encoding", "deflate");
        }

        let resp = match request.send().await {
            Ok(resp) => resp,
            Err(e) => bail!("error POSTing: {}", self.redact(&e.to_string())),
        };

        let status = resp.status();
        if !(200..=204).contains(&status.as_u16()) {
            let bytes = resp.bytes().await.unwrap_or_default();
            let snippet = String::from_utf8_lossy(&bytes[..bytes.len().min(MAX_RESPONSE_SIZE)]);
            info!(status = status.as_u16(), body = %snippet, "request failed");
            bail!("received bad status code {}", status.as_u16());
        }
        // Drain the body so the connection can be reused.
        let _ = resp.bytes().await;
        Ok(())
    }

    /// Replaces the API key with `*****` wherever it appears in a message.
    fn redact(&self, msg: &str) -> String {
        msg.replace(&self.api_key, "*****")
    }
}

/// Serializes `data` as JSON into `buffer`, optionally wrapped in zlib.
fn marshal(buffer: &mut Vec<u8>, data: &impl Serialize, compress: bool) -> Result<()> {
    buffer.clear();
    if compress {
        let mut encoder = ZlibEncoder::new(&mut *buffer, Compression::best());
        serde_json::to_writer(&mut encoder, data).context("serializing payload")?;
        encoder.finish().context("closing compressor")?;
    } else {
        serde_json::to_writer(&mut *buffer, data).context("serializing payload")?;
    }
    Ok(())
}

/// Incremental batch builder used while walking a snapshot.
struct FlushState<'a> {
    series: Vec<SeriesMetric>,
    timestamp: f64,
    flush_interval_sec: f64,
    metrics_per_batch: usize,
    cb: &'a mut dyn FnMut(TimeSeries),
}

impl FlushState<'_> {
    fn add_metric(&mut self, kind: &'static str, value: f64, source: &Source, tags: Tags, name: String) {
        self.series.push(SeriesMetric {
            host: source.as_str().to_string(),
            interval: if kind == KIND_RATE {
                self.flush_interval_sec
            } else {
                0.0
            },
            metric: name,
            points: [[self.timestamp, value]],
            tags: tags.as_slice().to_vec(),
            kind,
        });
    }

    fn maybe_flush(&mut self) {
        if self.series.len() >= self.metrics_per_batch {
            let series = mem::take(&mut self.series);
            (self.cb)(TimeSeries { series });
        }
    }

    fn finish(&mut self) {
        if !self.series.is_empty() {
            let series = mem::take(&mut self.series);
            (self.cb)(TimeSeries { series });
        }
    }
}

/// Pre-allocated serialization buffers doubling as the concurrency gate:
/// the pool holds exactly as many buffers as there may be in-flight posts,
/// so holding a buffer is holding a request slot.
#[derive(Debug)]
struct BufferPool {
    sem: Arc<Semaphore>,
    buffers: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl BufferPool {
    fn new(size: usize) -> Self {
        BufferPool {
            sem: Arc::new(Semaphore::new(size)),
            buffers: Arc::new(Mutex::new((0..size).map(|_| Vec::new()).collect())),
        }
    }

    /// Waits for a free slot and returns its buffer. `None` only if the pool
    /// was closed, which never happens during normal operation.
    async fn acquire(&self) -> Option<BufferGuard> {
        let permit = match Arc::clone(&self.sem).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return None,
        };
        let buf = self.buffers.lock().pop().unwrap_or_default();
        Some(BufferGuard {
            buffers: Arc::clone(&self.buffers),
            buf: Some(buf),
            _permit: permit,
        })
    }

    #[cfg(test)]
    fn available(&self) -> usize {
        self.sem.available_permits()
    }
}

/// RAII handle for one pooled buffer; returns the cleared buffer and the
/// concurrency slot on drop.
struct BufferGuard {
    buffers: Arc<Mutex<Vec<Vec<u8>>>>,
    buf: Option<Vec<u8>>,
    _permit: OwnedSemaphorePermit,
}

impl BufferGuard {
    fn buf(&mut self) -> &mut Vec<u8> {
        self.buf.as_mut().expect("buffer present until drop")
    }
}

impl Drop for BufferGuard {
    fn drop(&mut self) {
        if let Some(mut buf) = self.buf.take() {
            buf.clear();
            self.buffers.lock().push(buf);
        }
    }
}

/// Exponential backoff with jitter: intervals start at 500ms, grow by 1.5x
/// up to 60s, and are randomized within ±50%. `next` returns `None` once the
/// overall budget is spent.
struct Backoff {
    interval: Duration,
    deadline: Option<std::time::Instant>,
}

const BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(60);
const BACKOFF_MULTIPLIER: f64 = 1.5;

impl Backoff {
    fn new(budget: Option<Duration>) -> Self {
        Backoff {
            interval: BACKOFF_INITIAL,
            deadline: budget.map(|b| std::time::Instant::now() + b),
        }
    }

    fn next(&mut self) -> Option<Duration> {
        if let Some(deadline) = self.deadline {
            if std::time::Instant::now() >= deadline {
                return None;
            }
        }
        let base = self.interval;
        self.interval = base.mul_f64(BACKOFF_MULTIPLIER).min(BACKOFF_MAX);
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Some(base.mul_f64(jitter))
    }
}
