use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::PipelineHandler;
use crate::stats::{Statser, WaitGroup};
use crate::types::{
    CachedInstances, Event, Instance, InstanceInfo, Metric, MetricMap, Source, Tags,
};

/// Enriches metrics and events with tags and a canonical hostname derived
/// from the source IP, via an external [`CachedInstances`] collaborator.
///
/// The hot path probes the cache and forwards hits immediately. Misses are
/// buffered per IP inside the run loop, which keeps exactly one outstanding
/// lookup per IP and drains the pending queues when the result arrives.
pub struct CloudHandler<H> {
    shared: Arc<Shared<H>>,
    incoming_metrics: mpsc::Sender<Vec<Metric>>,
    incoming_events: mpsc::Sender<Event>,
    emit: mpsc::Sender<Statser>,
}

impl<H> Clone for CloudHandler<H> {
    fn clone(&self) -> Self {
        CloudHandler {
            shared: Arc::clone(&self.shared),
            incoming_metrics: self.incoming_metrics.clone(),
            incoming_events: self.incoming_events.clone(),
            emit: self.emit.clone(),
        }
    }
}

struct Shared<H> {
    // Incremented from the hot path by any task.
    cache_hit: AtomicU64,
    cache_miss: AtomicU64,

    cached: Arc<dyn CachedInstances>,
    handler: H,
    /// In-flight event counter; joined by `wait_for_events`.
    event_wait: WaitGroup,
    estimated_tags: usize,
    cancel: CancellationToken,
}

impl<H: PipelineHandler> CloudHandler<H> {
    /// Creates the handler and its run loop. The runner owns all pending
    /// queues; spawn [`CloudHandlerRunner::run`] before dispatching.
    pub fn new(
        cached: Arc<dyn CachedInstances>,
        handler: H,
        cancel: CancellationToken,
    ) -> (CloudHandler<H>, CloudHandlerRunner<H>) {
        let estimated_tags = handler.estimated_tags() + cached.estimated_tags();
        // Capacity 1: effectively unbuffered, a slow provider back-pressures
        // dispatchers.
        let (metrics_tx, metrics_rx) = mpsc::channel(1);
        let (events_tx, events_rx) = mpsc::channel(1);
        let (emit_tx, emit_rx) = mpsc::channel(1);

        let shared = Arc::new(Shared {
            cache_hit: AtomicU64::new(0),
            cache_miss: AtomicU64::new(0),
            cached,
            handler,
            event_wait: WaitGroup::new(),
            estimated_tags,
            cancel,
        });

        let handler = CloudHandler {
            shared: Arc::clone(&shared),
            incoming_metrics: metrics_tx,
            incoming_events: events_tx,
            emit: emit_tx,
        };
        let runner = CloudHandlerRunner {
            state: RunnerState {
                shared,
                awaiting_metrics: HashMap::new(),
                awaiting_events: HashMap::new(),
                to_lookup_ips: Vec::new(),
                metric_items_queued: 0,
                metric_hosts_queued: 0,
                event_items_queued: 0,
                event_hosts_queued: 0,
            },
            incoming_metrics: metrics_rx,
            incoming_events: events_rx,
            emit: emit_rx,
        };
        (handler, runner)
    }

    /// Emits cache and queue gauges on every flush. The queue scalars are
    /// owned by the run loop, so the request is funneled there instead of
    /// reading them here.
    pub async fn run_metrics(&self, statser: Statser) {
        use tokio::sync::broadcast::error::RecvError;

        let mut flushed = statser.register_flush();
        loop {
            tokio::select! {
                _ = self.shared.cancel.cancelled() => return,
                res = flushed.recv() => {
                    match res {
                        Ok(()) | Err(RecvError::Lagged(_)) => self.schedule_emit(&statser),
                        Err(RecvError::Closed) => return,
                    }
                }
            }
        }
    }

    /// Fire-and-forget request for the run loop to emit its stats.
    fn schedule_emit(&self, statser: &Statser) {
        let _ = self.emit.try_send(statser.clone());
    }

    fn get_instance(&self, ip: &Source) -> (Option<Arc<Instance>>, bool) {
        if ip.is_unknown() {
            return (None, true);
        }
        let (instance, cache_hit) = self.shared.cached.peek(ip);
        if cache_hit {
            self.shared.cache_hit.fetch_add(1, Ordering::Relaxed);
        } else {
            self.shared.cache_miss.fetch_add(1, Ordering::Relaxed);
        }
        (instance, cache_hit)
    }

    async fn process_metrics(&self, metrics: Vec<Metric>) {
        let mut to_dispatch = MetricMap::new();
        let mut to_handle = Vec::new();
        for mut m in metrics {
            let (instance, cache_hit) = self.get_instance(&m.source);
            if cache_hit {
                if let Some(instance) = &instance {
                    m.add_tags_set_source(&instance.tags, &instance.id);
                }
                to_dispatch.receive(m);
            } else {
                to_handle.push(m);
            }
        }

        if !to_dispatch.is_empty() {
            self.shared.handler.dispatch_metric_map(to_dispatch).await;
        }

        if !to_handle.is_empty() {
            tokio::select! {
                _ = self.shared.cancel.cancelled() => {}
                _ = self.incoming_metrics.send(to_handle) => {}
            }
        }
    }
}

impl<H: PipelineHandler> PipelineHandler for CloudHandler<H> {
    fn estimated_tags(&self) -> usize {
        self.shared.estimated_tags
    }

    async fn dispatch_metric_map(&self, mm: MetricMap) {
        self.process_metrics(mm.as_metrics()).await;
    }

    async fn dispatch_event(&self, mut e: Event) {
        let (instance, cache_hit) = self.get_instance(&e.source);
        if cache_hit {
            if let Some(instance) = &instance {
                e.add_tags_set_source(&instance.tags, &instance.id);
            }
            self.shared.handler.dispatch_event(e).await;
            return;
        }

        // Increment before handing off so wait_for_events covers the queue.
        self.shared.event_wait.add(1);
        tokio::select! {
            _ = self.shared.cancel.cancelled() => self.shared.event_wait.done(),
            res = self.incoming_events.send(e) => {
                if res.is_err() {
                    self.shared.event_wait.done();
                }
            }
        }
    }

    async fn wait_for_events(&self) {
        self.shared.event_wait.wait().await;
        self.shared.handler.wait_for_events().await;
    }
}

/// Select-driven run loop owning all pending state.
pub struct CloudHandlerRunner<H> {
    state: RunnerState<H>,
    incoming_metrics: mpsc::Receiver<Vec<Metric>>,
    incoming_events: mpsc::Receiver<Event>,
    emit: mpsc::Receiver<Statser>,
}

struct RunnerState<H> {
    shared: Arc<Shared<H>>,
    awaiting_metrics: HashMap<Source, Vec<Metric>>,
    awaiting_events: HashMap<Source, Vec<Event>>,
    /// IPs waiting for a lookup slot. LIFO; order is not a contract.
    to_lookup_ips: Vec<Source>,
    // Scalars below are only touched by the run loop.
    metric_items_queued: u64,
    metric_hosts_queued: u64,
    event_items_queued: u64,
    event_hosts_queued: u64,
}

impl<H: PipelineHandler> CloudHandlerRunner<H> {
    pub async fn run(self) {
        let CloudHandlerRunner {
            mut state,
            mut incoming_metrics,
            mut incoming_events,
            mut emit,
        } = self;

        let cancel = state.shared.cancel.clone();
        let mut info_source = state.shared.cached.info_source();
        let ip_sink = state.shared.cached.ip_sink();
        // The IP popped off the stack but not yet accepted by the provider.
        let mut pending_lookup: Option<Source> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    state.drain_on_shutdown();
                    return;
                }
                permit = ip_sink.reserve(), if pending_lookup.is_some() => {
                    match permit {
                        Ok(permit) => {
                            if let Some(ip) = pending_lookup.take() {
                                permit.send(ip);
                            }
                        }
                        Err(_) => {
                            warn!("instance lookup channel closed, dropping lookup");
                            pending_lookup = None;
                        }
                    }
                }
                Some(info) = info_source.recv() => state.handle_instance_info(info),
                Some(metrics) = incoming_metrics.recv() => state.handle_incoming_metrics(metrics),
                Some(e) = incoming_events.recv() => state.handle_incoming_event(e),
                Some(statser) = emit.recv() => state.emit_stats(&statser),
            }

            if pending_lookup.is_none() {
                pending_lookup = state.to_lookup_ips.pop();
            }
        }
    }
}

impl<H: PipelineHandler> RunnerState<H> {
    /// The lookup for `info.ip` resolved: drain both pending queues and
    /// dispatch on short-lived tasks so the loop keeps servicing channels.
    ///
    /// A pending queue only exists while non-empty, and the matching host
    /// counter was incremented when it was created, so each decrement here
    /// is balanced.
    fn handle_instance_info(&mut self, info: InstanceInfo) {
        if let Some(metrics) = self.awaiting_metrics.remove(&info.ip) {
            self.metric_items_queued -= metrics.len() as u64;
            self.metric_hosts_queued -= 1;
            let handler = self.shared.handler.clone();
            let instance = info.instance.clone();
            tokio::spawn(update_and_dispatch_metrics(handler, instance, metrics));
        }
        if let Some(events) = self.awaiting_events.remove(&info.ip) {
            self.event_items_queued -= events.len() as u64;
            self.event_hosts_queued -= 1;
            let handler = self.shared.handler.clone();
            let wait = self.shared.event_wait.clone();
            tokio::spawn(update_and_dispatch_events(
                handler,
                info.instance,
                events,
                wait,
            ));
        }
    }

    fn handle_incoming_metrics(&mut self, metrics: Vec<Metric>) {
        self.metric_items_queued += metrics.len() as u64;
        for m in metrics {
            let events_empty = self
                .awaiting_events
                .get(&m.source)
                .map_or(true, Vec::is_empty);
            let queue = self.awaiting_metrics.entry(m.source.clone()).or_default();
            if queue.is_empty() {
                // First metric for this IP; `handle_instance_info` decrements
                // when it drains this queue.
                self.metric_hosts_queued += 1;
                if events_empty {
                    // No lookup outstanding for this IP yet.
                    self.to_lookup_ips.push(m.source.clone());
                }
            }
            queue.push(m);
        }
    }

    fn handle_incoming_event(&mut self, e: Event) {
        self.event_items_queued += 1;
        let metrics_empty = self
            .awaiting_metrics
            .get(&e.source)
            .map_or(true, Vec::is_empty);
        let queue = self.awaiting_events.entry(e.source.clone()).or_default();
        if queue.is_empty() {
            // First event for this IP; `handle_instance_info` decrements
            // when it drains this queue.
            self.event_hosts_queued += 1;
            if metrics_empty {
                // No lookup outstanding for this IP yet.
                self.to_lookup_ips.push(e.source.clone());
            }
        }
        queue.push(e);
    }

    fn emit_stats(&self, statser: &Statser) {
        let none = Tags::new();
        statser.gauge(
            "cloudprovider.cache_hit",
            self.shared.cache_hit.load(Ordering::Relaxed) as f64,
            &none,
        );
        statser.gauge(
            "cloudprovider.cache_miss",
            self.shared.cache_miss.load(Ordering::Relaxed) as f64,
            &none,
        );
        let t = Tags::from(&["type:metric"][..]);
        statser.gauge("cloudprovider.hosts_queued", self.metric_hosts_queued as f64, &t);
        statser.gauge("cloudprovider.items_queued", self.metric_items_queued as f64, &t);
        let t = Tags::from(&["type:event"][..]);
        statser.gauge("cloudprovider.hosts_queued", self.event_hosts_queued as f64, &t);
        statser.gauge("cloudprovider.items_queued", self.event_items_queued as f64, &t);
    }

    /// Pending events are dropped at shutdown; acknowledge them so
    /// `wait_for_events` can resolve.
    fn drain_on_shutdown(&mut self) {
        for events in self.awaiting_events.values() {
            for _ in events {
                self.shared.event_wait.done();
            }
        }
        self.awaiting_events.clear();
        self.awaiting_metrics.clear();
    }
}

async fn update_and_dispatch_metrics<H: PipelineHandler>(
    handler: H,
    instance: Option<Arc<Instance>>,
    metrics: Vec<Metric>,
) {
    let mut mm = MetricMap::new();
    for mut m in metrics {
        // A negative lookup dispatches the metric unmodified.
        if let Some(instance) = &instance {
            m.add_tags_set_source(&instance.tags, &instance.id);
        }
        mm.receive(m);
    }
    handler.dispatch_metric_map(mm).await;
}

async fn update_and_dispatch_events<H: PipelineHandler>(
    handler: H,
    instance: Option<Arc<Instance>>,
    events: Vec<Event>,
    wait: WaitGroup,
) {
    for mut e in events {
        if let Some(instance) = &instance {
            e.add_tags_set_source(&instance.tags, &instance.id);
        }
        handler.dispatch_event(e).await;
        wait.done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MetricValue;
    use crate::types::Nanotime;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct CapturingHandler {
        maps: Arc<Mutex<Vec<MetricMap>>>,
        events: Arc<Mutex<Vec<Event>>>,
    }

    impl PipelineHandler for CapturingHandler {
        fn estimated_tags(&self) -> usize {
            0
        }

        async fn dispatch_metric_map(&self, mm: MetricMap) {
            self.maps.lock().push(mm);
        }

        async fn dispatch_event(&self, e: Event) {
            self.events.lock().push(e);
        }

        async fn wait_for_events(&self) {}
    }

    struct FakeCachedInstances {
        cache: Mutex<HashMap<Source, Option<Arc<Instance>>>>,
        ip_tx: mpsc::Sender<Source>,
        info_rx: Mutex<Option<mpsc::Receiver<InstanceInfo>>>,
    }

    impl FakeCachedInstances {
        fn new() -> (
            Arc<Self>,
            mpsc::Receiver<Source>,
            mpsc::Sender<InstanceInfo>,
        ) {
            let (ip_tx, ip_rx) = mpsc::channel(1);
            let (info_tx, info_rx) = mpsc::channel(1);
            (
                Arc::new(FakeCachedInstances {
                    cache: Mutex::new(HashMap::new()),
                    ip_tx,
                    info_rx: Mutex::new(Some(info_rx)),
                }),
                ip_rx,
                info_tx,
            )
        }

        fn prime(&self, ip: &str, instance: Option<Arc<Instance>>) {
            self.cache.lock().insert(Source::from(ip), instance);
        }
    }

    impl CachedInstances for FakeCachedInstances {
        fn peek(&self, ip: &Source) -> (Option<Arc<Instance>>, bool) {
            match self.cache.lock().get(ip) {
                Some(entry) => (entry.clone(), true),
                None => (None, false),
            }
        }

        fn ip_sink(&self) -> mpsc::Sender<Source> {
            self.ip_tx.clone()
        }

        fn info_source(&self) -> mpsc::Receiver<InstanceInfo> {
            self.info_rx.lock().take().expect("info_source taken twice")
        }

        fn estimated_tags(&self) -> usize {
            1
        }
    }

    fn instance(id: &str, tags: &[&str]) -> Arc<Instance> {
        Arc::new(Instance {
            id: Source::from(id),
            tags: Tags::from(tags),
        })
    }

    fn metric_with_source(name: &str, source: &str) -> MetricMap {
        let mut mm = MetricMap::new();
        mm.receive(Metric::new(
            name,
            MetricValue::Counter(1.0),
            Tags::from(&["a:1"][..]),
            Source::from(source),
            Nanotime(1),
        ));
        mm
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !check() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached in time"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn cache_hit_enriches_and_forwards_immediately() {
        let (cached, _ip_rx, _info_tx) = FakeCachedInstances::new();
        cached.prime("10.0.0.1", Some(instance("host-a", &["env:prod"])));
        let downstream = CapturingHandler::default();
        let (handler, runner) =
            CloudHandler::new(cached, downstream.clone(), CancellationToken::new());
        tokio::spawn(runner.run());

        handler
            .dispatch_metric_map(metric_with_source("c", "10.0.0.1"))
            .await;

        let maps = downstream.maps.lock();
        assert_eq!(maps.len(), 1);
        let c = &maps[0].counters["c"]["a:1,env:prod"];
        assert_eq!(c.source, Source::from("host-a"));
        assert_eq!(handler.shared.cache_hit.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn cache_miss_buffers_and_requests_one_lookup() {
        let (cached, mut ip_rx, info_tx) = FakeCachedInstances::new();
        let downstream = CapturingHandler::default();
        let (handler, runner) =
            CloudHandler::new(cached, downstream.clone(), CancellationToken::new());
        tokio::spawn(runner.run());

        // A metric and an event for the same cold IP.
        handler
            .dispatch_metric_map(metric_with_source("c", "10.0.0.1"))
            .await;
        let mut e = Event::new("deploy", "x");
        e.source = Source::from("10.0.0.1");
        handler.dispatch_event(e).await;

        // Exactly one lookup is requested.
        let requested = tokio::time::timeout(Duration::from_secs(2), ip_rx.recv())
            .await
            .expect("lookup requested")
            .expect("channel open");
        assert_eq!(requested, Source::from("10.0.0.1"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(ip_rx.try_recv().is_err(), "only one outstanding lookup per IP");

        // Nothing dispatched downstream yet.
        assert!(downstream.maps.lock().is_empty());
        assert!(downstream.events.lock().is_empty());

        // Deliver the lookup result; both queues drain enriched.
        info_tx
            .send(InstanceInfo {
                ip: Source::from("10.0.0.1"),
                instance: Some(instance("host-a", &["env:prod"])),
            })
            .await
            .expect("info delivered");

        wait_until(|| !downstream.maps.lock().is_empty()).await;
        wait_until(|| !downstream.events.lock().is_empty()).await;

        {
            let maps = downstream.maps.lock();
            let c = &maps[0].counters["c"]["a:1,env:prod"];
            assert_eq!(c.source, Source::from("host-a"));
            let events = downstream.events.lock();
            assert_eq!(events[0].source, Source::from("host-a"));
            assert_eq!(
                events[0].tags.as_slice(),
                &["env:prod".to_string()]
            );
        }

        tokio::time::timeout(Duration::from_secs(2), handler.wait_for_events())
            .await
            .expect("events drained");
    }

    #[tokio::test]
    async fn event_before_metric_for_same_ip_drains_both() {
        let (cached, mut ip_rx, info_tx) = FakeCachedInstances::new();
        let downstream = CapturingHandler::default();
        let (handler, runner) =
            CloudHandler::new(cached, downstream.clone(), CancellationToken::new());
        tokio::spawn(runner.run());

        // Reversed arrival order relative to the test above: the event
        // creates the pending state, the metric joins it.
        let mut e = Event::new("deploy", "x");
        e.source = Source::from("10.0.0.4");
        handler.dispatch_event(e).await;
        handler
            .dispatch_metric_map(metric_with_source("c", "10.0.0.4"))
            .await;

        let requested = tokio::time::timeout(Duration::from_secs(2), ip_rx.recv())
            .await
            .expect("lookup requested")
            .expect("channel open");
        assert_eq!(requested, Source::from("10.0.0.4"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(ip_rx.try_recv().is_err(), "only one outstanding lookup per IP");

        info_tx
            .send(InstanceInfo {
                ip: Source::from("10.0.0.4"),
                instance: Some(instance("host-b", &["env:prod"])),
            })
            .await
            .expect("info delivered");

        // Both kinds drain; an unbalanced host counter would kill the run
        // loop before the second kind is dispatched.
        wait_until(|| !downstream.maps.lock().is_empty()).await;
        wait_until(|| !downstream.events.lock().is_empty()).await;

        {
            let maps = downstream.maps.lock();
            let c = &maps[0].counters["c"]["a:1,env:prod"];
            assert_eq!(c.source, Source::from("host-b"));
            let events = downstream.events.lock();
            assert_eq!(events[0].source, Source::from("host-b"));
        }

        tokio::time::timeout(Duration::from_secs(2), handler.wait_for_events())
            .await
            .expect("events drained");
    }

    #[tokio::test]
    async fn negative_lookup_dispatches_unmodified() {
        let (cached, mut ip_rx, info_tx) = FakeCachedInstances::new();
        let downstream = CapturingHandler::default();
        let (handler, runner) =
            CloudHandler::new(cached, downstream.clone(), CancellationToken::new());
        tokio::spawn(runner.run());

        handler
            .dispatch_metric_map(metric_with_source("c", "10.0.0.2"))
            .await;
        let _ = tokio::time::timeout(Duration::from_secs(2), ip_rx.recv())
            .await
            .expect("lookup requested");

        info_tx
            .send(InstanceInfo {
                ip: Source::from("10.0.0.2"),
                instance: None,
            })
            .await
            .expect("info delivered");

        wait_until(|| !downstream.maps.lock().is_empty()).await;
        let maps = downstream.maps.lock();
        let c = &maps[0].counters["c"]["a:1"];
        assert_eq!(c.source, Source::from("10.0.0.2"));
        assert_eq!(c.tags.as_slice(), &["a:1".to_string()]);
    }

    #[tokio::test]
    async fn unknown_source_bypasses_enrichment() {
        let (cached, mut ip_rx, _info_tx) = FakeCachedInstances::new();
        let downstream = CapturingHandler::default();
        let (handler, runner) =
            CloudHandler::new(cached, downstream.clone(), CancellationToken::new());
        tokio::spawn(runner.run());

        let mut mm = MetricMap::new();
        mm.receive(Metric::new(
            "c",
            MetricValue::Counter(1.0),
            Tags::new(),
            Source::Unknown,
            Nanotime(1),
        ));
        handler.dispatch_metric_map(mm).await;

        assert_eq!(downstream.maps.lock().len(), 1);
        assert_eq!(handler.shared.cache_hit.load(Ordering::Relaxed), 0);
        assert_eq!(handler.shared.cache_miss.load(Ordering::Relaxed), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(ip_rx.try_recv().is_err(), "no lookup for unknown source");
    }

    #[tokio::test]
    async fn repeat_metrics_for_pending_ip_do_not_requeue_lookup() {
        let (cached, mut ip_rx, _info_tx) = FakeCachedInstances::new();
        let downstream = CapturingHandler::default();
        let (handler, runner) =
            CloudHandler::new(cached, downstream.clone(), CancellationToken::new());
        tokio::spawn(runner.run());

        for _ in 0..3 {
            handler
                .dispatch_metric_map(metric_with_source("c", "10.0.0.3"))
                .await;
        }

        let _ = tokio::time::timeout(Duration::from_secs(2), ip_rx.recv())
            .await
            .expect("first lookup");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(ip_rx.try_recv().is_err());
    }
}
