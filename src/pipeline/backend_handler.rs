use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::aggregator::MetricAggregator;
use super::PipelineHandler;
use crate::backends::Backend;
use crate::stats::{watch_queue_depth, Statser, WaitGroup};
use crate::types::{Event, MetricMap, Tags};

/// Closure broadcast to every shard by [`BackendHandler::process`]; runs on
/// the shard's own task with exclusive access to its aggregator.
pub type ProcessFn = Arc<dyn Fn(usize, &mut MetricAggregator) + Send + Sync>;

enum WorkerCommand {
    Map(MetricMap),
    Process(ProcessCommand),
}

struct ProcessCommand {
    f: ProcessFn,
    done: Option<WaitGroup>,
}

impl Drop for ProcessCommand {
    fn drop(&mut self) {
        // Acknowledge exactly once, whether the command ran or was dropped
        // on shutdown, so process waiters never hang.
        if let Some(wg) = self.done.take() {
            wg.done();
        }
    }
}

/// Terminal pipeline stage: shards metric maps across aggregation workers
/// and fans events out to every backend.
///
/// Each worker owns one [`MetricAggregator`] and drains one bounded channel.
/// Maps and process commands travel on the same channel, so a process
/// command can never overtake a map dispatched to the same shard earlier.
#[derive(Clone)]
pub struct BackendHandler {
    shards: Arc<Vec<mpsc::Sender<WorkerCommand>>>,
    backends: Arc<Vec<Backend>>,
    event_wait: WaitGroup,
    cancel: CancellationToken,
    estimated_tags: usize,
}

impl BackendHandler {
    pub fn new(
        backends: Vec<Backend>,
        num_shards: usize,
        queue_size: usize,
        estimated_tags: usize,
        mut make_aggregator: impl FnMut(usize) -> MetricAggregator,
        cancel: CancellationToken,
    ) -> Self {
        assert!(num_shards > 0, "at least one shard is required");
        let mut shards = Vec::with_capacity(num_shards);
        for id in 0..num_shards {
            let (tx, rx) = mpsc::channel(queue_size);
            tokio::spawn(worker(id, make_aggregator(id), rx));
            shards.push(tx);
        }
        BackendHandler {
            shards: Arc::new(shards),
            backends: Arc::new(backends),
            event_wait: WaitGroup::new(),
            cancel,
            estimated_tags,
        }
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }

    /// Broadcasts `f` to every shard. The returned wait group resolves once
    /// every shard has executed the closure (or been shut down). Per-shard
    /// FIFO order relative to earlier `dispatch_metric_map` calls is
    /// guaranteed by the shared command channel.
    pub async fn process(&self, f: ProcessFn) -> WaitGroup {
        let done = WaitGroup::new();
        done.add(self.shards.len());
        for tx in self.shards.iter() {
            let cmd = WorkerCommand::Process(ProcessCommand {
                f: Arc::clone(&f),
                done: Some(done.clone()),
            });
            // Workers outlive every handler clone, so this only fails once
            // the pipeline is torn down; dropping the returned command
            // acknowledges it through `ProcessCommand::drop`.
            let _ = tx.send(cmd).await;
        }
        done
    }

    /// Spawns the per-shard queue depth watchers.
    pub fn run_metrics(&self, statser: Statser) {
        for (id, tx) in self.shards.iter().enumerate() {
            let tx = tx.clone();
            let mut tags = Tags::new();
            tags.push(format!("aggregator_id:{id}"));
            tokio::spawn(watch_queue_depth(
                statser.clone(),
                "dispatch_aggregator_map",
                tags,
                move || tx.max_capacity() - tx.capacity(),
                Duration::from_secs(1),
                self.cancel.clone(),
            ));
        }
    }
}

impl PipelineHandler for BackendHandler {
    fn estimated_tags(&self) -> usize {
        self.estimated_tags
    }

    /// Re-buckets the map by shard and queues each non-empty piece. Blocks
    /// when a shard queue is full, back-pressuring the caller.
    async fn dispatch_metric_map(&self, mm: MetricMap) {
        let pieces = mm.split_by_shard(self.shards.len());
        for (tx, piece) in self.shards.iter().zip(pieces) {
            if piece.is_empty() {
                continue;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                res = tx.send(WorkerCommand::Map(piece)) => {
                    if res.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Sends the event to every backend on its own task. `wait_for_events`
    /// joins all of them.
    async fn dispatch_event(&self, e: Event) {
        self.event_wait.add(self.backends.len());
        for backend in self.backends.iter() {
            let backend = backend.clone();
            let event = e.clone();
            let wait = self.event_wait.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                if let Err(err) = backend.send_event(&cancel, &event).await {
                    warn!(backend = backend.name(), error = %err, "failed to send event");
                }
                wait.done();
            });
        }
    }

    async fn wait_for_events(&self) {
        self.event_wait.wait().await;
    }
}

/// Worker loop. Deliberately does not watch the cancellation token: the
/// final flush after shutdown still needs live workers, so a worker only
/// stops once every handler clone has been dropped and its channel closes.
async fn worker(id: usize, mut aggr: MetricAggregator, mut rx: mpsc::Receiver<WorkerCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WorkerCommand::Map(mm) => aggr.receive_map(mm),
            WorkerCommand::Process(p) => (p.f)(id, &mut aggr),
        }
    }
}
